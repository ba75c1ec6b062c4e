use std::{env, path::PathBuf, process::Command};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_file = out_dir.join("teddy");

    println!("cargo:rerun-if-changed=../teddy-ebpf/src");
    println!("cargo:rerun-if-changed=../teddy-common/src");
    println!("cargo:rerun-if-env-changed=TEDDY_SKIP_EBPF");

    if env::var_os("TEDDY_SKIP_EBPF").is_some() {
        println!("cargo:warning=TEDDY_SKIP_EBPF set; embedding an empty eBPF object");
        std::fs::write(&out_file, []).unwrap();
        return;
    }

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    let bpf_target = match arch.as_str() {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            eprintln!(
                "Warning: Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    };

    println!(
        "cargo:warning=Building eBPF for target: {} (host arch: {})",
        bpf_target, arch
    );

    let ebpf_dir = PathBuf::from("../teddy-ebpf");

    // Use a separate target directory for eBPF to avoid file lock conflicts
    let ebpf_target_dir = out_dir.join("ebpf-target");

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(&ebpf_dir)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", bpf_target),
            "-Z",
            "build-std=core",
        ])
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status();

    let built = match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            println!("cargo:warning=eBPF build failed ({status}); embedding an empty object");
            false
        }
        Err(e) => {
            println!("cargo:warning=Could not run eBPF build ({e}); embedding an empty object");
            false
        }
    };

    let ebpf_binary = ebpf_target_dir.join(format!("{}/release/teddy", bpf_target));
    if built && std::fs::copy(&ebpf_binary, &out_file).is_ok() {
        println!("cargo:warning=eBPF build completed");
    } else {
        std::fs::write(&out_file, []).unwrap();
    }
}
