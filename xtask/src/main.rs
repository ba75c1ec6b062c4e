use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARIES: [&str; 2] = ["teddy-tracer", "scx_teddy"];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and package teddy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the complete binaries (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target architecture for cross-compilation (e.g., x86_64-unknown-linux-gnu, aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Build and run the tracer as root
    Trace {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Arguments passed to teddy-tracer
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Package binaries for distribution
    Package {
        /// Target architecture
        #[arg(long)]
        target: Option<String>,

        /// Output directory
        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Trace { release, args } => {
            trace(release, &args)?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn binary_path(root: &Path, target: Option<&str>, release: bool, name: &str) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    match target {
        Some(t) => root.join("target").join(t).join(profile).join(name),
        None => root.join("target").join(profile).join(name),
    }
}

fn build(release: bool, target: Option<&str>) -> Result<()> {
    let root = project_root()?;

    println!("🔨 Building teddy...");

    // Linux target from a non-Linux host needs `cross`
    let is_cross_compile = target
        .map(|t| t.contains("linux"))
        .unwrap_or(false) && !cfg!(target_os = "linux");

    let build_cmd = if is_cross_compile {
        if which::which("cross").is_ok() {
            println!("   Using 'cross' for cross-compilation");
            "cross"
        } else {
            bail!(
                "Cross-compilation to Linux requires 'cross' tool.\n\
                 Install with: cargo install cross\n\
                 Also requires Docker to be running."
            );
        }
    } else {
        "cargo"
    };

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root);
    cmd.arg("build");

    if release {
        cmd.arg("--release");
    }

    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    cmd.arg("-p").arg("teddy");

    let status = cmd.status().context("Failed to run cargo build")?;

    if !status.success() {
        bail!("Build failed");
    }

    for name in BINARIES {
        println!("✅ Built: {}", binary_path(&root, target, release, name).display());
    }

    Ok(())
}

fn trace(release: bool, args: &[String]) -> Result<()> {
    build(release, None)?;

    let root = project_root()?;
    let tracer = binary_path(&root, None, release, "teddy-tracer");

    let status = Command::new("sudo")
        .arg("-E")
        .arg(&tracer)
        .args(args)
        .status()
        .context("Failed to run teddy-tracer")?;

    if !status.success() {
        bail!("teddy-tracer exited with {}", status);
    }
    Ok(())
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    build(true, target)?;

    let root = project_root()?;
    let output_path = root.join(output_dir);

    fs::create_dir_all(&output_path).context("Failed to create output directory")?;

    let arch = target.unwrap_or(std::env::consts::ARCH);
    let version = env!("CARGO_PKG_VERSION");
    let package_name = format!("teddy-{}-{}", version, arch);

    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir)?;

    for name in BINARIES {
        let binary = binary_path(&root, target, true, name);
        if !binary.exists() {
            bail!("Binary not found at: {}", binary.display());
        }
        fs::copy(&binary, package_dir.join(name))?;
    }

    for (src, dst) in [
        ("example.env", "teddy.env.example"),
        ("configs/teddy.example.json", "teddy.example.json"),
    ] {
        let path = root.join(src);
        if path.exists() {
            fs::copy(&path, package_dir.join(dst))?;
        }
    }

    let install_script = r#"#!/bin/bash
set -e

INSTALL_DIR="${INSTALL_DIR:-/usr/local/bin}"
CONFIG_DIR="${CONFIG_DIR:-/etc/teddy}"

echo "Installing teddy..."

sudo install -m 755 teddy-tracer "$INSTALL_DIR/teddy-tracer"
sudo install -m 755 scx_teddy "$INSTALL_DIR/scx_teddy"

sudo mkdir -p "$CONFIG_DIR"
for f in teddy.env.example teddy.example.json; do
    if [ -f "$f" ]; then
        sudo cp "$f" "$CONFIG_DIR/$f"
    fi
done

echo "✅ Installed to $INSTALL_DIR"
"#;

    fs::write(package_dir.join("install.sh"), install_script)?;

    let tarball = output_path.join(format!("{}.tar.gz", package_name));

    let tarball_arg = tarball.to_string_lossy().to_string();
    let status = Command::new("tar")
        .current_dir(&output_path)
        .args(["-czf", tarball_arg.as_str(), package_name.as_str()])
        .status()
        .context("Failed to create tarball")?;

    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;

    println!("✅ Package created: {}", tarball.display());

    Ok(())
}
