pub mod config;
pub mod error;
pub mod probes;
pub mod registry;
pub mod report;
pub mod sched;
pub mod settings;
pub mod sim;
pub mod stats;
pub mod telemetry;
pub mod tracer;

use anyhow::Result;
use log::warn;

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter(verbose: bool) -> &'static str {
    if verbose { "info" } else { "warn" }
}

// eBPF maps live in locked kernel memory; older kernels charge them
// against RLIMIT_MEMLOCK.
pub(crate) fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
