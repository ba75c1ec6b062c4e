use std::path::PathBuf;

use thiserror::Error;

/// Problems with the scheduler configuration file. Nothing is applied to the
/// registry when any of these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
    #[error("invalid target_mode {0} (expected 0 for tid or 1 for tgid)")]
    InvalidMode(i64),
    #[error("task {tid}: invalid prio {prio} (expected 0..=2)")]
    InvalidPrio { tid: i32, prio: i64 },
    #[error("task {tid}: slice must be positive")]
    InvalidSlice { tid: i32 },
    #[error("task {tid}: invalid on_ecore {value} (expected 0 or 1)")]
    InvalidOnEcore { tid: i32, value: i64 },
    #[error("invalid task id {0}")]
    InvalidTid(i64),
    #[error("invalid tgid {0}")]
    InvalidTgid(i64),
    #[error("tid mode needs exactly one task or a tgid ({0} tasks, no tgid)")]
    UnmatchedTids(usize),
    #[error("tgid mode needs a tgid")]
    MissingTgid,
    #[error("too many tasks: {count} (max {max})")]
    TooManyTasks { count: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("failed to create dispatch queue {dsq_id}: {reason}")]
    CreateDsq { dsq_id: u64, reason: String },
    #[error("dispatch queue {0} does not exist")]
    UnknownDsq(u64),
    #[error("target table is full ({0} entries)")]
    RegistryFull(usize),
}

#[derive(Debug, Error)]
pub enum TeddyError {
    #[error("root privileges are required (running as uid {0})")]
    InsufficientPrivilege(u32),
    #[error("eBPF object was not embedded at build time; rebuild with the BPF toolchain")]
    MissingBytecode,
    #[error("no targets given")]
    NoTargets,
    #[error("invalid target id {0}")]
    InvalidTarget(i32),
    #[error("too many {kind} targets: {count} (max {max})")]
    TooManyTargets {
        kind: &'static str,
        count: usize,
        max: usize,
    },
}
