//! Tiered scheduling policy.
//!
//! The policy is written against [`ScxBackend`], the subset of sched_ext
//! kfuncs it needs. [`crate::sim::SimHost`] implements it in-process.

use std::fmt;

use teddy_common::TaskIdentity;

use crate::error::SchedError;

pub mod engine;

pub use engine::{SchedStats, TASK_CTX_MAX, TeddyScheduler};

/// Wakeup hint: the waker is about to give up its CPU.
pub const SCX_WAKE_SYNC: u64 = 0x10;
pub const SCX_ENQ_WAKEUP: u64 = 0x1;

pub const SCX_DSQ_FLAG_BUILTIN: u64 = 1 << 63;
pub const SCX_DSQ_FLAG_LOCAL_ON: u64 = 1 << 62;
pub const SCX_DSQ_LOCAL_ON: u64 = SCX_DSQ_FLAG_BUILTIN | SCX_DSQ_FLAG_LOCAL_ON;
pub const SCX_DSQ_LOCAL_CPU_MASK: u64 = 0xffff_ffff;

/// Id of the local queue of `cpu`.
pub const fn local_on(cpu: i32) -> u64 {
    SCX_DSQ_LOCAL_ON | (cpu as u64 & SCX_DSQ_LOCAL_CPU_MASK)
}

/// CPU of a local-queue id, if `dsq_id` is one.
pub const fn local_cpu(dsq_id: u64) -> Option<i32> {
    if dsq_id & SCX_DSQ_LOCAL_ON == SCX_DSQ_LOCAL_ON {
        Some((dsq_id & SCX_DSQ_LOCAL_CPU_MASK) as i32)
    } else {
        None
    }
}

/// CPUs a task may run on. Up to 64 CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn all(nr_cpus: u32) -> Self {
        if nr_cpus >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << nr_cpus) - 1)
        }
    }

    pub const fn single(cpu: i32) -> Self {
        Self(1u64 << cpu)
    }

    pub fn contains(&self, cpu: i32) -> bool {
        (0..64).contains(&cpu) && self.0 & (1u64 << cpu) != 0
    }
}

/// What the policy sees of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub tid: i32,
    pub tgid: i32,
    pub cpus_allowed: CpuMask,
}

impl Task {
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.tid, self.tgid)
    }
}

/// Kernel services used by the policy.
pub trait ScxBackend {
    fn create_dsq(&mut self, dsq_id: u64, node: i32) -> Result<(), SchedError>;
    fn destroy_dsq(&mut self, dsq_id: u64);
    fn dsq_insert(&mut self, task: &Task, dsq_id: u64, slice_ns: u64, enq_flags: u64);
    /// Moves the head of `dsq_id` to the local queue of the dispatching CPU.
    fn dsq_move_to_local(&mut self, dsq_id: u64) -> bool;
    /// Default idle CPU pick. The flag reports whether the CPU is idle.
    fn select_cpu_dfl(&mut self, task: &Task, prev_cpu: i32, wake_flags: u64) -> (i32, bool);
    /// CPU the current hook runs on.
    fn current_cpu(&self) -> i32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Done,
    Unregistered,
    UnregisteredByKernel,
    /// Another policy took over.
    Replaced,
    SysRq,
    Error,
    Stall,
}

impl ExitKind {
    pub fn reason(self) -> &'static str {
        match self {
            ExitKind::Done => "scheduler finished",
            ExitKind::Unregistered => "unregistered from user space",
            ExitKind::UnregisteredByKernel => "unregistered by the kernel",
            ExitKind::Replaced => "replaced by another scheduler",
            ExitKind::SysRq => "disabled by sysrq",
            ExitKind::Error => "runtime error",
            ExitKind::Stall => "runnable task stall",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, ExitKind::Error | ExitKind::Stall)
    }
}

/// Recorded by `exit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub reason: String,
    pub message: String,
}

impl ExitInfo {
    pub fn new(kind: ExitKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: kind.reason().to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "EXIT: {}", self.reason)
        } else {
            write!(f, "EXIT: {} ({})", self.reason, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_queue_ids_round_trip_cpu() {
        assert_eq!(local_cpu(local_on(3)), Some(3));
        assert_eq!(local_cpu(teddy_common::FALLBACK_DSQ), None);
        assert_eq!(local_on(0) & SCX_DSQ_FLAG_BUILTIN, SCX_DSQ_FLAG_BUILTIN);
    }

    #[test]
    fn cpu_mask_bounds() {
        let mask = CpuMask::all(4);
        assert!(mask.contains(0) && mask.contains(3));
        assert!(!mask.contains(4));
        assert!(!mask.contains(-1));
        assert!(CpuMask::all(64).contains(63));
        assert!(!CpuMask::single(2).contains(1));
    }

    #[test]
    fn exit_info_display() {
        let info = ExitInfo::new(ExitKind::Replaced, "scx_other attached");
        assert_eq!(
            info.to_string(),
            "EXIT: replaced by another scheduler (scx_other attached)"
        );
        assert!(!info.kind.is_error());
        assert!(ExitKind::Stall.is_error());
    }
}
