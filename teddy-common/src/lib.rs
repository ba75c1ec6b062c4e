#![cfg_attr(not(test), no_std)]

//! Types and logic shared by the teddy eBPF programs and userspace.
//!
//! Everything here is `no_std`, allocation free and bounded, so the same code
//! runs inside the kernel programs and in the userspace policy host.

pub mod channel;
pub mod filter;
pub mod fixed_map;
pub mod trace;

pub use channel::EventChannel;
pub use filter::{TargetFilter, TargetMode, TaskIdentity};
pub use fixed_map::{CapacityError, FixedMap, SlotKey};
pub use trace::{EventSink, SleepWindow, TASK_REPORT_MAX, TaskTrace, Tracer, is_sleeping_state};

pub const MODE_TID: i32 = 0;
pub const MODE_TGID: i32 = 1;

/// Dispatch queue for every task that is not a target.
pub const FALLBACK_DSQ: u64 = 200;
pub const TARGET_CRITICAL_DSQ: u64 = 201;
pub const TARGET_INTERACTIVE_DSQ: u64 = 202;
pub const TARGET_NORMAL_DSQ: u64 = 203;

/// All user dispatch queues, created at attach time.
pub const DSQ_IDS: [u64; 4] = [
    FALLBACK_DSQ,
    TARGET_CRITICAL_DSQ,
    TARGET_INTERACTIVE_DSQ,
    TARGET_NORMAL_DSQ,
];

/// Order in which `dispatch` drains the user queues.
pub const DISPATCH_ORDER: [u64; 4] = [
    TARGET_CRITICAL_DSQ,
    TARGET_INTERACTIVE_DSQ,
    TARGET_NORMAL_DSQ,
    FALLBACK_DSQ,
];

/// Slice granted to non-target tasks (100us).
pub const FALLBACK_SLICE_NS: u64 = 100 * 1000;

/// Accumulated runtime after which a still-runnable task is flushed.
pub const LONG_RUN_FLUSH_NS: u64 = 1_000_000_000;

pub const TARGET_TIDS_MAX: usize = 1024;
pub const TASK_TRACES_MAX: usize = 10240;
pub const TRACKED_TIDS_MAX: usize = 1024;
pub const TRACKED_TGIDS_MAX: usize = 256;
pub const TASK_TGIDS_MAX: usize = 10240;
pub const EVENTS_RINGBUF_SIZE: usize = 256 * 1024;

/// Priority class of a target task.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Critical = 0,
    Interactive = 1,
    Normal = 2,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Critical, Tier::Interactive, Tier::Normal];

    pub const fn dsq_id(self) -> u64 {
        TARGET_CRITICAL_DSQ + self as u64
    }

    pub const fn name(self) -> &'static str {
        match self {
            Tier::Critical => "critical",
            Tier::Interactive => "interactive",
            Tier::Normal => "normal",
        }
    }
}

impl TryFrom<i32> for Tier {
    type Error = i32;

    fn try_from(prio: i32) -> Result<Self, Self::Error> {
        match prio {
            0 => Ok(Tier::Critical),
            1 => Ok(Tier::Interactive),
            2 => Ok(Tier::Normal),
            other => Err(other),
        }
    }
}

/// Scheduling parameters of one target task.
///
/// Value type of the target-parameter table and of the per-task context.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetCtx {
    pub prio: i32,
    pub _pad0: u32,
    pub slice: u64,
    pub on_ecore: u8,
    pub _pad1: [u8; 7],
}

impl TargetCtx {
    pub const fn new(tier: Tier, slice: u64, on_ecore: bool) -> Self {
        Self {
            prio: tier as i32,
            _pad0: 0,
            slice,
            on_ecore: on_ecore as u8,
            _pad1: [0; 7],
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        Tier::try_from(self.prio).ok()
    }

    /// Queue the task is enqueued on; unknown tiers fall back to the
    /// target-normal queue.
    pub fn dsq_id(&self) -> u64 {
        self.tier().unwrap_or(Tier::Normal).dsq_id()
    }

    pub fn on_ecore(&self) -> bool {
        self.on_ecore != 0
    }
}

/// Per-task tracer bookkeeping as stored in the kernel trace-state table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceData {
    pub runtime_ns: u64,
    pub start_running: u64,
    pub sleep_start: u64,
    pub sleep_end: u64,
}

/// One record sent through the event ring buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceEvent {
    pub tid: i32,
    pub _pad: u32,
    pub sleep_start: u64,
    pub sleep_end: u64,
    pub runtime_ns: u64,
}

impl TraceEvent {
    /// Length of the sleep window carried by this record, if it has one.
    pub fn sleep_duration(&self) -> Option<u64> {
        if self.sleep_start != 0 && self.sleep_end > self.sleep_start {
            Some(self.sleep_end - self.sleep_start)
        } else {
            None
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TargetCtx {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TraceData {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TraceEvent {}
