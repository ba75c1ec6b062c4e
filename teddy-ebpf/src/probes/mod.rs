use aya_ebpf::{
    macros::map,
    maps::{HashMap, RingBuf},
};
use teddy_common::{
    EVENTS_RINGBUF_SIZE, EventSink, TASK_TGIDS_MAX, TASK_TRACES_MAX, TRACKED_TGIDS_MAX,
    TRACKED_TIDS_MAX, TargetFilter, TaskIdentity, TraceData, TraceEvent,
};

pub mod sched_trace;

// Run-wide target selection, rewritten by userspace before load.
#[unsafe(no_mangle)]
static TARGET_MODE: i32 = 0;
#[unsafe(no_mangle)]
static TARGET_SINGLE_TID: i32 = 0;
#[unsafe(no_mangle)]
static TARGET_SINGLE_TGID: i32 = 0;

#[map]
pub static TASK_TRACES: HashMap<i32, TraceData> =
    HashMap::with_max_entries(TASK_TRACES_MAX as u32, 0);

#[map]
pub static TRACKED_TIDS: HashMap<i32, u8> = HashMap::with_max_entries(TRACKED_TIDS_MAX as u32, 0);

#[map]
pub static TRACKED_TGIDS: HashMap<i32, u8> =
    HashMap::with_max_entries(TRACKED_TGIDS_MAX as u32, 0);

/// tid -> tgid, learned at switch-out and seeded from procfs.
#[map]
pub static TASK_TGIDS: HashMap<i32, i32> = HashMap::with_max_entries(TASK_TGIDS_MAX as u32, 0);

#[map]
pub static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RINGBUF_SIZE as u32, 0);

#[inline(always)]
pub fn target_filter() -> Option<TargetFilter> {
    let (mode, tid, tgid) = unsafe {
        (
            core::ptr::read_volatile(&TARGET_MODE),
            core::ptr::read_volatile(&TARGET_SINGLE_TID),
            core::ptr::read_volatile(&TARGET_SINGLE_TGID),
        )
    };
    TargetFilter::from_raw(mode, tid, tgid)
}

#[inline(always)]
pub fn is_target(filter: &TargetFilter, task: TaskIdentity) -> bool {
    filter.matches(
        task,
        |tid| unsafe { TRACKED_TIDS.get(&tid) }.is_some(),
        |tgid| unsafe { TRACKED_TGIDS.get(&tgid) }.is_some(),
    )
}

#[inline(always)]
pub fn known_tgid(tid: i32) -> i32 {
    unsafe { TASK_TGIDS.get(&tid) }.copied().unwrap_or(0)
}

/// Ring buffer as an [`EventSink`]: reserve, copy, commit.
pub struct RingBufSink<'a>(pub &'a RingBuf);

impl EventSink for RingBufSink<'_> {
    #[inline(always)]
    fn submit(&mut self, event: &TraceEvent) -> bool {
        match self.0.reserve::<TraceEvent>(0) {
            Some(mut slot) => {
                slot.write(*event);
                slot.submit(0);
                true
            }
            None => false,
        }
    }
}
