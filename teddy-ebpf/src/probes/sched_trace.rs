//! Sleep/runtime tracer on sched/sched_switch and sched/sched_wakeup.

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::tracepoint,
    programs::TracePointContext,
};
use aya_log_ebpf::debug;
use teddy_common::{TaskIdentity, TaskTrace, TraceData, is_sleeping_state};

use super::{EVENTS, RingBufSink, TASK_TGIDS, TASK_TRACES, is_target, known_tgid, target_filter};

// sched/sched_switch record layout.
const PREV_PID_OFFSET: usize = 24;
const PREV_STATE_OFFSET: usize = 32;
const NEXT_PID_OFFSET: usize = 56;

// sched/sched_wakeup record layout.
const WAKEUP_PID_OFFSET: usize = 24;

#[tracepoint]
pub fn teddy_sched_switch(ctx: TracePointContext) -> u32 {
    match try_sched_switch(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

fn try_sched_switch(ctx: &TracePointContext) -> Result<(), u32> {
    let Some(filter) = target_filter() else {
        return Ok(());
    };
    let now = unsafe { bpf_ktime_get_ns() };

    let prev_tid: i32 = unsafe { ctx.read_at(PREV_PID_OFFSET).map_err(|_| 1u32)? };
    let prev_state: i64 = unsafe { ctx.read_at(PREV_STATE_OFFSET).map_err(|_| 1u32)? };
    let next_tid: i32 = unsafe { ctx.read_at(NEXT_PID_OFFSET).map_err(|_| 1u32)? };

    // The outgoing task is still current here.
    let prev_tgid = (bpf_get_current_pid_tgid() >> 32) as i32;
    if prev_tid != 0 {
        let _ = TASK_TGIDS.insert(&prev_tid, &prev_tgid, 0);
    }

    let prev = TaskIdentity::new(prev_tid, prev_tgid);
    if prev_tid != 0
        && is_target(&filter, prev)
        && let Some(data) = TASK_TRACES.get_ptr_mut(&prev_tid)
    {
        let mut trace = TaskTrace::from(unsafe { *data });
        trace.switch_out(
            prev_tid,
            now,
            is_sleeping_state(prev_state),
            &mut RingBufSink(&EVENTS),
        );
        unsafe { *data = trace.into() };
    }

    let next = TaskIdentity::new(next_tid, known_tgid(next_tid));
    if next_tid != 0 && is_target(&filter, next) {
        match TASK_TRACES.get_ptr_mut(&next_tid) {
            Some(data) => unsafe { (*data).start_running = now },
            None => {
                let fresh: TraceData = TaskTrace::started(now).into();
                if TASK_TRACES.insert(&next_tid, &fresh, 0).is_ok() {
                    debug!(ctx, "tracking tid {}", next_tid);
                }
            }
        }
    }

    Ok(())
}

#[tracepoint]
pub fn teddy_sched_wakeup(ctx: TracePointContext) -> u32 {
    match try_sched_wakeup(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

fn try_sched_wakeup(ctx: &TracePointContext) -> Result<(), u32> {
    let Some(filter) = target_filter() else {
        return Ok(());
    };
    let now = unsafe { bpf_ktime_get_ns() };
    let tid: i32 = unsafe { ctx.read_at(WAKEUP_PID_OFFSET).map_err(|_| 1u32)? };

    let task = TaskIdentity::new(tid, known_tgid(tid));
    if !is_target(&filter, task) {
        return Ok(());
    }

    if let Some(data) = TASK_TRACES.get_ptr_mut(&tid) {
        let mut trace = TaskTrace::from(unsafe { *data });
        trace.wakeup(now);
        unsafe { *data = trace.into() };
    }

    Ok(())
}
