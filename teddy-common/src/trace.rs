//! Per-task running/sleeping tracker.
//!
//! [`TaskTrace`] is the logic view of the [`TraceData`] stored per task. The
//! sleep bookkeeping is a tagged [`SleepWindow`] so a sleep end can only be
//! recorded while a sleep start is pending. Emission timing:
//!
//! - switch-out into sleep emits the previous window first if one is open,
//!   then opens a new window at `now`;
//! - switch-out while still runnable emits once accumulated runtime reaches
//!   [`LONG_RUN_FLUSH_NS`];
//! - wakeup only closes the window; the record goes out on a later
//!   switch-out.
//!
//! A successful emission clears runtime and the sleep end. The sleep start
//! stays, so the same start may appear in several records.

use crate::{
    CapacityError, EventChannel, FixedMap, LONG_RUN_FLUSH_NS, TRACKED_TGIDS_MAX,
    TRACKED_TIDS_MAX, TargetFilter, TaskIdentity, TraceData, TraceEvent,
};

/// Preemption marker OR'ed into `prev_state` by sched_switch.
pub const TASK_REPORT_MAX: i64 = 0x100;

/// Decodes sched_switch `prev_state`: any reported state bit other than
/// "running" means the task left the CPU to sleep. A preempted task only
/// carries the marker and stays runnable.
#[inline(always)]
pub const fn is_sleeping_state(prev_state: i64) -> bool {
    prev_state & (TASK_REPORT_MAX - 1) != 0
}

/// Destination of emitted records. Implementations reserve a slot, copy the
/// record and commit it, returning `false` when no slot was available.
pub trait EventSink {
    fn submit(&mut self, event: &TraceEvent) -> bool;
}

impl<const N: usize> EventSink for EventChannel<TraceEvent, N> {
    fn submit(&mut self, event: &TraceEvent) -> bool {
        self.try_send(*event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SleepWindow {
    /// No sleep observed since tracking started.
    #[default]
    Clear,
    /// The task went to sleep at `start` and has not woken yet.
    Pending { start: u64 },
    /// The task slept from `start` and was woken at `end`.
    Resolved { start: u64, end: u64 },
}

impl SleepWindow {
    pub fn start(&self) -> u64 {
        match *self {
            SleepWindow::Clear => 0,
            SleepWindow::Pending { start } | SleepWindow::Resolved { start, .. } => start,
        }
    }

    pub fn end(&self) -> u64 {
        match *self {
            SleepWindow::Resolved { end, .. } => end,
            _ => 0,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, SleepWindow::Clear)
    }

    fn without_end(self) -> Self {
        match self {
            SleepWindow::Resolved { start, .. } => SleepWindow::Pending { start },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskTrace {
    pub runtime_ns: u64,
    pub last_switch_in: u64,
    pub window: SleepWindow,
}

impl TaskTrace {
    /// Fresh state for a task first seen switching in at `now`.
    pub const fn started(now: u64) -> Self {
        Self {
            runtime_ns: 0,
            last_switch_in: now,
            window: SleepWindow::Clear,
        }
    }

    #[inline(always)]
    pub fn switch_in(&mut self, now: u64) {
        self.last_switch_in = now;
    }

    #[inline(always)]
    pub fn wakeup(&mut self, now: u64) {
        if let SleepWindow::Pending { start } | SleepWindow::Resolved { start, .. } = self.window {
            self.window = SleepWindow::Resolved { start, end: now };
        }
    }

    /// Applies a switch-out at `now`. Returns whether a record was emitted.
    #[inline(always)]
    pub fn switch_out<S: EventSink>(
        &mut self,
        tid: i32,
        now: u64,
        sleeping: bool,
        sink: &mut S,
    ) -> bool {
        self.runtime_ns = self
            .runtime_ns
            .saturating_add(now.saturating_sub(self.last_switch_in));

        if sleeping {
            // Flush the unresolved window before it is overwritten.
            let emitted = self.window.is_open() && self.emit(tid, sink);
            self.window = SleepWindow::Pending { start: now };
            emitted
        } else if self.runtime_ns >= LONG_RUN_FLUSH_NS {
            self.emit(tid, sink)
        } else {
            false
        }
    }

    pub fn record(&self, tid: i32) -> TraceEvent {
        TraceEvent {
            tid,
            _pad: 0,
            sleep_start: self.window.start(),
            sleep_end: self.window.end(),
            runtime_ns: self.runtime_ns,
        }
    }

    #[inline(always)]
    pub fn emit<S: EventSink>(&mut self, tid: i32, sink: &mut S) -> bool {
        if !sink.submit(&self.record(tid)) {
            return false;
        }
        self.runtime_ns = 0;
        self.window = self.window.without_end();
        true
    }
}

impl From<TraceData> for TaskTrace {
    fn from(data: TraceData) -> Self {
        let window = match (data.sleep_start, data.sleep_end) {
            (0, _) => SleepWindow::Clear,
            (start, 0) => SleepWindow::Pending { start },
            (start, end) => SleepWindow::Resolved { start, end },
        };
        Self {
            runtime_ns: data.runtime_ns,
            last_switch_in: data.start_running,
            window,
        }
    }
}

impl From<TaskTrace> for TraceData {
    fn from(trace: TaskTrace) -> Self {
        Self {
            runtime_ns: trace.runtime_ns,
            start_running: trace.last_switch_in,
            sleep_start: trace.window.start(),
            sleep_end: trace.window.end(),
        }
    }
}

/// In-process tracer over fixed-capacity tables, fed with the same
/// switch/wakeup events the kernel tracepoints see.
pub struct Tracer<const N: usize> {
    filter: TargetFilter,
    tracked_tids: FixedMap<i32, (), TRACKED_TIDS_MAX>,
    tracked_tgids: FixedMap<i32, (), TRACKED_TGIDS_MAX>,
    states: FixedMap<i32, TaskTrace, N>,
}

impl<const N: usize> Tracer<N> {
    pub fn new(filter: TargetFilter) -> Self {
        Self {
            filter,
            tracked_tids: FixedMap::new(),
            tracked_tgids: FixedMap::new(),
            states: FixedMap::new(),
        }
    }

    pub fn track_tid(&mut self, tid: i32) -> Result<(), CapacityError> {
        self.tracked_tids.insert(tid, ()).map(|_| ())
    }

    pub fn track_tgid(&mut self, tgid: i32) -> Result<(), CapacityError> {
        self.tracked_tgids.insert(tgid, ()).map(|_| ())
    }

    pub fn is_target(&self, task: TaskIdentity) -> bool {
        self.filter.matches(
            task,
            |tid| self.tracked_tids.contains_key(&tid),
            |tgid| self.tracked_tgids.contains_key(&tgid),
        )
    }

    pub fn state(&self, tid: i32) -> Option<&TaskTrace> {
        self.states.get(&tid)
    }

    /// A context switch from `prev` to `next` at `now`.
    pub fn on_switch<S: EventSink>(
        &mut self,
        now: u64,
        prev: Option<(TaskIdentity, bool)>,
        next: Option<TaskIdentity>,
        sink: &mut S,
    ) {
        if let Some((task, sleeping)) = prev
            && self.is_target(task)
            && let Some(state) = self.states.get_mut(&task.tid)
        {
            state.switch_out(task.tid, now, sleeping, sink);
        }

        if let Some(task) = next
            && self.is_target(task)
        {
            match self.states.get_mut(&task.tid) {
                Some(state) => state.switch_in(now),
                // Table full: the task stays untraced.
                None => {
                    let _ = self.states.insert(task.tid, TaskTrace::started(now));
                }
            }
        }
    }

    pub fn on_wakeup(&mut self, now: u64, task: TaskIdentity) {
        if self.is_target(task)
            && let Some(state) = self.states.get_mut(&task.tid)
        {
            state.wakeup(now);
        }
    }
}
