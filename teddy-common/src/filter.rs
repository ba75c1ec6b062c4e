//! Target classification.
//!
//! A run selects one matching mode globally. Each mode has a single-id fast
//! path (plain equality) and a multi-id path backed by a membership set that
//! the caller provides as a closure, so the same logic serves kernel maps and
//! userspace tables.

use crate::{MODE_TGID, MODE_TID};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    /// Match individual threads by task id.
    #[default]
    Tid = MODE_TID,
    /// Match every thread of a process by process id.
    Tgid = MODE_TGID,
}

impl TryFrom<i32> for TargetMode {
    type Error = i32;

    fn try_from(mode: i32) -> Result<Self, Self::Error> {
        match mode {
            MODE_TID => Ok(TargetMode::Tid),
            MODE_TGID => Ok(TargetMode::Tgid),
            other => Err(other),
        }
    }
}

/// Thread and process id of a task as seen by a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIdentity {
    pub tid: i32,
    pub tgid: i32,
}

impl TaskIdentity {
    pub const fn new(tid: i32, tgid: i32) -> Self {
        Self { tid, tgid }
    }
}

/// Mode and single-target identifiers of a run. Zero means "not set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetFilter {
    pub mode: TargetMode,
    pub single_tid: i32,
    pub single_tgid: i32,
}

impl TargetFilter {
    pub const fn new(mode: TargetMode, single_tid: i32, single_tgid: i32) -> Self {
        Self {
            mode,
            single_tid,
            single_tgid,
        }
    }

    /// Builds a filter from the raw globals written by userspace. Unknown
    /// modes match nothing.
    pub fn from_raw(mode: i32, single_tid: i32, single_tgid: i32) -> Option<Self> {
        let mode = TargetMode::try_from(mode).ok()?;
        Some(Self::new(mode, single_tid, single_tgid))
    }

    /// Tracer classification: fast path when a single id is set, otherwise
    /// membership in the tracked set of the active mode.
    #[inline(always)]
    pub fn matches<T, G>(&self, task: TaskIdentity, tracked_tid: T, tracked_tgid: G) -> bool
    where
        T: FnOnce(i32) -> bool,
        G: FnOnce(i32) -> bool,
    {
        match self.mode {
            TargetMode::Tid if self.single_tid != 0 => task.tid == self.single_tid,
            TargetMode::Tid => tracked_tid(task.tid),
            TargetMode::Tgid if self.single_tgid != 0 => task.tgid == self.single_tgid,
            TargetMode::Tgid => tracked_tgid(task.tgid),
        }
    }

    /// Scheduler classification: fast path only.
    ///
    /// In task-id mode without a single task id the process-id fast path
    /// still applies, so a configuration naming only a process targets every
    /// thread of it regardless of the mode field.
    #[inline(always)]
    pub fn matches_single(&self, task: TaskIdentity) -> bool {
        if self.mode == TargetMode::Tid && self.single_tid != 0 {
            return task.tid == self.single_tid;
        }
        self.single_tgid != 0 && task.tgid == self.single_tgid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: i32) -> bool {
        false
    }

    #[test]
    fn tid_fast_path_ignores_tracked_set() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        assert!(filter.matches(TaskIdentity::new(100, 1), never, never));
        assert!(!filter.matches(TaskIdentity::new(101, 1), |_| true, |_| true));
    }

    #[test]
    fn multi_target_uses_set_of_active_mode_only() {
        let tids = [5, 6];
        let tgids = [42];
        let by_tid = TargetFilter::new(TargetMode::Tid, 0, 0);
        let by_tgid = TargetFilter::new(TargetMode::Tgid, 0, 0);

        let in_tids = |id| tids.contains(&id);
        let in_tgids = |id| tgids.contains(&id);

        assert!(by_tid.matches(TaskIdentity::new(6, 1), in_tids, in_tgids));
        assert!(!by_tid.matches(TaskIdentity::new(7, 42), in_tids, in_tgids));
        assert!(by_tgid.matches(TaskIdentity::new(7, 42), in_tids, in_tgids));
        assert!(!by_tgid.matches(TaskIdentity::new(5, 1), in_tids, in_tgids));
    }

    #[test]
    fn tracer_never_falls_through_to_process_match() {
        let filter = TargetFilter::new(TargetMode::Tid, 0, 42);
        assert!(!filter.matches(TaskIdentity::new(7, 42), never, |_| true));
    }

    #[test]
    fn scheduler_tid_mode_without_single_tid_defers_to_process_match() {
        let filter = TargetFilter::new(TargetMode::Tid, 0, 42);
        assert!(filter.matches_single(TaskIdentity::new(7, 42)));
        assert!(!filter.matches_single(TaskIdentity::new(7, 43)));
    }

    #[test]
    fn scheduler_single_tid_wins_over_process_id() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 42);
        assert!(filter.matches_single(TaskIdentity::new(100, 1)));
        assert!(!filter.matches_single(TaskIdentity::new(7, 42)));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = TargetFilter::default();
        assert!(!filter.matches_single(TaskIdentity::new(0, 0)));
        assert!(!filter.matches_single(TaskIdentity::new(1, 1)));
        assert_eq!(TargetFilter::from_raw(7, 1, 1), None);
    }

    #[test]
    fn classification_is_repeatable() {
        let filter = TargetFilter::new(TargetMode::Tgid, 0, 9);
        let task = TaskIdentity::new(3, 9);
        let first = filter.matches_single(task);
        assert_eq!(first, filter.matches_single(task));
        assert!(first);
    }
}
