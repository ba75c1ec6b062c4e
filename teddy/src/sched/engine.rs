use std::sync::Arc;

use log::{debug, info, warn};
use teddy_common::{
    DISPATCH_ORDER, DSQ_IDS, FALLBACK_DSQ, FALLBACK_SLICE_NS, FixedMap, TargetCtx, TargetFilter,
    Tier,
};

use super::{ExitInfo, SCX_WAKE_SYNC, ScxBackend, Task, local_on};
use crate::{error::SchedError, registry::TargetRegistry};

/// Per-task context slots.
pub const TASK_CTX_MAX: usize = 4096;

/// Decision counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Targets placed on the waker's CPU.
    pub sync_placements: u64,
    /// Targets placed on an idle CPU from `select_cpu`.
    pub idle_placements: u64,
    pub fallback_inserts: u64,
    /// Indexed by tier.
    pub tier_inserts: [u64; 3],
    /// Indexed like `DISPATCH_ORDER`.
    pub dispatched: [u64; 4],
    /// Target decisions made without a task context.
    pub ctx_unavailable: u64,
}

impl SchedStats {
    pub fn dispatched_from(&self, dsq_id: u64) -> u64 {
        DISPATCH_ORDER
            .iter()
            .position(|id| *id == dsq_id)
            .map_or(0, |idx| self.dispatched[idx])
    }
}

pub struct TeddyScheduler<B> {
    backend: B,
    registry: Arc<TargetRegistry>,
    filter: TargetFilter,
    contexts: Box<FixedMap<i32, TargetCtx, TASK_CTX_MAX>>,
    stats: SchedStats,
    exit_info: Option<ExitInfo>,
}

impl<B: ScxBackend> TeddyScheduler<B> {
    pub fn new(backend: B, registry: Arc<TargetRegistry>) -> Self {
        let filter = registry.filter();
        Self {
            backend,
            registry,
            filter,
            contexts: Box::new(FixedMap::new()),
            stats: SchedStats::default(),
            exit_info: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    pub fn exit_info(&self) -> Option<&ExitInfo> {
        self.exit_info.as_ref()
    }

    pub fn is_target(&self, task: &Task) -> bool {
        self.filter.matches_single(task.identity())
    }

    /// Context of `task`, copied from the registry on first use. `None`
    /// when the registry has no entry or the context table is full.
    fn task_ctx(&mut self, task: &Task) -> Option<TargetCtx> {
        let registry = &self.registry;
        let ctx = self
            .contexts
            .get_or_try_insert_with(task.tid, || registry.lookup(task.tid))
            .copied();
        if ctx.is_none() {
            self.stats.ctx_unavailable += 1;
        }
        ctx
    }

    fn insert_fallback(&mut self, task: &Task, flags: u64) {
        self.backend
            .dsq_insert(task, FALLBACK_DSQ, FALLBACK_SLICE_NS, flags);
        self.stats.fallback_inserts += 1;
    }

    /// Places a sync-woken target on the waker's CPU.
    fn dispatch_sync(&mut self, task: &Task, wake_flags: u64) -> Option<i32> {
        let cpu = self.backend.current_cpu();
        if !task.cpus_allowed.contains(cpu) {
            return None;
        }
        let ctx = self.task_ctx(task)?;
        self.backend
            .dsq_insert(task, local_on(cpu), ctx.slice, wake_flags);
        self.stats.sync_placements += 1;
        Some(cpu)
    }

    pub fn select_cpu(&mut self, task: &Task, prev_cpu: i32, wake_flags: u64) -> i32 {
        if !self.is_target(task) {
            self.insert_fallback(task, wake_flags);
            return prev_cpu;
        }

        if wake_flags & SCX_WAKE_SYNC != 0
            && let Some(cpu) = self.dispatch_sync(task, wake_flags)
        {
            return cpu;
        }

        let (cpu, is_idle) = self.backend.select_cpu_dfl(task, prev_cpu, wake_flags);
        if !is_idle {
            return prev_cpu;
        }
        let Some(ctx) = self.task_ctx(task) else {
            return prev_cpu;
        };
        self.backend
            .dsq_insert(task, local_on(cpu), ctx.slice, wake_flags);
        self.stats.idle_placements += 1;
        cpu
    }

    pub fn enqueue(&mut self, task: &Task, enq_flags: u64) {
        let ctx = if self.is_target(task) {
            self.task_ctx(task)
        } else {
            None
        };
        let Some(ctx) = ctx else {
            self.insert_fallback(task, enq_flags);
            return;
        };

        // TODO: on a wakeup of a critical or interactive target, kick a CPU
        // running a non-target or normal-tier task.
        let tier = ctx.tier().unwrap_or(Tier::Normal);
        self.backend
            .dsq_insert(task, ctx.dsq_id(), ctx.slice, enq_flags);
        self.stats.tier_inserts[tier as usize] += 1;
    }

    /// Moves one task to the local queue of the dispatching CPU. Returns the
    /// queue that served it.
    pub fn dispatch(&mut self, _cpu: i32, _prev: Option<&Task>) -> Option<u64> {
        let idx = DISPATCH_ORDER
            .iter()
            .position(|dsq_id| self.backend.dsq_move_to_local(*dsq_id))?;
        self.stats.dispatched[idx] += 1;
        Some(DISPATCH_ORDER[idx])
    }

    pub fn tick(&mut self, _task: &Task) {}

    pub fn init(&mut self) -> Result<(), SchedError> {
        for dsq_id in DSQ_IDS {
            self.backend.create_dsq(dsq_id, -1)?;
        }
        info!(
            "teddy attached: {} targets, filter {:?}",
            self.registry.len(),
            self.filter
        );
        Ok(())
    }

    pub fn exit(&mut self, info: ExitInfo) {
        for dsq_id in DSQ_IDS {
            self.backend.destroy_dsq(dsq_id);
        }
        if info.kind.is_error() {
            warn!("{info}");
        } else {
            info!("{info}");
        }
        self.exit_info = Some(info);
    }

    pub fn task_exit(&mut self, tid: i32) {
        if self.contexts.remove(&tid).is_some() {
            debug!("released context of tid {tid}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};

    use teddy_common::{
        TARGET_CRITICAL_DSQ, TARGET_INTERACTIVE_DSQ, TARGET_NORMAL_DSQ, TargetMode,
    };

    use super::*;
    use crate::sched::{CpuMask, ExitKind, SCX_ENQ_WAKEUP};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Insert {
        tid: i32,
        dsq_id: u64,
        slice: u64,
    }

    #[derive(Default)]
    struct FakeBackend {
        queues: HashMap<u64, VecDeque<i32>>,
        inserts: Vec<Insert>,
        moved: Vec<i32>,
        current_cpu: i32,
        idle: Option<i32>,
        fail_create: Option<u64>,
        destroyed: HashSet<u64>,
    }

    impl ScxBackend for FakeBackend {
        fn create_dsq(&mut self, dsq_id: u64, _node: i32) -> Result<(), SchedError> {
            if self.fail_create == Some(dsq_id) {
                return Err(SchedError::CreateDsq {
                    dsq_id,
                    reason: "injected".into(),
                });
            }
            self.queues.insert(dsq_id, VecDeque::new());
            Ok(())
        }

        fn destroy_dsq(&mut self, dsq_id: u64) {
            self.queues.remove(&dsq_id);
            self.destroyed.insert(dsq_id);
        }

        fn dsq_insert(&mut self, task: &Task, dsq_id: u64, slice_ns: u64, _flags: u64) {
            self.inserts.push(Insert {
                tid: task.tid,
                dsq_id,
                slice: slice_ns,
            });
            if let Some(queue) = self.queues.get_mut(&dsq_id) {
                queue.push_back(task.tid);
            }
        }

        fn dsq_move_to_local(&mut self, dsq_id: u64) -> bool {
            match self.queues.get_mut(&dsq_id).and_then(VecDeque::pop_front) {
                Some(tid) => {
                    self.moved.push(tid);
                    true
                }
                None => false,
            }
        }

        fn select_cpu_dfl(&mut self, _task: &Task, prev_cpu: i32, _flags: u64) -> (i32, bool) {
            match self.idle {
                Some(cpu) => (cpu, true),
                None => (prev_cpu, false),
            }
        }

        fn current_cpu(&self) -> i32 {
            self.current_cpu
        }
    }

    const MS: u64 = 1_000_000;

    fn task(tid: i32, tgid: i32) -> Task {
        Task {
            tid,
            tgid,
            cpus_allowed: CpuMask::all(4),
        }
    }

    fn registry(filter: TargetFilter, targets: &[(i32, Tier, u64)]) -> Arc<TargetRegistry> {
        let mut registry = TargetRegistry::new(filter);
        for &(tid, tier, slice) in targets {
            registry
                .register(tid, TargetCtx::new(tier, slice, false))
                .unwrap();
        }
        Arc::new(registry)
    }

    fn scheduler(
        filter: TargetFilter,
        targets: &[(i32, Tier, u64)],
    ) -> TeddyScheduler<FakeBackend> {
        let mut sched = TeddyScheduler::new(FakeBackend::default(), registry(filter, targets));
        sched.init().unwrap();
        sched
    }

    fn last_insert(sched: &TeddyScheduler<FakeBackend>) -> Insert {
        *sched.backend().inserts.last().unwrap()
    }

    #[test]
    fn single_critical_target_gets_its_queue_and_slice() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        let mut sched = scheduler(filter, &[(100, Tier::Critical, 5 * MS)]);

        sched.enqueue(&task(100, 100), 0);
        assert_eq!(
            last_insert(&sched),
            Insert {
                tid: 100,
                dsq_id: TARGET_CRITICAL_DSQ,
                slice: 5 * MS
            }
        );

        sched.enqueue(&task(101, 101), 0);
        assert_eq!(
            last_insert(&sched),
            Insert {
                tid: 101,
                dsq_id: FALLBACK_DSQ,
                slice: FALLBACK_SLICE_NS
            }
        );
    }

    #[test]
    fn dispatch_drains_in_strict_tier_order() {
        let filter = TargetFilter::new(TargetMode::Tgid, 0, 50);
        let mut sched = scheduler(
            filter,
            &[
                (51, Tier::Normal, MS),
                (52, Tier::Interactive, MS),
                (53, Tier::Critical, MS),
            ],
        );

        sched.enqueue(&task(9, 9), 0);
        sched.enqueue(&task(51, 50), 0);
        sched.enqueue(&task(52, 50), 0);
        sched.enqueue(&task(53, 50), 0);

        let served: Vec<u64> = (0..5).filter_map(|_| sched.dispatch(0, None)).collect();
        assert_eq!(
            served,
            vec![
                TARGET_CRITICAL_DSQ,
                TARGET_INTERACTIVE_DSQ,
                TARGET_NORMAL_DSQ,
                FALLBACK_DSQ
            ]
        );
        assert_eq!(sched.backend().moved, vec![53, 52, 51, 9]);
        assert_eq!(sched.stats().dispatched, [1, 1, 1, 1]);
        assert_eq!(sched.stats().dispatched_from(FALLBACK_DSQ), 1);
    }

    #[test]
    fn non_target_wakeup_goes_to_fallback_on_prev_cpu() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        let mut sched = scheduler(filter, &[(100, Tier::Critical, MS)]);
        sched.backend_mut().idle = Some(3);

        assert_eq!(sched.select_cpu(&task(7, 7), 2, SCX_WAKE_SYNC), 2);
        assert_eq!(last_insert(&sched).dsq_id, FALLBACK_DSQ);
    }

    #[test]
    fn sync_wakeup_lands_on_waker_cpu() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        let mut sched = scheduler(filter, &[(100, Tier::Interactive, 3 * MS)]);
        sched.backend_mut().current_cpu = 1;

        assert_eq!(sched.select_cpu(&task(100, 100), 0, SCX_WAKE_SYNC), 1);
        assert_eq!(
            last_insert(&sched),
            Insert {
                tid: 100,
                dsq_id: local_on(1),
                slice: 3 * MS
            }
        );
        assert_eq!(sched.stats().sync_placements, 1);
    }

    #[test]
    fn sync_wakeup_outside_affinity_uses_idle_search() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        let mut sched = scheduler(filter, &[(100, Tier::Critical, MS)]);
        sched.backend_mut().current_cpu = 1;
        sched.backend_mut().idle = Some(2);

        let pinned = Task {
            cpus_allowed: CpuMask::single(2),
            ..task(100, 100)
        };
        assert_eq!(sched.select_cpu(&pinned, 0, SCX_WAKE_SYNC), 2);
        assert_eq!(last_insert(&sched).dsq_id, local_on(2));
        assert_eq!(sched.stats().idle_placements, 1);
    }

    #[test]
    fn busy_system_defers_to_enqueue() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        let mut sched = scheduler(filter, &[(100, Tier::Critical, MS)]);

        assert_eq!(sched.select_cpu(&task(100, 100), 3, 0), 3);
        assert!(sched.backend().inserts.is_empty());
    }

    #[test]
    fn target_without_context_degrades_locally() {
        // Whole process is targeted but only one thread has parameters.
        let filter = TargetFilter::new(TargetMode::Tgid, 0, 50);
        let mut sched = scheduler(filter, &[(51, Tier::Critical, MS)]);
        sched.backend_mut().idle = Some(1);

        let stray = task(58, 50);
        assert_eq!(sched.select_cpu(&stray, 0, 0), 0);
        assert!(sched.backend().inserts.is_empty());

        sched.enqueue(&stray, SCX_ENQ_WAKEUP);
        assert_eq!(last_insert(&sched).dsq_id, FALLBACK_DSQ);
        assert_eq!(sched.stats().ctx_unavailable, 2);
    }

    #[test]
    fn tid_mode_without_single_tid_falls_through_to_process() {
        let filter = TargetFilter::new(TargetMode::Tid, 0, 50);
        let mut sched = scheduler(filter, &[(51, Tier::Interactive, MS), (52, Tier::Normal, MS)]);

        sched.enqueue(&task(52, 50), 0);
        assert_eq!(last_insert(&sched).dsq_id, TARGET_NORMAL_DSQ);
    }

    #[test]
    fn context_is_copied_once_and_released_on_exit() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        let mut sched = scheduler(filter, &[(100, Tier::Normal, MS)]);

        sched.enqueue(&task(100, 100), 0);
        assert_eq!(sched.contexts.len(), 1);
        sched.enqueue(&task(100, 100), 0);
        assert_eq!(sched.contexts.len(), 1);

        sched.task_exit(100);
        assert!(sched.contexts.is_empty());
    }

    #[test]
    fn init_failure_propagates() {
        let backend = FakeBackend {
            fail_create: Some(TARGET_INTERACTIVE_DSQ),
            ..Default::default()
        };
        let mut sched = TeddyScheduler::new(backend, registry(TargetFilter::default(), &[]));
        let err = sched.init().unwrap_err();
        assert!(matches!(
            err,
            SchedError::CreateDsq {
                dsq_id: TARGET_INTERACTIVE_DSQ,
                ..
            }
        ));
    }

    #[test]
    fn exit_records_reason_and_releases_queues() {
        let mut sched = scheduler(TargetFilter::default(), &[]);
        sched.exit(ExitInfo::new(ExitKind::Unregistered, "ctrl-c"));

        let info = sched.exit_info().unwrap();
        assert_eq!(info.kind, ExitKind::Unregistered);
        assert_eq!(info.message, "ctrl-c");
        assert!(sched.backend().queues.is_empty());
        assert_eq!(sched.backend().destroyed.len(), DSQ_IDS.len());
    }

    #[test]
    fn hooks_never_touch_registry() {
        let filter = TargetFilter::new(TargetMode::Tid, 100, 0);
        let mut sched = scheduler(filter, &[(100, Tier::Critical, MS)]);
        let before: Vec<_> = sched.registry.iter().collect();

        sched.select_cpu(&task(100, 100), 0, SCX_WAKE_SYNC);
        sched.enqueue(&task(100, 100), SCX_ENQ_WAKEUP);
        sched.dispatch(0, None);
        sched.tick(&task(100, 100));

        let after: Vec<_> = sched.registry.iter().collect();
        assert_eq!(before, after);
    }
}
