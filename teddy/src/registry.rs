//! Target parameter table.
//!
//! Filled once before the policy starts, then shared read-only.

use log::warn;
use teddy_common::{FixedMap, TARGET_TIDS_MAX, TargetCtx, TargetFilter};

use crate::{config::TargetSet, error::SchedError};

pub struct TargetRegistry {
    entries: Box<FixedMap<i32, TargetCtx, TARGET_TIDS_MAX>>,
    filter: TargetFilter,
}

impl TargetRegistry {
    pub fn new(filter: TargetFilter) -> Self {
        Self {
            entries: Box::new(FixedMap::new()),
            filter,
        }
    }

    pub fn from_targets(targets: &TargetSet) -> Result<Self, SchedError> {
        let mut registry = Self::new(targets.filter());
        for task in &targets.tasks {
            if registry.register(task.tid, task.ctx)?.is_some() {
                warn!("Duplicate target tid {}; later entry wins", task.tid);
            }
        }
        Ok(registry)
    }

    /// Adds or overwrites `tid`, returning the replaced parameters.
    pub fn register(&mut self, tid: i32, ctx: TargetCtx) -> Result<Option<TargetCtx>, SchedError> {
        self.entries
            .insert(tid, ctx)
            .map_err(|_| SchedError::RegistryFull(TARGET_TIDS_MAX))
    }

    pub fn lookup(&self, tid: i32) -> Option<TargetCtx> {
        self.entries.get(&tid).copied()
    }

    pub fn filter(&self) -> TargetFilter {
        self.filter
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, TargetCtx)> + '_ {
        self.entries.iter().map(|(tid, ctx)| (*tid, *ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetTask;
    use teddy_common::{TargetMode, Tier};

    fn target(tid: i32, tier: Tier, slice: u64) -> TargetTask {
        TargetTask {
            tid,
            ctx: TargetCtx::new(tier, slice, false),
        }
    }

    #[test]
    fn duplicates_overwrite() {
        let set = TargetSet {
            mode: TargetMode::Tid,
            tgid: 0,
            tasks: vec![
                target(100, Tier::Critical, 1_000),
                target(100, Tier::Normal, 2_000),
            ],
        };
        let registry = TargetRegistry::from_targets(&set).unwrap();
        assert_eq!(registry.len(), 1);
        let ctx = registry.lookup(100).unwrap();
        assert_eq!(ctx.tier(), Some(Tier::Normal));
        assert_eq!(ctx.slice, 2_000);
    }

    #[test]
    fn lookup_is_pure() {
        let mut registry = TargetRegistry::new(TargetFilter::default());
        registry.register(7, TargetCtx::new(Tier::Interactive, 10, true)).unwrap();
        assert_eq!(registry.lookup(7), registry.lookup(7));
        assert_eq!(registry.lookup(8), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_reports_capacity() {
        let mut registry = TargetRegistry::new(TargetFilter::default());
        for tid in 1..=TARGET_TIDS_MAX as i32 {
            registry.register(tid, TargetCtx::default()).unwrap();
        }
        assert!(matches!(
            registry.register(-1, TargetCtx::default()),
            Err(SchedError::RegistryFull(_))
        ));
    }
}
