use anyhow::{Context, Result, bail};
use aya::{Ebpf, maps::HashMap};
use log::{debug, info, warn};
use teddy_common::{TASK_TGIDS_MAX, TargetMode};

use crate::{
    probes::{Probe, TracepointConfig, attach_tracepoint},
    telemetry,
    tracer::TraceTargets,
};

/// Context-switch and wakeup tracepoints feeding the `EVENTS` ring buffer.
pub struct SchedTraceProbe<'a> {
    pub targets: &'a TraceTargets,
}

impl Probe for SchedTraceProbe<'_> {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        self.populate_tracked(bpf)?;
        if self.targets.mode() == TargetMode::Tgid {
            self.seed_task_tgids(bpf)?;
        }

        let switch = attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "teddy_sched_switch",
                category: "sched",
                name: "sched_switch",
            },
        )?;
        if !switch {
            bail!("sched/sched_switch is unavailable; nothing can be traced");
        }

        let wakeup = attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "teddy_sched_wakeup",
                category: "sched",
                name: "sched_wakeup",
            },
        )?;
        if !wakeup {
            warn!("Sleep windows will not be measured without sched_wakeup");
        }

        let attached = 1 + u64::from(wakeup);
        telemetry::record_active_probe("sched_trace", attached);
        info!("SchedTraceProbe attached ({} programs)", attached);
        Ok(())
    }
}

impl SchedTraceProbe<'_> {
    /// Fills the membership set of the active mode. Single-target runs use
    /// the load-time globals instead and leave both sets empty.
    fn populate_tracked(&self, bpf: &mut Ebpf) -> Result<()> {
        let tracked = self.targets.tracked();
        if tracked.is_empty() {
            return Ok(());
        }

        let map_name = match self.targets.mode() {
            TargetMode::Tid => "TRACKED_TIDS",
            TargetMode::Tgid => "TRACKED_TGIDS",
        };
        let mut map: HashMap<_, i32, u8> = bpf
            .map_mut(map_name)
            .with_context(|| format!("Failed to find {} map", map_name))?
            .try_into()
            .with_context(|| format!("{} is not a HashMap", map_name))?;

        for id in tracked {
            map.insert(id, 1, 0)
                .with_context(|| format!("Failed to track {}", id))?;
        }
        info!("Tracking {} ids in {}", tracked.len(), map_name);
        Ok(())
    }

    /// Records the threads that already exist in each target process, so a
    /// wakeup of a thread that has not been switched out yet still resolves
    /// to its process.
    fn seed_task_tgids(&self, bpf: &mut Ebpf) -> Result<()> {
        let mut map: HashMap<_, i32, i32> = bpf
            .map_mut("TASK_TGIDS")
            .context("Failed to find TASK_TGIDS map")?
            .try_into()
            .context("TASK_TGIDS is not a HashMap")?;

        let mut seeded = 0usize;
        for &tgid in self.targets.ids() {
            let process = match procfs::process::Process::new(tgid) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Process {} not readable from procfs: {}", tgid, e);
                    continue;
                }
            };
            let tasks = match process.tasks() {
                Ok(t) => t,
                Err(e) => {
                    warn!("Failed to list threads of {}: {}", tgid, e);
                    continue;
                }
            };

            for task in tasks.flatten() {
                if seeded >= TASK_TGIDS_MAX {
                    warn!("TASK_TGIDS is full; remaining threads are learned at runtime");
                    return Ok(());
                }
                map.insert(task.tid, tgid, 0)?;
                seeded += 1;
                debug!("Seeded thread {} of process {}", task.tid, tgid);
            }
        }
        info!("Seeded {} threads into TASK_TGIDS", seeded);
        Ok(())
    }
}
