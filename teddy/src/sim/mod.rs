//! Deterministic policy host.
//!
//! Runs [`TeddyScheduler`] on a [`SimHost`] against a synthetic workload:
//! configured targets alternate between CPU bursts and sleeps while
//! background tasks compete for the CPUs. The same switch and wakeup events
//! feed an in-process [`Tracer`], whose records flow through an
//! [`EventChannel`] into an [`Aggregator`].

use std::{collections::HashMap, sync::Arc};

use log::{debug, info, warn};
use teddy_common::{EventChannel, Tracer, TraceEvent};

use crate::{
    registry::TargetRegistry,
    sched::{
        CpuMask, ExitInfo, ExitKind, SCX_ENQ_WAKEUP, SCX_WAKE_SYNC, SchedStats, Task,
        TeddyScheduler,
    },
    settings::Settings,
    stats::Aggregator,
    telemetry,
};

pub mod host;

pub use host::{Queued, SimCpu, SimHost};

const SIM_TRACE_CAPACITY: usize = 1024;
const SIM_CHANNEL_CAPACITY: usize = 256;
const BACKGROUND_TID_BASE: i32 = 1_000_000;
const BACKGROUND_BURST_NS: u64 = 5_000_000;
const BACKGROUND_SLEEP_NS: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct Workload {
    pub nr_cpus: usize,
    pub duration_ns: u64,
    pub tick_ns: u64,
    pub target_burst_ns: u64,
    /// Zero keeps targets runnable.
    pub target_sleep_ns: u64,
    pub background_tasks: usize,
}

impl Workload {
    pub fn from_settings(
        settings: &Settings,
        nr_cpus: usize,
        duration_ms: u64,
        background_tasks: usize,
    ) -> Self {
        Self {
            nr_cpus: nr_cpus.clamp(1, 64),
            duration_ns: duration_ms.saturating_mul(1_000_000),
            tick_ns: settings.sim_tick_ns(),
            target_burst_ns: settings.target_burst_ns(),
            target_sleep_ns: settings.target_sleep_ns(),
            background_tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Queued somewhere, waiting for a CPU.
    Runnable,
    Running { cpu: i32, slice_left: u64 },
    Sleeping { until: u64 },
}

#[derive(Debug, Clone)]
struct SimTask {
    task: Task,
    burst_ns: u64,
    sleep_ns: u64,
    burst_left: u64,
    phase: Phase,
    prev_cpu: i32,
    cpu_time_ns: u64,
    wakeups: u64,
}

impl SimTask {
    fn new(task: Task, burst_ns: u64, sleep_ns: u64) -> Self {
        Self {
            task,
            burst_ns,
            sleep_ns,
            burst_left: burst_ns,
            phase: Phase::Runnable,
            prev_cpu: 0,
            cpu_time_ns: 0,
            wakeups: 0,
        }
    }
}

/// CPU time one task received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskUsage {
    pub tid: i32,
    pub target: bool,
    pub cpu_time_ns: u64,
}

#[derive(Debug)]
pub struct SimOutcome {
    pub stats: SchedStats,
    pub exit: Option<ExitInfo>,
    pub trace: Aggregator,
    pub dropped_events: u64,
    pub usage: Vec<TaskUsage>,
}

pub struct Simulation {
    sched: TeddyScheduler<SimHost>,
    tasks: Vec<SimTask>,
    index: HashMap<i32, usize>,
    tracer: Box<Tracer<SIM_TRACE_CAPACITY>>,
    channel: EventChannel<TraceEvent, SIM_CHANNEL_CAPACITY>,
    trace: Aggregator,
    workload: Workload,
    now: u64,
}

impl Simulation {
    pub fn new(registry: Arc<TargetRegistry>, workload: Workload, host: SimHost) -> Self {
        let filter = registry.filter();
        let all_cpus = CpuMask::all(workload.nr_cpus as u32);

        let mut tracer = Box::new(Tracer::new(filter));
        let mut tasks = Vec::new();
        for (tid, _) in registry.iter() {
            if tracer.track_tid(tid).is_err() {
                warn!("Tracer membership full; tid {tid} not traced");
            }
            let tgid = if filter.single_tgid != 0 {
                filter.single_tgid
            } else {
                tid
            };
            tasks.push(SimTask::new(
                Task {
                    tid,
                    tgid,
                    cpus_allowed: all_cpus,
                },
                workload.target_burst_ns,
                workload.target_sleep_ns,
            ));
        }
        tasks.sort_by_key(|t| t.task.tid);

        // Main thread of a targeted process without its own parameters.
        let tgid = filter.single_tgid;
        if tgid != 0 {
            let _ = tracer.track_tgid(tgid);
            if registry.lookup(tgid).is_none() {
                tasks.push(SimTask::new(
                    Task {
                        tid: tgid,
                        tgid,
                        cpus_allowed: all_cpus,
                    },
                    BACKGROUND_BURST_NS,
                    BACKGROUND_SLEEP_NS,
                ));
            }
        }

        for i in 0..workload.background_tasks {
            let tid = BACKGROUND_TID_BASE + i as i32;
            // Half of the background is CPU bound.
            let sleep_ns = if i % 2 == 0 { 0 } else { BACKGROUND_SLEEP_NS };
            tasks.push(SimTask::new(
                Task {
                    tid,
                    tgid: tid,
                    cpus_allowed: all_cpus,
                },
                BACKGROUND_BURST_NS,
                sleep_ns,
            ));
        }

        let index = tasks
            .iter()
            .enumerate()
            .map(|(idx, t)| (t.task.tid, idx))
            .collect();

        Self {
            sched: TeddyScheduler::new(host, registry),
            tasks,
            index,
            tracer,
            channel: EventChannel::new(),
            trace: Aggregator::new(),
            workload,
            now: 0,
        }
    }

    pub fn scheduler(&self) -> &TeddyScheduler<SimHost> {
        &self.sched
    }

    /// Attaches the policy, runs the workload to completion and detaches.
    pub fn run(mut self) -> anyhow::Result<SimOutcome> {
        self.sched.init()?;
        info!(
            "Simulating {} tasks on {} CPUs for {} ms",
            self.tasks.len(),
            self.workload.nr_cpus,
            self.workload.duration_ns / 1_000_000
        );

        for idx in 0..self.tasks.len() {
            self.wake(idx, 0);
        }
        self.fill_idle_cpus();

        let mut exit = ExitInfo::new(ExitKind::Unregistered, "workload complete");
        while self.now < self.workload.duration_ns {
            self.now += self.workload.tick_ns;
            // Wakeups land while the previous tick's tasks still hold their
            // CPUs.
            self.wake_sleepers();
            self.advance_running();
            self.fill_idle_cpus();
            self.drain_events();

            if let Some(err) = self.sched.backend_mut().take_error() {
                exit = ExitInfo::new(ExitKind::Error, err.to_string());
                break;
            }
        }

        self.retire_tasks();
        self.drain_events();
        self.sched.exit(exit);

        let usage = self
            .tasks
            .iter()
            .map(|t| TaskUsage {
                tid: t.task.tid,
                target: self.sched.is_target(&t.task),
                cpu_time_ns: t.cpu_time_ns,
            })
            .collect();

        Ok(SimOutcome {
            stats: self.sched.stats().clone(),
            exit: self.sched.exit_info().cloned(),
            trace: self.trace,
            dropped_events: self.channel.dropped(),
            usage,
        })
    }

    fn switch_out(&mut self, idx: usize, sleeping: bool) {
        let now = self.now;
        let t = &mut self.tasks[idx];
        let Phase::Running { cpu, .. } = t.phase else {
            return;
        };
        t.prev_cpu = cpu;
        self.sched.backend_mut().cpu_mut(cpu).running = None;
        self.tracer.on_switch(
            now,
            Some((t.task.identity(), sleeping)),
            None,
            &mut self.channel,
        );
    }

    fn advance_running(&mut self) {
        let tick = self.workload.tick_ns;
        for cpu in 0..self.workload.nr_cpus as i32 {
            let Some(tid) = self.sched.backend().cpu(cpu).running else {
                continue;
            };
            let Some(&idx) = self.index.get(&tid) else {
                continue;
            };
            let task = self.tasks[idx].task;
            self.sched.tick(&task);

            let t = &mut self.tasks[idx];
            let Phase::Running { cpu, slice_left } = t.phase else {
                continue;
            };
            let ran = tick.min(t.burst_left).min(slice_left);
            t.cpu_time_ns += ran;
            t.burst_left -= ran;
            let slice_left = slice_left - ran;
            t.phase = Phase::Running { cpu, slice_left };

            if t.burst_left == 0 {
                t.burst_left = t.burst_ns;
                if t.sleep_ns > 0 {
                    let until = self.now + t.sleep_ns;
                    self.switch_out(idx, true);
                    self.tasks[idx].phase = Phase::Sleeping { until };
                    continue;
                }
            }
            if slice_left == 0 {
                self.switch_out(idx, false);
                self.tasks[idx].phase = Phase::Runnable;
                self.sched.enqueue(&task, 0);
            }
        }
    }

    fn wake_sleepers(&mut self) {
        let now = self.now;
        for idx in 0..self.tasks.len() {
            if matches!(self.tasks[idx].phase, Phase::Sleeping { until } if until <= now) {
                self.wake(idx, now);
            }
        }
    }

    fn wake(&mut self, idx: usize, now: u64) {
        let nr_cpus = self.workload.nr_cpus as i32;
        let t = &mut self.tasks[idx];
        t.wakeups += 1;
        let task = t.task;
        let prev_cpu = t.prev_cpu;
        // Every other wakeup of a task comes from the neighbouring CPU as a
        // sync hand-off.
        let wake_flags = if t.wakeups % 2 == 0 { SCX_WAKE_SYNC } else { 0 };

        self.tracer.on_wakeup(now, task.identity());
        let host = self.sched.backend_mut();
        host.set_current_cpu((prev_cpu + 1) % nr_cpus);
        host.take_inserted();

        let cpu = self.sched.select_cpu(&task, prev_cpu, wake_flags);
        if !self.sched.backend_mut().take_inserted() {
            self.sched.enqueue(&task, SCX_ENQ_WAKEUP);
        }
        let t = &mut self.tasks[idx];
        t.prev_cpu = cpu;
        t.phase = Phase::Runnable;
    }

    fn fill_idle_cpus(&mut self) {
        let now = self.now;
        for cpu in 0..self.workload.nr_cpus as i32 {
            if self.sched.backend().cpu(cpu).running.is_some() {
                continue;
            }
            if self.sched.backend().cpu(cpu).local.is_empty() {
                self.sched.backend_mut().set_current_cpu(cpu);
                self.sched.dispatch(cpu, None);
            }
            let Some(next) = self.sched.backend_mut().cpu_mut(cpu).local.pop_front() else {
                continue;
            };
            let Some(&idx) = self.index.get(&next.tid) else {
                continue;
            };
            self.sched.backend_mut().cpu_mut(cpu).running = Some(next.tid);
            let t = &mut self.tasks[idx];
            t.phase = Phase::Running {
                cpu,
                slice_left: next.slice_ns.max(1),
            };
            self.tracer
                .on_switch(now, None, Some(t.task.identity()), &mut self.channel);
        }
    }

    fn drain_events(&mut self) {
        let trace = &mut self.trace;
        self.channel.drain(|event| {
            telemetry::record_trace_event(&event);
            trace.consume(&event);
        });
    }

    /// Running tasks exit with a final switch-out; everything releases its
    /// scheduler context.
    fn retire_tasks(&mut self) {
        for idx in 0..self.tasks.len() {
            if matches!(self.tasks[idx].phase, Phase::Running { .. }) {
                self.switch_out(idx, true);
            }
            let tid = self.tasks[idx].task.tid;
            self.sched.task_exit(tid);
        }
        debug!("Retired {} tasks at {} ns", self.tasks.len(), self.now);
    }
}
