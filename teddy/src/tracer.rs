//! Live tracer session: loads the tracepoint programs, consumes the ring
//! buffer and aggregates per-task statistics until the run ends.

use std::time::Duration;

use anyhow::{Context, Result};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{info, warn};
use teddy_common::{
    TRACKED_TGIDS_MAX, TRACKED_TIDS_MAX, TargetFilter, TargetMode, TraceEvent,
};
use tokio::{signal, sync::mpsc};

use crate::{
    bump_memlock_rlimit,
    error::TeddyError,
    probes::{Probe, request_shutdown, sched_trace::SchedTraceProbe, spawn_ringbuf_handler},
    settings::Settings,
    stats::Aggregator,
    telemetry,
};

/// Ids the tracer follows and the mode they are matched in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceTargets {
    mode: TargetMode,
    ids: Vec<i32>,
}

impl TraceTargets {
    /// Duplicates are dropped, order is kept.
    pub fn new(mode: TargetMode, ids: &[i32]) -> Result<Self, TeddyError> {
        let mut unique: Vec<i32> = Vec::with_capacity(ids.len());
        for &id in ids {
            if id <= 0 {
                return Err(TeddyError::InvalidTarget(id));
            }
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        if unique.is_empty() {
            return Err(TeddyError::NoTargets);
        }

        let (kind, max) = match mode {
            TargetMode::Tid => ("tid", TRACKED_TIDS_MAX),
            TargetMode::Tgid => ("tgid", TRACKED_TGIDS_MAX),
        };
        if unique.len() > max {
            return Err(TeddyError::TooManyTargets {
                kind,
                count: unique.len(),
                max,
            });
        }

        Ok(Self { mode, ids: unique })
    }

    pub fn mode(&self) -> TargetMode {
        self.mode
    }

    pub fn ids(&self) -> &[i32] {
        &self.ids
    }

    /// Ids that go into the membership set. Empty for a single target.
    pub fn tracked(&self) -> &[i32] {
        if self.ids.len() == 1 { &[] } else { &self.ids }
    }

    /// Load-time globals for the tracepoint programs.
    pub fn filter(&self) -> TargetFilter {
        let single = match self.ids.as_slice() {
            [id] => *id,
            _ => 0,
        };
        match self.mode {
            TargetMode::Tid => TargetFilter::new(TargetMode::Tid, single, 0),
            TargetMode::Tgid => TargetFilter::new(TargetMode::Tgid, 0, single),
        }
    }
}

fn check_privilege() -> Result<(), TeddyError> {
    let uid = unsafe { libc::geteuid() };
    if uid != 0 {
        return Err(TeddyError::InsufficientPrivilege(uid));
    }
    Ok(())
}

fn check_bytecode(bytecode: &[u8]) -> Result<(), TeddyError> {
    if bytecode.is_empty() {
        return Err(TeddyError::MissingBytecode);
    }
    Ok(())
}

fn consume(agg: &mut Aggregator, event: &TraceEvent) {
    agg.consume(event);
    telemetry::record_trace_event(event);
}

pub struct TracerSession {
    bpf: Ebpf,
    targets: TraceTargets,
    poll_interval: Duration,
}

impl TracerSession {
    pub fn load(bytecode: &[u8], targets: TraceTargets, settings: &Settings) -> Result<Self> {
        check_privilege()?;
        check_bytecode(bytecode)?;
        bump_memlock_rlimit()?;

        let filter = targets.filter();
        let mode = filter.mode as i32;
        let mut bpf = EbpfLoader::new()
            .set_global("TARGET_MODE", &mode, true)
            .set_global("TARGET_SINGLE_TID", &filter.single_tid, true)
            .set_global("TARGET_SINGLE_TGID", &filter.single_tgid, true)
            .load(bytecode)
            .context("Failed to load eBPF object")?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        info!(
            "Loaded tracer for {:?} targets {:?}",
            targets.mode(),
            targets.ids()
        );
        Ok(Self {
            bpf,
            targets,
            poll_interval: Duration::from_millis(settings.poll_interval_ms()),
        })
    }

    /// Traces until `duration` elapses or Ctrl-C. A zero duration only stops
    /// on Ctrl-C.
    pub async fn run(mut self, duration: Duration) -> Result<Aggregator> {
        SchedTraceProbe {
            targets: &self.targets,
        }
        .attach(&mut self.bpf)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<TraceEvent>();
        let reader = spawn_ringbuf_handler(
            &mut self.bpf,
            "EVENTS",
            self.poll_interval,
            move |event: TraceEvent| {
                let _ = tx.send(event);
            },
        )?;

        let deadline = async {
            if duration.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(duration).await
            }
        };
        tokio::pin!(deadline);
        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut agg = Aggregator::new();
        info!("Tracing active. Press Ctrl-C to stop.");
        loop {
            tokio::select! {
                Some(event) = rx.recv() => consume(&mut agg, &event),
                _ = &mut deadline => {
                    info!("Trace duration elapsed");
                    break;
                }
                res = &mut ctrl_c => {
                    res.context("Failed to listen for Ctrl-C")?;
                    info!("Interrupted, stopping trace");
                    break;
                }
            }
        }

        request_shutdown();
        reader.await.context("Ring buffer reader panicked")?;
        while let Ok(event) = rx.try_recv() {
            consume(&mut agg, &event);
        }
        Ok(agg)
    }
}
