use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{MapData, RingBuf},
    programs::TracePoint,
};
use log::{info, warn};
use tokio::task::JoinHandle;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod sched_trace;

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

/// Loads and attaches a tracepoint program. Returns `false` when the
/// tracepoint is missing on this kernel.
pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// Polls a ring buffer on a blocking thread until shutdown is requested,
/// handing each complete record to `handler`. The buffer is drained once
/// more after shutdown so records committed before it are not lost.
pub fn spawn_ringbuf_handler<T, F>(
    bpf: &mut Ebpf,
    map_name: &str,
    poll_interval: Duration,
    handler: F,
) -> Result<JoinHandle<()>>
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to find {} map", map_name))?,
    )?;
    let shutdown = shutdown_flag();

    let handle = tokio::task::spawn_blocking(move || {
        let drain = |ring_buf: &mut RingBuf<MapData>| {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<T>() {
                    let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                    handler(event);
                }
            }
            has_work
        };

        while !shutdown.load(Ordering::Relaxed) {
            if !drain(&mut ring_buf) {
                std::thread::sleep(poll_interval);
            }
        }
        drain(&mut ring_buf);
    });
    Ok(handle)
}
