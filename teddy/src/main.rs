use std::time::Duration;

use anyhow::Result;
use aya::include_bytes_aligned;
use clap::{Parser, ValueEnum};
use log::info;
use teddy::{
    default_log_filter,
    report::render_trace_report,
    settings::Settings,
    telemetry,
    tracer::{TraceTargets, TracerSession},
};
use teddy_common::TargetMode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Follow individual threads
    Tid,
    /// Follow every thread of a process
    Tgid,
}

impl From<Mode> for TargetMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Tid => TargetMode::Tid,
            Mode::Tgid => TargetMode::Tgid,
        }
    }
}

/// Trace runtime and sleep behavior of selected tasks.
#[derive(Debug, Parser)]
#[clap(name = "teddy-tracer")]
struct Opt {
    /// How targets are matched
    #[clap(short, long, value_enum, default_value = "tid")]
    mode: Mode,

    /// Thread or process ids to trace (defaults to this process)
    #[clap(short, long = "target", value_delimiter = ',')]
    targets: Vec<i32>,

    /// Trace duration in seconds, 0 to run until Ctrl-C
    #[clap(short, long, default_value_t = 10)]
    duration: u64,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

fn own_id(mode: TargetMode) -> i32 {
    match mode {
        TargetMode::Tid => unsafe { libc::gettid() },
        TargetMode::Tgid => std::process::id() as i32,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_log_filter(opt.verbose)),
    )
    .init();

    let settings = Settings::new()?;
    telemetry::init_metrics("teddy-tracer", settings.otel_exporter_otlp_endpoint.as_deref())?;

    let mode = TargetMode::from(opt.mode);
    let ids = if opt.targets.is_empty() {
        vec![own_id(mode)]
    } else {
        opt.targets
    };
    let targets = TraceTargets::new(mode, &ids)?;

    let session = TracerSession::load(
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/teddy")),
        targets,
        &settings,
    )?;
    let agg = session.run(Duration::from_secs(opt.duration)).await?;

    info!("Collected {} records", agg.total_events());
    print!("{}", render_trace_report(&agg));

    telemetry::shutdown_metrics();
    Ok(())
}
