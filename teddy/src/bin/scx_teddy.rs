use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, bail};
use clap::Parser;
use log::info;
use teddy::{
    config::SchedConfig,
    default_log_filter,
    registry::TargetRegistry,
    report::render_trace_report,
    settings::Settings,
    sim::{SimHost, Simulation, Workload},
    telemetry,
};
use teddy_common::{DISPATCH_ORDER, FALLBACK_DSQ, Tier};

/// Run the tiered scheduling policy on a simulated sched_ext host.
///
/// Nothing is attached to the running kernel, so no privileges are needed.
#[derive(Debug, Parser)]
#[clap(name = "scx_teddy")]
struct Opt {
    /// JSON file with the target mode and per-task parameters
    #[clap(long)]
    config: PathBuf,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// CPUs of the simulated host
    #[clap(long, default_value_t = 4)]
    cpus: usize,

    /// Length of the simulated run
    #[clap(long, default_value_t = 1000)]
    duration_ms: u64,

    /// Non-target tasks competing for the CPUs
    #[clap(long, default_value_t = 4)]
    background_tasks: usize,
}

fn queue_name(dsq_id: u64) -> &'static str {
    if dsq_id == FALLBACK_DSQ {
        return "fallback";
    }
    Tier::ALL
        .iter()
        .find(|tier| tier.dsq_id() == dsq_id)
        .map_or("unknown", |tier| tier.name())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_log_filter(opt.verbose)),
    )
    .init();

    let settings = Settings::new()?;
    telemetry::init_metrics("scx_teddy", settings.otel_exporter_otlp_endpoint.as_deref())?;

    let targets = SchedConfig::load(&opt.config)?.validate()?;
    let registry = Arc::new(TargetRegistry::from_targets(&targets)?);
    info!(
        "Loaded {} targets in {:?} mode",
        registry.len(),
        targets.mode
    );

    let workload = Workload::from_settings(
        &settings,
        opt.cpus,
        opt.duration_ms,
        opt.background_tasks,
    );
    info!(
        "Policy runs on a simulated {}-CPU host; the live scheduler is left untouched",
        workload.nr_cpus
    );
    let host = SimHost::new(workload.nr_cpus);
    let outcome = Simulation::new(registry, workload, host).run()?;

    println!("========== Dispatch Summary ==========");
    for dsq_id in DISPATCH_ORDER {
        let count = outcome.stats.dispatched_from(dsq_id);
        telemetry::record_dispatches(queue_name(dsq_id), count);
        println!("  {:<12} ({}): {}", queue_name(dsq_id), dsq_id, count);
    }
    for tier in Tier::ALL {
        println!(
            "  {} inserts: {}",
            tier.name(),
            outcome.stats.tier_inserts[tier as usize]
        );
    }
    println!("  fallback inserts: {}", outcome.stats.fallback_inserts);
    println!(
        "  sync placements: {}, idle placements: {}",
        outcome.stats.sync_placements, outcome.stats.idle_placements
    );
    if outcome.stats.ctx_unavailable > 0 {
        println!(
            "  decisions without task context: {}",
            outcome.stats.ctx_unavailable
        );
    }
    println!();

    println!("========== CPU Usage ==========");
    for usage in &outcome.usage {
        println!(
            "  TID {:>8} {:<10} {:.2} ms",
            usage.tid,
            if usage.target { "target" } else { "background" },
            usage.cpu_time_ns as f64 / 1_000_000.0
        );
    }
    println!();

    print!("{}", render_trace_report(&outcome.trace));
    telemetry::record_dropped_events(outcome.dropped_events);
    if outcome.dropped_events > 0 {
        println!("Dropped events: {}", outcome.dropped_events);
    }

    telemetry::shutdown_metrics();

    match outcome.exit {
        Some(exit) if exit.kind.is_error() => bail!("{}", exit),
        Some(exit) => {
            println!("{}", exit);
            Ok(())
        }
        None => Ok(()),
    }
}
