use std::fmt::{self, Write};

use crate::stats::{Aggregator, RunningStats};

fn write_section(out: &mut impl Write, title: &str, stats: &RunningStats, with_count: bool) -> fmt::Result {
    writeln!(out)?;
    writeln!(out, "  {title}:")?;
    if with_count {
        writeln!(out, "    Count: {}", stats.count())?;
    }
    writeln!(out, "    Average: {:.2} ms", stats.mean_ms())?;
    writeln!(out, "    Std dev: {:.2} ms", stats.std_dev_ms())?;
    writeln!(out, "    Min: {:.2} ms", stats.min_ms())?;
    writeln!(out, "    Max: {:.2} ms", stats.max_ms())
}

pub fn write_trace_report(out: &mut impl Write, agg: &Aggregator) -> fmt::Result {
    writeln!(out, "========== Statistics Report ==========")?;
    writeln!(out)?;

    if agg.is_empty() {
        writeln!(out, "No events received.")?;
        return Ok(());
    }

    for (tid, profile) in agg.tasks() {
        writeln!(out, "Task TID: {tid}")?;
        writeln!(out, "  Event count: {}", profile.events)?;

        write_section(out, "Runtime", &profile.runtime, false)?;
        if !profile.sleep_duration.is_empty() {
            write_section(out, "Sleep Duration", &profile.sleep_duration, true)?;
        }
        if !profile.sleep_interval.is_empty() {
            write_section(
                out,
                "Sleep Interval (time between sleeps)",
                &profile.sleep_interval,
                true,
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn render_trace_report(agg: &Aggregator) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_trace_report(&mut out, agg);
    out
}
