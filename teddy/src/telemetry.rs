//! OpenTelemetry metrics export module
//!
//! Exports tracer records and scheduling decisions to an OpenTelemetry
//! Collector. Export is off unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;
use teddy_common::TraceEvent;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<TeddyMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Attached programs per name (for ObservableGauge callback)
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct TeddyMetrics {
    pub trace_events: Counter<u64>,
    pub trace_runtime_ns: Histogram<u64>,
    pub trace_sleep_ns: Histogram<u64>,
    pub trace_dropped_events: Counter<u64>,
    pub dispatch_events: Counter<u64>,
}

impl TeddyMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            trace_events: meter
                .u64_counter("trace_events")
                .with_description("Number of tracer records consumed")
                .with_unit("events")
                .build(),
            trace_runtime_ns: meter
                .u64_histogram("trace_runtime_ns")
                .with_description("Runtime carried by tracer records")
                .with_unit("ns")
                .build(),
            trace_sleep_ns: meter
                .u64_histogram("trace_sleep_ns")
                .with_description("Completed sleep windows")
                .with_unit("ns")
                .build(),
            trace_dropped_events: meter
                .u64_counter("trace_dropped_events")
                .with_description("Tracer records lost to a full channel")
                .with_unit("events")
                .build(),
            dispatch_events: meter
                .u64_counter("dispatch_events")
                .with_description("Tasks moved to a local queue, per source queue")
                .with_unit("events")
                .build(),
        }
    }
}

/// Adds a scheme when the endpoint has none. Empty means disabled.
fn otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = configured?.trim();
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint.to_string())
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC. Must run inside a
/// tokio runtime.
pub fn init_metrics(service_name: &'static str, endpoint: Option<&str>) -> Result<()> {
    let endpoint = match otlp_endpoint(endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", service_name),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("teddy");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of attached eBPF programs")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(TeddyMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static TeddyMetrics> {
    METRICS.get()
}

pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

pub fn record_trace_event(event: &TraceEvent) {
    if let Some(m) = metrics() {
        let attrs = [KeyValue::new("tid", event.tid as i64)];
        m.trace_events.add(1, &attrs);
        m.trace_runtime_ns.record(event.runtime_ns, &attrs);
        if let Some(slept) = event.sleep_duration() {
            m.trace_sleep_ns.record(slept, &attrs);
        }
    }
}

pub fn record_dropped_events(count: u64) {
    if let Some(m) = metrics()
        && count > 0
    {
        m.trace_dropped_events.add(count, &[]);
    }
}

pub fn record_dispatches(queue: &str, count: u64) {
    if let Some(m) = metrics() {
        m.dispatch_events
            .add(count, &[KeyValue::new("queue", queue.to_string())]);
    }
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otlp_endpoint_not_set() {
        assert!(otlp_endpoint(None).is_none());
    }

    #[test]
    fn test_otlp_endpoint_empty() {
        assert!(otlp_endpoint(Some("")).is_none());
        assert!(otlp_endpoint(Some("  ")).is_none());
    }

    #[test]
    fn test_otlp_endpoint_keeps_scheme() {
        assert_eq!(
            otlp_endpoint(Some("https://custom:4317")),
            Some("https://custom:4317".to_string())
        );
    }

    #[test]
    fn test_otlp_endpoint_adds_http_prefix() {
        assert_eq!(
            otlp_endpoint(Some("collector:4317")),
            Some("http://collector:4317".to_string())
        );
    }

    #[test]
    fn test_recording_without_provider_is_noop() {
        record_trace_event(&TraceEvent::default());
        record_dispatches("fallback", 3);
        record_dropped_events(1);
        assert!(metrics().is_none());
    }
}
