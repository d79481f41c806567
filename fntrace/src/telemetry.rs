//! OpenTelemetry metrics export module
//!
//! Exports per-call latency and probe health collected by fntrace to an
//! OpenTelemetry Collector. Export is only enabled when an OTLP endpoint is
//! configured (`OTEL_EXPORTER_OTLP_ENDPOINT` or `otel_exporter_otlp_endpoint`
//! in the settings file).

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

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<FnTraceMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Attached probe count per traced function (read by the ObservableGauge callback)
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct FnTraceMetrics {
    pub function_calls: Counter<u64>,
    pub function_latency_ns: Histogram<u64>,
    pub function_events: Counter<u64>,
    pub unpaired_events: Counter<u64>,
}

impl FnTraceMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            function_calls: meter
                .u64_counter("function_calls")
                .with_description("Number of completed calls of the traced function")
                .with_unit("calls")
                .build(),
            function_latency_ns: meter
                .u64_histogram("function_latency_ns")
                .with_description("Time between function entry and return")
                .with_unit("ns")
                .build(),
            function_events: meter
                .u64_counter("function_events")
                .with_description("Entry and exit records read from the ring buffer")
                .with_unit("events")
                .build(),
            unpaired_events: meter
                .u64_counter("unpaired_events")
                .with_description("Records that could not be paired into a call")
                .with_unit("events")
                .build(),
        }
    }
}

/// Normalizes the configured collector address; empty means disabled.
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
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if no endpoint is configured.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let endpoint = match otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("No OTLP endpoint configured. Metrics export disabled.");
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
        KeyValue::new("service.name", "fntrace"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("fntrace");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently attached uprobes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (function, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("function", function.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(FnTraceMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static FnTraceMetrics> {
    METRICS.get()
}

pub fn record_function_call(function: &str, comm: &str, duration_ns: u64) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("function", function.to_string()),
            KeyValue::new("process", comm.to_string()),
        ];
        m.function_calls.add(1, &attrs);
        m.function_latency_ns.record(duration_ns, &attrs);
    }
}

pub fn record_function_event(function: &str, kind: &str) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("function", function.to_string()),
            KeyValue::new("kind", kind.to_string()),
        ];
        m.function_events.add(1, &attrs);
    }
}

pub fn record_unpaired_event(function: &str, reason: &str, count: u64) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("function", function.to_string()),
            KeyValue::new("reason", reason.to_string()),
        ];
        m.unpaired_events.add(count, &attrs);
    }
}

/// Updates the attached probe count for a function.
pub fn record_active_probe(function: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(function.to_string(), count);
        info!("Active probes for {}: {}", function, count);
    }
}

pub fn active_probe_count(function: &str) -> Option<u64> {
    active_probes_map().read().ok()?.get(function).copied()
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
            otlp_endpoint(Some("https://collector:4317")),
            Some("https://collector:4317".to_string())
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
    fn test_init_without_endpoint_is_noop() {
        assert!(init_metrics(None).is_ok());
        assert!(metrics().is_none());

        // Recording without a provider must not panic.
        record_function_call("work", "app", 1_000);
        record_unpaired_event("work", "invalid", 1);
    }

    #[test]
    fn test_record_active_probe() {
        record_active_probe("telemetry_test_fn", 2);
        assert_eq!(active_probe_count("telemetry_test_fn"), Some(2));
        record_active_probe("telemetry_test_fn", 0);
        assert_eq!(active_probe_count("telemetry_test_fn"), Some(0));
    }
}
