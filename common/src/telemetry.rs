// Telemetry module for structured logging, metrics, and tracing

use crate::models::{EntityKind, FetchOutcome};
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "plan-sync";

/// Initialize structured logging with JSON formatting and trace context
///
/// `RUST_LOG` takes precedence over the configured level. When a tracing
/// endpoint is given, spans are also exported over OTLP.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans; call once before exit
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the pipeline metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "calendar_fetch_total",
        "Calendar fetches by entity kind and outcome"
    );
    describe_histogram!(
        "calendar_fetch_duration_seconds",
        "Wall time of one entity's calendar fetch including retries"
    );
    describe_counter!(
        "sessions_extracted_total",
        "Class sessions extracted from calendar documents"
    );
    describe_counter!(
        "sessions_written_total",
        "Class session rows acknowledged by the store"
    );
    describe_counter!(
        "write_conflicts_total",
        "Rows the store rejected after row-by-row retry"
    );
    describe_counter!(
        "field_truncations_total",
        "Text fields truncated to their column limit"
    );
    describe_gauge!(
        "deferred_links",
        "Junction links waiting for an unknown counterpart"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_fetch(kind: EntityKind, outcome: FetchOutcome, duration_seconds: f64) {
    counter!(
        "calendar_fetch_total",
        "kind" => kind.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!("calendar_fetch_duration_seconds", "kind" => kind.as_str()).record(duration_seconds);
}

#[inline]
pub fn record_sessions_extracted(kind: EntityKind, count: usize) {
    counter!("sessions_extracted_total", "kind" => kind.as_str()).increment(count as u64);
}

#[inline]
pub fn record_sessions_written(count: usize) {
    counter!("sessions_written_total").increment(count as u64);
}

#[inline]
pub fn record_write_conflicts(table: &'static str, count: usize) {
    counter!("write_conflicts_total", "table" => table).increment(count as u64);
}

#[inline]
pub fn record_truncation(table: &'static str, column: &'static str) {
    counter!("field_truncations_total", "table" => table, "column" => column).increment(1);
}

#[inline]
pub fn set_deferred_links(count: usize) {
    gauge!("deferred_links").set(count as f64);
}
