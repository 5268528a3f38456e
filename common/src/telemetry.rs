// Telemetry: structured logging, Prometheus metrics, optional OTLP tracing

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
use uuid::Uuid;

const SERVICE_NAME: &str = "migration-scheduler";

/// Initialize JSON logging; `RUST_LOG` wins over `log_level` when set.
/// With a tracing endpoint, spans are also exported over OTLP.
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(log_level, tracing_endpoint, "Structured logging initialized");
    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let provider = TracerProvider::builder()
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

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(SERVICE_NAME))
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter on `0.0.0.0:<port>` and describe all metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("migration_run_success_total", "Runs whose worker exited with code 0");
    describe_counter!(
        "migration_run_failed_total",
        "Runs that exited non-zero or could not be launched"
    );
    describe_histogram!("migration_run_duration_seconds", "Wall-clock duration of runs");
    describe_counter!(
        "migration_trigger_skipped_total",
        "Triggers that did not start a run, by reason"
    );
    describe_counter!(
        "migration_dependency_wait_total",
        "Dependency waits by result (armed, released, timed_out, cancelled)"
    );
    describe_gauge!("migration_jobs_armed", "Jobs with an armed recurrence timer");

    tracing::info!(metrics_port, "Prometheus metrics exporter initialized");
    Ok(())
}

#[inline]
pub fn record_run_success(job_id: &Uuid, job_name: &str) {
    counter!(
        "migration_run_success_total",
        "job_id" => job_id.to_string(),
        "job_name" => job_name.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_run_failure(job_id: &Uuid, job_name: &str, reason: &str) {
    counter!(
        "migration_run_failed_total",
        "job_id" => job_id.to_string(),
        "job_name" => job_name.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_run_duration(job_id: &Uuid, job_name: &str, duration_seconds: f64) {
    histogram!(
        "migration_run_duration_seconds",
        "job_id" => job_id.to_string(),
        "job_name" => job_name.to_string()
    )
    .record(duration_seconds);
}

/// `reason` is one of: running, dependencies, wait_pending
#[inline]
pub fn record_trigger_skipped(reason: &'static str) {
    counter!("migration_trigger_skipped_total", "reason" => reason).increment(1);
}

#[inline]
pub fn record_dependency_wait(result: &'static str) {
    counter!("migration_dependency_wait_total", "result" => result).increment(1);
}

#[inline]
pub fn set_jobs_armed(count: usize) {
    gauge!("migration_jobs_armed").set(count as f64);
}
