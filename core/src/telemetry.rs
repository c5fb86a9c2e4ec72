use crate::config::{LogFormat, TelemetryConfig};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Page fetches range from a fast JSON list to a slow XML export.
const FETCH_DURATION_BUCKETS_MS: &[f64] = &[
    50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0,
];

pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_tracing(config);

    // One invocation is usually short-lived, so the exporter is opt-in.
    if config.metrics_enabled {
        init_metrics(config.metrics_port)?;
    }

    Ok(())
}

fn init_tracing(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "ingestor")
        .set_buckets_for_metric(
            Matcher::Full("ingestor_fetch_duration_ms".to_string()),
            FETCH_DURATION_BUCKETS_MS,
        )?
        .install()?;

    describe_metrics();
    tracing::info!(port, "Metrics endpoint started at http://0.0.0.0:{}/metrics", port);
    Ok(())
}

/// Registers help text for every metric the ingestor emits.
pub fn describe_metrics() {
    describe_counter!("ingestor_pages_fetched", "Pages fetched, per task");
    describe_counter!("ingestor_items_upserted", "Items mapped and upserted, per task");
    describe_counter!("ingestor_item_errors", "Item failures, per task");
    describe_counter!("ingestor_downloads_enqueued", "Attachment downloads queued, per owning table");
    describe_counter!("ingestor_runs_finished", "Invocations finished, per terminal status");
    describe_counter!("ingestor_rows_upserted", "Rows written to target tables");
    describe_counter!("ingestor_checkpoints_saved", "Progress checkpoints persisted");
    describe_histogram!(
        "ingestor_fetch_duration_ms",
        Unit::Milliseconds,
        "Wall time of one page request"
    );
}

pub fn shutdown() {
    tracing::debug!("Shutting down telemetry");
}
