mod buffer;
mod config;
mod delivery;
mod mqtt;
mod sink;
mod stats;
mod telemetry;

use crate::config::{Backend, Config};
use crate::delivery::DeliveryLoop;
use crate::sink::{
    build_pool, BatchWriter, BufferedSink, ClickHouseWriter, InfluxWriter, SimulatorWriter,
    TimescaleWriter,
};
use crate::stats::BridgeStats;
use anyhow::Result;
use futures::FutureExt;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_db_bridge=info".into());
    let traces = match config.otlp_endpoint.as_deref().and_then(traces_endpoint) {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true),
        )
        .with(traces)
        .try_init()?;
    Ok(())
}

fn otlp_tracer(endpoint: String) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace, Resource};

    let resource = Resource::new([KeyValue::new("service.name", env!("CARGO_PKG_NAME"))]);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http().with_endpoint(endpoint))
        .with_trace_config(trace::Config::default().with_resource(resource))
        .install_batch(Tokio)?;
    Ok(tracer)
}

/// OTLP over HTTP posts spans to `/v1/traces`; a bare collector address gets
/// the path appended. Blank means export is off.
fn traces_endpoint(raw: &str) -> Option<String> {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        return None;
    }
    if raw.ends_with("/v1/traces") {
        Some(raw.to_string())
    } else {
        Some(format!("{raw}/v1/traces"))
    }
}

async fn run<W: BatchWriter>(config: Config, writer: W, stats: Arc<BridgeStats>) -> Result<()> {
    let sink = Arc::new(BufferedSink::new(
        writer,
        config.buffer_max_items,
        config.buffer_max_age(),
        stats.clone(),
    ));
    let delivery = DeliveryLoop::new(sink, config.retry_delay(), stats.clone());

    let stats_handle = {
        let stats = stats.clone();
        let interval = config.stats_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_summary();
            }
        })
    };

    let shutdown = tokio::signal::ctrl_c().map(|res| {
        if let Err(err) = res {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    });
    let result = mqtt::run_listener(&config, delivery, stats.clone(), shutdown).await;

    stats_handle.abort();
    stats.log_summary();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    config.log_startup();

    let stats = Arc::new(BridgeStats::new());
    match config.backend {
        Backend::ClickHouse => {
            let writer = ClickHouseWriter::new(&config.db)?;
            run(config, writer, stats).await
        }
        Backend::InfluxDb => {
            let writer = InfluxWriter::new(&config.db)?;
            run(config, writer, stats).await
        }
        Backend::Timescale => {
            let pool = build_pool(&config.db.postgres_url()?, config.db.pool_size)?;
            run(config, TimescaleWriter::new(pool), stats).await
        }
        Backend::Simulator => run(config, SimulatorWriter, stats).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_address_gets_traces_path() {
        assert_eq!(
            traces_endpoint("http://collector:4318/").as_deref(),
            Some("http://collector:4318/v1/traces")
        );
        assert_eq!(
            traces_endpoint(" http://collector:4318/v1/traces ").as_deref(),
            Some("http://collector:4318/v1/traces")
        );
        assert_eq!(traces_endpoint("  "), None);
    }
}
