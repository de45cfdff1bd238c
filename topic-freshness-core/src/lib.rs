//! Topic freshness exporter.
//!
//! Periodically finds the topics matching a set of name prefixes, reads the broker timestamp of
//! the newest record of every partition and publishes the newest one per topic as
//! `topic_last_event_timestamp_seconds{topic}`, next to a `topic_metric_exporter_up` health
//! gauge. Reads never join a consumer group and never commit offsets.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use topic_freshness_kafka::KafkaClusterClient;
use tracing::{error, info};

pub use crate::error::{Error, Result};

mod error;

/// Environment driven configuration.
pub mod config;

/// Read-only cluster access used by the engine.
pub mod cluster;

/// Prefix based topic discovery.
mod discovery;

/// Watermark probe and latest-record fetch of a single partition.
mod probe;

/// Topic level aggregation of partition timestamps.
pub mod scanner;

/// Discover, scan, publish; on a fixed cadence.
pub mod cycle;

/// Prometheus registry, scrape server and the sink the cycle publishes to.
pub mod metrics;

#[cfg(test)]
mod test_utils;

use crate::config::ExporterConfig;
use crate::cycle::{CycleResult, FreshnessCycle};
use crate::metrics::FreshnessMetrics;

/// Connects to the cluster, serves the metrics endpoint and runs freshness cycles until `cancel`
/// fires.
pub async fn run(config: ExporterConfig, cancel: CancellationToken) -> Result<()> {
    info!(
        bootstrap_servers = %config.cluster.bootstrap_servers(),
        prefixes = ?config.engine.topic_prefixes,
        interval = ?config.engine.interval,
        security_protocol = %config.cluster.security_protocol,
        "Starting topic freshness exporter"
    );

    let client = KafkaClusterClient::connect(config.cluster.clone())?;
    let metrics = FreshnessMetrics::new();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_cancel = cancel.child_token();
    let mut server = tokio::spawn(metrics::start_metrics_server(
        addr,
        metrics.clone(),
        server_cancel.clone(),
    ));

    let cycle = FreshnessCycle::new(client, metrics, config.engine);
    tokio::select! {
        _ = cycle.run(cancel.clone()) => {}
        served = &mut server => {
            // the server only returns on its own when it could not start
            error!("Metrics server exited, stopping the exporter");
            cancel.cancel();
            return flatten_server_result(served);
        }
    }

    server_cancel.cancel();
    flatten_server_result(server.await)?;
    info!("Exporter stopped");
    Ok(())
}

fn flatten_server_result(
    served: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    served.map_err(|e| Error::MetricsServer(format!("metrics server task failed: {e}")))?
}

/// Runs a single cycle against the cluster and returns its result together with the metrics
/// exposition it produced.
pub async fn run_once(config: ExporterConfig) -> Result<(CycleResult, String)> {
    let client = KafkaClusterClient::connect(config.cluster.clone())?;
    let metrics = FreshnessMetrics::new();

    let mut cycle = FreshnessCycle::new(client, metrics.clone(), config.engine);
    let result = cycle.run_once().await;
    if let Some(e) = &result.discovery_error {
        error!(?e, "Single cycle could not discover topics");
    }

    let exposition = metrics.encode()?;
    Ok((result, exposition))
}
