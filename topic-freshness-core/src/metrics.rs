//! Freshness metrics and the HTTP endpoint they are scraped from.
//!
//! The registry is owned by a [FreshnessMetrics] handle that is created once at startup and
//! cloned into the freshness cycle (writer) and the scrape server (reader). There is no
//! process-wide registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum_server::Handle;
use http::{Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

const TOPIC_FRESHNESS: &str = "topic_last_event_timestamp_seconds";
const EXPORTER_UP: &str = "topic_metric_exporter_up";
// the text encoder appends `_total` to counters
const PARTITION_FAILURES: &str = "topic_metric_exporter_partition_failures";
const CYCLE_DURATION: &str = "topic_metric_exporter_cycle_duration_seconds";
const TOPICS_DISCOVERED: &str = "topic_metric_exporter_topics_discovered";

const TOPIC_LABEL: &str = "topic";
const REASON_LABEL: &str = "reason";

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the freshness cycle publishes its results. Only the cycle writes, and only while it
/// is publishing.
pub trait MetricsSink: Send + Sync + 'static {
    /// Sets the newest event time of `topic`, in fractional seconds since the epoch.
    fn set_topic_freshness(&self, topic: &str, unix_seconds: f64);

    fn set_exporter_health(&self, healthy: bool);

    fn record_partition_failure(&self, _topic: &str, _reason: &str) {}

    /// Called once at the end of every cycle, successful or not. `topics_discovered` is None
    /// when the topics could not be listed.
    fn observe_cycle(&self, _duration: Duration, _topics_discovered: Option<usize>) {}
}

type Labels = Vec<(String, String)>;

/// Cloneable handle to the exporter's registry and metrics.
#[derive(Clone)]
pub struct FreshnessMetrics {
    registry: Arc<parking_lot::Mutex<Registry>>,
    topic_freshness: Family<Labels, Gauge<f64, AtomicU64>>,
    exporter_up: Gauge<f64, AtomicU64>,
    partition_failures: Family<Labels, Counter>,
    cycle_duration: Gauge<f64, AtomicU64>,
    topics_discovered: Gauge,
    ready: Arc<AtomicBool>,
}

impl Default for FreshnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FreshnessMetrics {
    pub fn new() -> Self {
        let metrics = Self {
            registry: Arc::new(parking_lot::Mutex::new(Registry::default())),
            topic_freshness: Family::default(),
            exporter_up: Gauge::default(),
            partition_failures: Family::default(),
            cycle_duration: Gauge::default(),
            topics_discovered: Gauge::default(),
            ready: Arc::new(AtomicBool::new(false)),
        };

        let mut registry = metrics.registry.lock();
        registry.register(
            TOPIC_FRESHNESS,
            "Unix time in seconds of the newest event on the topic",
            metrics.topic_freshness.clone(),
        );
        registry.register(
            EXPORTER_UP,
            "Whether the last freshness cycle succeeded (1) or failed (0)",
            metrics.exporter_up.clone(),
        );
        registry.register(
            PARTITION_FAILURES,
            "Partition probes and fetches that failed, by topic and reason",
            metrics.partition_failures.clone(),
        );
        registry.register(
            CYCLE_DURATION,
            "Duration of the last freshness cycle in seconds",
            metrics.cycle_duration.clone(),
        );
        registry.register(
            TOPICS_DISCOVERED,
            "Number of topics matching the configured prefixes in the last cycle",
            metrics.topics_discovered.clone(),
        );
        drop(registry);

        metrics
    }

    /// True once at least one cycle has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Snapshot of the registry in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        let registry = self.registry.lock();
        let mut buffer = String::new();
        encode(&mut buffer, &registry)
            .map_err(|e| Error::MetricsServer(format!("Encoding metrics: {e}")))?;
        Ok(buffer)
    }
}

impl MetricsSink for FreshnessMetrics {
    fn set_topic_freshness(&self, topic: &str, unix_seconds: f64) {
        self.topic_freshness
            .get_or_create(&vec![(TOPIC_LABEL.to_string(), topic.to_string())])
            .set(unix_seconds);
    }

    fn set_exporter_health(&self, healthy: bool) {
        self.exporter_up.set(if healthy { 1.0 } else { 0.0 });
    }

    fn record_partition_failure(&self, topic: &str, reason: &str) {
        self.partition_failures
            .get_or_create(&vec![
                (TOPIC_LABEL.to_string(), topic.to_string()),
                (REASON_LABEL.to_string(), reason.to_string()),
            ])
            .inc();
    }

    fn observe_cycle(&self, duration: Duration, topics_discovered: Option<usize>) {
        self.cycle_duration.set(duration.as_secs_f64());
        // an unknown count leaves the last known one in place
        if let Some(topics_discovered) = topics_discovered {
            self.topics_discovered
                .set(i64::try_from(topics_discovered).unwrap_or(i64::MAX));
        }
        self.ready.store(true, Ordering::Relaxed);
    }
}

/// Serves `/metrics`, `/livez` and `/readyz` on `addr` until `cancel` fires, then drains
/// in-flight scrapes and returns.
pub async fn start_metrics_server(
    addr: SocketAddr,
    metrics: FreshnessMetrics,
    cancel: CancellationToken,
) -> Result<()> {
    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone(), cancel));

    info!(?addr, "Starting metrics server");
    axum_server::bind(addr)
        .handle(handle)
        .serve(metrics_router(metrics).into_make_service())
        .await
        .map_err(|e| Error::MetricsServer(format!("Starting web server for metrics: {e}")))?;

    info!("Metrics server stopped");
    Ok(())
}

async fn graceful_shutdown(handle: Handle, cancel: CancellationToken) {
    cancel.cancelled().await;
    info!("Sending graceful shutdown signal to metrics server");
    handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
}

/// router for metrics and k8s health endpoints
fn metrics_router(metrics: FreshnessMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<FreshnessMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(buffer) => {
            debug!(bytes = buffer.len(), "Exposing metrics");
            Response::builder()
                .status(StatusCode::OK)
                .header(
                    http::header::CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )
                .body(Body::from(buffer))
                .map_err(|e| {
                    error!(?e, "Building metrics response");
                    StatusCode::INTERNAL_SERVER_ERROR
                })
                .into_response()
        }
        Err(e) => {
            error!(?e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn readyz(State(metrics): State<FreshnessMetrics>) -> impl IntoResponse {
    if metrics.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
