//! The freshness cycle: discover topics, scan them, publish. Repeated on a fixed cadence until
//! cancelled.
//!
//! ```text
//! Idle -> Discovering -> Scanning -> Publishing -> Idle
//!             |                                    ^
//!             +---------- discovery failed --------+
//! ```
//!
//! Freshness values are written only while publishing. A failed discovery only reports health
//! and the cycle duration.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::ClusterClient;
use crate::config::EngineConfig;
use crate::discovery;
use crate::error::Error;
use crate::metrics::MetricsSink;
use crate::scanner::{ScanOutcome, TopicScan, TopicScanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Discovering,
    Scanning,
    Publishing,
}

/// Everything a single cycle decided.
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub healthy: bool,
    /// Set when the cycle was aborted because topics could not be listed.
    pub discovery_error: Option<Error>,
    /// Topics whose scan completed, in completion order.
    pub scans: Vec<TopicScan>,
    /// Topics still being scanned when the cycle deadline hit.
    pub abandoned: Vec<String>,
    /// Topics whose scan task panicked.
    pub crashed: Vec<String>,
    pub duration: Duration,
}

impl CycleResult {
    pub fn topics_discovered(&self) -> usize {
        self.scans.len() + self.abandoned.len() + self.crashed.len()
    }

    /// Topics and the event time (in seconds) published for them.
    pub fn published(&self) -> impl Iterator<Item = (&str, f64)> {
        self.scans.iter().filter_map(|scan| match scan.outcome {
            ScanOutcome::Fresh { timestamp_ms } => {
                Some((scan.topic.as_str(), millis_to_seconds(timestamp_ms)))
            }
            _ => None,
        })
    }
}

/// Broker timestamps are whole milliseconds; the exposed gauge is fractional seconds.
fn millis_to_seconds(timestamp_ms: i64) -> f64 {
    timestamp_ms as f64 / 1000.0
}

/// Drives discovery, scanning and publishing against one cluster and one metrics sink.
pub struct FreshnessCycle<C, S> {
    client: C,
    sink: S,
    config: EngineConfig,
    phase: CyclePhase,
    #[cfg(test)]
    phase_history: Vec<CyclePhase>,
}

/// Completed scans plus the topics that never produced one.
struct ScanReport {
    scans: Vec<TopicScan>,
    abandoned: Vec<String>,
    crashed: Vec<String>,
}

impl<C, S> FreshnessCycle<C, S>
where
    C: ClusterClient + Clone + Send + Sync + 'static,
    S: MetricsSink,
{
    pub fn new(client: C, sink: S, config: EngineConfig) -> Self {
        Self {
            client,
            sink,
            config,
            phase: CyclePhase::Idle,
            #[cfg(test)]
            phase_history: vec![],
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    fn enter(&mut self, phase: CyclePhase) {
        self.phase = phase;
        #[cfg(test)]
        self.phase_history.push(phase);
    }

    /// Runs one cycle to completion. Never fails: a failed cycle is reported through the health
    /// gauge and the returned [CycleResult].
    pub async fn run_once(&mut self) -> CycleResult {
        let started = Instant::now();

        self.enter(CyclePhase::Discovering);
        let topics = match discovery::discover(
            &self.client,
            &self.config.topic_prefixes,
            self.config.discovery_timeout,
        )
        .await
        {
            Ok(topics) => topics,
            Err(e) => {
                let duration = started.elapsed();
                error!(?e, ?duration, "Topic discovery failed, skipping cycle");
                // the topic count is unknown, so the last reported one stays
                self.sink.set_exporter_health(false);
                self.sink.observe_cycle(duration, None);
                self.enter(CyclePhase::Idle);
                return CycleResult {
                    healthy: false,
                    discovery_error: Some(e),
                    scans: vec![],
                    abandoned: vec![],
                    crashed: vec![],
                    duration,
                };
            }
        };

        self.enter(CyclePhase::Scanning);
        let report = self.scan_topics(topics).await;

        let succeeded = report
            .scans
            .iter()
            .filter(|scan| !matches!(scan.outcome, ScanOutcome::Failed { .. }))
            .count();
        let discovered = report.scans.len() + report.abandoned.len() + report.crashed.len();
        let result = CycleResult {
            healthy: discovered == 0 || succeeded > 0,
            discovery_error: None,
            scans: report.scans,
            abandoned: report.abandoned,
            crashed: report.crashed,
            duration: started.elapsed(),
        };
        self.publish(&result);
        result
    }

    /// Runs a cycle right away and then once per interval until `cancel` fires. A cycle that
    /// overruns the interval delays the next one instead of overlapping it.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            prefixes = ?self.config.topic_prefixes,
            "Starting freshness cycles"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Cancelled in the middle of a cycle");
                    break;
                }
                _ = self.run_once() => {}
            }
        }
        self.enter(CyclePhase::Idle);
        info!("Freshness cycles stopped");
    }

    /// Scans every topic, at most `topic_concurrency` at a time, until all are done or the cycle
    /// deadline passes.
    async fn scan_topics(&self, topics: BTreeSet<String>) -> ScanReport {
        let scanner = TopicScanner::new(
            self.client.clone(),
            self.config.worker_pool_size,
            self.config.discovery_timeout,
            self.config.poll_timeout,
        );
        let topic_slots = Arc::new(Semaphore::new(self.config.topic_concurrency.max(1)));

        let mut tasks = JoinSet::new();
        let mut task_topics: HashMap<Id, String> = HashMap::with_capacity(topics.len());
        for topic in topics.iter().cloned() {
            let scanner = scanner.clone();
            let topic_slots = Arc::clone(&topic_slots);
            let handle = tasks.spawn({
                let topic = topic.clone();
                async move {
                    let _slot = topic_slots.acquire_owned().await;
                    scanner.scan(topic).await
                }
            });
            task_topics.insert(handle.id(), topic);
        }

        let mut pending = topics;
        let mut scans = Vec::with_capacity(pending.len());
        let mut crashed = vec![];
        let deadline = Instant::now() + self.config.cycle_deadline;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(Some(Ok((_, scan)))) => {
                    pending.remove(&scan.topic);
                    scans.push(scan);
                }
                Ok(Some(Err(join_error))) => {
                    let Some(topic) = task_topics.remove(&join_error.id()) else {
                        error!(?join_error, "Unknown topic scan task failed");
                        continue;
                    };
                    error!(%topic, ?join_error, "Topic scan task failed");
                    pending.remove(&topic);
                    crashed.push(topic);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        deadline = ?self.config.cycle_deadline,
                        unfinished = pending.len(),
                        "Cycle deadline exceeded, abandoning unfinished topics"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        ScanReport {
            scans,
            abandoned: pending.into_iter().collect(),
            crashed,
        }
    }

    fn publish(&mut self, result: &CycleResult) {
        self.enter(CyclePhase::Publishing);

        for scan in &result.scans {
            match &scan.outcome {
                ScanOutcome::Fresh { timestamp_ms } => {
                    self.sink
                        .set_topic_freshness(&scan.topic, millis_to_seconds(*timestamp_ms));
                }
                ScanOutcome::Empty => {
                    info!(topic = %scan.topic, "Topic has no records, keeping previous value");
                }
                ScanOutcome::Failed { reason } => {
                    warn!(topic = %scan.topic, %reason, "No freshness for topic this cycle");
                }
            }
            for e in &scan.partition_errors {
                self.sink.record_partition_failure(&scan.topic, e.reason_label());
            }
        }

        self.sink.set_exporter_health(result.healthy);
        self.sink
            .observe_cycle(result.duration, Some(result.topics_discovered()));

        let published = result.published().count();
        if result.healthy {
            info!(
                discovered = result.topics_discovered(),
                published,
                abandoned = result.abandoned.len(),
                crashed = result.crashed.len(),
                duration = ?result.duration,
                "Freshness cycle completed"
            );
        } else {
            error!(
                discovered = result.topics_discovered(),
                published,
                duration = ?result.duration,
                "Freshness cycle failed"
            );
        }

        self.enter(CyclePhase::Idle);
    }
}
