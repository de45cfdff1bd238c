//! In-memory cluster and metrics sink used by the engine tests. Failures and latency are injected
//! per operation so that every partial-failure path can be driven deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cluster::{ClusterClient, PartitionRef, ReadRecord};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;

/// Long enough to outlive every timeout used in the tests.
const HANG: Duration = Duration::from_secs(3600);

/// How a fake operation responds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Behavior {
    #[default]
    Ok,
    /// Returns a cluster error right away.
    Fail,
    /// Never answers.
    Hang,
    /// Poll window elapses without a record. Only meaningful for fetches.
    NoRecords,
    /// Panics inside the calling task.
    Panic,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakePartition {
    high_watermark: i64,
    latest_timestamp_ms: Option<i64>,
    returned_offset: Option<i64>,
    probe: Behavior,
    fetch: Behavior,
}

impl FakePartition {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// A partition whose newest record sits at `high_watermark - 1`.
    pub(crate) fn with_latest(high_watermark: i64, timestamp_ms: i64) -> Self {
        Self {
            high_watermark,
            latest_timestamp_ms: Some(timestamp_ms),
            ..Default::default()
        }
    }

    pub(crate) fn probe(mut self, behavior: Behavior) -> Self {
        self.probe = behavior;
        self
    }

    pub(crate) fn fetch(mut self, behavior: Behavior) -> Self {
        self.fetch = behavior;
        self
    }

    /// The poll answers with a record at `offset` whatever offset was asked for.
    pub(crate) fn returned_offset(mut self, offset: i64) -> Self {
        self.returned_offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, Default)]
struct FakeTopic {
    partitions: Vec<FakePartition>,
    list: Behavior,
}

#[derive(Debug, Default)]
struct FakeState {
    topics: BTreeMap<String, FakeTopic>,
    discovery: Behavior,
    discovery_delay: Duration,
}

/// Shared handle to an in-memory cluster. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
    polls: Arc<AtomicUsize>,
    discoveries_in_flight: Arc<AtomicUsize>,
    max_discoveries_in_flight: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_topic(self, name: &str, partitions: Vec<FakePartition>) -> Self {
        self.state.lock().topics.insert(
            name.to_string(),
            FakeTopic {
                partitions,
                list: Behavior::Ok,
            },
        );
        self
    }

    pub(crate) fn with_partition_listing(self, name: &str, behavior: Behavior) -> Self {
        self.state
            .lock()
            .topics
            .entry(name.to_string())
            .or_default()
            .list = behavior;
        self
    }

    pub(crate) fn with_discovery(self, behavior: Behavior) -> Self {
        self.state.lock().discovery = behavior;
        self
    }

    /// Every topic listing takes at least `delay`.
    pub(crate) fn with_discovery_delay(self, delay: Duration) -> Self {
        self.state.lock().discovery_delay = delay;
        self
    }

    pub(crate) fn set_discovery(&self, behavior: Behavior) {
        self.state.lock().discovery = behavior;
    }

    /// Number of polls issued so far.
    pub(crate) fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Highest number of topic listings that were running at the same time.
    pub(crate) fn max_concurrent_discoveries(&self) -> usize {
        self.max_discoveries_in_flight.load(Ordering::SeqCst)
    }

    fn partition(&self, partition: &PartitionRef) -> Result<FakePartition> {
        let state = self.state.lock();
        state
            .topics
            .get(&partition.topic)
            .and_then(|topic| {
                usize::try_from(partition.partition)
                    .ok()
                    .and_then(|idx| topic.partitions.get(idx))
            })
            .cloned()
            .ok_or_else(|| Error::Cluster(format!("unknown partition {partition}")))
    }
}

async fn respond(behavior: Behavior, operation: &str) -> Result<()> {
    match behavior {
        Behavior::Ok | Behavior::NoRecords => Ok(()),
        Behavior::Fail => Err(Error::Cluster(format!("injected {operation} failure"))),
        Behavior::Hang => {
            tokio::time::sleep(HANG).await;
            Err(Error::Cluster(format!("{operation} hung")))
        }
        Behavior::Panic => panic!("injected {operation} panic"),
    }
}

/// Counts a running operation, released on drop so cancelled calls are accounted for too.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>, max: &AtomicUsize) -> Self {
        let running = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(running, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ClusterClient for FakeCluster {
    async fn list_topics(&self, _timeout: Duration) -> Result<Vec<String>> {
        let _in_flight = InFlight::enter(
            &self.discoveries_in_flight,
            &self.max_discoveries_in_flight,
        );
        let (behavior, delay, topics) = {
            let state = self.state.lock();
            (
                state.discovery,
                state.discovery_delay,
                state.topics.keys().cloned().collect(),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        respond(behavior, "list topics").await?;
        Ok(topics)
    }

    async fn list_partitions(&self, topic: &str, _timeout: Duration) -> Result<Vec<i32>> {
        let fake_topic = self
            .state
            .lock()
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| Error::Cluster(format!("unknown topic {topic}")))?;
        respond(fake_topic.list, "list partitions").await?;
        Ok((0..fake_topic.partitions.len())
            .map(|p| i32::try_from(p).unwrap_or(i32::MAX))
            .collect())
    }

    async fn high_watermark(&self, partition: &PartitionRef, _timeout: Duration) -> Result<i64> {
        let fake = self.partition(partition)?;
        respond(fake.probe, "probe").await?;
        Ok(fake.high_watermark)
    }

    async fn poll_at(
        &self,
        partition: &PartitionRef,
        offset: i64,
        _timeout: Duration,
    ) -> Result<Option<ReadRecord>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let fake = self.partition(partition)?;
        respond(fake.fetch, "fetch").await?;
        if fake.fetch == Behavior::NoRecords {
            return Ok(None);
        }

        let newest = fake.high_watermark - 1;
        match fake.returned_offset {
            Some(returned) => Ok(Some(ReadRecord {
                offset: returned,
                timestamp_ms: fake.latest_timestamp_ms,
            })),
            None if offset == newest && newest >= 0 => Ok(Some(ReadRecord {
                offset,
                timestamp_ms: fake.latest_timestamp_ms,
            })),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    freshness: BTreeMap<String, f64>,
    health: Option<bool>,
    freshness_writes: usize,
    partition_failures: Vec<(String, String)>,
    topics_discovered: Option<usize>,
    cycles: usize,
}

/// Metrics sink that remembers what was published.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn freshness(&self) -> BTreeMap<String, f64> {
        self.state.lock().freshness.clone()
    }

    pub(crate) fn health(&self) -> Option<bool> {
        self.state.lock().health
    }

    pub(crate) fn freshness_writes(&self) -> usize {
        self.state.lock().freshness_writes
    }

    pub(crate) fn partition_failures(&self) -> Vec<(String, String)> {
        self.state.lock().partition_failures.clone()
    }

    /// Last topic count reported with a cycle, None if none was ever reported.
    pub(crate) fn topics_discovered(&self) -> Option<usize> {
        self.state.lock().topics_discovered
    }

    pub(crate) fn cycles(&self) -> usize {
        self.state.lock().cycles
    }
}

impl MetricsSink for RecordingSink {
    fn set_topic_freshness(&self, topic: &str, unix_seconds: f64) {
        let mut state = self.state.lock();
        state.freshness.insert(topic.to_string(), unix_seconds);
        state.freshness_writes += 1;
    }

    fn set_exporter_health(&self, healthy: bool) {
        self.state.lock().health = Some(healthy);
    }

    fn record_partition_failure(&self, topic: &str, reason: &str) {
        self.state
            .lock()
            .partition_failures
            .push((topic.to_string(), reason.to_string()));
    }

    fn observe_cycle(&self, _duration: Duration, topics_discovered: Option<usize>) {
        let mut state = self.state.lock();
        if topics_discovered.is_some() {
            state.topics_discovered = topics_discovered;
        }
        state.cycles += 1;
    }
}
