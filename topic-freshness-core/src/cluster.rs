//! The cluster as seen by the freshness engine: a read-only handle that can list topics and
//! partitions, probe watermarks and read the record at a given offset.

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// [ClusterClient] backed by librdkafka.
mod kafka;

/// A single partition of a topic. Listed fresh every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionRef {
    pub topic: String,
    pub partition: i32,
}

impl PartitionRef {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A record returned by [LocalClusterClient::poll_at].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRecord {
    pub offset: i64,
    /// Broker-assigned timestamp in epoch milliseconds, None if the record has none.
    pub timestamp_ms: Option<i64>,
}

/// Handle to an already connected and authenticated cluster. Implementations are cloned into
/// every concurrent probe/fetch task, so cloning must be cheap and must not share cursors.
#[trait_variant::make(ClusterClient: Send)]
pub trait LocalClusterClient {
    /// Names of all topics visible on the cluster.
    async fn list_topics(&self, timeout: Duration) -> Result<Vec<String>>;

    /// Partition ids of `topic`.
    async fn list_partitions(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>>;

    /// High watermark of the partition, `0` when the partition holds no records.
    async fn high_watermark(&self, partition: &PartitionRef, timeout: Duration) -> Result<i64>;

    /// Reads the record at `offset` with a throwaway cursor and a single poll bounded by
    /// `timeout`. None when no record arrived in time.
    async fn poll_at(
        &self,
        partition: &PartitionRef,
        offset: i64,
        timeout: Duration,
    ) -> Result<Option<ReadRecord>>;
}
