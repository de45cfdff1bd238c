use std::time::Duration;

use topic_freshness_kafka::{KafkaClusterClient, PolledRecord};

use crate::cluster::{ClusterClient, PartitionRef, ReadRecord};

impl From<PolledRecord> for ReadRecord {
    fn from(record: PolledRecord) -> Self {
        Self {
            offset: record.offset,
            timestamp_ms: record.timestamp_ms,
        }
    }
}

/// Kafka reports an emptied partition as `low == high` with `high > 0` once retention has
/// removed every record, so the watermark pair is folded into "0 means empty" here.
fn normalize_high_watermark(low: i64, high: i64) -> i64 {
    if high <= low { 0 } else { high }
}

impl ClusterClient for KafkaClusterClient {
    async fn list_topics(&self, timeout: Duration) -> crate::Result<Vec<String>> {
        Ok(KafkaClusterClient::list_topics(self, timeout).await?)
    }

    async fn list_partitions(&self, topic: &str, timeout: Duration) -> crate::Result<Vec<i32>> {
        Ok(KafkaClusterClient::list_partitions(self, topic, timeout).await?)
    }

    async fn high_watermark(
        &self,
        partition: &PartitionRef,
        timeout: Duration,
    ) -> crate::Result<i64> {
        let (low, high) = self
            .watermarks(&partition.topic, partition.partition, timeout)
            .await?;
        Ok(normalize_high_watermark(low, high))
    }

    async fn poll_at(
        &self,
        partition: &PartitionRef,
        offset: i64,
        timeout: Duration,
    ) -> crate::Result<Option<ReadRecord>> {
        let polled =
            KafkaClusterClient::poll_at(self, &partition.topic, partition.partition, offset, timeout)
                .await?;
        Ok(polled.map(ReadRecord::from))
    }
}
