//! Computes the freshness of one topic: the newest broker timestamp across its partitions.
//!
//! Every partition is probed for its high watermark and, when it holds records, the record just
//! below the watermark is read. Partition work runs on a worker pool shared by the whole cycle.
//! Partition failures never escape the scanner; they are folded into the [TopicScan].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cluster::{ClusterClient, PartitionRef};
use crate::error::{Error, Result};
use crate::probe;

/// What a single topic scan concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Newest broker timestamp (epoch millis) among the non-empty partitions that answered.
    Fresh { timestamp_ms: i64 },
    /// No partitions, or every partition is empty.
    Empty,
    /// The partitions could not be listed, or no partition succeeded and at least one failed.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicScan {
    pub topic: String,
    pub outcome: ScanOutcome,
    /// Partition-scoped errors swallowed while scanning, also present for a Fresh topic.
    pub partition_errors: Vec<Error>,
}

impl TopicScan {
    fn failed(topic: String, error: Error) -> Self {
        Self {
            topic,
            outcome: ScanOutcome::Failed {
                reason: error.to_string(),
            },
            partition_errors: vec![],
        }
    }
}

/// Scans topics against one cluster. Cloning shares the worker pool.
pub(crate) struct TopicScanner<C> {
    client: C,
    pool: Arc<Semaphore>,
    discovery_timeout: Duration,
    poll_timeout: Duration,
}

impl<C: Clone> Clone for TopicScanner<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            pool: Arc::clone(&self.pool),
            discovery_timeout: self.discovery_timeout,
            poll_timeout: self.poll_timeout,
        }
    }
}

impl<C> TopicScanner<C>
where
    C: ClusterClient + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        client: C,
        worker_pool_size: usize,
        discovery_timeout: Duration,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client,
            pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            discovery_timeout,
            poll_timeout,
        }
    }

    pub(crate) async fn scan(&self, topic: String) -> TopicScan {
        let partitions = match self.list_partitions(&topic).await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(%topic, ?e, "Skipping topic, failed to list its partitions");
                return TopicScan::failed(topic, e);
            }
        };

        if partitions.is_empty() {
            debug!(%topic, "Topic has no partitions");
            return TopicScan {
                topic,
                outcome: ScanOutcome::Empty,
                partition_errors: vec![],
            };
        }

        let mut tasks = JoinSet::new();
        let mut task_partitions = HashMap::with_capacity(partitions.len());
        for partition in partitions {
            let scanner = self.clone();
            let task_partition = partition.clone();
            let handle = tasks.spawn(async move { scanner.latest_timestamp(&task_partition).await });
            task_partitions.insert(handle.id(), partition);
        }

        let mut newest: Option<i64> = None;
        let mut empty = 0usize;
        let mut partition_errors = vec![];
        while let Some(joined) = tasks.join_next_with_id().await {
            let result = match joined {
                Ok((_, result)) => result,
                Err(join_error) => {
                    let partition = task_partitions
                        .get(&join_error.id())
                        .map_or_else(|| topic.clone(), ToString::to_string);
                    Err(Error::Fetch {
                        partition,
                        reason: format!("partition task failed: {join_error}"),
                    })
                }
            };

            match result {
                Ok(Some(timestamp_ms)) => {
                    newest = Some(newest.map_or(timestamp_ms, |n| n.max(timestamp_ms)));
                }
                Ok(None) => empty += 1,
                Err(e) => {
                    warn!(%topic, ?e, "Partition skipped");
                    partition_errors.push(e);
                }
            }
        }

        let outcome = match newest {
            Some(timestamp_ms) => ScanOutcome::Fresh { timestamp_ms },
            None if partition_errors.is_empty() => ScanOutcome::Empty,
            None => ScanOutcome::Failed {
                reason: format!(
                    "{} of {} partitions failed, the rest are empty",
                    partition_errors.len(),
                    partition_errors.len() + empty
                ),
            },
        };
        debug!(%topic, ?outcome, "Topic scanned");

        TopicScan {
            topic,
            outcome,
            partition_errors,
        }
    }

    async fn list_partitions(&self, topic: &str) -> Result<Vec<PartitionRef>> {
        let listed = tokio::time::timeout(
            self.discovery_timeout,
            self.client.list_partitions(topic, self.discovery_timeout),
        )
        .await;

        let partition_list_error = |reason: String| Error::PartitionList {
            topic: topic.to_string(),
            reason,
        };
        match listed {
            Ok(Ok(ids)) => Ok(ids
                .into_iter()
                .map(|id| PartitionRef::new(topic, id))
                .collect()),
            Ok(Err(e)) => Err(partition_list_error(e.to_string())),
            Err(_) => Err(partition_list_error(format!(
                "timed out after {}ms",
                self.discovery_timeout.as_millis()
            ))),
        }
    }

    /// Newest timestamp of one partition, None when it holds no records. Holds a pool slot for
    /// the probe and the fetch.
    async fn latest_timestamp(&self, partition: &PartitionRef) -> Result<Option<i64>> {
        let _permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|e| Error::Probe {
                partition: partition.to_string(),
                reason: format!("worker pool closed: {e}"),
            })?;

        let high_watermark =
            probe::high_watermark(&self.client, partition, self.discovery_timeout).await?;
        if high_watermark == 0 {
            debug!(%partition, "Partition is empty");
            return Ok(None);
        }

        probe::fetch_timestamp(&self.client, partition, high_watermark - 1, self.poll_timeout)
            .await
            .map(Some)
    }
}
