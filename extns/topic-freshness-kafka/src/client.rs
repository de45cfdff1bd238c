use std::sync::Arc;
use std::time::Duration;

use rdkafka::Offset;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tracing::{debug, error, warn};

use crate::{Error, KafkaClusterConfig, Result};

/// Group id handed to librdkafka. The cursors only ever `assign`, so the group is never joined
/// and, with auto commit and offset store disabled, nothing is ever committed under it.
const NO_COMMIT_GROUP_ID: &str = "topic-freshness-exporter-no-commit";

/// Upper bound on queued events handled per drain so a flood of broker errors cannot stall a
/// cycle.
const MAX_DRAINED_EVENTS: usize = 1000;

/// The newest record of a partition as returned by a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolledRecord {
    /// Offset of the record the broker actually returned.
    pub offset: i64,
    /// Broker-assigned timestamp in milliseconds since epoch, None if the record carries none.
    pub timestamp_ms: Option<i64>,
}

/// Read-only view of a Kafka cluster.
///
/// Metadata and watermark queries go through one long-lived handle which librdkafka allows to be
/// used from many threads. Reading a record needs a positioned cursor, so every read creates its
/// own consumer, uses it for a single poll and drops it before returning.
#[derive(Clone)]
pub struct KafkaClusterClient {
    config: Arc<KafkaClusterConfig>,
    metadata: Arc<BaseConsumer>,
}

impl KafkaClusterClient {
    pub fn connect(config: KafkaClusterConfig) -> Result<Self> {
        let metadata: BaseConsumer =
            base_client_config(&config)
                .create()
                .map_err(|err| Error::Connection {
                    server: config.bootstrap_servers(),
                    error: err.to_string(),
                })?;

        Ok(Self {
            config: Arc::new(config),
            metadata: Arc::new(metadata),
        })
    }

    /// Serves the events queued on the long-lived metadata handle (errors, logs, statistics).
    /// librdkafka only hands them out on poll, and the handle never consumes, so without this the
    /// queue grows for the lifetime of the process. Returns the number of events served.
    pub async fn drain_events(&self) -> usize {
        let consumer = Arc::clone(&self.metadata);
        run_blocking(move || Ok(drain_queue(&consumer)))
            .await
            .unwrap_or(0)
    }

    /// Names of every topic visible on the cluster. Also drains the metadata handle's event
    /// queue, which happens once per cycle.
    pub async fn list_topics(&self, timeout: Duration) -> Result<Vec<String>> {
        let consumer = Arc::clone(&self.metadata);
        // fetch_metadata blocks on librdkafka, keep it off the async workers.
        run_blocking(move || {
            drain_queue(&consumer);
            let metadata = consumer
                .fetch_metadata(None, timeout)
                .map_err(|e| Error::Kafka(format!("Failed to fetch cluster metadata: {e}")))?;
            Ok(metadata
                .topics()
                .iter()
                .map(|topic| topic.name().to_string())
                .collect())
        })
        .await
    }

    /// Partition ids of a single topic.
    pub async fn list_partitions(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>> {
        let consumer = Arc::clone(&self.metadata);
        let topic = topic.to_string();
        run_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| Error::Kafka(format!("Failed to fetch metadata for {topic}: {e}")))?;
            let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
                return Err(Error::Kafka(format!("No topic metadata found for {topic}")));
            };
            if let Some(err) = topic_metadata.error() {
                return Err(Error::Kafka(format!(
                    "Broker returned an error for topic {topic}: {err:?}"
                )));
            }
            Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
        })
        .await
    }

    /// Low and high watermark of a partition.
    pub async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> Result<(i64, i64)> {
        let consumer = Arc::clone(&self.metadata);
        let topic = topic.to_string();
        run_blocking(move || {
            consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map_err(|e| {
                    Error::Kafka(format!(
                        "Failed to fetch watermarks for {topic}[{partition}]: {e}"
                    ))
                })
        })
        .await
    }

    /// Positions a throwaway cursor at `offset` and polls once, waiting at most `timeout`.
    /// Returns None when nothing arrived within the poll window.
    pub async fn poll_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        timeout: Duration,
    ) -> Result<Option<PolledRecord>> {
        let config = Arc::clone(&self.config);
        let topic = topic.to_string();
        run_blocking(move || {
            let cursor = create_cursor(&config)?;

            let mut tpl = TopicPartitionList::with_capacity(1);
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset))
                .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
            cursor.assign(&tpl).map_err(|e| {
                Error::Kafka(format!("Failed to assign {topic}[{partition}]: {e}"))
            })?;

            let polled = match cursor.poll(timeout) {
                None => None,
                Some(Err(e)) => {
                    return Err(Error::Kafka(format!(
                        "Failed to read {topic}[{partition}]@{offset}: {e}"
                    )));
                }
                Some(Ok(message)) => Some(PolledRecord {
                    offset: message.offset(),
                    timestamp_ms: message.timestamp().to_millis(),
                }),
            };
            debug!(%topic, partition, offset, ?polled, "Polled latest record");
            // the cursor is dropped here, closing its broker connections
            Ok(polled)
        })
        .await
    }
}

/// Polls without waiting until the queue is empty or [MAX_DRAINED_EVENTS] were served.
fn drain_queue(consumer: &BaseConsumer) -> usize {
    let mut served = 0;
    while served < MAX_DRAINED_EVENTS {
        match consumer.poll(Duration::ZERO) {
            None => break,
            Some(Err(e)) => warn!(?e, "Kafka client reported an error"),
            Some(Ok(message)) => {
                debug!(topic = message.topic(), "Ignoring message on the metadata handle");
            }
        }
        served += 1;
    }
    served
}

fn base_client_config(config: &KafkaClusterConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("broker.address.family", "v4")
        .set("allow.auto.create.topics", "false")
        .set("group.id", NO_COMMIT_GROUP_ID)
        .set("enable.auto.commit", "false")
        .set_log_level(RDKafkaLogLevel::Warning);

    crate::update_auth_config(
        &mut client_config,
        &config.security_protocol,
        config.tls.as_ref(),
        config.auth.as_ref(),
    );
    client_config
}

fn create_cursor(config: &KafkaClusterConfig) -> Result<BaseConsumer> {
    let mut client_config = base_client_config(config);
    client_config
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        // an offset that was deleted by retention surfaces as an error instead of a reset
        .set("auto.offset.reset", "error");

    client_config.create().map_err(|err| Error::Connection {
        server: config.bootstrap_servers(),
        error: err.to_string(),
    })
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => {
            error!(?e, "Tokio task join error on a blocking Kafka call");
            Err(Error::Other(format!("Tokio task join error: {e}")))
        }
    }
}

/// Helpers to seed a local broker for the `kafka-tests` feature.
#[cfg(feature = "kafka-tests-utils")]
pub mod test_utils {
    use super::*;
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::client::DefaultClientContext;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    pub async fn setup_test_topic(prefix: &str, partitions: i32) -> (FutureProducer, String) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create producer");

        let topic_name = format!(
            "{prefix}{}",
            uuid::Uuid::new_v4().to_string().replace('-', "")
        );

        let admin_client: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create admin client");

        let topic_config =
            NewTopic::new(topic_name.as_str(), partitions, TopicReplication::Fixed(1));
        let _ = admin_client
            .create_topics(&[topic_config], &AdminOptions::new())
            .await
            .expect("Failed to create topic");

        (producer, topic_name)
    }

    pub async fn produce_to_partition(
        producer: &FutureProducer,
        topic: &str,
        partition: i32,
        timestamp_ms: i64,
    ) {
        let payload = format!("freshness {timestamp_ms}");
        let record = FutureRecord::<(), _>::to(topic)
            .payload(&payload)
            .partition(partition)
            .timestamp(timestamp_ms);
        producer
            .send(record, Duration::from_secs(5))
            .await
            .expect("Failed to send message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_does_not_require_a_reachable_broker() {
        let client = KafkaClusterClient::connect(KafkaClusterConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        });
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_config_never_commits() {
        let config = base_client_config(&KafkaClusterConfig::default());
        assert_eq!(config.get("group.id"), Some(NO_COMMIT_GROUP_ID));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("allow.auto.create.topics"), Some("false"));
        assert!(create_cursor(&KafkaClusterConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_list_topics_fails_without_broker() {
        let client = KafkaClusterClient::connect(KafkaClusterConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        })
        .unwrap();
        let result = client.list_topics(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::Kafka(_))));
    }

    #[tokio::test]
    async fn test_drain_events_after_broker_errors() {
        let client = KafkaClusterClient::connect(KafkaClusterConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        })
        .unwrap();
        for _ in 0..3 {
            let _ = client.list_topics(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let served = tokio::time::timeout(Duration::from_secs(2), client.drain_events())
            .await
            .expect("draining should not block");
        assert!(served <= MAX_DRAINED_EVENTS);
    }

    #[cfg(all(feature = "kafka-tests", feature = "kafka-tests-utils"))]
    #[tokio::test]
    async fn test_latest_record_timestamp() {
        let (producer, topic) = test_utils::setup_test_topic("freshness-test-", 3).await;
        test_utils::produce_to_partition(&producer, &topic, 0, 1_000).await;
        test_utils::produce_to_partition(&producer, &topic, 0, 1_500).await;
        test_utils::produce_to_partition(&producer, &topic, 2, 2_000).await;

        let client = KafkaClusterClient::connect(KafkaClusterConfig::default()).unwrap();
        let timeout = Duration::from_secs(5);

        let topics = client.list_topics(timeout).await.unwrap();
        assert!(topics.contains(&topic));

        let mut partitions = client.list_partitions(&topic, timeout).await.unwrap();
        partitions.sort();
        assert_eq!(partitions, vec![0, 1, 2]);

        let (_, high) = client.watermarks(&topic, 0, timeout).await.unwrap();
        assert_eq!(high, 2);
        let (empty_low, empty_high) = client.watermarks(&topic, 1, timeout).await.unwrap();
        assert_eq!(empty_low, empty_high);

        let record = client
            .poll_at(&topic, 0, high - 1, timeout)
            .await
            .unwrap()
            .expect("record should be returned");
        assert_eq!(record.offset, 1);
        assert_eq!(record.timestamp_ms, Some(1_500));
    }
}
