use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Listing the cluster's topics failed or timed out. Aborts the whole cycle.
    #[error("Discovery Error - {0}")]
    Discovery(String),

    /// Listing the partitions of one topic failed. Only that topic is skipped.
    #[error("Partition List Error - {topic}: {reason}")]
    PartitionList { topic: String, reason: String },

    #[error("Probe Error - {partition}: {reason}")]
    Probe { partition: String, reason: String },

    #[error("Fetch Error - {partition}: {reason}")]
    Fetch { partition: String, reason: String },

    #[error("Fetch Timeout Error - {partition}: no record within {timeout_ms}ms")]
    FetchTimeout { partition: String, timeout_ms: u128 },

    #[error("Offset Mismatch Error - {partition}: requested {requested}, got {returned}")]
    OffsetMismatch {
        partition: String,
        requested: i64,
        returned: i64,
    },

    /// Raw failure reported by the cluster client, before it is classified by the caller.
    #[error("Cluster Error - {0}")]
    Cluster(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Metrics Server Error - {0}")]
    MetricsServer(String),
}

impl Error {
    /// Short, stable label used when counting partition-scoped failures.
    pub(crate) fn reason_label(&self) -> &'static str {
        match self {
            Error::Discovery(_) => "discovery",
            Error::PartitionList { .. } => "partition_list",
            Error::Probe { .. } => "probe",
            Error::Fetch { .. } => "fetch",
            Error::FetchTimeout { .. } => "fetch_timeout",
            Error::OffsetMismatch { .. } => "offset_mismatch",
            Error::Cluster(_) => "cluster",
            Error::Config(_) => "config",
            Error::MetricsServer(_) => "metrics_server",
        }
    }
}

impl From<topic_freshness_kafka::Error> for Error {
    fn from(value: topic_freshness_kafka::Error) -> Self {
        match value {
            topic_freshness_kafka::Error::Kafka(e) => Error::Cluster(e),
            topic_freshness_kafka::Error::Connection { server, error } => Error::Cluster(format!(
                "Failed to connect to Kafka server: {server} - {error}"
            )),
            topic_freshness_kafka::Error::Other(e) => Error::Cluster(e),
        }
    }
}
