//! Per-partition reads: the high-watermark probe and the latest-record fetch. Both are bounded by
//! their own timeout and fail with partition-scoped errors only.

use std::time::Duration;

use tracing::debug;

use crate::cluster::{ClusterClient, PartitionRef};
use crate::error::{Error, Result};

/// Extra time on top of the poll window for creating and assigning the throwaway cursor.
const CURSOR_SETUP_GRACE: Duration = Duration::from_secs(1);

/// Returns the partition's high watermark, `0` for a partition without records.
pub(crate) async fn high_watermark<C: ClusterClient>(
    client: &C,
    partition: &PartitionRef,
    timeout: Duration,
) -> Result<i64> {
    let probe_error = |reason: String| Error::Probe {
        partition: partition.to_string(),
        reason,
    };

    match tokio::time::timeout(timeout, client.high_watermark(partition, timeout)).await {
        Ok(Ok(watermark)) if watermark >= 0 => Ok(watermark),
        Ok(Ok(watermark)) => Err(probe_error(format!("negative high watermark {watermark}"))),
        Ok(Err(e)) => Err(probe_error(e.to_string())),
        Err(_) => Err(probe_error(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Reads the broker timestamp (epoch millis) of the record at exactly `offset`.
///
/// An empty poll is a [Error::FetchTimeout]. A record at any other offset is rejected with
/// [Error::OffsetMismatch] instead of borrowing its timestamp.
pub(crate) async fn fetch_timestamp<C: ClusterClient>(
    client: &C,
    partition: &PartitionRef,
    offset: i64,
    poll_timeout: Duration,
) -> Result<i64> {
    let fetch_error = |reason: String| Error::Fetch {
        partition: partition.to_string(),
        reason,
    };
    let fetch_timeout = || Error::FetchTimeout {
        partition: partition.to_string(),
        timeout_ms: poll_timeout.as_millis(),
    };

    if offset < 0 {
        return Err(fetch_error(format!("invalid offset {offset}")));
    }

    let polled = tokio::time::timeout(
        poll_timeout + CURSOR_SETUP_GRACE,
        client.poll_at(partition, offset, poll_timeout),
    )
    .await;

    let record = match polled {
        Ok(Ok(Some(record))) => record,
        Ok(Ok(None)) | Err(_) => return Err(fetch_timeout()),
        Ok(Err(e)) => return Err(fetch_error(e.to_string())),
    };

    if record.offset != offset {
        return Err(Error::OffsetMismatch {
            partition: partition.to_string(),
            requested: offset,
            returned: record.offset,
        });
    }

    match record.timestamp_ms {
        Some(timestamp_ms) if timestamp_ms >= 0 => {
            debug!(%partition, offset, timestamp_ms, "Fetched latest record timestamp");
            Ok(timestamp_ms)
        }
        _ => Err(fetch_error(format!(
            "record at offset {offset} carries no broker timestamp"
        ))),
    }
}
