use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::cluster::ClusterClient;
use crate::error::{Error, Result};

/// Lists the cluster's topics once and keeps the ones starting with any of `prefixes`.
///
/// A failed or timed out listing is an [Error::Discovery]; there is no retry here, the next
/// cycle is the retry.
pub(crate) async fn discover<C: ClusterClient>(
    client: &C,
    prefixes: &[String],
    timeout: Duration,
) -> Result<BTreeSet<String>> {
    debug!("Fetching topic metadata from cluster");
    let topics = match tokio::time::timeout(timeout, client.list_topics(timeout)).await {
        Ok(Ok(topics)) => topics,
        Ok(Err(e)) => return Err(Error::Discovery(e.to_string())),
        Err(_) => {
            return Err(Error::Discovery(format!(
                "listing topics timed out after {}ms",
                timeout.as_millis()
            )));
        }
    };

    let matching = filter_topics(topics, prefixes);
    info!(
        count = matching.len(),
        ?prefixes,
        "Discovered topics matching prefixes"
    );
    Ok(matching)
}

fn filter_topics(topics: impl IntoIterator<Item = String>, prefixes: &[String]) -> BTreeSet<String> {
    topics
        .into_iter()
        .filter(|topic| prefixes.iter().any(|prefix| topic.starts_with(prefix.as_str())))
        .collect()
}
