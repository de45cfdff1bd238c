//! Exporter configuration, sourced from environment variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use topic_freshness_kafka::{KafkaClusterConfig, KafkaSaslAuth, TlsConfig};

use crate::error::{Error, Result};

const ENV_KAFKA_BOOTSTRAP_SERVERS: &str = "KAFKA_BOOTSTRAP_SERVERS";
const ENV_TOPIC_PREFIX: &str = "TOPIC_PREFIX";
const ENV_KAFKA_SECURITY_PROTOCOL: &str = "KAFKA_SECURITY_PROTOCOL";
const ENV_KAFKA_SASL_MECHANISM: &str = "KAFKA_SASL_MECHANISM";
const ENV_KAFKA_SASL_USERNAME: &str = "KAFKA_SASL_USERNAME";
const ENV_KAFKA_SASL_PASSWORD: &str = "KAFKA_SASL_PASSWORD";
const ENV_KAFKA_TLS_CA_CERT: &str = "KAFKA_TLS_CA_CERT";
const ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY: &str = "KAFKA_TLS_INSECURE_SKIP_VERIFY";
const ENV_SCRAPE_INTERVAL_SECONDS: &str = "SCRAPE_INTERVAL_SECONDS";
const ENV_METRICS_PORT: &str = "METRICS_PORT";
const ENV_CONSUMER_TIMEOUT_MS: &str = "CONSUMER_TIMEOUT_MS";
const ENV_TOPIC_DISCOVERY_TIMEOUT_S: &str = "TOPIC_DISCOVERY_TIMEOUT_S";
const ENV_WORKER_POOL_SIZE: &str = "WORKER_POOL_SIZE";
const ENV_TOPIC_CONCURRENCY: &str = "TOPIC_CONCURRENCY";
const ENV_CYCLE_DEADLINE_SECONDS: &str = "CYCLE_DEADLINE_SECONDS";

const ALL_ENV_VARS: [&str; 15] = [
    ENV_KAFKA_BOOTSTRAP_SERVERS,
    ENV_TOPIC_PREFIX,
    ENV_KAFKA_SECURITY_PROTOCOL,
    ENV_KAFKA_SASL_MECHANISM,
    ENV_KAFKA_SASL_USERNAME,
    ENV_KAFKA_SASL_PASSWORD,
    ENV_KAFKA_TLS_CA_CERT,
    ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY,
    ENV_SCRAPE_INTERVAL_SECONDS,
    ENV_METRICS_PORT,
    ENV_CONSUMER_TIMEOUT_MS,
    ENV_TOPIC_DISCOVERY_TIMEOUT_S,
    ENV_WORKER_POOL_SIZE,
    ENV_TOPIC_CONCURRENCY,
    ENV_CYCLE_DEADLINE_SECONDS,
];

const DEFAULT_SECURITY_PROTOCOL: &str = "PLAINTEXT";
const DEFAULT_SCRAPE_INTERVAL_SECONDS: u64 = 600;
const DEFAULT_METRICS_PORT: u16 = 8000;
const DEFAULT_CONSUMER_TIMEOUT_MS: u64 = 2000;
const DEFAULT_TOPIC_DISCOVERY_TIMEOUT_S: f64 = 10.0;
const DEFAULT_WORKER_POOL_SIZE: usize = 20;
const DEFAULT_TOPIC_CONCURRENCY: usize = 10;

/// Knobs of the freshness engine itself, independent of how the cluster is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// A topic is in scope when its name starts with any of these.
    pub topic_prefixes: Vec<String>,
    /// Time between the start of two consecutive cycles.
    pub interval: Duration,
    /// Bound for topic listing, partition listing and watermark probes.
    pub discovery_timeout: Duration,
    /// Bound for the single poll of the latest-record fetch.
    pub poll_timeout: Duration,
    /// Max number of partition operations in flight across the whole cycle.
    pub worker_pool_size: usize,
    /// Max number of topics scanned at the same time.
    pub topic_concurrency: usize,
    /// Upper bound for the scan phase of one cycle.
    pub cycle_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let interval = Duration::from_secs(DEFAULT_SCRAPE_INTERVAL_SECONDS);
        Self {
            topic_prefixes: vec![],
            interval,
            discovery_timeout: Duration::from_secs_f64(DEFAULT_TOPIC_DISCOVERY_TIMEOUT_S),
            poll_timeout: Duration::from_millis(DEFAULT_CONSUMER_TIMEOUT_MS),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            topic_concurrency: DEFAULT_TOPIC_CONCURRENCY,
            cycle_deadline: interval,
        }
    }
}

/// Everything the exporter process needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    pub cluster: KafkaClusterConfig,
    pub engine: EngineConfig,
    pub metrics_port: u16,
}

impl ExporterConfig {
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| ALL_ENV_VARS.contains(&key.as_str()))
            .collect();

        let get_var = |var: &str| -> Result<String> {
            Ok(env_vars
                .get(var)
                .ok_or_else(|| Error::Config(format!("Environment variable {var} is not set")))?
                .to_string())
        };

        let brokers: Vec<String> = get_var(ENV_KAFKA_BOOTSTRAP_SERVERS)?
            .split(',')
            .map(str::trim)
            .filter(|broker| !broker.is_empty())
            .map(str::to_string)
            .collect();
        if brokers.is_empty() {
            return Err(Error::Config(format!(
                "{ENV_KAFKA_BOOTSTRAP_SERVERS} does not contain any broker"
            )));
        }

        let topic_prefixes = parse_topic_prefixes(&get_var(ENV_TOPIC_PREFIX)?);
        if topic_prefixes.is_empty() {
            return Err(Error::Config(format!(
                "{ENV_TOPIC_PREFIX} does not contain any prefix"
            )));
        }

        let auth = match (
            env_vars.get(ENV_KAFKA_SASL_MECHANISM),
            env_vars.get(ENV_KAFKA_SASL_USERNAME),
            env_vars.get(ENV_KAFKA_SASL_PASSWORD),
        ) {
            (None, None, None) => None,
            (Some(mechanism), _, _) if mechanism.trim().eq_ignore_ascii_case("OAUTHBEARER") => {
                return Err(Error::Config(format!(
                    "{ENV_KAFKA_SASL_MECHANISM}=OAUTHBEARER is not supported (no token provider for \
                     MSK IAM), use PLAIN or SCRAM credentials"
                )));
            }
            (Some(mechanism), Some(username), Some(password)) => Some(KafkaSaslAuth {
                mechanism: mechanism.clone(),
                username: username.clone(),
                password: password.clone(),
            }),
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_KAFKA_SASL_MECHANISM}, {ENV_KAFKA_SASL_USERNAME} and {ENV_KAFKA_SASL_PASSWORD} must be set together"
                )));
            }
        };

        let insecure_skip_verify: bool =
            parse_var(&env_vars, ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY, false)?;
        let ca_cert = env_vars.get(ENV_KAFKA_TLS_CA_CERT).cloned();
        let tls = if insecure_skip_verify || ca_cert.is_some() {
            Some(TlsConfig {
                insecure_skip_verify,
                ca_cert,
            })
        } else {
            None
        };

        let security_protocol = env_vars
            .get(ENV_KAFKA_SECURITY_PROTOCOL)
            .cloned()
            .unwrap_or_else(|| DEFAULT_SECURITY_PROTOCOL.to_string());

        let interval_secs: u64 = parse_var(
            &env_vars,
            ENV_SCRAPE_INTERVAL_SECONDS,
            DEFAULT_SCRAPE_INTERVAL_SECONDS,
        )?;
        if interval_secs < 1 {
            return Err(Error::Config(format!(
                "{ENV_SCRAPE_INTERVAL_SECONDS} must be at least 1"
            )));
        }
        let interval = Duration::from_secs(interval_secs);

        let discovery_timeout_secs: f64 = parse_var(
            &env_vars,
            ENV_TOPIC_DISCOVERY_TIMEOUT_S,
            DEFAULT_TOPIC_DISCOVERY_TIMEOUT_S,
        )?;
        let discovery_timeout = positive_duration_from_secs(
            ENV_TOPIC_DISCOVERY_TIMEOUT_S,
            discovery_timeout_secs,
        )?;

        let poll_timeout_ms: u64 =
            parse_var(&env_vars, ENV_CONSUMER_TIMEOUT_MS, DEFAULT_CONSUMER_TIMEOUT_MS)?;
        if poll_timeout_ms == 0 {
            return Err(Error::Config(format!(
                "{ENV_CONSUMER_TIMEOUT_MS} must be greater than 0"
            )));
        }

        let worker_pool_size: usize =
            parse_var(&env_vars, ENV_WORKER_POOL_SIZE, DEFAULT_WORKER_POOL_SIZE)?;
        let topic_concurrency: usize =
            parse_var(&env_vars, ENV_TOPIC_CONCURRENCY, DEFAULT_TOPIC_CONCURRENCY)?;
        if worker_pool_size == 0 || topic_concurrency == 0 {
            return Err(Error::Config(format!(
                "{ENV_WORKER_POOL_SIZE} and {ENV_TOPIC_CONCURRENCY} must be at least 1"
            )));
        }

        let cycle_deadline = match env_vars.get(ENV_CYCLE_DEADLINE_SECONDS) {
            Some(_) => {
                let secs: f64 = parse_var(&env_vars, ENV_CYCLE_DEADLINE_SECONDS, 0.0)?;
                positive_duration_from_secs(ENV_CYCLE_DEADLINE_SECONDS, secs)?
            }
            None => interval,
        };

        Ok(Self {
            cluster: KafkaClusterConfig {
                brokers,
                security_protocol,
                auth,
                tls,
            },
            engine: EngineConfig {
                topic_prefixes,
                interval,
                discovery_timeout,
                poll_timeout: Duration::from_millis(poll_timeout_ms),
                worker_pool_size,
                topic_concurrency,
                cycle_deadline,
            },
            metrics_port: parse_var(&env_vars, ENV_METRICS_PORT, DEFAULT_METRICS_PORT)?,
        })
    }
}

/// Splits `prefix_one;prefix_two` into its non-blank parts.
fn parse_topic_prefixes(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T>(env_vars: &HashMap<String, String>, var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_vars.get(var) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("Invalid value {value:?} for {var}: {e}"))),
        None => Ok(default),
    }
}

fn positive_duration_from_secs(var: &str, secs: f64) -> Result<Duration> {
    if secs <= 0.0 {
        return Err(Error::Config(format!("{var} must be greater than 0")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("Invalid duration for {var}: {e}")))
}
