//! Thin, read-only Kafka access for the freshness exporter. Nothing in here joins a consumer
//! group or commits an offset; the exporter only inspects metadata, watermarks and the single
//! newest record of a partition.

use rdkafka::config::ClientConfig;
use tracing::warn;

pub mod client;

pub use client::{KafkaClusterClient, PolledRecord};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// SASL credentials used to authenticate with the brokers.
#[derive(Clone, PartialEq)]
pub struct KafkaSaslAuth {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for KafkaSaslAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSaslAuth")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
}

/// Connection settings shared by the metadata handle and every throwaway cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaClusterConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// Value for librdkafka's `security.protocol`, e.g. `PLAINTEXT` or `SASL_SSL`.
    pub security_protocol: String,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
}

impl Default for KafkaClusterConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            security_protocol: "PLAINTEXT".to_string(),
            auth: None,
            tls: None,
        }
    }
}

impl KafkaClusterConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Applies the security protocol, SASL and TLS settings to a librdkafka client config.
pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    security_protocol: &str,
    tls_config: Option<&TlsConfig>,
    auth: Option<&KafkaSaslAuth>,
) {
    client_config.set("security.protocol", security_protocol);

    if let Some(auth) = auth {
        client_config
            .set("sasl.mechanisms", &auth.mechanism)
            .set("sasl.username", &auth.username)
            .set("sasl.password", &auth.password);
    }

    if let Some(tls_config) = tls_config {
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config.set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert) = &tls_config.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_auth_config_plaintext() {
        let mut client_config = ClientConfig::new();
        update_auth_config(&mut client_config, "PLAINTEXT", None, None);
        assert_eq!(client_config.get("security.protocol"), Some("PLAINTEXT"));
        assert_eq!(client_config.get("sasl.mechanisms"), None);
        assert_eq!(client_config.get("ssl.ca.location"), None);
    }

    #[test]
    fn test_update_auth_config_sasl_tls() {
        let mut client_config = ClientConfig::new();
        let auth = KafkaSaslAuth {
            mechanism: "SCRAM-SHA-512".to_string(),
            username: "exporter".to_string(),
            password: "secret".to_string(),
        };
        let tls = TlsConfig {
            insecure_skip_verify: true,
            ca_cert: Some("/etc/ssl/ca.pem".to_string()),
        };
        update_auth_config(&mut client_config, "SASL_SSL", Some(&tls), Some(&auth));

        assert_eq!(client_config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client_config.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(client_config.get("sasl.username"), Some("exporter"));
        assert_eq!(client_config.get("sasl.password"), Some("secret"));
        assert_eq!(
            client_config.get("ssl.endpoint.identification.algorithm"),
            Some("none")
        );
        assert_eq!(client_config.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
    }

    #[test]
    fn test_sasl_debug_redacts_password() {
        let auth = KafkaSaslAuth {
            mechanism: "PLAIN".to_string(),
            username: "exporter".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{auth:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
