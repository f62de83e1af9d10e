//! Server configuration types.

use serde::{Deserialize, Serialize};

use crate::api::params::ControlPrefixes;
use crate::receipts::ReceiptStoreConf;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub receipts: ReceiptsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub prefix: PrefixConfig,
}

impl AppConfig {
    /// Reject configurations that cannot produce a working bridge.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server port cannot be 0".to_string());
        }
        self.kafka.validate()
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Bus connectivity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    /// Client ID; a UUID is generated when empty
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic the bridge consumes replies from
    #[serde(default = "default_topic_in")]
    pub topic_in: String,
    /// Topic the bridge produces requests to
    #[serde(default = "default_topic_out")]
    pub topic_out: String,
    /// Partition count for the in-process bus (standalone mode)
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
}

impl KafkaConfig {
    fn validate(&self) -> Result<(), String> {
        if self.topic_out.is_empty() {
            return Err("no output topic specified for bridge to send requests to".to_string());
        }
        if self.topic_in.is_empty() {
            return Err("no input topic specified for bridge to listen to".to_string());
        }
        if self.consumer_group.is_empty() {
            return Err("no consumer group specified".to_string());
        }
        let certs = self.tls.client_certs_file.is_empty();
        let key = self.tls.private_key_file.is_empty();
        if certs != key {
            return Err(
                "tls client_certs_file and private_key_file must be set together".to_string(),
            );
        }
        let user = self.sasl.username.is_empty();
        let pass = self.sasl.password.is_empty();
        if user != pass {
            return Err("sasl username and password must be set together".to_string());
        }
        Ok(())
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: String::new(),
            consumer_group: default_consumer_group(),
            topic_in: default_topic_in(),
            topic_out: default_topic_out(),
            partitions: default_partitions(),
            tls: TlsConfig::default(),
            sasl: SaslConfig::default(),
        }
    }
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_consumer_group() -> String {
    "ethbridge".to_string()
}

fn default_topic_in() -> String {
    "replies".to_string()
}

fn default_topic_out() -> String {
    "requests".to_string()
}

fn default_partitions() -> i32 {
    4
}

/// Bus TLS configuration, applied once at gateway construction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub client_certs_file: String,
    #[serde(default)]
    pub private_key_file: String,
    #[serde(default)]
    pub ca_certs_file: String,
}

/// Bus SASL credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaslConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Receipt store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptsConfig {
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    #[serde(default = "default_max_docs")]
    pub max_docs: usize,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
}

impl From<&ReceiptsConfig> for ReceiptStoreConf {
    fn from(conf: &ReceiptsConfig) -> Self {
        Self {
            query_limit: conf.query_limit,
            max_docs: conf.max_docs,
            retry_initial_delay_ms: conf.retry_initial_delay_ms,
            retry_timeout_ms: conf.retry_timeout_ms,
        }
    }
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            query_limit: default_query_limit(),
            max_docs: default_max_docs(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_timeout_ms: default_retry_timeout_ms(),
        }
    }
}

fn default_query_limit() -> usize {
    100
}

fn default_max_docs() -> usize {
    250
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_timeout_ms() -> u64 {
    120_000
}

/// Event delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_ws_processing_timeout_secs")]
    pub ws_processing_timeout_secs: u64,
    #[serde(default = "default_batch_retry_initial_delay_ms")]
    pub batch_retry_initial_delay_ms: u64,
    #[serde(default = "default_batch_retry_max_delay_ms")]
    pub batch_retry_max_delay_ms: u64,
}

impl From<&EventsConfig> for crate::events::StreamRetryConf {
    fn from(conf: &EventsConfig) -> Self {
        Self {
            initial_delay_ms: conf.batch_retry_initial_delay_ms,
            max_delay_ms: conf.batch_retry_max_delay_ms,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ws_processing_timeout_secs: default_ws_processing_timeout_secs(),
            batch_retry_initial_delay_ms: default_batch_retry_initial_delay_ms(),
            batch_retry_max_delay_ms: default_batch_retry_max_delay_ms(),
        }
    }
}

fn default_ws_processing_timeout_secs() -> u64 {
    30
}

fn default_batch_retry_initial_delay_ms() -> u64 {
    1_000
}

fn default_batch_retry_max_delay_ms() -> u64 {
    30_000
}

/// Control-parameter prefixes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixConfig {
    #[serde(default = "default_prefix_short")]
    pub short: String,
    #[serde(default = "default_prefix_long")]
    pub long: String,
}

impl From<&PrefixConfig> for ControlPrefixes {
    fn from(conf: &PrefixConfig) -> Self {
        Self {
            short: conf.short.clone(),
            long: conf.long.clone(),
        }
    }
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            short: default_prefix_short(),
            long: default_prefix_long(),
        }
    }
}

fn default_prefix_short() -> String {
    "fly".to_string()
}

fn default_prefix_long() -> String {
    "firefly".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            kafka: KafkaConfig::default(),
            receipts: ReceiptsConfig::default(),
            events: EventsConfig::default(),
            prefix: PrefixConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_missing_topics_rejected() {
        let mut config = valid();
        config.kafka.topic_out.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.kafka.topic_in.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.kafka.consumer_group.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_files_all_or_none() {
        let mut config = valid();
        config.kafka.tls.client_certs_file = "client.pem".to_string();
        assert!(config.validate().is_err());

        config.kafka.tls.private_key_file = "client.key".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_sasl_credentials_all_or_none() {
        let mut config = valid();
        config.kafka.sasl.username = "user".to_string();
        assert!(config.validate().is_err());

        config.kafka.sasl.password = "secret".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = valid();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_events_config_maps_to_stream_retry() {
        let retry: crate::events::StreamRetryConf = (&EventsConfig::default()).into();
        assert_eq!(retry.initial_delay_ms, 1_000);
        assert_eq!(retry.max_delay_ms, 30_000);
    }
}
