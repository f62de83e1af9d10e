//! Configuration loading.
//!
//! Layers embedded defaults, optional files, and `ETHBRIDGE_*` environment
//! variables, then applies the flat `KAFKA_*` / `PREFIX_*` variables the
//! deployment environment provides.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

use super::config::AppConfig;

/// Embedded default configuration (compiled into the binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let config = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/local").required(false))
        // 3. Environment variables (highest priority)
        .add_source(
            Environment::with_prefix("ETHBRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut app_config: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;
    apply_flat_env(&mut app_config, |name| std::env::var(name).ok());
    Ok(app_config)
}

/// Apply the flat environment variables recognized for deployment
/// compatibility. `lookup` is injectable so tests need not mutate the
/// process environment.
pub fn apply_flat_env<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(brokers) = lookup("KAFKA_BROKERS") {
        config.kafka.brokers = brokers
            .split(',')
            .filter(|b| !b.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(client_id) = lookup("KAFKA_CLIENT_ID") {
        config.kafka.client_id = client_id;
    }
    if let Some(group) = lookup("KAFKA_CONSUMER_GROUP") {
        config.kafka.consumer_group = group;
    }
    if let Some(topic) = lookup("KAFKA_TOPIC_IN") {
        config.kafka.topic_in = topic;
    }
    if let Some(topic) = lookup("KAFKA_TOPIC_OUT") {
        config.kafka.topic_out = topic;
    }
    if let Some(enabled) = lookup("KAFKA_TLS_ENABLED") {
        config.kafka.tls.enabled = enabled.parse().unwrap_or(false);
    }
    if let Some(insecure) = lookup("KAFKA_TLS_INSECURE") {
        config.kafka.tls.insecure_skip_verify = insecure.parse().unwrap_or(false);
    }
    if let Some(file) = lookup("KAFKA_TLS_CLIENT_CERT") {
        config.kafka.tls.client_certs_file = file;
    }
    if let Some(file) = lookup("KAFKA_TLS_CLIENT_KEY") {
        config.kafka.tls.private_key_file = file;
    }
    if let Some(file) = lookup("KAFKA_TLS_CA_CERTS") {
        config.kafka.tls.ca_certs_file = file;
    }
    if let Some(username) = lookup("KAFKA_SASL_USERNAME") {
        config.kafka.sasl.username = username;
    }
    if let Some(password) = lookup("KAFKA_SASL_PASSWORD") {
        config.kafka.sasl.password = password;
    }
    if let Some(short) = lookup("PREFIX_SHORT") {
        config.prefix.short = short.to_lowercase();
    }
    if let Some(long) = lookup("PREFIX_LONG") {
        config.prefix.long = long.to_lowercase();
    }
}
