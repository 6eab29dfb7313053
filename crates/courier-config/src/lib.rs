// ============================================================================
// Courier Config - Centralized configuration management
// ============================================================================
//
// Loads the relay service configuration from environment variables (and an
// optional .env file) with sensible defaults.
//
// ============================================================================

mod constants;
mod kafka;
mod relay;
mod topics;

pub use constants::{
    DEFAULT_CONSUMER_GROUP, DEFAULT_PUBLIC_A_TOPIC, DEFAULT_PUBLIC_B_TOPIC,
    DEFAULT_STAGING_A_TOPIC, DEFAULT_STAGING_B_TOPIC, ROLLBACK_SENTINEL,
};
pub use kafka::KafkaConfig;
pub use relay::RelayConfig;
pub use topics::TopicsConfig;

use anyhow::Result;
use constants::*;

/// Main configuration structure for the courier service
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,

    /// Pod identifier, exposed read-only on /api/messages/pod-number and used
    /// to derive stable transactional ids
    pub pod_number: u32,

    pub rust_log: String,

    /// Upper bound on how long shutdown waits for relay workers to stop
    pub shutdown_grace_secs: u64,

    // Sub-configurations
    pub kafka: KafkaConfig,
    pub topics: TopicsConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let pod_number = match std::env::var("POD_NUMBER") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                anyhow::anyhow!("POD_NUMBER must be a non-negative integer, got '{}'", raw)
            })?,
            Err(_) => {
                tracing::warn!("POD_NUMBER not set, defaulting to 0");
                0
            }
        };

        Ok(Self {
            port,
            bind_address: format!("[::]:{}", port),
            pod_number,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            shutdown_grace_secs: std::env::var("SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            kafka: KafkaConfig::from_env(),
            topics: TopicsConfig::from_env(),
            relay: RelayConfig::from_env(),
        })
    }
}

impl Default for Config {
    /// In-process configuration used by tests and `KAFKA_ENABLED=false` runs.
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: format!("[::]:{}", DEFAULT_PORT),
            pod_number: 0,
            rust_log: "info".to_string(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            kafka: KafkaConfig {
                enabled: false,
                ..KafkaConfig::default()
            },
            topics: TopicsConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}
