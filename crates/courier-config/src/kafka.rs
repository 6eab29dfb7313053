// ============================================================================
// Kafka Configuration
// ============================================================================

use crate::constants::*;

/// Kafka connection and transactional producer settings
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Whether a real broker is used (false = in-process broker for local runs)
    pub enabled: bool,
    /// Comma-separated list of Kafka brokers (e.g., "kafka1:9092,kafka2:9092")
    pub brokers: String,
    /// Prefix for every transactional.id this process registers
    pub transactional_id_prefix: String,
    /// Consumer group shared by both staging relays
    pub consumer_group: String,
    /// SSL/TLS enabled
    pub ssl_enabled: bool,
    /// SASL mechanism (e.g., "SCRAM-SHA-256", "PLAIN")
    pub sasl_mechanism: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Path to CA certificate file (for self-signed certificates)
    pub ssl_ca_location: Option<String>,
    // producer-specific settings
    pub producer_acks: String, // transactional producers require "all"
    pub producer_linger_ms: u32,
    pub producer_request_timeout_ms: u32,
    pub producer_delivery_timeout_ms: u32,
    /// Broker-side transaction timeout (transaction.timeout.ms)
    pub transaction_timeout_ms: u32,
    /// Client-side timeout for init/commit/abort round-trips
    pub transaction_op_timeout_ms: u64,
}

impl KafkaConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            enabled: std::env::var("KAFKA_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            brokers: std::env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| DEFAULT_BROKERS.to_string()),
            transactional_id_prefix: std::env::var("KAFKA_TRANSACTIONAL_ID_PREFIX")
                .unwrap_or_else(|_| DEFAULT_TRANSACTIONAL_ID_PREFIX.to_string()),
            consumer_group: std::env::var("KAFKA_CONSUMER_GROUP")
                .unwrap_or_else(|_| DEFAULT_CONSUMER_GROUP.to_string()),
            ssl_enabled: std::env::var("KAFKA_SSL_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            sasl_mechanism: std::env::var("KAFKA_SASL_MECHANISM").ok(),
            sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
            sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
            ssl_ca_location: std::env::var("KAFKA_SSL_CA_LOCATION").ok(),
            producer_acks: std::env::var("KAFKA_PRODUCER_ACKS")
                .unwrap_or_else(|_| "all".to_string()),
            producer_linger_ms: std::env::var("KAFKA_PRODUCER_LINGER_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            producer_request_timeout_ms: std::env::var("KAFKA_PRODUCER_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30000),
            producer_delivery_timeout_ms: std::env::var("KAFKA_PRODUCER_DELIVERY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60000),
            transaction_timeout_ms: std::env::var("KAFKA_TRANSACTION_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT_MS),
            transaction_op_timeout_ms: std::env::var("KAFKA_TRANSACTION_OP_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TRANSACTION_OP_TIMEOUT_MS),
        }
    }

    /// transactional.id for a named role on a given pod.
    ///
    /// Ids must be stable across restarts of the same pod so that a restarted
    /// producer fences its predecessor and aborts whatever it left open.
    pub fn transactional_id(&self, role: &str, pod_number: u32) -> String {
        format!("{}{}-{}", self.transactional_id_prefix, role, pod_number)
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            brokers: DEFAULT_BROKERS.to_string(),
            transactional_id_prefix: DEFAULT_TRANSACTIONAL_ID_PREFIX.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            ssl_enabled: false,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            producer_acks: "all".to_string(),
            producer_linger_ms: 5,
            producer_request_timeout_ms: 30000,
            producer_delivery_timeout_ms: 60000,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            transaction_op_timeout_ms: DEFAULT_TRANSACTION_OP_TIMEOUT_MS,
        }
    }
}
