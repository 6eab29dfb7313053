// ============================================================================
// Configuration Constants
// ============================================================================

// Default port values
pub(crate) const DEFAULT_PORT: u16 = 8080;

// Broker defaults
pub(crate) const DEFAULT_BROKERS: &str = "localhost:9092";
pub(crate) const DEFAULT_TRANSACTIONAL_ID_PREFIX: &str = "courier-tx-";
pub const DEFAULT_CONSUMER_GROUP: &str = "staging-to-public-group";

// Topic defaults (partition count / replication match the provisioning of the
// original deployment)
pub const DEFAULT_STAGING_A_TOPIC: &str = "stagingA";
pub const DEFAULT_STAGING_B_TOPIC: &str = "stagingB";
pub const DEFAULT_PUBLIC_A_TOPIC: &str = "publicA";
pub const DEFAULT_PUBLIC_B_TOPIC: &str = "publicB";
pub(crate) const DEFAULT_TOPIC_PARTITIONS: i32 = 3;
pub(crate) const DEFAULT_TOPIC_REPLICATION_FACTOR: i32 = 1;

// Transaction timeouts (in milliseconds)
// transaction.timeout.ms is enforced broker-side; a producer that dies mid
// transaction blocks read_committed readers of its partitions for at most this long
pub(crate) const DEFAULT_TRANSACTION_TIMEOUT_MS: u32 = 60_000;
pub(crate) const DEFAULT_TRANSACTION_OP_TIMEOUT_MS: u64 = 30_000;

// Relay loop timings (in milliseconds)
pub(crate) const DEFAULT_RELAY_POLL_TIMEOUT_MS: u64 = 1_000;
pub(crate) const DEFAULT_RELAY_RETRY_BACKOFF_MS: u64 = 500;

pub(crate) const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// Message content that forces the publish transaction to roll back.
pub const ROLLBACK_SENTINEL: &str = "FAIL";
