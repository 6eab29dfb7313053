// ============================================================================
// Topic Configuration
// ============================================================================

use crate::constants::*;

/// Names and provisioning parameters for the four pipeline topics
#[derive(Clone, Debug)]
pub struct TopicsConfig {
    pub staging_a: String,
    pub staging_b: String,
    pub public_a: String,
    pub public_b: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicsConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            staging_a: std::env::var("TOPIC_STAGING_A")
                .unwrap_or_else(|_| DEFAULT_STAGING_A_TOPIC.to_string()),
            staging_b: std::env::var("TOPIC_STAGING_B")
                .unwrap_or_else(|_| DEFAULT_STAGING_B_TOPIC.to_string()),
            public_a: std::env::var("TOPIC_PUBLIC_A")
                .unwrap_or_else(|_| DEFAULT_PUBLIC_A_TOPIC.to_string()),
            public_b: std::env::var("TOPIC_PUBLIC_B")
                .unwrap_or_else(|_| DEFAULT_PUBLIC_B_TOPIC.to_string()),
            partitions: std::env::var("TOPIC_PARTITIONS")
                .ok()
                .and_then(|p| p.parse().ok())
                .filter(|p| *p > 0)
                .unwrap_or(DEFAULT_TOPIC_PARTITIONS),
            replication_factor: std::env::var("TOPIC_REPLICATION_FACTOR")
                .ok()
                .and_then(|r| r.parse().ok())
                .filter(|r| *r > 0)
                .unwrap_or(DEFAULT_TOPIC_REPLICATION_FACTOR),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            staging_a: DEFAULT_STAGING_A_TOPIC.to_string(),
            staging_b: DEFAULT_STAGING_B_TOPIC.to_string(),
            public_a: DEFAULT_PUBLIC_A_TOPIC.to_string(),
            public_b: DEFAULT_PUBLIC_B_TOPIC.to_string(),
            partitions: DEFAULT_TOPIC_PARTITIONS,
            replication_factor: DEFAULT_TOPIC_REPLICATION_FACTOR,
        }
    }
}
