use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_histogram, register_int_counter_vec, Counter, Histogram,
    IntCounterVec,
};

/// Publish transactions committed
pub static PUBLISH_COMMITTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "courier_publish_committed_total",
        "Total number of committed publish transactions"
    )
    .expect("Failed to register courier_publish_committed_total metric")
});

/// Publish transactions rolled back on the sentinel message
pub static PUBLISH_ROLLED_BACK: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "courier_publish_rolled_back_total",
        "Total number of publish transactions rolled back by a FAIL message"
    )
    .expect("Failed to register courier_publish_rolled_back_total metric")
});

/// Publish transactions aborted by a broker error
pub static PUBLISH_FAILED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "courier_publish_failed_total",
        "Total number of publish transactions aborted by a broker error"
    )
    .expect("Failed to register courier_publish_failed_total metric")
});

/// Messages made visible on the staging topics (counted once per message, not per topic)
pub static PUBLISHED_MESSAGES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "courier_published_messages_total",
        "Total number of messages committed to the staging topics"
    )
    .expect("Failed to register courier_published_messages_total metric")
});

/// End-to-end publish latency, begin to commit/abort
pub static PUBLISH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "courier_publish_latency_seconds",
        "Publish transaction latency in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register courier_publish_latency_seconds metric")
});

/// Records relayed to a public topic, by staging topic
pub static RELAY_COMMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "courier_relay_committed_total",
        "Total number of relay transactions committed",
        &["source_topic"]
    )
    .expect("Failed to register courier_relay_committed_total metric")
});

/// Relay transactions aborted, by staging topic
pub static RELAY_ABORTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "courier_relay_aborted_total",
        "Total number of relay transactions aborted",
        &["source_topic"]
    )
    .expect("Failed to register courier_relay_aborted_total metric")
});
