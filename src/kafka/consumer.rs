use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, Consumer, ConsumerContext, ConsumerGroupMetadata, Rebalance, StreamConsumer,
};
use rdkafka::{ClientContext, Message, Offset};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use super::config::create_client_config;
use super::error::{BrokerError, BrokerResult};
use super::types::StagedRecord;
use super::StagingConsumer;
use courier_config::KafkaConfig;

/// Consumer context that tracks partition revocations
///
/// librdkafka runs rebalance callbacks from inside `recv()`. The relay never
/// polls while a transaction is open, so by the time a revocation is applied
/// the previous record is already committed or aborted. The revocation counter
/// lets the relay double-check before committing.
pub struct RelayConsumerContext {
    topic: String,
    revocations: AtomicU64,
}

impl RelayConsumerContext {
    fn new(topic: String) -> Self {
        Self {
            topic,
            revocations: AtomicU64::new(0),
        }
    }
}

impl ClientContext for RelayConsumerContext {}

impl ConsumerContext for RelayConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                self.revocations.fetch_add(1, Ordering::SeqCst);
                info!(
                    topic = %self.topic,
                    partitions = tpl.count(),
                    "Partitions revoked"
                );
            }
            Rebalance::Assign(tpl) => {
                info!(
                    topic = %self.topic,
                    partitions = tpl.count(),
                    "Partitions assigned"
                );
            }
            Rebalance::Error(e) => {
                warn!(topic = %self.topic, error = %e, "Rebalance error");
            }
        }
    }
}

/// Read-committed Kafka consumer for one staging topic
///
/// This consumer is configured for:
/// - `isolation.level=read_committed`: aborted publishes are never relayed
/// - No auto commit: offsets only move inside relay transactions
/// - Consumer group coordination (relays on other pods share the partitions)
pub struct KafkaStagingConsumer {
    consumer: StreamConsumer<RelayConsumerContext>,
    topic: String,
}

impl KafkaStagingConsumer {
    /// Create a new staging consumer and subscribe it to `topic`.
    ///
    /// # Configuration
    /// - `enable.auto.commit=false`: offsets are committed by the producer transaction.
    /// - `enable.auto.offset.store=false`: the client never stores offsets on its own.
    /// - `auto.offset.reset=earliest`: a fresh group starts from the beginning.
    /// - `session.timeout.ms=30000`: 30s session timeout.
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self> {
        info!(topic = %topic, group = %config.consumer_group, "Initializing staging consumer...");
        let mut client_config = create_client_config(config)?;

        let consumer: StreamConsumer<RelayConsumerContext> = client_config
            .set("group.id", &config.consumer_group)
            // Offset management
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            // Only committed transactional records are visible
            .set("isolation.level", "read_committed")
            .set("enable.partition.eof", "false")
            // Session management
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .create_with_context(RelayConsumerContext::new(topic.to_string()))
            .context("Failed to create staging consumer")?;

        consumer
            .subscribe(&[topic])
            .context("Failed to subscribe to staging topic")?;

        info!(
            "Staging consumer initialized for topic '{}' in group '{}'",
            topic, config.consumer_group
        );

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl StagingConsumer for KafkaStagingConsumer {
    type GroupMetadata = ConsumerGroupMetadata;

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, timeout: Duration) -> BrokerResult<Option<StagedRecord>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(StagedRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
            Ok(Err(e)) => {
                error!(error = %e, topic = %self.topic, "Kafka consumer error");
                Err(e.into())
            }
        }
    }

    fn group_metadata(&self) -> BrokerResult<ConsumerGroupMetadata> {
        self.consumer
            .group_metadata()
            .ok_or_else(|| BrokerError::Rebalanced("consumer is not part of a group".to_string()))
    }

    fn revocations(&self) -> u64 {
        self.consumer.context().revocations.load(Ordering::SeqCst)
    }

    fn owns(&self, partition: i32) -> bool {
        self.consumer
            .assignment()
            .map(|tpl| tpl.find_partition(&self.topic, partition).is_some())
            .unwrap_or(false)
    }

    fn rewind(&self, record: &StagedRecord) -> BrokerResult<()> {
        self.consumer
            .seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                Duration::from_secs(5),
            )
            .map_err(BrokerError::from)
    }
}
