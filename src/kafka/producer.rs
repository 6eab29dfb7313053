use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::KafkaResult;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, error, info};

use super::config::create_client_config;
use super::error::{BrokerError, BrokerResult};
use super::types::{OffsetCommit, RecordPosition};
use super::TransactionalProducer;
use courier_config::KafkaConfig;

/// Transactional Kafka producer
///
/// This producer is configured for:
/// - Exactly-once writes (`transactional.id` + idempotence)
/// - Acknowledgement from all in-sync replicas
/// - Broker-side transaction timeout, so a dead process cannot block
///   read_committed consumers forever
///
/// librdkafka's transactional calls block the calling thread until the
/// coordinator answers; they run on the blocking pool.
pub struct KafkaTransactionalProducer {
    producer: FutureProducer,
    transactional_id: String,
    op_timeout: Duration,
    queue_timeout: Duration,
}

impl KafkaTransactionalProducer {
    /// Create the producer and register its transactional.id with the coordinator.
    ///
    /// `init_transactions` bumps the producer epoch for this id: any previous
    /// producer with the same id is fenced and its open transaction aborted.
    pub async fn new(config: &KafkaConfig, transactional_id: String) -> Result<Self> {
        info!(transactional_id = %transactional_id, "Initializing transactional Kafka producer...");
        let mut client_config = create_client_config(config)?;

        let producer: FutureProducer = client_config
            .set("transactional.id", &transactional_id)
            // Reliability settings
            .set("enable.idempotence", "true")
            .set("acks", &config.producer_acks)
            .set("max.in.flight.requests.per.connection", "5")
            .set(
                "transaction.timeout.ms",
                config.transaction_timeout_ms.to_string(),
            )
            // Performance settings
            .set("linger.ms", config.producer_linger_ms.to_string())
            // Timeout settings
            .set(
                "request.timeout.ms",
                config.producer_request_timeout_ms.to_string(),
            )
            .set(
                "delivery.timeout.ms",
                config.producer_delivery_timeout_ms.to_string(),
            )
            .create()
            .context("Failed to create transactional Kafka producer")?;

        let op_timeout = Duration::from_millis(config.transaction_op_timeout_ms);
        let init_producer = producer.clone();
        tokio::task::spawn_blocking(move || init_producer.init_transactions(op_timeout))
            .await
            .context("init_transactions task panicked")?
            .with_context(|| {
                format!(
                    "Failed to initialise transactions for '{}'",
                    transactional_id
                )
            })?;

        info!(
            transactional_id = %transactional_id,
            "Transactional Kafka producer ready"
        );

        Ok(Self {
            producer,
            transactional_id,
            op_timeout,
            queue_timeout: Duration::from_millis(u64::from(config.producer_delivery_timeout_ms)),
        })
    }

    /// Run a blocking librdkafka call on the blocking pool
    async fn blocking<F>(&self, op: F) -> BrokerResult<()>
    where
        F: FnOnce(&FutureProducer, Duration) -> KafkaResult<()> + Send + 'static,
    {
        let producer = self.producer.clone();
        let timeout = self.op_timeout;
        tokio::task::spawn_blocking(move || op(&producer, timeout))
            .await
            .map_err(|e| BrokerError::Unavailable(format!("blocking Kafka call failed: {}", e)))?
            .map_err(BrokerError::from)
    }
}

#[async_trait]
impl TransactionalProducer for KafkaTransactionalProducer {
    type GroupMetadata = ConsumerGroupMetadata;

    fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    async fn begin_transaction(&self) -> BrokerResult<()> {
        // begin_transaction is local to the client, no coordinator round-trip
        self.producer.begin_transaction().map_err(BrokerError::from)
    }

    async fn send(&self, topic: &str, payload: &[u8]) -> BrokerResult<RecordPosition> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(topic).payload(payload);

        match self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    transactional_id = %self.transactional_id,
                    "Record written inside transaction"
                );
                Ok(RecordPosition { partition, offset })
            }
            Err((kafka_err, _)) => {
                error!(
                    error = %kafka_err,
                    topic = %topic,
                    transactional_id = %self.transactional_id,
                    "Failed to send record to Kafka"
                );
                Err(kafka_err.into())
            }
        }
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: &[OffsetCommit],
        group: ConsumerGroupMetadata,
    ) -> BrokerResult<()> {
        let mut tpl = TopicPartitionList::new();
        for commit in offsets {
            tpl.add_partition_offset(&commit.topic, commit.partition, Offset::Offset(commit.offset))
                .map_err(BrokerError::from)?;
        }

        self.blocking(move |producer, timeout| {
            producer.send_offsets_to_transaction(&tpl, &group, timeout)
        })
        .await
    }

    async fn commit_transaction(&self) -> BrokerResult<()> {
        // Flushes outstanding records, then asks the coordinator to commit
        self.blocking(|producer, timeout| producer.commit_transaction(timeout))
            .await
    }

    async fn abort_transaction(&self) -> BrokerResult<()> {
        self.blocking(|producer, timeout| producer.abort_transaction(timeout))
            .await
    }
}
