// Kafka module for the staging/public pipeline
//
// Broker access goes through three small traits so the publisher and the
// relays are written once and run against either librdkafka or the
// in-process broker (KAFKA_ENABLED=false and tests).

pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod topics;
pub mod types;

use async_trait::async_trait;
use std::time::Duration;

pub use config::create_client_config;
pub use consumer::{KafkaStagingConsumer, RelayConsumerContext};
pub use error::{BrokerError, BrokerResult};
pub use memory::{
    MemoryBroker, MemoryGroupMetadata, MemoryStagingConsumer, MemoryTransactionalProducer,
};
pub use producer::KafkaTransactionalProducer;
pub use topics::{
    KafkaTopicAdmin, RelayRoute, TopicSpec, TopicStatus, Topology, TopologyError, ensure_topic,
};
pub use types::{OffsetCommit, Payload, RecordPosition, StagedRecord};

/// A producer bound to one transactional.id
///
/// Implementations must already be initialised for transactions (and have
/// fenced any previous holder of the same id) when handed out.
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    /// Consumer-group handle accepted by `send_offsets_to_transaction`
    type GroupMetadata: Send + 'static;

    fn transactional_id(&self) -> &str;

    async fn begin_transaction(&self) -> BrokerResult<()>;

    /// Produce one keyless record inside the open transaction
    async fn send(&self, topic: &str, payload: &[u8]) -> BrokerResult<RecordPosition>;

    /// Stage consumer offsets so they commit atomically with the produced records
    async fn send_offsets_to_transaction(
        &self,
        offsets: &[OffsetCommit],
        group: Self::GroupMetadata,
    ) -> BrokerResult<()>;

    async fn commit_transaction(&self) -> BrokerResult<()>;

    async fn abort_transaction(&self) -> BrokerResult<()>;
}

/// Read-committed consumer of one staging topic inside a consumer group
#[async_trait]
pub trait StagingConsumer: Send + Sync {
    type GroupMetadata: Send + 'static;

    fn topic(&self) -> &str;

    /// Wait up to `timeout` for the next committed record
    ///
    /// Rebalances are applied while polling, never while a record is being
    /// relayed. Returns `None` when the timeout expires.
    async fn poll(&self, timeout: Duration) -> BrokerResult<Option<StagedRecord>>;

    /// Current group membership, passed to the producer with staged offsets
    fn group_metadata(&self) -> BrokerResult<Self::GroupMetadata>;

    /// Number of partition revocations observed so far
    fn revocations(&self) -> u64;

    /// Whether this member currently owns `partition` of its topic
    fn owns(&self, partition: i32) -> bool;

    /// Move the read position back to `record` so the next poll redelivers it
    fn rewind(&self, record: &StagedRecord) -> BrokerResult<()>;
}

/// Topic provisioning
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<TopicStatus>;
}
