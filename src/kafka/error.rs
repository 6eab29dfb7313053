use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by broker clients (producer, consumer, admin)
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Another producer registered the same transactional.id; this handle is dead
    #[error("Producer fenced: {0}")]
    Fenced(String),

    /// Consumer group moved on; offsets from the old generation are rejected
    #[error("Consumer group rebalanced: {0}")]
    Rebalanced(String),

    /// Operation not valid in the current transaction state
    #[error("Invalid transaction state: {0}")]
    State(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Kafka error: {0}")]
    Kafka(KafkaError),
}

impl BrokerError {
    /// Fatal errors leave the client unusable; retrying on the same handle is pointless.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::Fenced(_) => true,
            BrokerError::Kafka(KafkaError::Transaction(err)) => err.is_fatal(),
            _ => false,
        }
    }
}

impl From<KafkaError> for BrokerError {
    fn from(err: KafkaError) -> Self {
        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::ProducerFenced)
            | Some(RDKafkaErrorCode::InvalidProducerEpoch) => BrokerError::Fenced(err.to_string()),
            Some(RDKafkaErrorCode::RebalanceInProgress)
            | Some(RDKafkaErrorCode::IllegalGeneration)
            | Some(RDKafkaErrorCode::UnknownMemberId)
            | Some(RDKafkaErrorCode::FencedInstanceId) => BrokerError::Rebalanced(err.to_string()),
            Some(RDKafkaErrorCode::UnknownTopicOrPartition) => {
                BrokerError::UnknownTopic(err.to_string())
            }
            _ => BrokerError::Kafka(err),
        }
    }
}

impl From<BrokerError> for courier_error::AppError {
    fn from(err: BrokerError) -> Self {
        courier_error::AppError::kafka(err.to_string())
    }
}
