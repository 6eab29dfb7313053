// ============================================================================
// Transactional Publisher
// ============================================================================
//
// Writes each message of a call to both staging topics inside one producer
// transaction. Either every message of the call becomes visible on both
// topics, or none does.
//
// The rollback sentinel is checked while the transaction is still open; the
// abort erases the writes already queued for earlier messages of the same
// call. This relies on committing exactly once, at the end.
//
// ============================================================================

use async_trait::async_trait;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::kafka::metrics::{
    PUBLISHED_MESSAGES, PUBLISH_COMMITTED, PUBLISH_FAILED, PUBLISH_LATENCY, PUBLISH_ROLLED_BACK,
};
use crate::kafka::{BrokerError, Payload, Topology, TransactionalProducer};
use crate::transaction::{Transaction, TransactionalSession};
use courier_config::ROLLBACK_SENTINEL;
use courier_error::AppError;

/// Outcome of a committed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub published_count: usize,
}

#[derive(Error, Debug)]
pub enum PublishError {
    /// The sentinel was found at `position`; the whole call was rolled back
    #[error("Encountered 'FAIL' message - transaction rolled back")]
    Rollback { position: usize },

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Rollback { position } => AppError::rollback(format!(
                "Encountered '{}' message at position {}",
                ROLLBACK_SENTINEL, position
            )),
            PublishError::Serialization(e) => AppError::internal(e.to_string()),
            PublishError::Broker(e) => e.into(),
        }
    }
}

/// Object-safe publishing surface used by the HTTP layer
#[async_trait]
pub trait StagingPublisher: Send + Sync {
    async fn publish(&self, messages: &[String]) -> Result<PublishReceipt, PublishError>;
}

/// Publisher owning one transactional producer
///
/// Calls are serialized: a transactional producer has at most one open
/// transaction.
pub struct Publisher<P> {
    session: Mutex<TransactionalSession<P>>,
    staging_a: String,
    staging_b: String,
}

impl<P: TransactionalProducer> Publisher<P> {
    pub fn new(producer: P, staging_a: impl Into<String>, staging_b: impl Into<String>) -> Self {
        Self {
            session: Mutex::new(TransactionalSession::new(producer)),
            staging_a: staging_a.into(),
            staging_b: staging_b.into(),
        }
    }

    pub fn for_topology(producer: P, topology: &Topology) -> Self {
        Self::new(
            producer,
            topology.staging_a.name.clone(),
            topology.staging_b.name.clone(),
        )
    }

    /// Publish `messages` to both staging topics atomically
    pub async fn publish(&self, messages: &[String]) -> Result<PublishReceipt, PublishError> {
        if messages.is_empty() {
            debug!("Empty publish request, nothing to do");
            return Ok(PublishReceipt { published_count: 0 });
        }

        let session = self.session.lock().await;
        let started = Instant::now();

        let txn = session.begin().await.inspect_err(|_| PUBLISH_FAILED.inc())?;

        let result = match self.write_all(&txn, messages).await {
            Ok(()) => txn.commit().await.map_err(PublishError::from),
            Err(e) => {
                if let Err(abort_err) = txn.abort().await {
                    error!(
                        transactional_id = %session.transactional_id(),
                        error = %abort_err,
                        "Failed to abort publish transaction"
                    );
                }
                Err(e)
            }
        };
        PUBLISH_LATENCY.observe(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                PUBLISH_COMMITTED.inc();
                PUBLISHED_MESSAGES.inc_by(messages.len() as f64);
                info!(
                    count = messages.len(),
                    staging_a = %self.staging_a,
                    staging_b = %self.staging_b,
                    "Published messages to staging topics"
                );
                Ok(PublishReceipt {
                    published_count: messages.len(),
                })
            }
            Err(PublishError::Rollback { position }) => {
                PUBLISH_ROLLED_BACK.inc();
                warn!(
                    position = position,
                    count = messages.len(),
                    "Rollback sentinel received, publish transaction aborted"
                );
                Err(PublishError::Rollback { position })
            }
            Err(e) => {
                PUBLISH_FAILED.inc();
                error!(error = %e, count = messages.len(), "Publish transaction failed");
                Err(e)
            }
        }
    }

    async fn write_all(
        &self,
        txn: &Transaction<'_, P>,
        messages: &[String],
    ) -> Result<(), PublishError> {
        for (position, content) in messages.iter().enumerate() {
            if content == ROLLBACK_SENTINEL {
                return Err(PublishError::Rollback { position });
            }

            let bytes = Payload::new(content.as_str()).to_bytes()?;
            txn.send(&self.staging_a, &bytes).await?;
            txn.send(&self.staging_b, &bytes).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P: TransactionalProducer> StagingPublisher for Publisher<P> {
    async fn publish(&self, messages: &[String]) -> Result<PublishReceipt, PublishError> {
        Publisher::publish(self, messages).await
    }
}
