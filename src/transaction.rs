// ============================================================================
// Transaction Scope
// ============================================================================
//
// `Transaction` is the only way the publisher and the relays talk to a
// transactional producer. Every exit path ends in commit or abort:
//
// - `commit()` / `abort()` consume the transaction.
// - A failed commit is followed by an abort attempt.
// - A transaction dropped without either (task cancelled, panic, early
//   return) marks the session dangling; the next `begin()` aborts it first.
//
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use crate::kafka::{BrokerResult, OffsetCommit, RecordPosition, TransactionalProducer};

/// A transactional producer plus the bookkeeping for abandoned transactions
pub struct TransactionalSession<P> {
    producer: P,
    dangling: AtomicBool,
}

impl<P: TransactionalProducer> TransactionalSession<P> {
    pub fn new(producer: P) -> Self {
        Self {
            producer,
            dangling: AtomicBool::new(false),
        }
    }

    pub fn transactional_id(&self) -> &str {
        self.producer.transactional_id()
    }

    /// Whether a previous transaction was dropped without commit or abort
    pub fn is_dangling(&self) -> bool {
        self.dangling.load(Ordering::SeqCst)
    }

    /// Open a new transaction, aborting a dangling one first
    pub async fn begin(&self) -> BrokerResult<Transaction<'_, P>> {
        if self.dangling.swap(false, Ordering::SeqCst) {
            warn!(
                transactional_id = %self.transactional_id(),
                "Aborting transaction abandoned by a previous call"
            );
            if let Err(e) = self.producer.abort_transaction().await {
                if e.is_fatal() {
                    self.dangling.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                // Nothing left to abort if the abandoned commit went through
                warn!(
                    transactional_id = %self.transactional_id(),
                    error = %e,
                    "Abort of abandoned transaction failed"
                );
            }
        }

        if let Err(e) = self.producer.begin_transaction().await {
            error!(
                transactional_id = %self.transactional_id(),
                error = %e,
                "Failed to begin transaction"
            );
            return Err(e);
        }

        Ok(Transaction {
            session: self,
            finished: false,
        })
    }
}

/// An open transaction; must be finished with `commit` or `abort`
pub struct Transaction<'a, P: TransactionalProducer> {
    session: &'a TransactionalSession<P>,
    finished: bool,
}

impl<P: TransactionalProducer> Transaction<'_, P> {
    pub async fn send(&self, topic: &str, payload: &[u8]) -> BrokerResult<RecordPosition> {
        self.session.producer.send(topic, payload).await
    }

    /// Stage consumer offsets to commit together with the produced records
    pub async fn send_offsets(
        &self,
        offsets: &[OffsetCommit],
        group: P::GroupMetadata,
    ) -> BrokerResult<()> {
        self.session
            .producer
            .send_offsets_to_transaction(offsets, group)
            .await
    }

    /// Commit; on failure the transaction is aborted before the error is returned
    pub async fn commit(mut self) -> BrokerResult<()> {
        match self.session.producer.commit_transaction().await {
            Ok(()) => {
                self.finished = true;
                Ok(())
            }
            Err(e) => {
                warn!(
                    transactional_id = %self.session.transactional_id(),
                    error = %e,
                    "Commit failed, aborting transaction"
                );
                if let Err(abort_err) = self.session.producer.abort_transaction().await {
                    error!(
                        transactional_id = %self.session.transactional_id(),
                        error = %abort_err,
                        "Abort after failed commit also failed"
                    );
                } else {
                    self.finished = true;
                }
                Err(e)
            }
        }
    }

    pub async fn abort(mut self) -> BrokerResult<()> {
        self.session.producer.abort_transaction().await?;
        self.finished = true;
        Ok(())
    }
}

impl<P: TransactionalProducer> Drop for Transaction<'_, P> {
    fn drop(&mut self) {
        if !self.finished {
            self.session.dangling.store(true, Ordering::SeqCst);
        }
    }
}
