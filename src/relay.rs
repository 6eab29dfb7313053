// ============================================================================
// Staging Relay
// ============================================================================
//
// Moves committed records from one staging topic to its public topic. Each
// record is relayed in its own transaction that also carries the consumer
// offset, so the public write and the offset advance commit together:
//
//   IDLE -> POLLING -> TRANSACTION_OPEN -> WRITE_TO_PUBLIC
//        -> COMMIT_OFFSET_AND_TRANSACTION -> POLLING
//
// Any failure between begin and commit goes through ABORT_TRANSACTION back to
// POLLING with the consumer rewound to the failed record, which is then
// redelivered after a backoff. Processing errors never leave the relay; only
// a fenced producer stops it.
//
// ============================================================================

use anyhow::anyhow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::kafka::metrics::{RELAY_ABORTED, RELAY_COMMITTED};
use crate::kafka::{BrokerError, BrokerResult, StagedRecord, StagingConsumer, TransactionalProducer};
use crate::transaction::{Transaction, TransactionalSession};
use courier_config::RelayConfig;

const STATS_LOG_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Polling,
    TransactionOpen,
    WriteToPublic,
    CommitOffsetAndTransaction,
    AbortTransaction,
    Stopped,
}

/// Result of one poll iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Record relayed and its offset committed
    Committed { partition: i32, offset: i64 },
    /// Transaction aborted; the record will be redelivered
    Aborted { partition: i32, offset: i64 },
    /// Poll timed out without a record
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub committed: u64,
    pub aborted: u64,
}

/// Whether every relay worker of the process is still running
///
/// A relay that returns before shutdown was requested never relays its
/// staging topic again, so the process is no longer ready.
#[derive(Clone, Default)]
pub struct RelayHealth {
    inner: Arc<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    stopped: AtomicUsize,
    notify: Notify,
}

impl RelayHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.stopped_relays() == 0
    }

    pub fn stopped_relays(&self) -> usize {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn mark_stopped(&self) {
        self.inner.stopped.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once any relay has stopped unexpectedly
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if !self.is_healthy() {
                return;
            }
            notified.await;
        }
    }
}

/// Relay worker for one staging -> public route
pub struct StagingRelay<P, C> {
    session: TransactionalSession<P>,
    consumer: C,
    destination: String,
    config: RelayConfig,
    state: RelayState,
    stats: RelayStats,
}

impl<P, C> StagingRelay<P, C>
where
    C: StagingConsumer,
    P: TransactionalProducer<GroupMetadata = C::GroupMetadata>,
{
    pub fn new(
        producer: P,
        consumer: C,
        destination: impl Into<String>,
        config: RelayConfig,
    ) -> Self {
        Self {
            session: TransactionalSession::new(producer),
            consumer,
            destination: destination.into(),
            config,
            state: RelayState::Idle,
            stats: RelayStats::default(),
        }
    }

    pub fn source(&self) -> &str {
        self.consumer.topic()
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Poll once and drive the received record to commit or abort
    ///
    /// Returns `Err` for poll failures and for fatal errors; in the latter
    /// case the relay is `Stopped` and must not be polled again.
    pub async fn poll_once(&mut self) -> BrokerResult<RelayOutcome> {
        if self.state == RelayState::Stopped {
            return Err(BrokerError::State("relay is stopped".to_string()));
        }

        self.state = RelayState::Polling;
        let Some(record) = self.consumer.poll(self.config.poll_timeout()).await? else {
            self.state = RelayState::Idle;
            return Ok(RelayOutcome::Idle);
        };

        let source = self.consumer.topic().to_string();
        match relay_record(
            &self.session,
            &self.consumer,
            &self.destination,
            &record,
            &mut self.state,
        )
        .await
        {
            Ok(()) => {
                self.stats.committed += 1;
                RELAY_COMMITTED.with_label_values(&[source.as_str()]).inc();
                debug!(
                    source = %source,
                    destination = %self.destination,
                    partition = record.partition,
                    offset = record.offset,
                    "Record relayed"
                );
                self.state = RelayState::Polling;
                Ok(RelayOutcome::Committed {
                    partition: record.partition,
                    offset: record.offset,
                })
            }
            Err(e) => {
                self.stats.aborted += 1;
                RELAY_ABORTED.with_label_values(&[source.as_str()]).inc();

                if e.is_fatal() {
                    error!(
                        source = %source,
                        transactional_id = %self.session.transactional_id(),
                        error = %e,
                        "Relay producer fenced, stopping"
                    );
                    self.state = RelayState::Stopped;
                    return Err(e);
                }

                warn!(
                    source = %source,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Relay transaction aborted, record will be redelivered"
                );

                // A partition that moved to another member is redelivered there
                if let Err(rewind_err) = self.consumer.rewind(&record)
                    && self.consumer.owns(record.partition)
                {
                    error!(
                        source = %source,
                        partition = record.partition,
                        error = %rewind_err,
                        "Failed to rewind consumer after abort, stopping"
                    );
                    self.state = RelayState::Stopped;
                    return Err(rewind_err);
                }

                self.state = RelayState::Polling;
                Ok(RelayOutcome::Aborted {
                    partition: record.partition,
                    offset: record.offset,
                })
            }
        }
    }

    /// Relay until `shutdown` is set or the relay hits a fatal error
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> anyhow::Result<RelayStats> {
        info!(
            source = %self.source(),
            destination = %self.destination,
            transactional_id = %self.session.transactional_id(),
            "Relay started"
        );

        let mut window = RelayStats::default();
        let mut last_stats_log = Instant::now();

        while !shutdown.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok(RelayOutcome::Committed { .. }) => window.committed += 1,
                Ok(RelayOutcome::Idle) => {}
                Ok(RelayOutcome::Aborted { .. }) => {
                    window.aborted += 1;
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
                Err(e) if self.state == RelayState::Stopped => {
                    return Err(anyhow!(e).context(format!(
                        "Relay {} -> {} stopped",
                        self.source(),
                        self.destination
                    )));
                }
                Err(e) => {
                    error!(source = %self.source(), error = %e, "Relay poll failed");
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
            }

            // Log stats periodically (every 30 seconds)
            let now = Instant::now();
            if now.duration_since(last_stats_log).as_secs() >= STATS_LOG_INTERVAL_SECS {
                info!(
                    source = %self.source(),
                    committed = window.committed,
                    aborted = window.aborted,
                    "Relay metrics (last 30s)"
                );
                window = RelayStats::default();
                last_stats_log = now;
            }
        }

        self.state = RelayState::Stopped;
        info!(
            source = %self.source(),
            committed = self.stats.committed,
            aborted = self.stats.aborted,
            "Relay stopped gracefully"
        );
        Ok(self.stats)
    }
}

/// One record, one transaction
async fn relay_record<P, C>(
    session: &TransactionalSession<P>,
    consumer: &C,
    destination: &str,
    record: &StagedRecord,
    state: &mut RelayState,
) -> BrokerResult<()>
where
    C: StagingConsumer,
    P: TransactionalProducer<GroupMetadata = C::GroupMetadata>,
{
    let revocations = consumer.revocations();

    *state = RelayState::TransactionOpen;
    let txn = session.begin().await?;

    *state = RelayState::WriteToPublic;
    if let Err(e) = write_and_stage_offset(&txn, consumer, destination, record, revocations).await {
        *state = RelayState::AbortTransaction;
        if let Err(abort_err) = txn.abort().await {
            error!(error = %abort_err, "Failed to abort relay transaction");
        }
        return Err(e);
    }

    *state = RelayState::CommitOffsetAndTransaction;
    txn.commit().await
}

async fn write_and_stage_offset<P, C>(
    txn: &Transaction<'_, P>,
    consumer: &C,
    destination: &str,
    record: &StagedRecord,
    revocations: u64,
) -> BrokerResult<()>
where
    C: StagingConsumer,
    P: TransactionalProducer<GroupMetadata = C::GroupMetadata>,
{
    txn.send(destination, &record.payload).await?;

    if consumer.revocations() != revocations || !consumer.owns(record.partition) {
        return Err(BrokerError::Rebalanced(format!(
            "{}-{} revoked before commit",
            record.topic, record.partition
        )));
    }

    let group = consumer.group_metadata()?;
    txn.send_offsets(&[record.offset_commit()], group).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::memory::{MemoryStagingConsumer, MemoryTransactionalProducer};
    use crate::kafka::{MemoryBroker, MemoryGroupMetadata, TopicAdmin, TopicSpec};
    use async_trait::async_trait;
    use std::time::Duration;

    const GROUP: &str = "staging-to-public-group";

    fn config() -> RelayConfig {
        RelayConfig {
            poll_timeout_ms: 100,
            retry_backoff_ms: 10,
        }
    }

    async fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        for name in ["stagingA", "publicA"] {
            broker
                .create_topic(&TopicSpec::new(name, 1, 1))
                .await
                .unwrap();
        }
        broker
    }

    /// Memory consumer whose partition can be revoked right after a poll
    /// and whose rewind can be made to fail
    struct ScriptedConsumer {
        inner: MemoryStagingConsumer,
        revoke_on_poll: bool,
        fail_rewind: bool,
        revoked: AtomicBool,
    }

    impl ScriptedConsumer {
        fn new(inner: MemoryStagingConsumer, revoke_on_poll: bool, fail_rewind: bool) -> Self {
            Self {
                inner,
                revoke_on_poll,
                fail_rewind,
                revoked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl StagingConsumer for ScriptedConsumer {
        type GroupMetadata = MemoryGroupMetadata;

        fn topic(&self) -> &str {
            self.inner.topic()
        }

        async fn poll(&self, timeout: Duration) -> BrokerResult<Option<StagedRecord>> {
            let record = self.inner.poll(timeout).await?;
            if record.is_some() && self.revoke_on_poll {
                self.revoked.store(true, Ordering::SeqCst);
            }
            Ok(record)
        }

        fn group_metadata(&self) -> BrokerResult<MemoryGroupMetadata> {
            self.inner.group_metadata()
        }

        fn revocations(&self) -> u64 {
            self.inner.revocations() + u64::from(self.revoked.load(Ordering::SeqCst))
        }

        fn owns(&self, partition: i32) -> bool {
            !self.revoked.load(Ordering::SeqCst) && self.inner.owns(partition)
        }

        fn rewind(&self, record: &StagedRecord) -> BrokerResult<()> {
            if self.fail_rewind {
                return Err(BrokerError::State("seek failed".to_string()));
            }
            self.inner.rewind(record)
        }
    }

    fn scripted_relay(
        broker: &MemoryBroker,
        revoke_on_poll: bool,
        fail_rewind: bool,
    ) -> StagingRelay<MemoryTransactionalProducer, ScriptedConsumer> {
        StagingRelay::new(
            broker.transactional_producer("relay-a"),
            ScriptedConsumer::new(
                broker.consumer(GROUP, "stagingA"),
                revoke_on_poll,
                fail_rewind,
            ),
            "publicA",
            config(),
        )
    }

    fn relay(
        broker: &MemoryBroker,
        id: &str,
    ) -> StagingRelay<MemoryTransactionalProducer, MemoryStagingConsumer> {
        StagingRelay::new(
            broker.transactional_producer(id),
            broker.consumer(GROUP, "stagingA"),
            "publicA",
            config(),
        )
    }

    #[tokio::test]
    async fn test_relays_bytes_unchanged_and_commits_offset() {
        let broker = broker().await;
        // Not valid JSON: the relay must not care
        broker.produce_committed("stagingA", b"\x00raw bytes\xff").unwrap();
        let mut relay = relay(&broker, "relay-a");

        let outcome = relay.poll_once().await.unwrap();

        assert_eq!(outcome, RelayOutcome::Committed { partition: 0, offset: 0 });
        assert_eq!(broker.payloads("publicA"), vec![b"\x00raw bytes\xff".to_vec()]);
        assert_eq!(broker.committed_offset(GROUP, "stagingA", 0), Some(1));
        assert_eq!(relay.state(), RelayState::Polling);
    }

    #[tokio::test]
    async fn test_idle_when_nothing_to_relay() {
        let broker = broker().await;
        let mut relay = relay(&broker, "relay-a");

        assert_eq!(relay.poll_once().await.unwrap(), RelayOutcome::Idle);
        assert_eq!(relay.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn test_failed_commit_is_redelivered_once() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"m").unwrap();
        let mut relay = relay(&broker, "relay-a");
        broker.fail_next_commits(1);

        let first = relay.poll_once().await.unwrap();
        assert_eq!(first, RelayOutcome::Aborted { partition: 0, offset: 0 });
        assert!(broker.payloads("publicA").is_empty());
        assert_eq!(broker.committed_offset(GROUP, "stagingA", 0), None);

        let second = relay.poll_once().await.unwrap();
        assert_eq!(second, RelayOutcome::Committed { partition: 0, offset: 0 });
        assert_eq!(broker.payloads("publicA"), vec![b"m".to_vec()]);
        assert_eq!(relay.stats(), RelayStats { committed: 1, aborted: 1 });
    }

    #[tokio::test]
    async fn test_failed_send_is_redelivered() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"m").unwrap();
        let mut relay = relay(&broker, "relay-a");
        broker.fail_next_sends(2);

        assert!(matches!(relay.poll_once().await.unwrap(), RelayOutcome::Aborted { .. }));
        assert!(matches!(relay.poll_once().await.unwrap(), RelayOutcome::Aborted { .. }));
        assert!(matches!(relay.poll_once().await.unwrap(), RelayOutcome::Committed { .. }));
        assert_eq!(broker.payloads("publicA").len(), 1);
    }

    #[tokio::test]
    async fn test_fenced_relay_stops() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"m").unwrap();
        let mut relay = relay(&broker, "relay-a");
        let _successor = broker.transactional_producer("relay-a");

        let err = relay.poll_once().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(relay.state(), RelayState::Stopped);
        assert!(broker.payloads("publicA").is_empty());
        assert!(relay.poll_once().await.is_err());
    }

    #[tokio::test]
    async fn test_rebalance_during_commit_hands_record_to_new_owner() {
        let broker = MemoryBroker::new();
        broker
            .create_topic(&TopicSpec::new("stagingA", 2, 1))
            .await
            .unwrap();
        broker
            .create_topic(&TopicSpec::new("publicA", 1, 1))
            .await
            .unwrap();
        broker.produce_committed("stagingA", b"first").unwrap();
        broker.produce_committed("stagingA", b"second").unwrap();

        let mut owner = relay(&broker, "relay-1");
        let first = owner.poll_once().await.unwrap();
        assert_eq!(first, RelayOutcome::Committed { partition: 0, offset: 0 });

        // Partition 1 moves to the new member while "second" is in flight
        let successor_consumer = broker.rebalance_before_next_commit(GROUP, "stagingA");
        let second = owner.poll_once().await.unwrap();
        assert_eq!(second, RelayOutcome::Aborted { partition: 1, offset: 0 });
        assert_eq!(broker.payloads("publicA"), vec![b"first".to_vec()]);
        assert_eq!(broker.committed_offset(GROUP, "stagingA", 1), None);

        let mut successor = StagingRelay::new(
            broker.transactional_producer("relay-2"),
            successor_consumer,
            "publicA",
            config(),
        );
        let handed_over = successor.poll_once().await.unwrap();
        assert_eq!(handed_over, RelayOutcome::Committed { partition: 1, offset: 0 });

        // The old owner kept partition 0 only and has nothing left
        assert_eq!(owner.poll_once().await.unwrap(), RelayOutcome::Idle);
        assert_eq!(
            broker.payloads("publicA"),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert_eq!(broker.committed_offset(GROUP, "stagingA", 1), Some(1));
    }

    #[tokio::test]
    async fn test_stale_generation_commit_is_redelivered() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"m").unwrap();
        let mut relay = relay(&broker, "relay-a");

        // Joins without taking the only partition, but bumps the generation
        let _idle_member = broker.rebalance_before_next_commit(GROUP, "stagingA");

        let first = relay.poll_once().await.unwrap();
        assert_eq!(first, RelayOutcome::Aborted { partition: 0, offset: 0 });
        assert!(broker.payloads("publicA").is_empty());

        let second = relay.poll_once().await.unwrap();
        assert_eq!(second, RelayOutcome::Committed { partition: 0, offset: 0 });
        assert_eq!(broker.payloads("publicA"), vec![b"m".to_vec()]);
    }

    #[tokio::test]
    async fn test_revocation_before_offsets_aborts() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"m").unwrap();
        let mut relay = scripted_relay(&broker, true, false);

        let outcome = relay.poll_once().await.unwrap();

        assert_eq!(outcome, RelayOutcome::Aborted { partition: 0, offset: 0 });
        assert_eq!(relay.state(), RelayState::Polling);
        assert!(broker.payloads("publicA").is_empty());
        assert_eq!(broker.committed_offset(GROUP, "stagingA", 0), None);
    }

    #[tokio::test]
    async fn test_failed_rewind_of_revoked_partition_keeps_running() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"m").unwrap();
        let mut relay = scripted_relay(&broker, true, true);

        let outcome = relay.poll_once().await.unwrap();
        assert_eq!(outcome, RelayOutcome::Aborted { partition: 0, offset: 0 });
        assert_eq!(relay.state(), RelayState::Polling);

        assert_eq!(relay.poll_once().await.unwrap(), RelayOutcome::Idle);
        assert!(broker.payloads("publicA").is_empty());
    }

    #[tokio::test]
    async fn test_failed_rewind_of_owned_partition_stops() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"m").unwrap();
        let mut relay = scripted_relay(&broker, false, true);
        broker.fail_next_sends(1);

        let err = relay.poll_once().await.unwrap_err();
        assert!(matches!(err, BrokerError::State(_)));
        assert_eq!(relay.state(), RelayState::Stopped);
        assert!(broker.payloads("publicA").is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let broker = broker().await;
        broker.produce_committed("stagingA", b"one").unwrap();
        broker.produce_committed("stagingA", b"two").unwrap();
        let relay = relay(&broker, "relay-a");
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(relay.run(shutdown.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.payloads("publicA").len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.store(true, Ordering::SeqCst);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.committed, 2);
        assert_eq!(broker.payloads("publicA"), vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
