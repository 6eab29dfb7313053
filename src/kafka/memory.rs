// ============================================================================
// In-Process Broker
// ============================================================================
//
// A small transactional log that behaves like a Kafka cluster for the parts
// the pipeline relies on:
//
// - Topics hold committed records only, so every reader is read_committed.
// - A transactional.id has an epoch; registering the id again fences the old
//   handle and discards its open transaction.
// - Consumer groups have generations; offsets staged under an old generation
//   are rejected at commit time.
//
// Used when KAFKA_ENABLED=false and by the test suite.
//
// ============================================================================

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::error::{BrokerError, BrokerResult};
use super::topics::{TopicSpec, TopicStatus};
use super::types::{OffsetCommit, Payload, RecordPosition, StagedRecord};
use super::{StagingConsumer, TopicAdmin, TransactionalProducer};

/// Group membership captured when a record was polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryGroupMetadata {
    pub group: String,
    pub generation: u64,
    pub member_id: u64,
}

#[derive(Default)]
struct TopicLog {
    partitions: Vec<Vec<Vec<u8>>>,
    next_partition: usize,
}

impl TopicLog {
    fn with_partitions(count: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); count],
            next_partition: 0,
        }
    }

    fn high_watermark(&self, partition: i32) -> i64 {
        usize::try_from(partition)
            .ok()
            .and_then(|p| self.partitions.get(p))
            .map(|records| records.len() as i64)
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct PendingTransaction {
    records: Vec<(String, i32, Vec<u8>)>,
    offsets: Option<(MemoryGroupMetadata, Vec<OffsetCommit>)>,
}

#[derive(Default)]
struct ProducerSlot {
    epoch: u64,
    transaction: Option<PendingTransaction>,
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    /// member id -> subscribed topic
    members: BTreeMap<u64, String>,
    /// member id -> owned partitions of its topic
    assignment: HashMap<u64, Vec<i32>>,
    committed: HashMap<(String, i32), i64>,
}

impl GroupState {
    /// Start a new generation and spread each topic's partitions over its subscribers
    fn rebalance(&mut self, topics: &HashMap<String, TopicLog>) {
        self.generation += 1;
        self.assignment.clear();

        let mut subscribers: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
        for (member, topic) in &self.members {
            subscribers.entry(topic.as_str()).or_default().push(*member);
        }

        for (topic, members) in subscribers {
            let partitions = topics.get(topic).map(|t| t.partitions.len()).unwrap_or(0);
            for member in &members {
                self.assignment.entry(*member).or_default();
            }
            for partition in 0..partitions {
                let member = members[partition % members.len()];
                self.assignment
                    .entry(member)
                    .or_default()
                    .push(partition as i32);
            }
        }
    }

    fn owns(&self, member: u64, partition: i32) -> bool {
        self.assignment
            .get(&member)
            .is_some_and(|partitions| partitions.contains(&partition))
    }
}

/// Member that joins its group when the next commit starts
struct PendingJoin {
    group: String,
    member_id: u64,
    topic: String,
}

#[derive(Default)]
struct Faults {
    fail_sends: u32,
    fail_commits: u32,
    joins_at_commit: Vec<PendingJoin>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    producers: HashMap<String, ProducerSlot>,
    groups: HashMap<String, GroupState>,
    faults: Faults,
    next_member: u64,
}

impl BrokerState {
    fn slot(&mut self, transactional_id: &str, epoch: u64) -> BrokerResult<&mut ProducerSlot> {
        match self.producers.get_mut(transactional_id) {
            Some(slot) if slot.epoch == epoch => Ok(slot),
            Some(slot) => Err(BrokerError::Fenced(format!(
                "transactional id '{}' epoch {} superseded by epoch {}",
                transactional_id, epoch, slot.epoch
            ))),
            None => Err(BrokerError::Fenced(format!(
                "transactional id '{}' is not registered",
                transactional_id
            ))),
        }
    }

    fn allocate_member(&mut self) -> u64 {
        self.next_member += 1;
        self.next_member
    }

    fn join(&mut self, group: &str, member_id: u64, topic: String) {
        let group_state = self.groups.entry(group.to_string()).or_default();
        group_state.members.insert(member_id, topic);
        group_state.rebalance(&self.topics);
    }

    fn open_transaction(
        &mut self,
        transactional_id: &str,
        epoch: u64,
    ) -> BrokerResult<&mut PendingTransaction> {
        self.slot(transactional_id, epoch)?
            .transaction
            .as_mut()
            .ok_or_else(|| BrokerError::State("no transaction in progress".to_string()))
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to an in-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn admin(&self) -> Arc<dyn TopicAdmin> {
        Arc::new(self.clone())
    }

    /// Register `transactional_id`, fencing any earlier producer with the same id
    ///
    /// A transaction left open by the previous holder is aborted.
    pub fn transactional_producer(
        &self,
        transactional_id: impl Into<String>,
    ) -> MemoryTransactionalProducer {
        let transactional_id = transactional_id.into();
        let mut state = self.inner.state();
        let slot = state.producers.entry(transactional_id.clone()).or_default();
        slot.epoch += 1;
        if slot.transaction.take().is_some() {
            info!(
                transactional_id = %transactional_id,
                "Aborted transaction left open by previous producer"
            );
        }
        let epoch = slot.epoch;
        drop(state);

        debug!(transactional_id = %transactional_id, epoch = epoch, "Producer registered");
        MemoryTransactionalProducer {
            inner: Arc::clone(&self.inner),
            transactional_id,
            epoch,
        }
    }

    /// Join `group` as a new member subscribed to `topic`
    pub fn consumer(
        &self,
        group: impl Into<String>,
        topic: impl Into<String>,
    ) -> MemoryStagingConsumer {
        let group = group.into();
        let topic = topic.into();

        let mut state = self.inner.state();
        let member_id = state.allocate_member();
        state.join(&group, member_id, topic.clone());
        drop(state);
        self.inner.notify.notify_waiters();

        debug!(group = %group, topic = %topic, member_id = member_id, "Consumer joined group");
        self.member(group, topic, member_id)
    }

    /// Like [`consumer`](Self::consumer), but the member joins `group` only
    /// when the next transaction commit starts
    ///
    /// The rebalance then lands while that transaction is still open, so the
    /// offsets it staged belong to a stale generation.
    pub fn rebalance_before_next_commit(
        &self,
        group: impl Into<String>,
        topic: impl Into<String>,
    ) -> MemoryStagingConsumer {
        let group = group.into();
        let topic = topic.into();

        let mut state = self.inner.state();
        let member_id = state.allocate_member();
        state.faults.joins_at_commit.push(PendingJoin {
            group: group.clone(),
            member_id,
            topic: topic.clone(),
        });
        drop(state);

        self.member(group, topic, member_id)
    }

    fn member(&self, group: String, topic: String, member_id: u64) -> MemoryStagingConsumer {
        MemoryStagingConsumer {
            inner: Arc::clone(&self.inner),
            group,
            topic,
            member_id,
            local: Mutex::new(ConsumerLocal::default()),
        }
    }

    /// Make the next `count` sends fail with `Unavailable`
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.state().faults.fail_sends = count;
    }

    /// Make the next `count` commits fail with `Unavailable`; the transaction stays open
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.state().faults.fail_commits = count;
    }

    /// Append a committed record outside any transaction
    pub fn produce_committed(&self, topic: &str, payload: &[u8]) -> BrokerResult<RecordPosition> {
        let mut state = self.inner.state();
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let position = append(log, payload.to_vec());
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(position)
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.inner.state().topics.get(topic).map(|t| t.partitions.len())
    }

    /// Committed record values of `topic`, partition by partition
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Decoded `content` of every committed record in `topic`
    pub fn contents(&self, topic: &str) -> Vec<String> {
        self.payloads(topic)
            .iter()
            .filter_map(|bytes| Payload::from_bytes(bytes).ok())
            .map(|payload| payload.content)
            .collect()
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }
}

fn append(log: &mut TopicLog, payload: Vec<u8>) -> RecordPosition {
    let partition = log.next_partition % log.partitions.len().max(1);
    log.next_partition = log.next_partition.wrapping_add(1);
    let records = &mut log.partitions[partition];
    records.push(payload);
    RecordPosition {
        partition: partition as i32,
        offset: records.len() as i64 - 1,
    }
}

#[async_trait]
impl TopicAdmin for MemoryBroker {
    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<TopicStatus> {
        if spec.partitions <= 0 || spec.replication_factor <= 0 {
            return Err(BrokerError::State(format!(
                "invalid topic configuration for '{}': {} partitions, replication factor {}",
                spec.name, spec.partitions, spec.replication_factor
            )));
        }

        let mut guard = self.inner.state();
        let state = &mut *guard;
        if state.topics.contains_key(&spec.name) {
            return Ok(TopicStatus::AlreadyExists);
        }

        state.topics.insert(
            spec.name.clone(),
            TopicLog::with_partitions(spec.partitions as usize),
        );
        for group in state.groups.values_mut() {
            if group.members.values().any(|topic| *topic == spec.name) {
                group.rebalance(&state.topics);
            }
        }
        drop(guard);
        self.inner.notify.notify_waiters();

        Ok(TopicStatus::Created)
    }
}

/// Producer handle bound to one epoch of a transactional.id
pub struct MemoryTransactionalProducer {
    inner: Arc<Inner>,
    transactional_id: String,
    epoch: u64,
}

#[async_trait]
impl TransactionalProducer for MemoryTransactionalProducer {
    type GroupMetadata = MemoryGroupMetadata;

    fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    async fn begin_transaction(&self) -> BrokerResult<()> {
        let mut state = self.inner.state();
        let slot = state.slot(&self.transactional_id, self.epoch)?;
        if slot.transaction.is_some() {
            return Err(BrokerError::State(
                "transaction already in progress".to_string(),
            ));
        }
        slot.transaction = Some(PendingTransaction::default());
        Ok(())
    }

    async fn send(&self, topic: &str, payload: &[u8]) -> BrokerResult<RecordPosition> {
        let mut guard = self.inner.state();
        let state = &mut *guard;
        state.open_transaction(&self.transactional_id, self.epoch)?;

        if state.faults.fail_sends > 0 {
            state.faults.fail_sends -= 1;
            return Err(BrokerError::Unavailable(format!(
                "injected send failure for topic '{}'",
                topic
            )));
        }

        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let partition = (log.next_partition % log.partitions.len().max(1)) as i32;
        log.next_partition = log.next_partition.wrapping_add(1);
        let committed = log.high_watermark(partition);

        let transaction = state.open_transaction(&self.transactional_id, self.epoch)?;
        let pending = transaction
            .records
            .iter()
            .filter(|(t, p, _)| t == topic && *p == partition)
            .count() as i64;
        transaction
            .records
            .push((topic.to_string(), partition, payload.to_vec()));

        Ok(RecordPosition {
            partition,
            offset: committed + pending,
        })
    }

    async fn send_offsets_to_transaction(
        &self,
        offsets: &[OffsetCommit],
        group: MemoryGroupMetadata,
    ) -> BrokerResult<()> {
        let mut state = self.inner.state();
        let transaction = state.open_transaction(&self.transactional_id, self.epoch)?;
        transaction.offsets = Some((group, offsets.to_vec()));
        Ok(())
    }

    async fn commit_transaction(&self) -> BrokerResult<()> {
        let mut guard = self.inner.state();
        let state = &mut *guard;
        state.open_transaction(&self.transactional_id, self.epoch)?;

        if state.faults.fail_commits > 0 {
            state.faults.fail_commits -= 1;
            return Err(BrokerError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }

        let joins = std::mem::take(&mut state.faults.joins_at_commit);
        if !joins.is_empty() {
            for pending in joins {
                debug!(
                    group = %pending.group,
                    member_id = pending.member_id,
                    "Member joined during commit"
                );
                state.join(&pending.group, pending.member_id, pending.topic);
            }
            self.inner.notify.notify_waiters();
        }

        let staged = state
            .open_transaction(&self.transactional_id, self.epoch)?
            .offsets
            .clone();
        if let Some((metadata, offsets)) = &staged {
            let group = state.groups.get(&metadata.group).ok_or_else(|| {
                BrokerError::Rebalanced(format!("group '{}' has no members", metadata.group))
            })?;
            if group.generation != metadata.generation {
                return Err(BrokerError::Rebalanced(format!(
                    "generation {} of group '{}' is stale (current {})",
                    metadata.generation, metadata.group, group.generation
                )));
            }
            if let Some(commit) = offsets
                .iter()
                .find(|c| !group.owns(metadata.member_id, c.partition))
            {
                return Err(BrokerError::Rebalanced(format!(
                    "member {} no longer owns {}-{}",
                    metadata.member_id, commit.topic, commit.partition
                )));
            }
        }

        let Some(transaction) = state
            .slot(&self.transactional_id, self.epoch)?
            .transaction
            .take()
        else {
            return Err(BrokerError::State("no transaction in progress".to_string()));
        };

        for (topic, partition, payload) in transaction.records {
            if let Some(records) = state
                .topics
                .get_mut(&topic)
                .and_then(|log| log.partitions.get_mut(partition as usize))
            {
                records.push(payload);
            }
        }
        if let Some((metadata, offsets)) = transaction.offsets
            && let Some(group) = state.groups.get_mut(&metadata.group)
        {
            for commit in offsets {
                group
                    .committed
                    .insert((commit.topic, commit.partition), commit.offset);
            }
        }
        drop(guard);
        self.inner.notify.notify_waiters();

        Ok(())
    }

    async fn abort_transaction(&self) -> BrokerResult<()> {
        let mut state = self.inner.state();
        state.slot(&self.transactional_id, self.epoch)?.transaction = None;
        Ok(())
    }
}

#[derive(Default)]
struct ConsumerLocal {
    generation: u64,
    assigned: Vec<i32>,
    positions: HashMap<i32, i64>,
    cursor: usize,
    revocations: u64,
}

/// Group member reading one topic of the in-process broker
pub struct MemoryStagingConsumer {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    member_id: u64,
    local: Mutex<ConsumerLocal>,
}

impl MemoryStagingConsumer {
    fn local(&self) -> MutexGuard<'_, ConsumerLocal> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a pending rebalance, then take the next record from an owned partition
    fn try_next(&self) -> Option<StagedRecord> {
        let state = self.inner.state();
        let mut local = self.local();
        let group = state.groups.get(&self.group)?;

        if group.generation != local.generation {
            let assigned = group
                .assignment
                .get(&self.member_id)
                .cloned()
                .unwrap_or_default();
            if local.assigned.iter().any(|p| !assigned.contains(p)) {
                local.revocations += 1;
                info!(
                    topic = %self.topic,
                    member_id = self.member_id,
                    "Partitions revoked"
                );
            }
            local.positions = assigned
                .iter()
                .map(|p| {
                    let committed = group.committed.get(&(self.topic.clone(), *p)).copied();
                    (*p, committed.unwrap_or(0))
                })
                .collect();
            debug!(
                topic = %self.topic,
                member_id = self.member_id,
                generation = group.generation,
                partitions = ?assigned,
                "Partitions assigned"
            );
            local.assigned = assigned;
            local.generation = group.generation;
            local.cursor = 0;
        }

        let log = state.topics.get(&self.topic)?;
        let count = local.assigned.len();
        for step in 0..count {
            let index = (local.cursor + step) % count;
            let partition = local.assigned[index];
            let position = local.positions.get(&partition).copied().unwrap_or(0);
            let Some(payload) = usize::try_from(position)
                .ok()
                .and_then(|o| log.partitions.get(partition as usize)?.get(o))
            else {
                continue;
            };

            let record = StagedRecord {
                topic: self.topic.clone(),
                partition,
                offset: position,
                payload: payload.clone(),
            };
            local.positions.insert(partition, position + 1);
            local.cursor = (index + 1) % count;
            return Some(record);
        }
        None
    }
}

impl Drop for MemoryStagingConsumer {
    fn drop(&mut self) {
        let mut guard = self.inner.state();
        let state = &mut *guard;
        state
            .faults
            .joins_at_commit
            .retain(|pending| pending.member_id != self.member_id);
        if let Some(group) = state.groups.get_mut(&self.group)
            && group.members.remove(&self.member_id).is_some()
        {
            group.rebalance(&state.topics);
        }
        drop(guard);
        self.inner.notify.notify_waiters();
    }
}

#[async_trait]
impl StagingConsumer for MemoryStagingConsumer {
    type GroupMetadata = MemoryGroupMetadata;

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, timeout: Duration) -> BrokerResult<Option<StagedRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.try_next() {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn group_metadata(&self) -> BrokerResult<MemoryGroupMetadata> {
        let local = self.local();
        if local.generation == 0 {
            return Err(BrokerError::Rebalanced(format!(
                "member {} has not joined group '{}' yet",
                self.member_id, self.group
            )));
        }
        Ok(MemoryGroupMetadata {
            group: self.group.clone(),
            generation: local.generation,
            member_id: self.member_id,
        })
    }

    fn revocations(&self) -> u64 {
        self.local().revocations
    }

    fn owns(&self, partition: i32) -> bool {
        self.local().assigned.contains(&partition)
    }

    fn rewind(&self, record: &StagedRecord) -> BrokerResult<()> {
        let mut local = self.local();
        if local.assigned.contains(&record.partition) {
            local.positions.insert(record.partition, record.offset);
        }
        Ok(())
    }
}
