use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_domain::{
    AuditIntent, AuditLogRecord, FailureRecord, GlobalAnchor, IntentStatus, NodeDoc,
    PartitionTail, SequenceState,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{ClaimGuard, DocumentStore, PluginBlob, StoreOps, StoreSession};

#[derive(Debug, Default, Clone)]
struct Inner {
    intents: HashMap<Uuid, AuditIntent>,
    logs: BTreeMap<u64, AuditLogRecord>,
    log_event_index: HashMap<Uuid, u64>,
    partition_tails: HashMap<u32, PartitionTail>,
    sequence: Option<SequenceState>,
    anchors: Vec<GlobalAnchor>,
    failures: HashMap<Uuid, FailureRecord>,
    nodes: HashMap<String, NodeDoc>,
    hwid_index: HashMap<String, String>,
    plugin_blobs: HashMap<String, PluginBlob>,
}

impl Inner {
    fn insert_intent(&mut self, intent: &AuditIntent) -> bool {
        if self.intents.contains_key(&intent.event_id) {
            return false;
        }
        self.intents.insert(intent.event_id, intent.clone());
        true
    }

    fn claim_candidates(&self, limit: usize) -> Vec<AuditIntent> {
        let mut rows: Vec<AuditIntent> = self
            .intents
            .values()
            .filter(|i| {
                matches!(i.status, IntentStatus::Pending | IntentStatus::FailedRetriable)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then(a.event_id.cmp(&b.event_id))
        });
        rows.truncate(limit);
        rows
    }

    fn expired_processing(&self, now: DateTime<Utc>, limit: usize) -> Vec<AuditIntent> {
        let mut rows: Vec<AuditIntent> = self
            .intents
            .values()
            .filter(|i| {
                i.status == IntentStatus::Processing
                    && i.lease_until.map_or(true, |until| until <= now)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then(a.event_id.cmp(&b.event_id))
        });
        rows.truncate(limit);
        rows
    }

    fn try_claim(
        &mut self,
        event_id: Uuid,
        guard: &ClaimGuard,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(intent) = self.intents.get_mut(&event_id) else {
            return false;
        };
        if intent.status != guard.status {
            return false;
        }
        if guard.status == IntentStatus::Processing
            && (intent.lease_owner != guard.lease_owner
                || intent.lease_until != guard.lease_until)
        {
            return false;
        }
        intent.status = IntentStatus::Processing;
        intent.lease_owner = Some(owner.to_string());
        intent.lease_until = Some(lease_until);
        intent.updated_at = now;
        true
    }

    fn mark_committed(
        &mut self,
        event_id: Uuid,
        global_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let intent = self
            .intents
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::NotFound(format!("intent {}", event_id)))?;
        intent.status = IntentStatus::Committed;
        intent.global_sequence = Some(global_sequence);
        intent.committed_at = Some(now);
        intent.error_last = None;
        intent.lease_owner = None;
        intent.lease_until = None;
        intent.updated_at = now;
        Ok(())
    }

    fn mark_retriable(
        &mut self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let intent = self
            .intents
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::NotFound(format!("intent {}", event_id)))?;
        intent.status = IntentStatus::FailedRetriable;
        intent.attempt_count += 1;
        intent.error_last = Some(error.to_string());
        intent.lease_owner = None;
        intent.lease_until = None;
        intent.updated_at = now;
        Ok(intent.attempt_count)
    }

    fn mark_terminal(
        &mut self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let intent = self
            .intents
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::NotFound(format!("intent {}", event_id)))?;
        intent.status = IntentStatus::FailedTerminal;
        intent.error_last = Some(error.to_string());
        intent.lease_owner = None;
        intent.lease_until = None;
        intent.updated_at = now;
        Ok(())
    }

    fn release_owned(&mut self, owner: &str, now: DateTime<Utc>) -> u64 {
        let mut released = 0;
        for intent in self.intents.values_mut() {
            if intent.status == IntentStatus::Processing
                && intent.lease_owner.as_deref() == Some(owner)
            {
                intent.status = IntentStatus::Pending;
                intent.lease_owner = None;
                intent.lease_until = None;
                intent.updated_at = now;
                released += 1;
            }
        }
        released
    }

    fn count_backlog(&self) -> u64 {
        self.intents.values().filter(|i| i.status.is_backlog()).count() as u64
    }

    fn insert_log(&mut self, log: &AuditLogRecord) -> Result<(), StoreError> {
        if self.log_event_index.contains_key(&log.event_id) {
            return Err(StoreError::DuplicateKey {
                collection: "audit_logs",
                key: log.event_id.to_string(),
            });
        }
        if self.logs.contains_key(&log.sequence) {
            return Err(StoreError::DuplicateKey {
                collection: "audit_logs",
                key: format!("_sequence={}", log.sequence),
            });
        }
        self.log_event_index.insert(log.event_id, log.sequence);
        self.logs.insert(log.sequence, log.clone());
        Ok(())
    }

    fn insert_logs(&mut self, logs: &[AuditLogRecord]) -> Result<Vec<Uuid>, StoreError> {
        let mut skipped = Vec::new();
        for log in logs {
            if self.log_event_index.contains_key(&log.event_id) {
                skipped.push(log.event_id);
                continue;
            }
            self.insert_log(log)?;
        }
        Ok(skipped)
    }

    fn logs_by_event_ids(&self, event_ids: &[Uuid]) -> Vec<AuditLogRecord> {
        event_ids
            .iter()
            .filter_map(|id| self.log_event_index.get(id))
            .filter_map(|seq| self.logs.get(seq))
            .cloned()
            .collect()
    }

    fn cas_partition_tail(
        &mut self,
        expected_sequence: u64,
        expected_hash: &str,
        next: &PartitionTail,
    ) -> bool {
        match self.partition_tails.get(&next.partition_id) {
            None => {
                if expected_sequence != 0 || !expected_hash.is_empty() {
                    return false;
                }
            }
            Some(tail) => {
                if tail.last_sequence != expected_sequence || tail.last_hash != expected_hash {
                    return false;
                }
            }
        }
        self.partition_tails.insert(next.partition_id, next.clone());
        true
    }

    fn sequence_state_mut(&mut self, now: DateTime<Utc>) -> &mut SequenceState {
        self.sequence.get_or_insert_with(|| SequenceState::initial(now))
    }

    fn insert_node(&mut self, node: &NodeDoc) -> Result<(), StoreError> {
        if self.hwid_index.contains_key(&node.hwid) {
            return Err(StoreError::DuplicateKey {
                collection: "nodes",
                key: node.hwid.clone(),
            });
        }
        if self.nodes.contains_key(&node.node_id) {
            return Err(StoreError::DuplicateKey {
                collection: "nodes",
                key: node.node_id.clone(),
            });
        }
        self.hwid_index.insert(node.hwid.clone(), node.node_id.clone());
        self.nodes.insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    fn update_node(&mut self, node: &NodeDoc) -> Result<(), StoreError> {
        if !self.nodes.contains_key(&node.node_id) {
            return Err(StoreError::NotFound(format!("node {}", node.node_id)));
        }
        self.hwid_index.insert(node.hwid.clone(), node.node_id.clone());
        self.nodes.insert(node.node_id.clone(), node.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Shared {
    /// Bumped on every committed write; optimistic sessions validate
    /// against it at commit time.
    version: u64,
    inner: Inner,
}

/// In-memory implementation of [`DocumentStore`].
///
/// All data is lost on process exit. Suitable for tests and single-process
/// deployments; replica-set-backed stores are separate deployment backends.
///
/// Transactions are optimistic: `begin` snapshots the state, operations run
/// against the private snapshot, and `commit` replaces the shared state only
/// if no other write landed in between — otherwise
/// [`StoreError::TransactionAborted`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

macro_rules! direct_read {
    ($self:ident, $body:expr) => {{
        let shared = $self.shared.lock().await;
        #[allow(clippy::redundant_closure_call)]
        let out = ($body)(&shared.inner);
        out
    }};
}

macro_rules! direct_write {
    ($self:ident, $body:expr) => {{
        let mut shared = $self.shared.lock().await;
        #[allow(clippy::redundant_closure_call)]
        let out = ($body)(&mut shared.inner);
        shared.version += 1;
        out
    }};
}

#[async_trait]
impl StoreOps for MemoryStore {
    async fn insert_intent(&self, intent: &AuditIntent) -> Result<bool, StoreError> {
        let mut shared = self.shared.lock().await;
        let inserted = shared.inner.insert_intent(intent);
        if inserted {
            shared.version += 1;
        }
        Ok(inserted)
    }

    async fn get_intent(&self, event_id: Uuid) -> Result<Option<AuditIntent>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.intents.get(&event_id).cloned()))
    }

    async fn claim_candidates(&self, limit: usize) -> Result<Vec<AuditIntent>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.claim_candidates(limit)))
    }

    async fn expired_processing(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditIntent>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.expired_processing(now, limit)))
    }

    async fn try_claim(
        &self,
        event_id: Uuid,
        guard: &ClaimGuard,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut shared = self.shared.lock().await;
        let claimed = shared.inner.try_claim(event_id, guard, owner, lease_until, now);
        if claimed {
            shared.version += 1;
        }
        Ok(claimed)
    }

    async fn mark_committed(
        &self,
        event_id: Uuid,
        global_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| inner
            .mark_committed(event_id, global_sequence, now))
    }

    async fn mark_retriable(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        direct_write!(self, |inner: &mut Inner| inner.mark_retriable(event_id, error, now))
    }

    async fn mark_terminal(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| inner.mark_terminal(event_id, error, now))
    }

    async fn release_owned(&self, owner: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        direct_write!(self, |inner: &mut Inner| Ok(inner.release_owned(owner, now)))
    }

    async fn count_backlog(&self) -> Result<u64, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.count_backlog()))
    }

    async fn insert_log(&self, log: &AuditLogRecord) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| inner.insert_log(log))
    }

    async fn insert_logs(&self, logs: &[AuditLogRecord]) -> Result<Vec<Uuid>, StoreError> {
        direct_write!(self, |inner: &mut Inner| inner.insert_logs(logs))
    }

    async fn logs_by_event_ids(
        &self,
        event_ids: &[Uuid],
    ) -> Result<Vec<AuditLogRecord>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.logs_by_event_ids(event_ids)))
    }

    async fn log_by_sequence(
        &self,
        sequence: u64,
    ) -> Result<Option<AuditLogRecord>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.logs.get(&sequence).cloned()))
    }

    async fn latest_log(&self) -> Result<Option<AuditLogRecord>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(
            inner.logs.values().next_back().cloned()
        ))
    }

    async fn list_logs(
        &self,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner
            .logs
            .range(from_sequence..)
            .take(limit)
            .map(|(_, log)| log.clone())
            .collect()))
    }

    async fn load_partition_tails(&self) -> Result<Vec<PartitionTail>, StoreError> {
        direct_read!(self, |inner: &Inner| {
            let mut tails: Vec<PartitionTail> =
                inner.partition_tails.values().cloned().collect();
            tails.sort_by_key(|t| t.partition_id);
            Ok(tails)
        })
    }

    async fn cas_partition_tail(
        &self,
        expected_sequence: u64,
        expected_hash: &str,
        next: &PartitionTail,
    ) -> Result<bool, StoreError> {
        let mut shared = self.shared.lock().await;
        let swapped = shared
            .inner
            .cas_partition_tail(expected_sequence, expected_hash, next);
        if swapped {
            shared.version += 1;
        }
        Ok(swapped)
    }

    async fn load_sequence_state(&self) -> Result<SequenceState, StoreError> {
        direct_write!(self, |inner: &mut Inner| Ok(inner
            .sequence_state_mut(Utc::now())
            .clone()))
    }

    async fn cas_global_tail(
        &self,
        expected_sequence: u64,
        expected_hash: &str,
        next_sequence: u64,
        next_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut shared = self.shared.lock().await;
        let state = shared.inner.sequence_state_mut(now);
        if state.global_last_sequence != expected_sequence
            || state.global_last_hash != expected_hash
        {
            return Ok(false);
        }
        state.global_last_sequence = next_sequence;
        state.global_last_hash = next_hash.to_string();
        state.value = state.value.max(next_sequence);
        state.updated_at = now;
        shared.version += 1;
        Ok(true)
    }

    async fn alloc_sequence(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        direct_write!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            state.value += 1;
            state.updated_at = now;
            Ok(state.value)
        })
    }

    async fn raise_sequence_floor(
        &self,
        min_value: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            state.value = state.value.max(min_value);
            state.updated_at = now;
            Ok(())
        })
    }

    async fn reconcile_sequence_state(
        &self,
        global_last_sequence: u64,
        global_last_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            if global_last_sequence > state.global_last_sequence {
                state.global_last_sequence = global_last_sequence;
                state.global_last_hash = global_last_hash.to_string();
            }
            state.value = state.value.max(global_last_sequence);
            state.updated_at = now;
            Ok(())
        })
    }

    async fn record_backpressure_hit(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            state.backpressure_hits += 1;
            state.backpressure_last_at = Some(now);
            Ok(())
        })
    }

    async fn latest_anchor(&self) -> Result<Option<GlobalAnchor>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.anchors.last().cloned()))
    }

    async fn append_anchor(&self, anchor: &GlobalAnchor) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| {
            inner.anchors.push(anchor.clone());
            Ok(())
        })
    }

    async fn insert_failure(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| {
            inner.failures.insert(failure.event_id, failure.clone());
            Ok(())
        })
    }

    async fn failure_by_event_id(
        &self,
        event_id: Uuid,
    ) -> Result<Option<FailureRecord>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.failures.get(&event_id).cloned()))
    }

    async fn node_by_hwid(&self, hwid: &str) -> Result<Option<NodeDoc>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner
            .hwid_index
            .get(hwid)
            .and_then(|id| inner.nodes.get(id))
            .cloned()))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDoc>, StoreError> {
        direct_read!(self, |inner: &Inner| {
            let mut nodes: Vec<NodeDoc> = inner.nodes.values().cloned().collect();
            nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(nodes)
        })
    }

    async fn insert_node(&self, node: &NodeDoc) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| inner.insert_node(node))
    }

    async fn update_node(&self, node: &NodeDoc) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| inner.update_node(node))
    }

    async fn get_plugin_blob(&self, plugin_id: &str) -> Result<Option<PluginBlob>, StoreError> {
        direct_read!(self, |inner: &Inner| Ok(inner.plugin_blobs.get(plugin_id).cloned()))
    }

    async fn put_plugin_blob(&self, blob: &PluginBlob) -> Result<(), StoreError> {
        direct_write!(self, |inner: &mut Inner| {
            inner.plugin_blobs.insert(blob.plugin_id.clone(), blob.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn supports_transactions(&self) -> bool {
        true
    }

    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let shared = self.shared.lock().await;
        Ok(Box::new(MemorySession {
            origin: Arc::clone(&self.shared),
            base_version: shared.version,
            work: Mutex::new(shared.inner.clone()),
        }))
    }

    fn as_ops(&self) -> &dyn StoreOps {
        self
    }
}

/// One optimistic transaction over a [`MemoryStore`].
struct MemorySession {
    origin: Arc<Mutex<Shared>>,
    base_version: u64,
    work: Mutex<Inner>,
}

macro_rules! session_op {
    ($self:ident, $body:expr) => {{
        let mut work = $self.work.lock().await;
        #[allow(clippy::redundant_closure_call)]
        let out = ($body)(&mut *work);
        out
    }};
}

#[async_trait]
impl StoreOps for MemorySession {
    async fn insert_intent(&self, intent: &AuditIntent) -> Result<bool, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.insert_intent(intent)))
    }

    async fn get_intent(&self, event_id: Uuid) -> Result<Option<AuditIntent>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.intents.get(&event_id).cloned()))
    }

    async fn claim_candidates(&self, limit: usize) -> Result<Vec<AuditIntent>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.claim_candidates(limit)))
    }

    async fn expired_processing(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditIntent>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.expired_processing(now, limit)))
    }

    async fn try_claim(
        &self,
        event_id: Uuid,
        guard: &ClaimGuard,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(
            inner.try_claim(event_id, guard, owner, lease_until, now)
        ))
    }

    async fn mark_committed(
        &self,
        event_id: Uuid,
        global_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| inner
            .mark_committed(event_id, global_sequence, now))
    }

    async fn mark_retriable(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        session_op!(self, |inner: &mut Inner| inner.mark_retriable(event_id, error, now))
    }

    async fn mark_terminal(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| inner.mark_terminal(event_id, error, now))
    }

    async fn release_owned(&self, owner: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.release_owned(owner, now)))
    }

    async fn count_backlog(&self) -> Result<u64, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.count_backlog()))
    }

    async fn insert_log(&self, log: &AuditLogRecord) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| inner.insert_log(log))
    }

    async fn insert_logs(&self, logs: &[AuditLogRecord]) -> Result<Vec<Uuid>, StoreError> {
        session_op!(self, |inner: &mut Inner| inner.insert_logs(logs))
    }

    async fn logs_by_event_ids(
        &self,
        event_ids: &[Uuid],
    ) -> Result<Vec<AuditLogRecord>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.logs_by_event_ids(event_ids)))
    }

    async fn log_by_sequence(
        &self,
        sequence: u64,
    ) -> Result<Option<AuditLogRecord>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.logs.get(&sequence).cloned()))
    }

    async fn latest_log(&self) -> Result<Option<AuditLogRecord>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(
            inner.logs.values().next_back().cloned()
        ))
    }

    async fn list_logs(
        &self,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner
            .logs
            .range(from_sequence..)
            .take(limit)
            .map(|(_, log)| log.clone())
            .collect()))
    }

    async fn load_partition_tails(&self) -> Result<Vec<PartitionTail>, StoreError> {
        session_op!(self, |inner: &mut Inner| {
            let mut tails: Vec<PartitionTail> =
                inner.partition_tails.values().cloned().collect();
            tails.sort_by_key(|t| t.partition_id);
            Ok(tails)
        })
    }

    async fn cas_partition_tail(
        &self,
        expected_sequence: u64,
        expected_hash: &str,
        next: &PartitionTail,
    ) -> Result<bool, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(
            inner.cas_partition_tail(expected_sequence, expected_hash, next)
        ))
    }

    async fn load_sequence_state(&self) -> Result<SequenceState, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(
            inner.sequence_state_mut(Utc::now()).clone()
        ))
    }

    async fn cas_global_tail(
        &self,
        expected_sequence: u64,
        expected_hash: &str,
        next_sequence: u64,
        next_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        session_op!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            if state.global_last_sequence != expected_sequence
                || state.global_last_hash != expected_hash
            {
                return Ok(false);
            }
            state.global_last_sequence = next_sequence;
            state.global_last_hash = next_hash.to_string();
            state.value = state.value.max(next_sequence);
            state.updated_at = now;
            Ok(true)
        })
    }

    async fn alloc_sequence(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        session_op!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            state.value += 1;
            state.updated_at = now;
            Ok(state.value)
        })
    }

    async fn raise_sequence_floor(
        &self,
        min_value: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            state.value = state.value.max(min_value);
            state.updated_at = now;
            Ok(())
        })
    }

    async fn reconcile_sequence_state(
        &self,
        global_last_sequence: u64,
        global_last_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            if global_last_sequence > state.global_last_sequence {
                state.global_last_sequence = global_last_sequence;
                state.global_last_hash = global_last_hash.to_string();
            }
            state.value = state.value.max(global_last_sequence);
            state.updated_at = now;
            Ok(())
        })
    }

    async fn record_backpressure_hit(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| {
            let state = inner.sequence_state_mut(now);
            state.backpressure_hits += 1;
            state.backpressure_last_at = Some(now);
            Ok(())
        })
    }

    async fn latest_anchor(&self) -> Result<Option<GlobalAnchor>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.anchors.last().cloned()))
    }

    async fn append_anchor(&self, anchor: &GlobalAnchor) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| {
            inner.anchors.push(anchor.clone());
            Ok(())
        })
    }

    async fn insert_failure(&self, failure: &FailureRecord) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| {
            inner.failures.insert(failure.event_id, failure.clone());
            Ok(())
        })
    }

    async fn failure_by_event_id(
        &self,
        event_id: Uuid,
    ) -> Result<Option<FailureRecord>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner.failures.get(&event_id).cloned()))
    }

    async fn node_by_hwid(&self, hwid: &str) -> Result<Option<NodeDoc>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(inner
            .hwid_index
            .get(hwid)
            .and_then(|id| inner.nodes.get(id))
            .cloned()))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDoc>, StoreError> {
        session_op!(self, |inner: &mut Inner| {
            let mut nodes: Vec<NodeDoc> = inner.nodes.values().cloned().collect();
            nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(nodes)
        })
    }

    async fn insert_node(&self, node: &NodeDoc) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| inner.insert_node(node))
    }

    async fn update_node(&self, node: &NodeDoc) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| inner.update_node(node))
    }

    async fn get_plugin_blob(&self, plugin_id: &str) -> Result<Option<PluginBlob>, StoreError> {
        session_op!(self, |inner: &mut Inner| Ok(
            inner.plugin_blobs.get(plugin_id).cloned()
        ))
    }

    async fn put_plugin_blob(&self, blob: &PluginBlob) -> Result<(), StoreError> {
        session_op!(self, |inner: &mut Inner| {
            inner.plugin_blobs.insert(blob.plugin_id.clone(), blob.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let session = *self;
        let work = session.work.into_inner();
        let mut shared = session.origin.lock().await;
        if shared.version != session.base_version {
            return Err(StoreError::TransactionAborted);
        }
        shared.inner = work;
        shared.version += 1;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    fn as_ops(&self) -> &dyn StoreOps {
        self
    }
}
