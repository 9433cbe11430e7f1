use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_domain::{
    AuditIntent, AuditLogRecord, FailureRecord, GlobalAnchor, IntentStatus, NodeDoc,
    PartitionTail, SequenceState,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// CAS guard for claiming an intent: the claim only succeeds if the stored
/// row still matches what the claimer read. Lease fields are only compared
/// when reclaiming a stale `processing` row.
#[derive(Debug, Clone)]
pub struct ClaimGuard {
    pub status: IntentStatus,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
}

impl ClaimGuard {
    pub fn fresh(status: IntentStatus) -> Self {
        Self { status, lease_owner: None, lease_until: None }
    }

    pub fn stale(intent: &AuditIntent) -> Self {
        Self {
            status: IntentStatus::Processing,
            lease_owner: intent.lease_owner.clone(),
            lease_until: intent.lease_until,
        }
    }
}

/// An encrypted per-plugin configuration blob as persisted by the vault.
/// The store never sees plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginBlob {
    pub plugin_id: String,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    pub updated_at: DateTime<Utc>,
}

/// Typed operations over the control-plane collections.
///
/// Implemented both by [`DocumentStore`] (auto-commit, one operation per
/// write) and by [`StoreSession`] (all operations land atomically at
/// `commit`). Engine code is written against this trait so a code path can
/// run in either mode, mirroring a driver-level `session?` parameter.
#[async_trait]
pub trait StoreOps: Send + Sync {
    // ── audit_intents ─────────────────────────────────────────────────────────

    /// Insert an intent. Returns `Ok(false)` when `event_id` already exists
    /// (idempotent re-enqueue), `Ok(true)` on a fresh insert.
    async fn insert_intent(&self, intent: &AuditIntent) -> Result<bool, StoreError>;

    async fn get_intent(&self, event_id: Uuid) -> Result<Option<AuditIntent>, StoreError>;

    /// Up to `limit` intents in `pending` or `failed_retriable`, ordered by
    /// `(created_at, event_id)`.
    async fn claim_candidates(&self, limit: usize) -> Result<Vec<AuditIntent>, StoreError>;

    /// Up to `limit` intents stuck in `processing` whose lease expired (or
    /// was never set), same order.
    async fn expired_processing(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditIntent>, StoreError>;

    /// Conditionally move an intent to `processing` under `owner`. Returns
    /// whether the guard matched.
    async fn try_claim(
        &self,
        event_id: Uuid,
        guard: &ClaimGuard,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_committed(
        &self,
        event_id: Uuid,
        global_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a retriable worker failure: `failed_retriable`, attempt_count
    /// incremented, `error_last` set. Returns the new attempt count.
    async fn mark_retriable(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    async fn mark_terminal(
        &self,
        event_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Return every `processing` intent held by `owner` to `pending` without
    /// touching `attempt_count` (chain contention is not a failure). Returns
    /// how many rows were released.
    async fn release_owned(&self, owner: &str, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn count_backlog(&self) -> Result<u64, StoreError>;

    // ── audit_logs ────────────────────────────────────────────────────────────

    /// Strict single insert; duplicate `event_id` or `_sequence` raises
    /// [`StoreError::DuplicateKey`]. Used by the synchronous fallback path.
    async fn insert_log(&self, log: &AuditLogRecord) -> Result<(), StoreError>;

    /// Batch insert tolerating duplicates on `event_id` (idempotent replay);
    /// returns the event_ids that were skipped. A `_sequence` collision with
    /// a different event still raises [`StoreError::DuplicateKey`].
    async fn insert_logs(&self, logs: &[AuditLogRecord]) -> Result<Vec<Uuid>, StoreError>;

    async fn logs_by_event_ids(
        &self,
        event_ids: &[Uuid],
    ) -> Result<Vec<AuditLogRecord>, StoreError>;

    async fn log_by_sequence(&self, sequence: u64)
        -> Result<Option<AuditLogRecord>, StoreError>;

    async fn latest_log(&self) -> Result<Option<AuditLogRecord>, StoreError>;

    /// Logs with `_sequence >= from_sequence`, ascending, up to `limit`.
    async fn list_logs(
        &self,
        from_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, StoreError>;

    // ── audit_partition_state ─────────────────────────────────────────────────

    async fn load_partition_tails(&self) -> Result<Vec<PartitionTail>, StoreError>;

    /// CAS-upsert a partition tail guarded by the expected `(sequence, hash)`
    /// pair. An expectation of `(0, "")` matches an absent row and inserts
    /// it. Returns whether the guard matched.
    async fn cas_partition_tail(
        &self,
        expected_sequence: u64,
        expected_hash: &str,
        next: &PartitionTail,
    ) -> Result<bool, StoreError>;

    // ── audit_state (singleton) ───────────────────────────────────────────────

    /// Load the sequence-state singleton, creating the zero row if absent.
    async fn load_sequence_state(&self) -> Result<SequenceState, StoreError>;

    /// CAS-advance the committed global tail. Also lifts the allocation
    /// counter to at least `next_sequence` so the fallback allocator never
    /// hands out a sequence at or below the committed tail.
    async fn cas_global_tail(
        &self,
        expected_sequence: u64,
        expected_hash: &str,
        next_sequence: u64,
        next_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically increment the allocation counter and return the new value.
    async fn alloc_sequence(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Lift the allocation counter to `max(value, min_value)`.
    async fn raise_sequence_floor(
        &self,
        min_value: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reconcile the singleton upward against a recovered committed tail.
    async fn reconcile_sequence_state(
        &self,
        global_last_sequence: u64,
        global_last_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_backpressure_hit(&self, now: DateTime<Utc>) -> Result<(), StoreError>;

    // ── audit_global_anchor ───────────────────────────────────────────────────

    async fn latest_anchor(&self) -> Result<Option<GlobalAnchor>, StoreError>;

    async fn append_anchor(&self, anchor: &GlobalAnchor) -> Result<(), StoreError>;

    // ── audit_failures ────────────────────────────────────────────────────────

    async fn insert_failure(&self, failure: &FailureRecord) -> Result<(), StoreError>;

    async fn failure_by_event_id(
        &self,
        event_id: Uuid,
    ) -> Result<Option<FailureRecord>, StoreError>;

    // ── nodes ─────────────────────────────────────────────────────────────────

    async fn node_by_hwid(&self, hwid: &str) -> Result<Option<NodeDoc>, StoreError>;

    async fn list_nodes(&self) -> Result<Vec<NodeDoc>, StoreError>;

    /// Insert a node; `hwid` is unique.
    async fn insert_node(&self, node: &NodeDoc) -> Result<(), StoreError>;

    /// Replace a node by `node_id`.
    async fn update_node(&self, node: &NodeDoc) -> Result<(), StoreError>;

    // ── plugin config vault ───────────────────────────────────────────────────

    async fn get_plugin_blob(&self, plugin_id: &str) -> Result<Option<PluginBlob>, StoreError>;

    async fn put_plugin_blob(&self, blob: &PluginBlob) -> Result<(), StoreError>;
}

/// A document store with transactional and non-transactional modes.
#[async_trait]
pub trait DocumentStore: StoreOps + 'static {
    /// Whether [`DocumentStore::begin`] is backed by real transactions.
    fn supports_transactions(&self) -> bool;

    /// Open a transaction. Operations on the returned session become visible
    /// atomically at `commit`.
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;

    /// View this store as its operation surface.
    fn as_ops(&self) -> &dyn StoreOps;
}

/// One open transaction.
#[async_trait]
pub trait StoreSession: StoreOps {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn abort(self: Box<Self>) -> Result<(), StoreError>;

    /// View this session as its operation surface.
    fn as_ops(&self) -> &dyn StoreOps;
}
