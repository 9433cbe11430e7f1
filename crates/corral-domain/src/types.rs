use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Chain format version stamped on every committed log.
pub const CHAIN_VERSION: u32 = 1;

// ── Audit event ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditLevel::Debug => write!(f, "DEBUG"),
            AuditLevel::Info => write!(f, "INFO"),
            AuditLevel::Warn => write!(f, "WARN"),
            AuditLevel::Error => write!(f, "ERROR"),
            AuditLevel::Fatal => write!(f, "FATAL"),
        }
    }
}

/// One audit event as submitted at intake. Immutable after intake; the
/// pipeline only ever wraps it, never rewrites it.
///
/// `meta` is the single opaque extension point (string → JSON value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Wall-clock milliseconds since the epoch.
    pub ts: i64,
    pub level: AuditLevel,
    pub node_id: String,
    pub source: String,
    pub trace_id: String,
    pub content: String,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

// ── Audit intent ──────────────────────────────────────────────────────────────

/// Queue state of an intent.
///
/// Transitions:
///   Pending → Processing → Committed
///   Processing → FailedRetriable → Pending (attempt_count++)
///   FailedRetriable → FailedTerminal (attempts exhausted)
///
/// `ReadyForGlobalCommit` is reserved for a future two-phase commit; nothing
/// writes it today but it still counts as backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Processing,
    ReadyForGlobalCommit,
    Committed,
    FailedRetriable,
    FailedTerminal,
}

impl IntentStatus {
    /// Whether this status counts toward the intake backlog.
    pub fn is_backlog(&self) -> bool {
        matches!(
            self,
            IntentStatus::Pending
                | IntentStatus::Processing
                | IntentStatus::ReadyForGlobalCommit
                | IntentStatus::FailedRetriable
        )
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Processing => "processing",
            IntentStatus::ReadyForGlobalCommit => "ready_for_global_commit",
            IntentStatus::Committed => "committed",
            IntentStatus::FailedRetriable => "failed_retriable",
            IntentStatus::FailedTerminal => "failed_terminal",
        };
        write!(f, "{}", s)
    }
}

/// A queued audit event awaiting commit. Unique on `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditIntent {
    pub event_id: Uuid,
    pub route_tag: String,
    pub partition_id: u32,
    pub status: IntentStatus,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: AuditEvent,
    /// SHA-256 of the canonical payload, hex.
    pub payload_digest: String,
    /// HMAC-SHA256 of `payload_digest`, hex.
    pub payload_hmac: String,
    pub hmac_key_id: String,
    pub global_sequence: Option<u64>,
    pub committed_at: Option<DateTime<Utc>>,
    pub error_last: Option<String>,
}

// ── Committed log ─────────────────────────────────────────────────────────────

/// A committed audit log: the original event plus its position in both the
/// partition chain and the global chain. Unique on `_sequence` and `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub event_id: Uuid,
    pub chain_version: u32,
    #[serde(flatten)]
    pub event: AuditEvent,
    pub partition_id: u32,
    pub partition_sequence: u64,
    /// Hex, or "" for the first log of the partition.
    pub partition_previous_hash: String,
    pub partition_hash: String,
    #[serde(rename = "_sequence")]
    pub sequence: u64,
    /// Hex, or "" for the first log of the global chain.
    #[serde(rename = "_previous_hash")]
    pub previous_hash: String,
    #[serde(rename = "_hash")]
    pub hash: String,
}

// ── Partition state ───────────────────────────────────────────────────────────

/// Persisted tail of one partition chain. Unique on `partition_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTail {
    pub partition_id: u32,
    pub last_sequence: u64,
    pub last_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl PartitionTail {
    /// The tail of a partition that has never committed a log.
    pub fn zero(partition_id: u32, now: DateTime<Utc>) -> Self {
        Self { partition_id, last_sequence: 0, last_hash: String::new(), updated_at: now }
    }
}

/// A partition head as frozen into an anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHead {
    pub partition_id: u32,
    pub last_sequence: u64,
    pub last_hash: String,
}

// ── Global anchor ─────────────────────────────────────────────────────────────

/// A periodic snapshot of all partition heads, itself hash-chained against
/// the previous anchor. Fork-detection checkpoint independent of the log
/// stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalAnchor {
    pub anchor_id: Uuid,
    pub ts: DateTime<Utc>,
    /// Sorted by `partition_id`.
    pub partition_heads: Vec<PartitionHead>,
    pub previous_anchor_hash: String,
    pub anchor_hash: String,
}

// ── Failure record ────────────────────────────────────────────────────────────

/// A terminal intent failure, retained for inspection. Indexed by `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub event_id: Uuid,
    pub code: String,
    pub message: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
}

// ── Sequence state ────────────────────────────────────────────────────────────

/// The `_id = "global"` singleton guarding the global chain CAS.
///
/// `value` is the allocation counter used by the synchronous fallback path;
/// `global_last_sequence`/`global_last_hash` track the committed tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceState {
    pub value: u64,
    pub global_last_sequence: u64,
    pub global_last_hash: String,
    pub updated_at: DateTime<Utc>,
    pub backpressure_hits: u64,
    pub backpressure_last_at: Option<DateTime<Utc>>,
}

impl SequenceState {
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            value: 0,
            global_last_sequence: 0,
            global_last_hash: String::new(),
            updated_at: now,
            backpressure_hits: 0,
            backpressure_last_at: None,
        }
    }
}

// ── Caller context ────────────────────────────────────────────────────────────

/// The authenticated caller as handed to the core by the outer platform.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub trace_id: String,
    pub node_id: Option<String>,
    pub permissions: HashSet<String>,
}

impl CallerContext {
    pub fn has_permission(&self, perm: &str) -> bool {
        self.permissions.contains(perm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_status_backlog_membership() {
        assert!(IntentStatus::Pending.is_backlog());
        assert!(IntentStatus::Processing.is_backlog());
        assert!(IntentStatus::ReadyForGlobalCommit.is_backlog());
        assert!(IntentStatus::FailedRetriable.is_backlog());
        assert!(!IntentStatus::Committed.is_backlog());
        assert!(!IntentStatus::FailedTerminal.is_backlog());
    }

    #[test]
    fn audit_level_serializes_screaming() {
        assert_eq!(serde_json::to_string(&AuditLevel::Warn).unwrap(), "\"WARN\"");
        assert_eq!(AuditLevel::Fatal.to_string(), "FATAL");
    }

    #[test]
    fn log_record_uses_wire_field_names() {
        let rec = AuditLogRecord {
            event_id: Uuid::new_v4(),
            chain_version: CHAIN_VERSION,
            event: AuditEvent {
                ts: 1,
                level: AuditLevel::Info,
                node_id: "n".into(),
                source: "s".into(),
                trace_id: "t".into(),
                content: "c".into(),
                meta: BTreeMap::new(),
            },
            partition_id: 0,
            partition_sequence: 1,
            partition_previous_hash: String::new(),
            partition_hash: "p".into(),
            sequence: 1,
            previous_hash: String::new(),
            hash: "h".into(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["_sequence"], 1);
        assert_eq!(v["_previous_hash"], "");
        assert_eq!(v["_hash"], "h");
        // Flattened event fields live at the top level.
        assert_eq!(v["node_id"], "n");
    }
}
