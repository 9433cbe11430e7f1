use corral_domain::ErrorKind;
use corral_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    /// Admission denial. Carries the retry hint surfaced to callers.
    #[error("audit backpressure, retry after {retry_after_seconds}s")]
    Backpressure { retry_after_seconds: u32 },

    /// Recomputed digest or HMAC disagreed with the stored intent. Terminal
    /// on first detection, never retried.
    #[error("audit integrity check failed for intent {event_id}")]
    IntegrityCheckFailed { event_id: Uuid },

    /// Chain contention or a write-verification failure inside a commit.
    /// Caught by the drain worker and converted to retry-without-penalty.
    #[error("{kind}: {message}")]
    Chain { kind: ErrorKind, message: String },

    #[error("audit pipeline unavailable")]
    Unavailable,

    /// The synchronous fallback gave up waiting for the predecessor log.
    #[error("predecessor log at sequence {0} not visible within deadline")]
    PredecessorTimeout(u64),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AuditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuditError::Backpressure { .. } => ErrorKind::AuditBackpressure,
            AuditError::IntegrityCheckFailed { .. } => ErrorKind::AuditIntegrityCheckFailed,
            AuditError::Chain { kind, .. } => *kind,
            AuditError::Unavailable => ErrorKind::ServiceUnavailable,
            AuditError::PredecessorTimeout(_) => ErrorKind::InternalError,
            AuditError::Store(StoreError::TransactionAborted) => ErrorKind::TransactionAborted,
            AuditError::Store(_) => ErrorKind::InternalError,
        }
    }

    /// Contention kinds that reset intents to `pending` without an attempt
    /// penalty. `TransactionAborted` is included: an optimistic-store abort
    /// is contention, not a worker failure.
    pub fn is_contention(&self) -> bool {
        match self {
            AuditError::Chain { kind, .. } => kind.is_chain_conflict(),
            AuditError::Store(StoreError::TransactionAborted) => true,
            _ => false,
        }
    }
}
