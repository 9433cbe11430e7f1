use corral_audit::AuditError;
use corral_domain::ErrorKind;
use corral_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("wire contract version mismatch: expected {expected}, got {got}")]
    WireContractMismatch { expected: String, got: String },

    #[error("invalid join request: {0}")]
    Invalid(#[from] corral_domain::DomainError),

    #[error("hardware profile hash mismatch")]
    ProfileHashMismatch,

    /// The node's previous address lease was reclaimed; the join must
    /// present the matching generation.
    #[error("network lease conflict: expected generation {expected_generation}")]
    LeaseConflict { expected_generation: u64 },

    #[error("audit backpressure, retry after {retry_after_seconds}s")]
    Backpressure { retry_after_seconds: u32 },

    #[error("join transaction aborted by contention")]
    TransactionAborted,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("audit error: {0}")]
    Audit(AuditError),
}

impl JoinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JoinError::WireContractMismatch { .. } => ErrorKind::WireContractVersionMismatch,
            JoinError::Invalid(_) => ErrorKind::InternalError,
            JoinError::ProfileHashMismatch => ErrorKind::HardwareProfileHashMismatch,
            JoinError::LeaseConflict { .. } => ErrorKind::NetworkLeaseConflict,
            JoinError::Backpressure { .. } => ErrorKind::AuditBackpressure,
            JoinError::TransactionAborted => ErrorKind::TransactionAborted,
            JoinError::Store(_) | JoinError::Audit(_) => ErrorKind::InternalError,
        }
    }
}

impl From<StoreError> for JoinError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TransactionAborted => JoinError::TransactionAborted,
            other => JoinError::Store(other),
        }
    }
}

impl From<AuditError> for JoinError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::Backpressure { retry_after_seconds } => {
                JoinError::Backpressure { retry_after_seconds }
            }
            other => JoinError::Audit(other),
        }
    }
}
