use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error kinds visible at component boundaries.
///
/// Chain-contention kinds (`AuditGlobalTailConflict`, `AuditPartitionTailConflict`,
/// `AuditLogWriteIncomplete`, `AuditLogWriteMismatch`) are internal retry
/// signals and are never surfaced to callers; everything else maps onto an
/// HTTP status or an M-Service response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuditBackpressure,
    AuditIntegrityCheckFailed,
    AuditLogWriteIncomplete,
    AuditLogWriteMismatch,
    AuditGlobalTailConflict,
    AuditPartitionTailConflict,
    TransactionAborted,
    WireContractVersionMismatch,
    HardwareProfileHashMismatch,
    NetworkLeaseConflict,
    InvalidCallDepth,
    ServiceUnavailable,
    AccessDenied,
    Timeout,
    MethodNotFound,
    PermissionDenied,
    PluginContextError,
    InternalError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::AuditBackpressure => "AUDIT_BACKPRESSURE",
            ErrorKind::AuditIntegrityCheckFailed => "AUDIT_INTEGRITY_CHECK_FAILED",
            ErrorKind::AuditLogWriteIncomplete => "AUDIT_LOG_WRITE_INCOMPLETE",
            ErrorKind::AuditLogWriteMismatch => "AUDIT_LOG_WRITE_MISMATCH",
            ErrorKind::AuditGlobalTailConflict => "AUDIT_GLOBAL_TAIL_CONFLICT",
            ErrorKind::AuditPartitionTailConflict => "AUDIT_PARTITION_TAIL_CONFLICT",
            ErrorKind::TransactionAborted => "TRANSACTION_ABORTED",
            ErrorKind::WireContractVersionMismatch => "WIRE_CONTRACT_VERSION_MISMATCH",
            ErrorKind::HardwareProfileHashMismatch => "HARDWARE_PROFILE_HASH_MISMATCH",
            ErrorKind::NetworkLeaseConflict => "NETWORK_LEASE_CONFLICT",
            ErrorKind::InvalidCallDepth => "INVALID_CALL_DEPTH",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::AccessDenied => "ACCESS_DENIED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::PluginContextError => "PLUGIN_CONTEXT_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for kinds that reach an HTTP caller.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::WireContractVersionMismatch
            | ErrorKind::HardwareProfileHashMismatch
            | ErrorKind::InvalidCallDepth => 400,
            ErrorKind::AccessDenied | ErrorKind::PermissionDenied => 403,
            ErrorKind::MethodNotFound => 404,
            ErrorKind::NetworkLeaseConflict | ErrorKind::TransactionAborted => 409,
            ErrorKind::AuditBackpressure | ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Timeout => 504,
            _ => 500,
        }
    }

    /// Retry hint attached to contention and backpressure responses.
    pub fn retry_after_seconds(&self) -> Option<u32> {
        match self {
            ErrorKind::AuditBackpressure | ErrorKind::TransactionAborted => Some(1),
            _ => None,
        }
    }

    /// Chain-contention kinds are caught inside the pipeline and converted to
    /// retry-without-penalty decisions.
    pub fn is_chain_conflict(&self) -> bool {
        matches!(
            self,
            ErrorKind::AuditGlobalTailConflict
                | ErrorKind::AuditPartitionTailConflict
                | ErrorKind::AuditLogWriteIncomplete
                | ErrorKind::AuditLogWriteMismatch
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid hwid: expected 64 hex characters")]
    InvalidHwid,

    #[error("invalid hostname: must be 1..=255 characters")]
    InvalidHostname,
}
