use corral_domain::ErrorKind;
use corral_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' already has an isolate")]
    AlreadyExists(String),

    #[error("plugin '{0}' has no isolate")]
    NotFound(String),

    #[error("failed to spawn worker for '{plugin_id}': {message}")]
    SpawnFailed { plugin_id: String, message: String },

    #[error("restart budget exhausted for '{0}'")]
    RestartBudgetExhausted(String),

    #[error("worker for '{0}' is gone")]
    WorkerGone(String),

    #[error("call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown context method '{0}'")]
    UnknownContextMethod(String),

    #[error("config of {size} bytes exceeds the {quota} byte quota")]
    QuotaExceeded { size: u64, quota: u64 },

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal plugin error: {0}")]
    Internal(String),
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::Timeout { .. } => ErrorKind::Timeout,
            PluginError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            PluginError::NotFound(_) | PluginError::WorkerGone(_) => ErrorKind::ServiceUnavailable,
            PluginError::UnknownContextMethod(_) => ErrorKind::MethodNotFound,
            _ => ErrorKind::PluginContextError,
        }
    }
}
