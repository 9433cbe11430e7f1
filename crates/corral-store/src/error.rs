use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique-index violation. The pipeline tolerates these on
    /// `audit_intents.event_id` and (batch path) `audit_logs.event_id`;
    /// everywhere else they propagate.
    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey { collection: &'static str, key: String },

    /// An optimistic transaction observed a concurrent write at commit.
    #[error("transaction aborted by concurrent write")]
    TransactionAborted,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }

    pub fn is_transaction_aborted(&self) -> bool {
        matches!(self, StoreError::TransactionAborted)
    }
}
