pub mod error;
pub mod node;
pub mod types;

pub use error::{DomainError, ErrorKind};
pub use node::{
    generate_node_id, is_hex64, valid_hostname, ConnectionStatus, HardwareDrift, NodeDoc,
    NodeNetwork, NodeStatus, Persona, ReclaimStatus, ShadowLease,
};
pub use types::{
    AuditEvent, AuditIntent, AuditLevel, AuditLogRecord, CallerContext, FailureRecord,
    GlobalAnchor, IntentStatus, PartitionHead, PartitionTail, SequenceState, CHAIN_VERSION,
};
