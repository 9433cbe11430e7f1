use corral_domain::Persona;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node-join request as presented by a client machine.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    /// 64-hex hardware fingerprint.
    pub hwid: String,
    pub hostname: String,
    pub persona: Persona,
    pub hardware_profile: Option<Value>,
    pub hardware_profile_hash: Option<String>,
    pub org_id: Option<String>,
    pub network_lease_generation: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    New,
    Existing,
    PendingApproval,
}

impl std::fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinStatus::New => write!(f, "new"),
            JoinStatus::Existing => write!(f, "existing"),
            JoinStatus::PendingApproval => write!(f, "pending_approval"),
        }
    }
}

/// What a successful join returns to the client.
#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub node_id: String,
    pub core_ip: String,
    pub status: JoinStatus,
}
