use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Enums ─────────────────────────────────────────────────────────────────────

/// The role a node plays in the fleet: resident AGENT or ephemeral GIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Persona {
    Agent,
    Gig,
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Persona::Agent => write!(f, "AGENT"),
            Persona::Gig => write!(f, "GIG"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
    PendingApproval,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Online => write!(f, "online"),
            ConnectionStatus::Offline => write!(f, "offline"),
            ConnectionStatus::PendingApproval => write!(f, "pending_approval"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReclaimStatus {
    Active,
    Reclaimed,
}

// ── Network ───────────────────────────────────────────────────────────────────

/// A bounded claim over a node's previous virtual IP while it is being
/// reclaimed. A join against a RECLAIMED lease must present the matching
/// `reclaim_generation` or be refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowLease {
    pub reclaim_status: ReclaimStatus,
    pub reclaim_generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeNetwork {
    pub virtual_ip: String,
    pub mode: String,
    pub v: u32,
    pub ip_shadow_lease: Option<ShadowLease>,
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub online: bool,
    pub connection_status: ConnectionStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Divergence between a node's baseline hardware-profile hash and the hash
/// presented at a later join. A detected drift freezes the node until it is
/// approved out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareDrift {
    pub detected: bool,
    pub baseline_hash: String,
    pub incoming_hash: String,
    pub detected_at: Option<DateTime<Utc>>,
}

// ── Node document ─────────────────────────────────────────────────────────────

/// One fleet member. Unique on `hwid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    pub node_id: String,
    pub org_id: String,
    /// 64-hex hardware fingerprint.
    pub hwid: String,
    pub hostname: String,
    pub persona: Persona,
    pub hardware_profile: Option<Value>,
    pub hardware_profile_hash: Option<String>,
    pub hardware_profile_drift: Option<HardwareDrift>,
    pub network: NodeNetwork,
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
}

// ── Identifier + validation helpers ───────────────────────────────────────────

/// Generate a node id in the `node-<timestamp36>-<rand>` format.
pub fn generate_node_id(now: DateTime<Utc>) -> String {
    let ts36 = to_base36(now.timestamp_millis().max(0) as u64);
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| {
                let idx = rng.gen_range(0..36u32);
                std::char::from_digit(idx, 36).unwrap_or('0')
            })
            .collect()
    };
    format!("node-{}-{}", ts36, suffix)
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        let d = (n % 36) as u32;
        out.push(std::char::from_digit(d, 36).unwrap_or('0'));
        n /= 36;
    }
    out.iter().rev().collect()
}

/// True when `s` is exactly 64 lowercase-insensitive hex characters.
pub fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hostnames are 1..=255 characters at intake.
pub fn valid_hostname(s: &str) -> bool {
    !s.is_empty() && s.len() <= 255
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_shape() {
        let id = generate_node_id(Utc::now());
        assert!(id.starts_with("node-"));
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn base36_round_numbers() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn hex64_validation() {
        assert!(is_hex64(&"a".repeat(64)));
        assert!(is_hex64(&"F".repeat(64)));
        assert!(!is_hex64(&"a".repeat(63)));
        assert!(!is_hex64(&"g".repeat(64)));
    }

    #[test]
    fn hostname_bounds() {
        assert!(!valid_hostname(""));
        assert!(valid_hostname("host-1"));
        assert!(valid_hostname(&"h".repeat(255)));
        assert!(!valid_hostname(&"h".repeat(256)));
    }

    #[test]
    fn persona_wire_names() {
        assert_eq!(serde_json::to_string(&Persona::Agent).unwrap(), "\"AGENT\"");
        assert_eq!(serde_json::to_string(&Persona::Gig).unwrap(), "\"GIG\"");
    }
}
