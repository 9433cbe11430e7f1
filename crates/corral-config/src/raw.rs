use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw YAML representation of the server config file (corral.yml).
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawConfig {
    #[serde(default)]
    pub server: RawServer,
    #[serde(default)]
    pub audit: RawAudit,
    #[serde(default)]
    pub join: RawJoin,
    #[serde(default)]
    pub plugins: RawPlugins,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawServer {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on every request. Absent means a token must be
    /// provided on the command line.
    pub auth_token: Option<String>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self { bind: default_bind(), port: default_port(), auth_token: None }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawAudit {
    pub partition_count: Option<u32>,
    pub batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub anchor_interval_ms: Option<u64>,
    pub backlog_soft_limit: Option<u64>,
    pub backlog_hard_limit: Option<u64>,
    pub lease_duration_ms: Option<u64>,
    pub max_retry_attempts: Option<u32>,
    pub hmac_secret: Option<String>,
    pub hmac_key_id: Option<String>,
    /// key id → retired secret, kept for verification after rotation.
    #[serde(default)]
    pub retired_hmac_secrets: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawJoin {
    pub default_org_id: Option<String>,
    pub core_ip: Option<String>,
    pub wire_contract_version: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawPlugins {
    pub max_restarts: Option<u32>,
    pub memory_threshold_mib: Option<u64>,
    pub vault_secret: Option<String>,
    pub vault_quota_mib: Option<u64>,
    pub reload_grace_ms: Option<u64>,
    /// Event subject → permission required to publish on it.
    #[serde(default)]
    pub publish_permissions: HashMap<String, String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}
