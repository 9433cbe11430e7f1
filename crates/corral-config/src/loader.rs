use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawConfig;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub partition_count: u32,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub anchor_interval_ms: u64,
    pub backlog_soft_limit: u64,
    pub backlog_hard_limit: u64,
    pub lease_duration_ms: u64,
    pub max_retry_attempts: u32,
    pub hmac_secret: String,
    pub hmac_key_id: String,
    pub retired_hmac_secrets: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct JoinSettings {
    pub default_org_id: String,
    pub core_ip: String,
    pub wire_contract_version: String,
}

#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub max_restarts: u32,
    pub memory_threshold_bytes: u64,
    pub vault_secret: String,
    pub vault_quota_bytes: u64,
    pub reload_grace_ms: u64,
    pub publish_permissions: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub server: ServerSettings,
    pub audit: AuditSettings,
    pub join: JoinSettings,
    pub plugins: PluginSettings,
}

/// Load `path`, or fall back to all defaults when `path` is absent.
pub fn load_config(path: Option<&Path>) -> Result<CoreConfig, ConfigError> {
    let raw = match path {
        Some(path) => {
            debug!("loading config from {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_yaml::from_str::<RawConfig>(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?
        }
        None => RawConfig::default(),
    };
    convert(raw, path)
}

fn convert(raw: RawConfig, path: Option<&Path>) -> Result<CoreConfig, ConfigError> {
    let path_str = path.map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".into());

    let audit = AuditSettings {
        partition_count: raw.audit.partition_count.unwrap_or(16),
        batch_size: raw.audit.batch_size.unwrap_or(32),
        flush_interval_ms: raw.audit.flush_interval_ms.unwrap_or(20),
        anchor_interval_ms: raw.audit.anchor_interval_ms.unwrap_or(1000),
        backlog_soft_limit: raw.audit.backlog_soft_limit.unwrap_or(3000),
        backlog_hard_limit: raw.audit.backlog_hard_limit.unwrap_or(8000),
        lease_duration_ms: raw.audit.lease_duration_ms.unwrap_or(10_000),
        max_retry_attempts: raw.audit.max_retry_attempts.unwrap_or(5),
        hmac_secret: raw.audit.hmac_secret.unwrap_or_else(|| "corral-dev-secret".to_string()),
        hmac_key_id: raw.audit.hmac_key_id.unwrap_or_else(|| "k0".to_string()),
        retired_hmac_secrets: raw.audit.retired_hmac_secrets,
    };
    if audit.partition_count == 0 {
        return Err(ConfigError::Invalid {
            path: path_str,
            message: "audit.partition_count must be at least 1".into(),
        });
    }
    if audit.batch_size == 0 {
        return Err(ConfigError::Invalid {
            path: path_str,
            message: "audit.batch_size must be at least 1".into(),
        });
    }
    if audit.hmac_secret.is_empty() {
        return Err(ConfigError::Invalid {
            path: path_str,
            message: "audit.hmac_secret must not be empty".into(),
        });
    }
    if audit.backlog_soft_limit > audit.backlog_hard_limit {
        return Err(ConfigError::Invalid {
            path: path_str,
            message: "audit.backlog_soft_limit exceeds audit.backlog_hard_limit".into(),
        });
    }

    Ok(CoreConfig {
        server: ServerSettings {
            bind: raw.server.bind,
            port: raw.server.port,
            auth_token: raw.server.auth_token,
        },
        audit,
        join: JoinSettings {
            default_org_id: raw.join.default_org_id.unwrap_or_else(|| "org-default".to_string()),
            core_ip: raw.join.core_ip.unwrap_or_else(|| "10.90.0.1".to_string()),
            wire_contract_version: raw
                .join
                .wire_contract_version
                .unwrap_or_else(|| "1".to_string()),
        },
        plugins: PluginSettings {
            max_restarts: raw.plugins.max_restarts.unwrap_or(3),
            memory_threshold_bytes: raw.plugins.memory_threshold_mib.unwrap_or(512) * 1024 * 1024,
            vault_secret: raw
                .plugins
                .vault_secret
                .unwrap_or_else(|| "corral-dev-vault".to_string()),
            vault_quota_bytes: raw.plugins.vault_quota_mib.unwrap_or(100) * 1024 * 1024,
            reload_grace_ms: raw.plugins.reload_grace_ms.unwrap_or(1000),
            publish_permissions: raw.plugins.publish_permissions,
        },
    })
}
