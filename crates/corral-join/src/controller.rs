use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use corral_audit::{AuditPipeline, EnqueueOptions};
use corral_chain as chain;
use corral_domain::{
    generate_node_id, is_hex64, valid_hostname, AuditEvent, AuditLevel, CallerContext,
    ConnectionStatus, DomainError, HardwareDrift, NodeDoc, NodeNetwork, NodeStatus,
    ReclaimStatus,
};
use corral_store::{DocumentStore, StoreOps};
use tracing::{info, warn};

use crate::error::JoinError;
use crate::request::{JoinOutcome, JoinRequest, JoinStatus};

#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Org assigned to nodes that do not name one.
    pub default_org_id: String,
    /// Control-plane address advertised back to joining nodes.
    pub core_ip: String,
    pub wire_contract_version: String,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            default_org_id: "org-default".to_string(),
            core_ip: "10.90.0.1".to_string(),
            wire_contract_version: "1".to_string(),
        }
    }
}

/// What the decision table resolved for one join.
struct Decision {
    node: NodeDoc,
    write: bool,
    created: bool,
    status: JoinStatus,
    level: AuditLevel,
    content: &'static str,
}

/// Zero-touch node-join: HWID affinity recovery, profile-drift detection,
/// lease-reclaim conflict handling, and transactional co-commit of the node
/// write with its audit intent.
pub struct JoinController {
    store: Arc<dyn DocumentStore>,
    pipeline: Arc<AuditPipeline>,
    cfg: JoinConfig,
}

impl JoinController {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        pipeline: Arc<AuditPipeline>,
        cfg: JoinConfig,
    ) -> Self {
        Self { store, pipeline, cfg }
    }

    pub async fn handle_join(
        &self,
        req: JoinRequest,
        ctx: &CallerContext,
        wire_version: Option<&str>,
    ) -> Result<JoinOutcome, JoinError> {
        if let Some(version) = wire_version {
            if version != self.cfg.wire_contract_version {
                return Err(JoinError::WireContractMismatch {
                    expected: self.cfg.wire_contract_version.clone(),
                    got: version.to_string(),
                });
            }
        }
        if !is_hex64(&req.hwid) {
            return Err(DomainError::InvalidHwid.into());
        }
        if !valid_hostname(&req.hostname) {
            return Err(DomainError::InvalidHostname.into());
        }

        let incoming_hash = resolve_profile_hash(&req)?;
        let now = Utc::now();
        let existing = self.store.node_by_hwid(&req.hwid).await?;
        let decision = self.decide(req, existing, incoming_hash, now)?;

        let mut meta = BTreeMap::new();
        meta.insert("hwid".to_string(), serde_json::json!(decision.node.hwid));
        meta.insert("hostname".to_string(), serde_json::json!(decision.node.hostname));
        meta.insert("persona".to_string(), serde_json::json!(decision.node.persona));
        meta.insert("status".to_string(), serde_json::json!(decision.status.to_string()));
        let event = AuditEvent {
            ts: now.timestamp_millis(),
            level: decision.level,
            node_id: decision.node.node_id.clone(),
            source: "join".to_string(),
            trace_id: ctx.trace_id.clone(),
            content: decision.content.to_string(),
            meta,
        };

        if self.pipeline.is_ready() {
            self.co_commit(&decision, &event).await?;
        } else {
            // Pipeline down: persist the node first, then fire-and-forget
            // the fallback audit write.
            if decision.write {
                if decision.created {
                    self.store.insert_node(&decision.node).await?;
                } else {
                    self.store.update_node(&decision.node).await?;
                }
            }
            let pipeline = Arc::clone(&self.pipeline);
            let fallback_event = event.clone();
            tokio::spawn(async move {
                let opts = EnqueueOptions { route_tag: "join", ..Default::default() };
                if let Err(error) = pipeline.record_audit_event(&fallback_event, opts).await {
                    warn!(%error, "fallback audit write for join failed");
                }
            });
        }

        match decision.status {
            JoinStatus::PendingApproval => warn!(
                node_id = %decision.node.node_id,
                hwid = %decision.node.hwid,
                "node join blocked by hardware profile drift"
            ),
            _ => info!(
                node_id = %decision.node.node_id,
                status = %decision.status,
                "node joined"
            ),
        }

        Ok(JoinOutcome {
            node_id: decision.node.node_id.clone(),
            core_ip: self.cfg.core_ip.clone(),
            status: decision.status,
        })
    }

    /// Node write and audit intent in one store transaction.
    async fn co_commit(&self, decision: &Decision, event: &AuditEvent) -> Result<(), JoinError> {
        let session = self.store.begin().await?;

        if decision.write {
            let write = if decision.created {
                session.insert_node(&decision.node).await
            } else {
                session.update_node(&decision.node).await
            };
            if let Err(e) = write {
                let _ = session.abort().await;
                return Err(e.into());
            }
        }

        let opts = EnqueueOptions {
            route_tag: "join",
            session: Some(session.as_ops()),
            ..Default::default()
        };
        let enqueued = self.pipeline.enqueue(event, opts).await;
        let admission = match enqueued {
            Ok(a) => a,
            Err(e) => {
                let _ = session.abort().await;
                return Err(e.into());
            }
        };
        if !admission.accepted {
            let _ = session.abort().await;
            return Err(match admission.reason {
                Some("backpressure") => JoinError::Backpressure {
                    retry_after_seconds: admission.retry_after_seconds.unwrap_or(1),
                },
                _ => JoinError::Audit(corral_audit::AuditError::Unavailable),
            });
        }

        session.commit().await?;
        Ok(())
    }

    fn decide(
        &self,
        req: JoinRequest,
        existing: Option<NodeDoc>,
        incoming_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Decision, JoinError> {
        let Some(node) = existing else {
            let node = NodeDoc {
                node_id: generate_node_id(now),
                org_id: req.org_id.unwrap_or_else(|| self.cfg.default_org_id.clone()),
                hwid: req.hwid.clone(),
                hostname: req.hostname,
                persona: req.persona,
                hardware_profile: req.hardware_profile,
                hardware_profile_hash: incoming_hash,
                hardware_profile_drift: None,
                network: NodeNetwork {
                    virtual_ip: derive_virtual_ip(&req.hwid),
                    mode: "overlay".to_string(),
                    v: 1,
                    ip_shadow_lease: None,
                },
                status: NodeStatus {
                    online: true,
                    connection_status: ConnectionStatus::Online,
                    last_seen: Some(now),
                },
                created_at: now,
            };
            return Ok(Decision {
                node,
                write: true,
                created: true,
                status: JoinStatus::New,
                level: AuditLevel::Info,
                content: "Node joined",
            });
        };

        // A reclaimed address lease fences the join behind its generation.
        if let Some(lease) = &node.network.ip_shadow_lease {
            if lease.reclaim_status == ReclaimStatus::Reclaimed
                && req.network_lease_generation != Some(lease.reclaim_generation)
            {
                return Err(JoinError::LeaseConflict {
                    expected_generation: lease.reclaim_generation,
                });
            }
        }

        // Drift: a frozen baseline cannot come back online under a new hash.
        if let (Some(baseline), Some(incoming)) = (&node.hardware_profile_hash, &incoming_hash) {
            if baseline != incoming {
                let mut frozen = node.clone();
                frozen.hardware_profile_drift = Some(HardwareDrift {
                    detected: true,
                    baseline_hash: baseline.clone(),
                    incoming_hash: incoming.clone(),
                    detected_at: Some(now),
                });
                frozen.status.online = false;
                frozen.status.connection_status = ConnectionStatus::PendingApproval;
                return Ok(Decision {
                    node: frozen,
                    write: true,
                    created: false,
                    status: JoinStatus::PendingApproval,
                    level: AuditLevel::Warn,
                    content: "Node join blocked by hardware profile drift",
                });
            }
        }

        // Elision: a node re-presenting an identical identity while online
        // needs no write, only the audit trail.
        let identity_matches = node.hostname == req.hostname
            && node.persona == req.persona
            && req.org_id.as_deref().map_or(true, |org| org == node.org_id);
        let no_drift = node
            .hardware_profile_drift
            .as_ref()
            .map_or(true, |d| !d.detected);
        if identity_matches
            && no_drift
            && node.status.connection_status == ConnectionStatus::Online
            && incoming_hash == node.hardware_profile_hash
        {
            return Ok(Decision {
                node,
                write: false,
                created: false,
                status: JoinStatus::Existing,
                level: AuditLevel::Info,
                content: "Node joined",
            });
        }

        // Refresh: recover affinity and bring the node online.
        let mut updated = node;
        updated.hostname = req.hostname;
        updated.persona = req.persona;
        if let Some(org) = req.org_id {
            updated.org_id = org;
        }
        if let Some(profile) = req.hardware_profile {
            updated.hardware_profile = Some(profile);
        }
        let baseline = incoming_hash.clone().or(updated.hardware_profile_hash.clone());
        updated.hardware_profile_hash = baseline.clone();
        updated.hardware_profile_drift = Some(HardwareDrift {
            detected: false,
            baseline_hash: baseline.unwrap_or_default(),
            incoming_hash: incoming_hash.unwrap_or_default(),
            detected_at: None,
        });
        updated.status.online = true;
        updated.status.connection_status = ConnectionStatus::Online;
        updated.status.last_seen = Some(now);

        Ok(Decision {
            node: updated,
            write: true,
            created: false,
            status: JoinStatus::Existing,
            level: AuditLevel::Info,
            content: "Node joined",
        })
    }
}

/// A supplied profile must hash to the supplied hash; the computed hash
/// wins as the incoming baseline. Without a profile, a well-formed supplied
/// hash is taken on trust and a malformed one is dropped.
fn resolve_profile_hash(req: &JoinRequest) -> Result<Option<String>, JoinError> {
    match &req.hardware_profile {
        None => Ok(req
            .hardware_profile_hash
            .as_deref()
            .filter(|h| is_hex64(h))
            .map(str::to_lowercase)),
        Some(profile) => {
            let computed = chain::profile_hash(profile);
            if let Some(provided) = &req.hardware_profile_hash {
                if !is_hex64(provided) || provided.to_lowercase() != computed {
                    return Err(JoinError::ProfileHashMismatch);
                }
            }
            Ok(Some(computed))
        }
    }
}

/// Deterministic overlay address derived from the hardware fingerprint.
fn derive_virtual_ip(hwid: &str) -> String {
    let digest = chain::sha256_hex(hwid.as_bytes());
    let a = u8::from_str_radix(&digest[0..2], 16).unwrap_or(0);
    let b = u8::from_str_radix(&digest[2..4], 16).unwrap_or(0);
    format!("100.64.{}.{}", a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_hash_resolution_rejects_mismatch() {
        let req = JoinRequest {
            hwid: "a".repeat(64),
            hostname: "h".into(),
            persona: corral_domain::Persona::Agent,
            hardware_profile: Some(serde_json::json!({"cpu": "x"})),
            hardware_profile_hash: Some("b".repeat(64)),
            org_id: None,
            network_lease_generation: None,
        };
        assert!(matches!(
            resolve_profile_hash(&req),
            Err(JoinError::ProfileHashMismatch)
        ));
    }

    #[test]
    fn profile_hash_resolution_accepts_matching_hash() {
        let profile = serde_json::json!({"cpu": "x", "ram_mb": 4096});
        let computed = chain::profile_hash(&profile);
        let req = JoinRequest {
            hwid: "a".repeat(64),
            hostname: "h".into(),
            persona: corral_domain::Persona::Agent,
            hardware_profile: Some(profile),
            hardware_profile_hash: Some(computed.to_uppercase()),
            org_id: None,
            network_lease_generation: None,
        };
        assert_eq!(resolve_profile_hash(&req).unwrap(), Some(computed));
    }

    #[test]
    fn bare_malformed_hash_is_dropped() {
        let req = JoinRequest {
            hwid: "a".repeat(64),
            hostname: "h".into(),
            persona: corral_domain::Persona::Gig,
            hardware_profile: None,
            hardware_profile_hash: Some("not-hex".into()),
            org_id: None,
            network_lease_generation: None,
        };
        assert_eq!(resolve_profile_hash(&req).unwrap(), None);
    }

    #[test]
    fn virtual_ip_is_stable() {
        let hwid = "c".repeat(64);
        assert_eq!(derive_virtual_ip(&hwid), derive_virtual_ip(&hwid));
        assert!(derive_virtual_ip(&hwid).starts_with("100.64."));
    }
}
