use std::sync::Arc;

use chrono::Utc;
use corral_audit::{AuditPipeline, PipelineConfig};
use corral_chain as chain;
use corral_domain::{
    AuditLevel, CallerContext, ConnectionStatus, NodeDoc, NodeNetwork, NodeStatus, Persona,
    ReclaimStatus, ShadowLease,
};
use corral_join::{JoinConfig, JoinController, JoinError, JoinRequest, JoinStatus};
use corral_store::{DocumentStore, MemoryStore, StoreOps};

fn request(hwid: &str) -> JoinRequest {
    JoinRequest {
        hwid: hwid.to_string(),
        hostname: "worker-01".to_string(),
        persona: Persona::Agent,
        hardware_profile: None,
        hardware_profile_hash: None,
        org_id: None,
        network_lease_generation: None,
    }
}

fn ctx() -> CallerContext {
    CallerContext {
        trace_id: "trace-join".to_string(),
        node_id: None,
        permissions: Default::default(),
    }
}

async fn harness() -> (Arc<dyn DocumentStore>, Arc<AuditPipeline>, JoinController) {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let pipeline = AuditPipeline::new(Arc::clone(&store), PipelineConfig::manual());
    pipeline.start().await.expect("pipeline start");
    let controller =
        JoinController::new(Arc::clone(&store), Arc::clone(&pipeline), JoinConfig::default());
    (store, pipeline, controller)
}

fn stored_node(hwid: &str, profile_hash: Option<String>) -> NodeDoc {
    NodeDoc {
        node_id: "node-existing-1".to_string(),
        org_id: "org-default".to_string(),
        hwid: hwid.to_string(),
        hostname: "worker-01".to_string(),
        persona: Persona::Agent,
        hardware_profile: None,
        hardware_profile_hash: profile_hash,
        hardware_profile_drift: None,
        network: NodeNetwork {
            virtual_ip: "100.64.0.1".to_string(),
            mode: "overlay".to_string(),
            v: 1,
            ip_shadow_lease: None,
        },
        status: NodeStatus {
            online: true,
            connection_status: ConnectionStatus::Online,
            last_seen: Some(Utc::now()),
        },
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn first_join_creates_node_and_audit_intent() {
    let (store, _pipeline, controller) = harness().await;
    let hwid = "n".repeat(64);

    let outcome = controller.handle_join(request(&hwid), &ctx(), None).await.unwrap();
    assert_eq!(outcome.status, JoinStatus::New);
    assert!(outcome.node_id.starts_with("node-"));

    let node = store.node_by_hwid(&hwid).await.unwrap().expect("node created");
    assert_eq!(node.node_id, outcome.node_id);
    assert!(node.status.online);

    let intents = store.claim_candidates(10).await.unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].payload.source, "join");
    assert_eq!(intents[0].payload.level, AuditLevel::Info);
    assert_eq!(intents[0].payload.content, "Node joined");
    assert_eq!(intents[0].route_tag, "join");
}

#[tokio::test]
async fn drift_freezes_node_with_warn_audit() {
    let (store, _pipeline, controller) = harness().await;
    let hwid = "d".repeat(64);
    let baseline = "0".repeat(64);
    store.insert_node(&stored_node(&hwid, Some(baseline.clone()))).await.unwrap();

    let mut req = request(&hwid);
    req.hardware_profile = Some(serde_json::json!({"cpu": "changed"}));
    let incoming = chain::profile_hash(req.hardware_profile.as_ref().unwrap());
    assert_ne!(incoming, baseline);

    let outcome = controller.handle_join(req, &ctx(), None).await.unwrap();
    assert_eq!(outcome.status, JoinStatus::PendingApproval);

    let node = store.node_by_hwid(&hwid).await.unwrap().unwrap();
    assert!(!node.status.online);
    assert_eq!(node.status.connection_status, ConnectionStatus::PendingApproval);
    let drift = node.hardware_profile_drift.expect("drift recorded");
    assert!(drift.detected);
    assert_eq!(drift.baseline_hash, baseline);
    assert_eq!(drift.incoming_hash, incoming);
    // The baseline itself is untouched by a blocked join.
    assert_eq!(node.hardware_profile_hash, Some(baseline));

    let intents = store.claim_candidates(10).await.unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].payload.level, AuditLevel::Warn);
    assert_eq!(intents[0].payload.content, "Node join blocked by hardware profile drift");
}

#[tokio::test]
async fn reclaimed_lease_requires_matching_generation() {
    let (store, _pipeline, controller) = harness().await;
    let hwid = "e".repeat(64);
    let mut node = stored_node(&hwid, None);
    node.network.ip_shadow_lease = Some(ShadowLease {
        reclaim_status: ReclaimStatus::Reclaimed,
        reclaim_generation: 7,
    });
    store.insert_node(&node).await.unwrap();

    // Stale generation.
    let mut stale = request(&hwid);
    stale.network_lease_generation = Some(6);
    let err = controller.handle_join(stale, &ctx(), None).await.unwrap_err();
    match err {
        JoinError::LeaseConflict { expected_generation } => assert_eq!(expected_generation, 7),
        other => panic!("expected lease conflict, got {other:?}"),
    }

    // Absent generation.
    let err = controller.handle_join(request(&hwid), &ctx(), None).await.unwrap_err();
    assert!(matches!(err, JoinError::LeaseConflict { expected_generation: 7 }));
    // A refused join leaves no audit intent behind.
    assert!(store.claim_candidates(10).await.unwrap().is_empty());

    // Matching generation proceeds.
    let mut ok = request(&hwid);
    ok.network_lease_generation = Some(7);
    let outcome = controller.handle_join(ok, &ctx(), None).await.unwrap();
    assert_eq!(outcome.status, JoinStatus::Existing);
}

#[tokio::test]
async fn identical_rejoin_is_elided_but_still_audited() {
    let (store, _pipeline, controller) = harness().await;
    let hwid = "f".repeat(64);

    controller.handle_join(request(&hwid), &ctx(), None).await.unwrap();
    let first = store.node_by_hwid(&hwid).await.unwrap().unwrap();

    let outcome = controller.handle_join(request(&hwid), &ctx(), None).await.unwrap();
    assert_eq!(outcome.status, JoinStatus::Existing);
    assert_eq!(outcome.node_id, first.node_id);

    // The elided join skipped the node write.
    let second = store.node_by_hwid(&hwid).await.unwrap().unwrap();
    assert_eq!(second.status.last_seen, first.status.last_seen);

    // But both joins are in the audit intake.
    assert_eq!(store.claim_candidates(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn offline_rejoin_refreshes_and_comes_online() {
    let (store, _pipeline, controller) = harness().await;
    let hwid = "a".repeat(64);
    let mut node = stored_node(&hwid, None);
    node.status.online = false;
    node.status.connection_status = ConnectionStatus::Offline;
    store.insert_node(&node).await.unwrap();

    let mut req = request(&hwid);
    req.hostname = "worker-renamed".to_string();
    let outcome = controller.handle_join(req, &ctx(), None).await.unwrap();
    assert_eq!(outcome.status, JoinStatus::Existing);

    let updated = store.node_by_hwid(&hwid).await.unwrap().unwrap();
    assert!(updated.status.online);
    assert_eq!(updated.status.connection_status, ConnectionStatus::Online);
    assert_eq!(updated.hostname, "worker-renamed");
}

#[tokio::test]
async fn provided_hash_must_match_computed() {
    let (_store, _pipeline, controller) = harness().await;
    let mut req = request(&"b".repeat(64));
    req.hardware_profile = Some(serde_json::json!({"disk": "ssd"}));
    req.hardware_profile_hash = Some("c".repeat(64));

    let err = controller.handle_join(req, &ctx(), None).await.unwrap_err();
    assert!(matches!(err, JoinError::ProfileHashMismatch));
}

#[tokio::test]
async fn wire_contract_version_is_enforced() {
    let (_store, _pipeline, controller) = harness().await;
    let err = controller
        .handle_join(request(&"b".repeat(64)), &ctx(), Some("99"))
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::WireContractMismatch { .. }));
}

#[tokio::test]
async fn backpressure_aborts_the_whole_join() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let cfg = PipelineConfig {
        backlog_hard_limit: 0,
        enable_background_loops: false,
        ..PipelineConfig::default()
    };
    let pipeline = AuditPipeline::new(Arc::clone(&store), cfg);
    pipeline.start().await.unwrap();
    let controller =
        JoinController::new(Arc::clone(&store), Arc::clone(&pipeline), JoinConfig::default());

    let hwid = "9".repeat(64);
    let err = controller.handle_join(request(&hwid), &ctx(), None).await.unwrap_err();
    assert!(matches!(err, JoinError::Backpressure { retry_after_seconds: 1 }));

    // The co-commit rolled back: no node, no intent.
    assert!(store.node_by_hwid(&hwid).await.unwrap().is_none());
    assert!(store.claim_candidates(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn join_works_with_pipeline_down_via_fallback() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let pipeline = AuditPipeline::new(Arc::clone(&store), PipelineConfig::manual());
    // Never started: join must persist the node and route the audit through
    // the synchronous fallback.
    let controller =
        JoinController::new(Arc::clone(&store), Arc::clone(&pipeline), JoinConfig::default());

    let hwid = "8".repeat(64);
    let outcome = controller.handle_join(request(&hwid), &ctx(), None).await.unwrap();
    assert_eq!(outcome.status, JoinStatus::New);
    assert!(store.node_by_hwid(&hwid).await.unwrap().is_some());

    // The fallback write is fire-and-forget; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let log = store.latest_log().await.unwrap().expect("fallback log committed");
    assert_eq!(log.event.source, "join");
    assert_eq!(log.sequence, 1);
}
