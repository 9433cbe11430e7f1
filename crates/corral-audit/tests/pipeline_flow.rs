use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use corral_audit::{AuditPipeline, EnqueueOptions, PipelineConfig};
use corral_chain as chain;
use corral_domain::{
    AuditEvent, AuditIntent, AuditLevel, AuditLogRecord, IntentStatus, PartitionTail,
    CHAIN_VERSION,
};
use corral_store::{DocumentStore, MemoryStore, StoreOps};
use uuid::Uuid;

fn event(i: usize) -> AuditEvent {
    let mut meta = BTreeMap::new();
    meta.insert("seq_hint".to_string(), serde_json::json!(i));
    AuditEvent {
        ts: 1_700_000_000_000 + i as i64,
        level: AuditLevel::Info,
        node_id: format!("node-{}", i % 7),
        source: "test".to_string(),
        trace_id: format!("trace-{}", i),
        content: format!("event {}", i),
        meta,
    }
}

async fn pipeline(store: Arc<dyn DocumentStore>) -> Arc<AuditPipeline> {
    let p = AuditPipeline::new(store, PipelineConfig::manual());
    p.start().await.expect("pipeline start");
    p
}

#[tokio::test]
async fn two_events_chain_in_order() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;

    for i in 0..2 {
        let adm = p
            .enqueue(&event(i), EnqueueOptions { route_tag: "t", ..Default::default() })
            .await
            .unwrap();
        assert!(adm.accepted);
    }
    p.drain_until_idle(10).await.unwrap();

    let logs = store.list_logs(1, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].sequence, 1);
    assert_eq!(logs[0].previous_hash, "");
    assert_eq!(logs[1].sequence, 2);
    assert_eq!(logs[1].previous_hash, logs[0].hash);
}

#[tokio::test]
async fn hundred_concurrent_enqueues_drain_without_gaps() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;

    let mut joins = Vec::new();
    for i in 0..100 {
        let p = Arc::clone(&p);
        joins.push(tokio::spawn(async move {
            let ev = event(i);
            p.enqueue(&ev, EnqueueOptions { route_tag: "load", ..Default::default() })
                .await
                .unwrap()
        }));
    }
    for j in joins {
        assert!(j.await.unwrap().accepted);
    }

    p.drain_until_idle(50).await.unwrap();

    let logs = store.list_logs(1, 200).await.unwrap();
    assert_eq!(logs.len(), 100);
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(log.sequence, i as u64 + 1);
    }

    let report = p.verify_chain(200).await.unwrap();
    assert!(report.valid, "chain invalid: {:?}", report.error);
    assert_eq!(report.checked, 100);
}

#[tokio::test]
async fn committed_intent_carries_its_global_sequence() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;

    let id = Uuid::new_v4();
    p.enqueue(
        &event(1),
        EnqueueOptions { route_tag: "t", event_id: Some(id), ..Default::default() },
    )
    .await
    .unwrap();
    p.drain_until_idle(10).await.unwrap();

    let intent = store.get_intent(id).await.unwrap().expect("intent");
    assert_eq!(intent.status, IntentStatus::Committed);
    let log = store
        .logs_by_event_ids(&[id])
        .await
        .unwrap()
        .pop()
        .expect("log");
    assert_eq!(intent.global_sequence, Some(log.sequence));
    assert!(intent.committed_at.is_some());
    assert!(intent.error_last.is_none());
}

#[tokio::test]
async fn duplicate_enqueue_is_idempotent() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;

    let id = Uuid::new_v4();
    for _ in 0..2 {
        let adm = p
            .enqueue(
                &event(1),
                EnqueueOptions { route_tag: "t", event_id: Some(id), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(adm.accepted);
    }
    p.drain_until_idle(10).await.unwrap();

    assert_eq!(store.list_logs(1, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn backpressure_refuses_until_drain_reduces_backlog() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let cfg = PipelineConfig {
        backlog_hard_limit: 2,
        enable_background_loops: false,
        ..PipelineConfig::default()
    };
    let p = AuditPipeline::new(Arc::clone(&store), cfg);
    p.start().await.unwrap();

    for i in 0..2 {
        let adm = p
            .enqueue(&event(i), EnqueueOptions { route_tag: "t", ..Default::default() })
            .await
            .unwrap();
        assert!(adm.accepted);
    }

    let refused = p
        .enqueue(&event(2), EnqueueOptions { route_tag: "t", ..Default::default() })
        .await
        .unwrap();
    assert!(!refused.accepted);
    assert_eq!(refused.reason, Some("backpressure"));
    assert_eq!(refused.retry_after_seconds, Some(1));

    p.drain_until_idle(10).await.unwrap();

    let adm = p
        .enqueue(&event(2), EnqueueOptions { route_tag: "t", ..Default::default() })
        .await
        .unwrap();
    assert!(adm.accepted);
}

#[tokio::test]
async fn tampered_intent_goes_terminal_with_failure_record() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;

    // An intent whose seal does not match its payload.
    let ev = event(9);
    let now = Utc::now();
    let forged = AuditIntent {
        event_id: Uuid::new_v4(),
        route_tag: "t".into(),
        partition_id: chain::partition_of(&ev, 16),
        status: IntentStatus::Pending,
        lease_owner: None,
        lease_until: None,
        attempt_count: 0,
        created_at: now,
        updated_at: now,
        payload: ev,
        payload_digest: "0".repeat(64),
        payload_hmac: "0".repeat(64),
        hmac_key_id: "k0".into(),
        global_sequence: None,
        committed_at: None,
        error_last: None,
    };
    store.insert_intent(&forged).await.unwrap();

    let report = p.drain_once().await.unwrap();
    assert_eq!(report.failed_terminal, 1);
    assert_eq!(report.committed, 0);

    let intent = store.get_intent(forged.event_id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::FailedTerminal);
    let failure = store
        .failure_by_event_id(forged.event_id)
        .await
        .unwrap()
        .expect("failure record");
    assert_eq!(failure.code, "AUDIT_INTEGRITY_CHECK_FAILED");
    assert!(store.list_logs(1, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn partition_tail_conflict_releases_claims_without_penalty() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;

    let ev = event(3);
    let partition_id = chain::partition_of(&ev, 16);
    let id = Uuid::new_v4();
    p.enqueue(
        &ev,
        EnqueueOptions { route_tag: "t", event_id: Some(id), ..Default::default() },
    )
    .await
    .unwrap();

    // Another worker advances this partition behind our back.
    let foreign = PartitionTail {
        partition_id,
        last_sequence: 1,
        last_hash: "f".repeat(64),
        updated_at: Utc::now(),
    };
    assert!(store.cas_partition_tail(0, "", &foreign).await.unwrap());

    let report = p.drain_once().await.unwrap();
    assert!(report.conflicted);
    assert_eq!(report.committed, 0);

    // Contention is not a failure: back to pending, no attempt penalty.
    let intent = store.get_intent(id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Pending);
    assert_eq!(intent.attempt_count, 0);

    // After tail recovery the next cycle commits on top of the foreign tail.
    let report = p.drain_once().await.unwrap();
    assert_eq!(report.committed, 1);
    let intent = store.get_intent(id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Committed);
    let log = store.logs_by_event_ids(&[id]).await.unwrap().pop().unwrap();
    assert_eq!(log.partition_sequence, 2);
    assert_eq!(log.partition_previous_hash, "f".repeat(64));
}

#[tokio::test]
async fn expired_lease_is_reclaimed() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let cfg = PipelineConfig { lease_duration_ms: 0, ..PipelineConfig::manual() };
    let p = AuditPipeline::new(Arc::clone(&store), cfg);
    p.start().await.unwrap();

    let id = Uuid::new_v4();
    p.enqueue(
        &event(4),
        EnqueueOptions { route_tag: "t", event_id: Some(id), ..Default::default() },
    )
    .await
    .unwrap();

    // Simulate a dead worker holding an expired lease.
    let claimed = store
        .try_claim(
            id,
            &corral_store::ClaimGuard::fresh(IntentStatus::Pending),
            "dead-worker",
            Utc::now() - chrono::Duration::seconds(5),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(claimed);

    let report = p.drain_once().await.unwrap();
    assert_eq!(report.committed, 1);
}

#[tokio::test]
async fn sync_fallback_commits_when_pipeline_down() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = AuditPipeline::new(Arc::clone(&store), PipelineConfig::manual());
    // Never started: not READY.

    let first = p
        .record_audit_event(&event(0), EnqueueOptions { route_tag: "t", ..Default::default() })
        .await
        .unwrap()
        .expect("fallback returns the committed log");
    assert_eq!(first.sequence, 1);
    assert_eq!(first.previous_hash, "");

    let second = p
        .record_audit_event(&event(1), EnqueueOptions { route_tag: "t", ..Default::default() })
        .await
        .unwrap()
        .expect("fallback returns the committed log");
    assert_eq!(second.sequence, 2);
    assert_eq!(second.previous_hash, first.hash);
}

#[tokio::test]
async fn fallback_waits_for_delayed_predecessor() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = AuditPipeline::new(Arc::clone(&store), PipelineConfig::manual());

    // Claim sequence 1 but delay its insert by 380 ms.
    let now = Utc::now();
    let seq1 = store.alloc_sequence(now).await.unwrap();
    assert_eq!(seq1, 1);

    let slow_store = Arc::clone(&store);
    let writer = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(380)).await;
        let ev = event(0);
        let hash = chain::log_hash(&ev, 1, "");
        let log = AuditLogRecord {
            event_id: Uuid::new_v4(),
            chain_version: CHAIN_VERSION,
            event: ev.clone(),
            partition_id: chain::partition_of(&ev, 16),
            partition_sequence: 1,
            partition_previous_hash: String::new(),
            partition_hash: chain::partition_hash(&ev, 1, ""),
            sequence: 1,
            previous_hash: String::new(),
            hash: hash.clone(),
        };
        slow_store.insert_log(&log).await.unwrap();
        hash
    });

    // Concurrent fallback write gets sequence 2 and must wait for #1.
    let log2 = p.record_sync(&event(1)).await.unwrap();
    let hash1 = writer.await.unwrap();

    assert_eq!(log2.sequence, 2);
    assert_eq!(log2.previous_hash, hash1);
}

#[tokio::test]
async fn anchors_chain_over_partition_heads() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;

    // Nothing committed yet: nothing to checkpoint.
    assert!(!p.anchor_once().await.unwrap());

    for i in 0..5 {
        p.enqueue(&event(i), EnqueueOptions { route_tag: "t", ..Default::default() })
            .await
            .unwrap();
    }
    p.drain_until_idle(10).await.unwrap();

    assert!(p.anchor_once().await.unwrap());
    let first = store.latest_anchor().await.unwrap().unwrap();
    assert_eq!(first.previous_anchor_hash, "");
    assert!(!first.partition_heads.is_empty());
    let heads_sorted = first
        .partition_heads
        .windows(2)
        .all(|w| w[0].partition_id < w[1].partition_id);
    assert!(heads_sorted);

    assert!(p.anchor_once().await.unwrap());
    let second = store.latest_anchor().await.unwrap().unwrap();
    assert_eq!(second.previous_anchor_hash, first.anchor_hash);
    assert_eq!(
        second.anchor_hash,
        chain::anchor_hash(&second.partition_heads, &second.previous_anchor_hash)
    );
}

#[tokio::test]
async fn stop_resets_readiness() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store)).await;
    assert!(p.is_ready());

    p.stop().await;
    assert!(!p.is_ready());

    let adm = p
        .enqueue(&event(0), EnqueueOptions { route_tag: "t", ..Default::default() })
        .await
        .unwrap();
    assert!(!adm.accepted);
    assert_eq!(adm.reason, Some("pipeline_unavailable"));
}
