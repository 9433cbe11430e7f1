use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use corral_chain as chain;
use corral_domain::{
    AuditEvent, AuditIntent, AuditLogRecord, GlobalAnchor, IntentStatus, PartitionHead,
    PartitionTail, CHAIN_VERSION,
};
use corral_store::{DocumentStore, StoreError, StoreOps};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::AuditError;

/// Result of an intake admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub accepted: bool,
    pub reason: Option<&'static str>,
    pub retry_after_seconds: Option<u32>,
}

impl Admission {
    fn accepted() -> Self {
        Self { accepted: true, reason: None, retry_after_seconds: None }
    }

    fn unavailable() -> Self {
        Self { accepted: false, reason: Some("pipeline_unavailable"), retry_after_seconds: None }
    }

    fn backpressure() -> Self {
        Self { accepted: false, reason: Some("backpressure"), retry_after_seconds: Some(1) }
    }
}

/// Per-enqueue options. `session` routes the intent insert through an open
/// store transaction so it co-commits with the caller's business write.
#[derive(Default)]
pub struct EnqueueOptions<'a> {
    pub route_tag: &'a str,
    pub session: Option<&'a dyn StoreOps>,
    /// Caller-supplied id for idempotent re-enqueue; generated when absent.
    pub event_id: Option<Uuid>,
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub committed: usize,
    pub failed_terminal: usize,
    pub conflicted: bool,
    /// True when the cycle did not run (pipeline stopped, or another drain
    /// was already in flight).
    pub skipped: bool,
}

impl DrainReport {
    pub(crate) fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

/// Result of a chain verification walk.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainReport {
    pub checked: u64,
    pub valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    pub(crate) global_tail: (u64, String),
    pub(crate) partition_tails: HashMap<u32, (u64, String)>,
    pub(crate) backlog: u64,
}

/// The audit pipeline: queued intake, leased drain workers, CAS-guarded
/// commit into the global and partition chains, periodic anchors.
///
/// One pipeline per process. Multiple processes may drain the same store
/// concurrently; correctness rests on the per-intent claim CAS and the
/// commit-time tail CAS guards.
pub struct AuditPipeline {
    store: Arc<dyn DocumentStore>,
    cfg: PipelineConfig,
    /// Lease owner for claims made by this process.
    worker_id: String,
    ready: AtomicBool,
    /// Only one drain may be active per process.
    flushing: AtomicBool,
    pub(crate) state: Mutex<RuntimeState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AuditPipeline {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: PipelineConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            cfg,
            worker_id: format!("drain-{}", Uuid::new_v4()),
            ready: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            state: Mutex::new(RuntimeState::default()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub(crate) fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Recover chain tails and backlog from the store, start the background
    /// loops when enabled, and mark the pipeline READY.
    pub async fn start(self: &Arc<Self>) -> Result<(), AuditError> {
        let now = Utc::now();
        let latest = self.store.latest_log().await?;
        let (global_sequence, global_hash) = latest
            .map(|log| (log.sequence, log.hash))
            .unwrap_or((0, String::new()));
        // The allocation counter must never trail the committed tail.
        self.store
            .reconcile_sequence_state(global_sequence, &global_hash, now)
            .await?;

        let tails = self.store.load_partition_tails().await?;
        let backlog = self.store.count_backlog().await?;

        {
            let mut state = self.state.lock().await;
            state.global_tail = (global_sequence, global_hash);
            state.partition_tails = tails
                .into_iter()
                .map(|t| (t.partition_id, (t.last_sequence, t.last_hash)))
                .collect();
            state.backlog = backlog;
        }

        if self.cfg.enable_background_loops {
            self.spawn_loops().await;
        }

        self.ready.store(true, Ordering::Release);
        info!(global_sequence, backlog, partitions = self.cfg.partition_count, "audit pipeline ready");
        Ok(())
    }

    async fn spawn_loops(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let drain = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(drain.cfg.flush_interval_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(error) = drain.drain_once().await {
                    warn!(%error, "audit drain cycle failed");
                }
            }
        }));

        let anchor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(anchor.cfg.anchor_interval_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(error) = anchor.anchor_once().await {
                    warn!(%error, "anchor write failed");
                }
            }
        }));
    }

    /// Clear timers and in-memory state. In-flight intents stay in
    /// `processing`; their leases expire and the next process reclaims them.
    pub async fn stop(&self) {
        self.ready.store(false, Ordering::Release);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        let mut state = self.state.lock().await;
        *state = RuntimeState::default();
        info!("audit pipeline stopped");
    }

    // ── Intake ────────────────────────────────────────────────────────────────

    /// Admission-controlled intake. Computes the payload seal, assigns the
    /// partition, and inserts the intent (idempotent on `event_id`).
    pub async fn enqueue(
        &self,
        event: &AuditEvent,
        opts: EnqueueOptions<'_>,
    ) -> Result<Admission, AuditError> {
        if !self.is_ready() {
            return Ok(Admission::unavailable());
        }

        let now = Utc::now();
        let over_limit = {
            let state = self.state.lock().await;
            state.backlog >= self.cfg.backlog_hard_limit
        };
        if over_limit {
            // The counter can drift; recount before refusing.
            let ops = opts.session.unwrap_or_else(|| self.store.as_ops());
            let backlog = ops.count_backlog().await?;
            {
                let mut state = self.state.lock().await;
                state.backlog = backlog;
            }
            if backlog >= self.cfg.backlog_hard_limit {
                self.store.record_backpressure_hit(now).await?;
                warn!(backlog, limit = self.cfg.backlog_hard_limit, "audit intake refused");
                return Ok(Admission::backpressure());
            }
        }

        let digest = chain::payload_digest(event);
        let hmac = chain::payload_hmac(&digest, self.cfg.hmac_secret.as_bytes());
        let intent = AuditIntent {
            event_id: opts.event_id.unwrap_or_else(Uuid::new_v4),
            route_tag: opts.route_tag.to_string(),
            partition_id: chain::partition_of(event, self.cfg.partition_count),
            status: IntentStatus::Pending,
            lease_owner: None,
            lease_until: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            payload: event.clone(),
            payload_digest: digest,
            payload_hmac: hmac,
            hmac_key_id: self.cfg.hmac_key_id.clone(),
            global_sequence: None,
            committed_at: None,
            error_last: None,
        };

        let ops = opts.session.unwrap_or_else(|| self.store.as_ops());
        let inserted = ops.insert_intent(&intent).await?;
        if inserted {
            let mut state = self.state.lock().await;
            state.backlog += 1;
        }
        Ok(Admission::accepted())
    }

    /// Record an audit event, asynchronously when the pipeline is READY
    /// (returns `None`; the commit happens in a later drain) and through the
    /// synchronous fallback otherwise (returns the committed log).
    pub async fn record_audit_event(
        &self,
        event: &AuditEvent,
        opts: EnqueueOptions<'_>,
    ) -> Result<Option<AuditLogRecord>, AuditError> {
        if !self.is_ready() {
            return self.record_sync(event).await.map(Some);
        }
        let admission = self.enqueue(event, opts).await?;
        if admission.accepted {
            return Ok(None);
        }
        match admission.reason {
            Some("backpressure") => Err(AuditError::Backpressure {
                retry_after_seconds: admission.retry_after_seconds.unwrap_or(1),
            }),
            // Lost the READY race after the check above.
            _ => self.record_sync(event).await.map(Some),
        }
    }

    // ── Synchronous fallback ──────────────────────────────────────────────────

    /// Commit one event directly, honouring the chain invariants without the
    /// intake queue. The gap between sequence allocation and log insert is
    /// not atomic: a duplicate-key insert reconciles the allocation counter
    /// and retries exactly once.
    pub async fn record_sync(&self, event: &AuditEvent) -> Result<AuditLogRecord, AuditError> {
        let now = Utc::now();
        let mut sequence = self.store.alloc_sequence(now).await?;
        let mut previous_hash = self.await_predecessor(sequence).await?;

        // Reserve the partition slot first so the partition chain stays
        // linear under concurrent fallback writers.
        let partition_id = chain::partition_of(event, self.cfg.partition_count);
        let (partition_sequence, partition_previous_hash) = loop {
            let tails = self.store.load_partition_tails().await?;
            let (cur_seq, cur_hash) = tails
                .into_iter()
                .find(|t| t.partition_id == partition_id)
                .map(|t| (t.last_sequence, t.last_hash))
                .unwrap_or((0, String::new()));
            let next_seq = cur_seq + 1;
            let next_hash = chain::partition_hash(event, next_seq, &cur_hash);
            let next = PartitionTail {
                partition_id,
                last_sequence: next_seq,
                last_hash: next_hash,
                updated_at: now,
            };
            if self.store.cas_partition_tail(cur_seq, &cur_hash, &next).await? {
                break (next_seq, cur_hash);
            }
        };

        let mut log = AuditLogRecord {
            event_id: Uuid::new_v4(),
            chain_version: CHAIN_VERSION,
            event: event.clone(),
            partition_id,
            partition_sequence,
            partition_previous_hash: partition_previous_hash.clone(),
            partition_hash: chain::partition_hash(event, partition_sequence, &partition_previous_hash),
            sequence,
            previous_hash: previous_hash.clone(),
            hash: chain::log_hash(event, sequence, &previous_hash),
        };

        match self.store.insert_log(&log).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                // Another writer used our sequence. Lift the allocation
                // counter past everything committed and retry exactly once.
                let latest = self
                    .store
                    .latest_log()
                    .await?
                    .map(|l| l.sequence)
                    .unwrap_or(0);
                self.store.raise_sequence_floor(latest, now).await?;
                sequence = self.store.alloc_sequence(now).await?;
                previous_hash = self.await_predecessor(sequence).await?;
                log.sequence = sequence;
                log.previous_hash = previous_hash.clone();
                log.hash = chain::log_hash(event, sequence, &previous_hash);
                self.store.insert_log(&log).await?;
            }
            Err(e) => return Err(e.into()),
        }

        // Best-effort committed-tail advance; start() re-derives the tail
        // from the latest log either way.
        let _ = self
            .store
            .cas_global_tail(sequence - 1, &previous_hash, sequence, &log.hash, now)
            .await;

        debug!(sequence, partition_id, "audit event committed via fallback path");
        Ok(log)
    }

    /// Wait for the predecessor log to become visible, with exponential
    /// backoff from 2 ms to 50 ms, capped at 30 s wall-clock.
    async fn await_predecessor(&self, sequence: u64) -> Result<String, AuditError> {
        if sequence <= 1 {
            return Ok(String::new());
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        let mut backoff = Duration::from_millis(2);
        loop {
            if let Some(prev) = self.store.log_by_sequence(sequence - 1).await? {
                return Ok(prev.hash);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AuditError::PredecessorTimeout(sequence - 1));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(50));
        }
    }

    // ── Drain ─────────────────────────────────────────────────────────────────

    /// Run a single claim → build → commit cycle. Only one drain may be
    /// active per process; a reentrant call reports `skipped`.
    pub async fn drain_once(&self) -> Result<DrainReport, AuditError> {
        if !self.is_ready() {
            return Ok(DrainReport::skipped());
        }
        if self.flushing.swap(true, Ordering::AcqRel) {
            return Ok(DrainReport::skipped());
        }
        let result = self.drain_cycle().await;
        self.flushing.store(false, Ordering::Release);
        result
    }

    /// Drain until the backlog is empty or `max_cycles` is reached. Test and
    /// shutdown helper.
    pub async fn drain_until_idle(&self, max_cycles: usize) -> Result<(), AuditError> {
        for _ in 0..max_cycles {
            let report = self.drain_once().await?;
            if !report.skipped && !report.conflicted && report.claimed == 0 {
                return Ok(());
            }
        }
        Ok(())
    }

    // ── Anchors ───────────────────────────────────────────────────────────────

    /// Write one global anchor over the current partition heads. Returns
    /// false when there are no heads to checkpoint yet.
    pub async fn anchor_once(&self) -> Result<bool, AuditError> {
        let tails = self.store.load_partition_tails().await?;
        if tails.is_empty() {
            return Ok(false);
        }
        // load_partition_tails returns rows sorted by partition_id.
        let heads: Vec<PartitionHead> = tails
            .into_iter()
            .map(|t| PartitionHead {
                partition_id: t.partition_id,
                last_sequence: t.last_sequence,
                last_hash: t.last_hash,
            })
            .collect();
        let previous_anchor_hash = self
            .store
            .latest_anchor()
            .await?
            .map(|a| a.anchor_hash)
            .unwrap_or_default();
        let anchor_hash = chain::anchor_hash(&heads, &previous_anchor_hash);
        let anchor = GlobalAnchor {
            anchor_id: Uuid::new_v4(),
            ts: Utc::now(),
            partition_heads: heads,
            previous_anchor_hash,
            anchor_hash,
        };
        self.store.append_anchor(&anchor).await?;
        Ok(true)
    }

    // ── Verification ──────────────────────────────────────────────────────────

    /// Walk committed logs from sequence 1, recomputing both chains.
    pub async fn verify_chain(&self, limit: usize) -> Result<ChainReport, AuditError> {
        let logs = self.store.list_logs(1, limit).await?;
        let mut previous_hash = String::new();
        let mut partition_cursors: HashMap<u32, (u64, String)> = HashMap::new();
        let mut checked = 0u64;

        for (i, log) in logs.iter().enumerate() {
            let expected_sequence = i as u64 + 1;
            if log.sequence != expected_sequence {
                return Ok(ChainReport {
                    checked,
                    valid: false,
                    error: Some(format!(
                        "sequence gap: expected {}, found {}",
                        expected_sequence, log.sequence
                    )),
                });
            }
            if log.previous_hash != previous_hash {
                return Ok(ChainReport {
                    checked,
                    valid: false,
                    error: Some(format!("broken global link at sequence {}", log.sequence)),
                });
            }
            let recomputed = chain::log_hash(&log.event, log.sequence, &log.previous_hash);
            if recomputed != log.hash {
                return Ok(ChainReport {
                    checked,
                    valid: false,
                    error: Some(format!("hash mismatch at sequence {}", log.sequence)),
                });
            }

            let cursor = partition_cursors
                .entry(log.partition_id)
                .or_insert((0, String::new()));
            if log.partition_sequence != cursor.0 + 1
                || log.partition_previous_hash != cursor.1
                || chain::partition_hash(&log.event, log.partition_sequence, &log.partition_previous_hash)
                    != log.partition_hash
            {
                return Ok(ChainReport {
                    checked,
                    valid: false,
                    error: Some(format!(
                        "broken partition chain at sequence {} (partition {})",
                        log.sequence, log.partition_id
                    )),
                });
            }
            *cursor = (log.partition_sequence, log.partition_hash.clone());

            previous_hash = log.hash.clone();
            checked += 1;
        }

        Ok(ChainReport { checked, valid: true, error: None })
    }

    pub(crate) fn lease_until(&self, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        now + ChronoDuration::milliseconds(self.cfg.lease_duration_ms as i64)
    }
}
