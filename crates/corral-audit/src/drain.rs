//! Claim, build and commit phases of one drain cycle.

use std::collections::HashMap;

use chrono::Utc;
use corral_chain as chain;
use corral_domain::{
    AuditIntent, AuditLogRecord, ErrorKind, FailureRecord, IntentStatus, PartitionTail,
    CHAIN_VERSION,
};
use corral_store::{ClaimGuard, StoreOps};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AuditError;
use crate::pipeline::{AuditPipeline, DrainReport};

/// One intent paired with the log computed for it.
struct PendingCommit {
    intent: AuditIntent,
    log: AuditLogRecord,
}

/// CAS guard for one partition touched by a batch. Within a batch a
/// partition tail may advance several times; only the first expectation
/// guards the commit, and `next` is the final position.
struct PartitionGuard {
    expected_sequence: u64,
    expected_hash: String,
    next: PartitionTail,
}

struct BatchPlan {
    commits: Vec<PendingCommit>,
    partitions: HashMap<u32, PartitionGuard>,
    expected_global: (u64, String),
    next_global: (u64, String),
    terminal: usize,
}

impl AuditPipeline {
    pub(crate) async fn drain_cycle(&self) -> Result<DrainReport, AuditError> {
        let claimed = self.claim_batch().await?;
        if claimed.is_empty() {
            return Ok(DrainReport::default());
        }

        let plan = self.build_batch(claimed).await?;
        if plan.terminal > 0 {
            let mut state = self.state.lock().await;
            state.backlog = state.backlog.saturating_sub(plan.terminal as u64);
        }
        if plan.commits.is_empty() {
            return Ok(DrainReport {
                claimed: plan.terminal,
                failed_terminal: plan.terminal,
                ..DrainReport::default()
            });
        }

        let claimed_count = plan.commits.len() + plan.terminal;
        match self.commit_batch(&plan).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.global_tail = plan.next_global.clone();
                for guard in plan.partitions.values() {
                    state.partition_tails.insert(
                        guard.next.partition_id,
                        (guard.next.last_sequence, guard.next.last_hash.clone()),
                    );
                }
                state.backlog = state.backlog.saturating_sub(plan.commits.len() as u64);
                debug!(
                    committed = plan.commits.len(),
                    global_sequence = plan.next_global.0,
                    "audit batch committed"
                );
                Ok(DrainReport {
                    claimed: claimed_count,
                    committed: plan.commits.len(),
                    failed_terminal: plan.terminal,
                    ..DrainReport::default()
                })
            }
            Err(error) if error.is_contention() => {
                warn!(%error, "audit commit contention, releasing claims");
                self.recover_from_conflict().await?;
                Ok(DrainReport {
                    claimed: claimed_count,
                    failed_terminal: plan.terminal,
                    conflicted: true,
                    ..DrainReport::default()
                })
            }
            Err(error) => {
                warn!(%error, "audit commit failed, penalizing batch");
                let terminal = self.penalize_batch(&plan, &error).await?;
                Ok(DrainReport {
                    claimed: claimed_count,
                    failed_terminal: plan.terminal + terminal,
                    ..DrainReport::default()
                })
            }
        }
    }

    /// Select candidates and take per-row leases. Fresh `pending` /
    /// `failed_retriable` rows first, topped up with expired `processing`
    /// leases, each claimed with a conditional update so concurrent workers
    /// never share a row.
    async fn claim_batch(&self) -> Result<Vec<AuditIntent>, AuditError> {
        let now = Utc::now();
        let batch = self.config().batch_size;
        let store = self.store();

        let mut rows = store.claim_candidates(batch).await?;
        if rows.len() < batch {
            let expired = store.expired_processing(now, batch - rows.len()).await?;
            rows.extend(expired);
        }

        let lease_until = self.lease_until(now);
        let mut claimed = Vec::new();
        for row in rows {
            let guard = if row.status == IntentStatus::Processing {
                ClaimGuard::stale(&row)
            } else {
                ClaimGuard::fresh(row.status)
            };
            if store
                .try_claim(row.event_id, &guard, self.worker_id(), lease_until, now)
                .await?
            {
                let mut intent = row;
                intent.status = IntentStatus::Processing;
                intent.lease_owner = Some(self.worker_id().to_string());
                intent.lease_until = Some(lease_until);
                claimed.push(intent);
            }
        }
        Ok(claimed)
    }

    /// Recheck each claimed intent's seal and thread it onto both chains.
    /// Integrity failures go terminal immediately and are skipped.
    async fn build_batch(&self, claimed: Vec<AuditIntent>) -> Result<BatchPlan, AuditError> {
        let now = Utc::now();
        let (expected_global, snapshot_tails) = {
            let state = self.state.lock().await;
            (state.global_tail.clone(), state.partition_tails.clone())
        };

        let mut cursor = expected_global.clone();
        let mut local_tails = snapshot_tails;
        let mut commits = Vec::new();
        let mut partitions: HashMap<u32, PartitionGuard> = HashMap::new();
        let mut terminal = 0usize;

        for intent in claimed {
            let digest = chain::payload_digest(&intent.payload);
            let secret = self.config().secret_for(&intent.hmac_key_id);
            let hmac = chain::payload_hmac(&digest, secret.as_bytes());
            if digest != intent.payload_digest || hmac != intent.payload_hmac {
                warn!(event_id = %intent.event_id, "audit intent failed integrity recheck");
                let code = ErrorKind::AuditIntegrityCheckFailed;
                self.store()
                    .mark_terminal(intent.event_id, code.code(), now)
                    .await?;
                self.store()
                    .insert_failure(&FailureRecord {
                        event_id: intent.event_id,
                        code: code.code().to_string(),
                        message: "payload digest or hmac mismatch".to_string(),
                        attempt_count: intent.attempt_count,
                        failed_at: now,
                    })
                    .await?;
                terminal += 1;
                continue;
            }

            let partition_id = intent.partition_id;
            let (tail_seq, tail_hash) = local_tails
                .get(&partition_id)
                .cloned()
                .unwrap_or((0, String::new()));
            let partition_sequence = tail_seq + 1;
            let partition_hash =
                chain::partition_hash(&intent.payload, partition_sequence, &tail_hash);

            let guard = partitions.entry(partition_id).or_insert(PartitionGuard {
                expected_sequence: tail_seq,
                expected_hash: tail_hash.clone(),
                next: PartitionTail::zero(partition_id, now),
            });
            guard.next = PartitionTail {
                partition_id,
                last_sequence: partition_sequence,
                last_hash: partition_hash.clone(),
                updated_at: now,
            };
            local_tails.insert(partition_id, (partition_sequence, partition_hash.clone()));

            let sequence = cursor.0 + 1;
            let hash = chain::log_hash(&intent.payload, sequence, &cursor.1);
            let log = AuditLogRecord {
                event_id: intent.event_id,
                chain_version: CHAIN_VERSION,
                event: intent.payload.clone(),
                partition_id,
                partition_sequence,
                partition_previous_hash: tail_hash,
                partition_hash,
                sequence,
                previous_hash: cursor.1.clone(),
                hash: hash.clone(),
            };
            cursor = (sequence, hash);
            commits.push(PendingCommit { intent, log });
        }

        Ok(BatchPlan {
            commits,
            partitions,
            expected_global,
            next_global: cursor,
            terminal,
        })
    }

    /// Apply the batch in one store transaction: logs, intent completion,
    /// partition CAS upserts, global CAS. Any guard mismatch aborts the
    /// whole transaction.
    async fn commit_batch(&self, plan: &BatchPlan) -> Result<(), AuditError> {
        if self.store().supports_transactions() {
            let session = self.store().begin().await?;
            let outcome = Self::commit_ops(session.as_ops(), plan).await;
            match outcome {
                Ok(()) => session.commit().await.map_err(Into::into),
                Err(error) => {
                    let _ = session.abort().await;
                    Err(error)
                }
            }
        } else {
            Self::commit_ops(self.store().as_ops(), plan).await
        }
    }

    async fn commit_ops(ops: &dyn StoreOps, plan: &BatchPlan) -> Result<(), AuditError> {
        let now = Utc::now();

        let logs: Vec<AuditLogRecord> = plan.commits.iter().map(|c| c.log.clone()).collect();
        let duplicates = ops.insert_logs(&logs).await?;
        if !duplicates.is_empty() {
            debug!(count = duplicates.len(), "tolerated duplicate log inserts (replay)");
        }

        // After duplicate tolerance the persisted batch must match what was
        // computed, field for field.
        let ids: Vec<Uuid> = plan.commits.iter().map(|c| c.log.event_id).collect();
        let persisted = ops.logs_by_event_ids(&ids).await?;
        let by_id: HashMap<Uuid, &AuditLogRecord> =
            persisted.iter().map(|l| (l.event_id, l)).collect();
        for commit in &plan.commits {
            let Some(stored) = by_id.get(&commit.log.event_id) else {
                return Err(AuditError::Chain {
                    kind: ErrorKind::AuditLogWriteIncomplete,
                    message: format!("log for intent {} absent after write", commit.log.event_id),
                });
            };
            if stored.sequence != commit.log.sequence
                || stored.previous_hash != commit.log.previous_hash
                || stored.hash != commit.log.hash
                || stored.partition_id != commit.log.partition_id
                || stored.partition_sequence != commit.log.partition_sequence
                || stored.partition_previous_hash != commit.log.partition_previous_hash
                || stored.partition_hash != commit.log.partition_hash
            {
                return Err(AuditError::Chain {
                    kind: ErrorKind::AuditLogWriteMismatch,
                    message: format!(
                        "persisted log for intent {} differs from computed batch",
                        commit.log.event_id
                    ),
                });
            }
        }

        for commit in &plan.commits {
            ops.mark_committed(commit.intent.event_id, commit.log.sequence, now)
                .await?;
        }

        for guard in plan.partitions.values() {
            let swapped = ops
                .cas_partition_tail(guard.expected_sequence, &guard.expected_hash, &guard.next)
                .await?;
            if !swapped {
                return Err(AuditError::Chain {
                    kind: ErrorKind::AuditPartitionTailConflict,
                    message: format!(
                        "partition {} tail moved past sequence {}",
                        guard.next.partition_id, guard.expected_sequence
                    ),
                });
            }
        }

        let swapped = ops
            .cas_global_tail(
                plan.expected_global.0,
                &plan.expected_global.1,
                plan.next_global.0,
                &plan.next_global.1,
                now,
            )
            .await?;
        if !swapped {
            return Err(AuditError::Chain {
                kind: ErrorKind::AuditGlobalTailConflict,
                message: format!(
                    "global tail moved past sequence {}",
                    plan.expected_global.0
                ),
            });
        }

        Ok(())
    }

    /// Chain contention: reload tails and backlog from the store and return
    /// every intent this worker still holds to `pending`, with no attempt
    /// penalty.
    async fn recover_from_conflict(&self) -> Result<(), AuditError> {
        let now = Utc::now();
        let latest = self.store().latest_log().await?;
        let tails = self.store().load_partition_tails().await?;
        let backlog = self.store().count_backlog().await?;

        {
            let mut state = self.state.lock().await;
            state.global_tail = latest
                .map(|log| (log.sequence, log.hash))
                .unwrap_or((0, String::new()));
            state.partition_tails = tails
                .into_iter()
                .map(|t| (t.partition_id, (t.last_sequence, t.last_hash)))
                .collect();
            state.backlog = backlog;
        }

        let released = self.store().release_owned(self.worker_id(), now).await?;
        debug!(released, "released claims after chain contention");
        Ok(())
    }

    /// A non-contention worker failure: every intent in the batch becomes
    /// `failed_retriable` with an attempt penalty; exhausted intents go
    /// terminal with a failure record. Returns how many went terminal.
    async fn penalize_batch(
        &self,
        plan: &BatchPlan,
        error: &AuditError,
    ) -> Result<usize, AuditError> {
        let now = Utc::now();
        let message = error.to_string();
        let mut terminal = 0usize;
        for commit in &plan.commits {
            let attempts = self
                .store()
                .mark_retriable(commit.intent.event_id, &message, now)
                .await?;
            if attempts >= self.config().max_retry_attempts {
                self.store()
                    .mark_terminal(commit.intent.event_id, &message, now)
                    .await?;
                self.store()
                    .insert_failure(&FailureRecord {
                        event_id: commit.intent.event_id,
                        code: error.kind().code().to_string(),
                        message: message.clone(),
                        attempt_count: attempts,
                        failed_at: now,
                    })
                    .await?;
                terminal += 1;
            }
        }
        if terminal > 0 {
            let mut state = self.state.lock().await;
            state.backlog = state.backlog.saturating_sub(terminal as u64);
        }
        Ok(terminal)
    }
}
