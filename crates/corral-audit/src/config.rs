use std::collections::HashMap;

/// Tuning knobs of the audit pipeline.
///
/// `lease_duration_ms` must comfortably exceed the longest observed commit
/// cycle; a lease that expires mid-commit lets another worker claim the same
/// intent, and correctness then rests on the commit-time CAS guards.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of partition chains. Determines tail parallelism.
    pub partition_count: u32,
    /// Max intents per claim+commit cycle.
    pub batch_size: usize,
    /// Background drain tick.
    pub flush_interval_ms: u64,
    /// Anchor writer tick.
    pub anchor_interval_ms: u64,
    pub backlog_soft_limit: u64,
    pub backlog_hard_limit: u64,
    pub lease_duration_ms: u64,
    pub max_retry_attempts: u32,
    pub hmac_secret: String,
    pub hmac_key_id: String,
    /// Rotated-out secrets, keyed by the `hmac_key_id` they signed under.
    /// Verification picks the secret bound to an intent's key id and falls
    /// back to the current secret for unknown ids.
    pub retired_hmac_secrets: HashMap<String, String>,
    /// When false, the drain and anchor loops must be driven externally via
    /// `drain_once` / `anchor_once` (deterministic tests).
    pub enable_background_loops: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            batch_size: 32,
            flush_interval_ms: 20,
            anchor_interval_ms: 1000,
            backlog_soft_limit: 3000,
            backlog_hard_limit: 8000,
            lease_duration_ms: 10_000,
            max_retry_attempts: 5,
            hmac_secret: "corral-dev-secret".to_string(),
            hmac_key_id: "k0".to_string(),
            retired_hmac_secrets: HashMap::new(),
            enable_background_loops: true,
        }
    }
}

impl PipelineConfig {
    /// A configuration for deterministic tests: background loops off,
    /// everything else default.
    pub fn manual() -> Self {
        Self { enable_background_loops: false, ..Self::default() }
    }

    /// Resolve the verification secret for an intent's `hmac_key_id`.
    pub fn secret_for(&self, key_id: &str) -> &str {
        if key_id == self.hmac_key_id {
            return &self.hmac_secret;
        }
        self.retired_hmac_secrets
            .get(key_id)
            .map(String::as_str)
            .unwrap_or(&self.hmac_secret)
    }
}
