use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub max_restarts: u32,
    pub memory_threshold_bytes: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { max_restarts: 3, memory_threshold_bytes: 512 * 1024 * 1024 }
    }
}

/// A worker's self-reported health, carried by HEALTH frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Resident set size in bytes.
    #[serde(rename = "memoryUsage")]
    pub memory_usage: u64,
    #[serde(rename = "uptime")]
    pub uptime_ms: u64,
    pub status: String,
}

/// Per-plugin restart budget plus last-health bookkeeping per worker.
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    restarts: Mutex<HashMap<String, u32>>,
    health: Mutex<HashMap<Uuid, HealthReport>>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self { cfg, restarts: Mutex::new(HashMap::new()), health: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.cfg
    }

    pub fn should_restart(&self, plugin_id: &str) -> bool {
        self.restart_count(plugin_id) < self.cfg.max_restarts
    }

    /// Returns the new count.
    pub fn record_restart(&self, plugin_id: &str) -> u32 {
        let mut restarts = self.restarts.lock();
        let count = restarts.entry(plugin_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_restart_count(&self, plugin_id: &str) {
        self.restarts.lock().remove(plugin_id);
    }

    pub fn restart_count(&self, plugin_id: &str) -> u32 {
        self.restarts.lock().get(plugin_id).copied().unwrap_or(0)
    }

    pub fn record_health(&self, worker_id: Uuid, report: HealthReport) {
        self.health.lock().insert(worker_id, report);
    }

    pub fn last_health(&self, worker_id: Uuid) -> Option<HealthReport> {
        self.health.lock().get(&worker_id).cloned()
    }

    pub fn forget_worker(&self, worker_id: Uuid) {
        self.health.lock().remove(&worker_id);
    }

    /// True when the worker's last report is within the memory threshold.
    /// No report yet means healthy.
    pub fn check_memory(&self, worker_id: Uuid) -> bool {
        self.health
            .lock()
            .get(&worker_id)
            .map_or(true, |r| r.memory_usage <= self.cfg.memory_threshold_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_after_max_restarts() {
        let breaker = CircuitBreaker::new(BreakerConfig { max_restarts: 2, ..Default::default() });
        assert!(breaker.should_restart("p"));
        breaker.record_restart("p");
        assert!(breaker.should_restart("p"));
        breaker.record_restart("p");
        assert!(!breaker.should_restart("p"));
        breaker.reset_restart_count("p");
        assert!(breaker.should_restart("p"));
    }

    #[test]
    fn memory_check_defaults_healthy() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let worker = Uuid::new_v4();
        assert!(breaker.check_memory(worker));

        breaker.record_health(
            worker,
            HealthReport { memory_usage: 600 * 1024 * 1024, uptime_ms: 1, status: "ok".into() },
        );
        assert!(!breaker.check_memory(worker));

        breaker.record_health(
            worker,
            HealthReport { memory_usage: 1024, uptime_ms: 2, status: "ok".into() },
        );
        assert!(breaker.check_memory(worker));
    }
}
