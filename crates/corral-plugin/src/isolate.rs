use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_audit::{AuditPipeline, EnqueueOptions};
use corral_domain::{AuditEvent, AuditLevel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{CircuitBreaker, HealthReport};
use crate::bridge::MessageBridge;
use crate::envelope::{MessageKind, PluginMessage};
use crate::error::PluginError;
use crate::spawn::{WorkerHandle, WorkerSpawner};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IsolateOptions {
    /// How long a replaced worker keeps draining in-flight messages before
    /// termination. Must cover the worst-case tail drain.
    pub reload_grace_ms: u64,
    pub monitor_interval_ms: u64,
}

impl Default for IsolateOptions {
    fn default() -> Self {
        Self { reload_grace_ms: 1000, monitor_interval_ms: 1000 }
    }
}

struct IsolateRuntime {
    manifest: PluginManifest,
    entry_path: String,
    worker: Arc<WorkerHandle>,
    started_at: DateTime<Utc>,
    memory: Option<u64>,
}

/// Status-surface snapshot of one isolate.
#[derive(Debug, Clone, Serialize)]
pub struct IsolateInfo {
    pub plugin_id: String,
    pub worker_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub memory: Option<u64>,
    pub restart_count: u32,
}

/// Supervises one worker per plugin: creation, circuit-breaker restarts,
/// preheat-and-swap reload, health intake, unexpected-termination recovery.
///
/// All isolate maps are owned by this supervisor; message handlers post work
/// onto it through the bridge.
pub struct IsolateManager {
    spawner: Arc<dyn WorkerSpawner>,
    bridge: Arc<MessageBridge>,
    breaker: Arc<CircuitBreaker>,
    pipeline: Option<Arc<AuditPipeline>>,
    opts: IsolateOptions,
    isolates: Mutex<HashMap<String, IsolateRuntime>>,
    expected_shutdown: Mutex<HashSet<String>>,
    restart_in_progress: Mutex<HashSet<String>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl IsolateManager {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        bridge: Arc<MessageBridge>,
        breaker: Arc<CircuitBreaker>,
        pipeline: Option<Arc<AuditPipeline>>,
        opts: IsolateOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            bridge,
            breaker,
            pipeline,
            opts,
            isolates: Mutex::new(HashMap::new()),
            expected_shutdown: Mutex::new(HashSet::new()),
            restart_in_progress: Mutex::new(HashSet::new()),
            monitors: Mutex::new(HashMap::new()),
        })
    }

    pub fn bridge(&self) -> &Arc<MessageBridge> {
        &self.bridge
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub async fn create_isolate(
        self: &Arc<Self>,
        plugin_id: &str,
        manifest: PluginManifest,
        entry_path: &str,
    ) -> Result<(), PluginError> {
        if self.isolates.lock().contains_key(plugin_id) {
            return Err(PluginError::AlreadyExists(plugin_id.to_string()));
        }
        self.breaker.reset_restart_count(plugin_id);

        let worker = self.spawner.spawn(plugin_id, entry_path)?;
        self.isolates.lock().insert(
            plugin_id.to_string(),
            IsolateRuntime {
                manifest: manifest.clone(),
                entry_path: entry_path.to_string(),
                worker: Arc::clone(&worker),
                started_at: Utc::now(),
                memory: None,
            },
        );
        self.attach_worker(plugin_id, &worker);
        if let Err(error) = worker.post(PluginMessage::new(
            MessageKind::Init,
            plugin_id,
            json!({"manifest": manifest}),
        )) {
            self.bridge.detach(worker.worker_id);
            self.isolates.lock().remove(plugin_id);
            worker.terminate();
            return Err(error);
        }
        self.start_monitor(plugin_id);

        info!(plugin_id, "plugin isolate created");
        self.audit(AuditLevel::Info, "Plugin isolate created", plugin_id).await;
        Ok(())
    }

    pub async fn destroy_isolate(&self, plugin_id: &str) -> Result<(), PluginError> {
        self.expected_shutdown.lock().insert(plugin_id.to_string());

        if let Some(monitor) = self.monitors.lock().remove(plugin_id) {
            monitor.abort();
        }
        let runtime = self.isolates.lock().remove(plugin_id);
        let Some(runtime) = runtime else {
            self.expected_shutdown.lock().remove(plugin_id);
            return Err(PluginError::NotFound(plugin_id.to_string()));
        };

        self.bridge.detach(runtime.worker.worker_id);
        self.breaker.forget_worker(runtime.worker.worker_id);
        let _ = runtime
            .worker
            .post(PluginMessage::new(MessageKind::Shutdown, plugin_id, json!({})));
        runtime.worker.terminate();

        self.expected_shutdown.lock().remove(plugin_id);
        info!(plugin_id, "plugin isolate destroyed");
        self.audit(AuditLevel::Info, "Plugin isolate destroyed", plugin_id).await;
        Ok(())
    }

    /// Restart within the circuit-breaker budget.
    pub async fn restart_isolate(self: &Arc<Self>, plugin_id: &str) -> Result<(), PluginError> {
        if !self.breaker.should_restart(plugin_id) {
            return Err(PluginError::RestartBudgetExhausted(plugin_id.to_string()));
        }
        self.breaker.record_restart(plugin_id);
        self.unsafe_restart(plugin_id).await
    }

    /// Preheat-and-swap reload: spawn and bootstrap a fresh worker, switch
    /// the active pointer, then terminate the old worker after the grace
    /// period — provided the switch is still in effect. On any failure the
    /// previous worker is reattached and the error surfaces.
    pub async fn unsafe_restart(self: &Arc<Self>, plugin_id: &str) -> Result<(), PluginError> {
        if !self.restart_in_progress.lock().insert(plugin_id.to_string()) {
            return Err(PluginError::Internal(format!(
                "restart already in progress for '{}'",
                plugin_id
            )));
        }
        let result = self.reload_inner(plugin_id).await;
        self.restart_in_progress.lock().remove(plugin_id);
        if result.is_ok() {
            self.audit(AuditLevel::Info, "Plugin isolate reloaded", plugin_id).await;
        }
        result
    }

    async fn reload_inner(self: &Arc<Self>, plugin_id: &str) -> Result<(), PluginError> {
        let (old_worker, manifest, entry_path) = {
            let isolates = self.isolates.lock();
            let Some(runtime) = isolates.get(plugin_id) else {
                return Err(PluginError::NotFound(plugin_id.to_string()));
            };
            (Arc::clone(&runtime.worker), runtime.manifest.clone(), runtime.entry_path.clone())
        };

        self.bridge.detach(old_worker.worker_id);

        // Preheat before touching the active pointer.
        let new_worker = match self.spawner.spawn(plugin_id, &entry_path) {
            Ok(worker) => worker,
            Err(error) => {
                warn!(plugin_id, %error, "reload preheat failed, reattaching previous worker");
                self.attach_worker(plugin_id, &old_worker);
                self.start_monitor(plugin_id);
                return Err(error);
            }
        };

        self.attach_worker(plugin_id, &new_worker);
        if let Err(error) = new_worker.post(PluginMessage::new(
            MessageKind::Init,
            plugin_id,
            json!({"manifest": manifest}),
        )) {
            warn!(plugin_id, %error, "reload bootstrap failed, reattaching previous worker");
            self.bridge.detach(new_worker.worker_id);
            new_worker.terminate();
            self.attach_worker(plugin_id, &old_worker);
            self.start_monitor(plugin_id);
            return Err(error);
        }

        // Atomic switch of the active pointer.
        {
            let mut isolates = self.isolates.lock();
            let Some(runtime) = isolates.get_mut(plugin_id) else {
                self.bridge.detach(new_worker.worker_id);
                new_worker.terminate();
                return Err(PluginError::NotFound(plugin_id.to_string()));
            };
            runtime.worker = Arc::clone(&new_worker);
            runtime.started_at = Utc::now();
            runtime.memory = None;
        }
        self.start_monitor(plugin_id);

        // Old worker drains in-flight messages, then goes — unless another
        // switch made it active again in the meantime.
        let manager = Arc::clone(self);
        let pid = plugin_id.to_string();
        let grace = Duration::from_millis(self.opts.reload_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_replaced = manager
                .isolates
                .lock()
                .get(&pid)
                .map(|r| r.worker.worker_id != old_worker.worker_id)
                .unwrap_or(true);
            if still_replaced {
                manager.breaker.forget_worker(old_worker.worker_id);
                old_worker.terminate();
                debug!(plugin_id = %pid, "replaced worker terminated after grace period");
            }
        });

        info!(plugin_id, "plugin isolate reloaded");
        Ok(())
    }

    // ── Failure handling ──────────────────────────────────────────────────────

    /// Invoked when a worker channel closes without an expected shutdown.
    pub async fn handle_unexpected_termination(self: &Arc<Self>, plugin_id: &str) {
        if self.expected_shutdown.lock().contains(plugin_id) {
            return;
        }
        if self.restart_in_progress.lock().contains(plugin_id) {
            return;
        }
        if !self.isolates.lock().contains_key(plugin_id) {
            return;
        }

        warn!(plugin_id, "worker terminated unexpectedly");
        if !self.breaker.should_restart(plugin_id) {
            warn!(plugin_id, "restart budget exhausted, destroying isolate");
            self.audit(AuditLevel::Warn, "Plugin restart budget exhausted", plugin_id).await;
            let _ = self.destroy_isolate(plugin_id).await;
            return;
        }

        self.breaker.record_restart(plugin_id);
        self.audit(AuditLevel::Warn, "Plugin isolate restarted after crash", plugin_id).await;
        if let Err(error) = self.unsafe_restart(plugin_id).await {
            warn!(plugin_id, %error, "restart failed, destroying isolate");
            let _ = self.destroy_isolate(plugin_id).await;
        }
    }

    /// HEALTH intake from the bridge. An rss above the threshold is treated
    /// as an unexpected termination.
    pub async fn handle_health(self: &Arc<Self>, worker_id: Uuid, report: HealthReport) {
        let plugin_id = {
            let mut isolates = self.isolates.lock();
            let entry = isolates
                .iter_mut()
                .find(|(_, r)| r.worker.worker_id == worker_id);
            match entry {
                Some((plugin_id, runtime)) => {
                    runtime.memory = Some(report.memory_usage);
                    plugin_id.clone()
                }
                None => return,
            }
        };
        let over_threshold = report.memory_usage > self.breaker.config().memory_threshold_bytes;
        self.breaker.record_health(worker_id, report);
        if over_threshold {
            warn!(plugin_id = %plugin_id, "worker exceeded memory threshold");
            self.handle_unexpected_termination(&plugin_id).await;
        }
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn is_isolate_running(&self, plugin_id: &str) -> bool {
        self.isolates
            .lock()
            .get(plugin_id)
            .map_or(false, |r| r.worker.is_alive())
    }

    pub fn restart_count(&self, plugin_id: &str) -> u32 {
        self.breaker.restart_count(plugin_id)
    }

    /// The active worker for a plugin; the router's resolver.
    pub fn worker_for(&self, plugin_id: &str) -> Option<Arc<WorkerHandle>> {
        self.isolates.lock().get(plugin_id).map(|r| Arc::clone(&r.worker))
    }

    /// Reverse lookup used when answering context frames.
    pub fn plugin_for_worker(&self, worker_id: Uuid) -> Option<(String, Arc<WorkerHandle>)> {
        self.isolates
            .lock()
            .iter()
            .find(|(_, r)| r.worker.worker_id == worker_id)
            .map(|(plugin_id, r)| (plugin_id.clone(), Arc::clone(&r.worker)))
    }

    pub fn list_isolates(&self) -> Vec<IsolateInfo> {
        let isolates = self.isolates.lock();
        let mut infos: Vec<IsolateInfo> = isolates
            .iter()
            .map(|(plugin_id, r)| IsolateInfo {
                plugin_id: plugin_id.clone(),
                worker_id: r.worker.worker_id,
                started_at: r.started_at,
                memory: r.memory,
                restart_count: self.breaker.restart_count(plugin_id),
            })
            .collect();
        infos.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        infos
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn attach_worker(self: &Arc<Self>, plugin_id: &str, worker: &Arc<WorkerHandle>) {
        let manager = Arc::clone(self);
        let pid = plugin_id.to_string();
        self.bridge.attach(
            worker,
            Some(Box::new(move || {
                tokio::spawn(async move {
                    manager.handle_unexpected_termination(&pid).await;
                });
            })),
        );
    }

    fn start_monitor(self: &Arc<Self>, plugin_id: &str) {
        let manager = Arc::clone(self);
        let pid = plugin_id.to_string();
        let interval_ms = self.opts.monitor_interval_ms.max(1);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let worker_id = manager.isolates.lock().get(&pid).map(|r| r.worker.worker_id);
                let Some(worker_id) = worker_id else { break };
                if !manager.breaker.check_memory(worker_id) {
                    warn!(plugin_id = %pid, "memory monitor tripped");
                    manager.handle_unexpected_termination(&pid).await;
                }
            }
        });
        if let Some(previous) = self.monitors.lock().insert(plugin_id.to_string(), handle) {
            previous.abort();
        }
    }

    async fn audit(&self, level: AuditLevel, content: &str, plugin_id: &str) {
        let Some(pipeline) = &self.pipeline else { return };
        let mut meta = BTreeMap::new();
        meta.insert("plugin_id".to_string(), json!(plugin_id));
        let event = AuditEvent {
            ts: Utc::now().timestamp_millis(),
            level,
            node_id: "control-plane".to_string(),
            source: "plugin".to_string(),
            trace_id: format!("plugin-{}", Uuid::new_v4()),
            content: content.to_string(),
            meta,
        };
        let opts = EnqueueOptions { route_tag: "plugin", ..Default::default() };
        if let Err(error) = pipeline.record_audit_event(&event, opts).await {
            warn!(%error, plugin_id, "plugin lifecycle audit failed");
        }
    }
}
