use std::collections::HashMap;
use std::sync::Arc;

use corral_audit::AuditPipeline;
use corral_store::DocumentStore;
use serde_json::json;
use tracing::debug;

use crate::breaker::{BreakerConfig, CircuitBreaker, HealthReport};
use crate::bridge::MessageBridge;
use crate::context::{context_error_payload, PluginContextHost};
use crate::envelope::MessageKind;
use crate::isolate::{IsolateManager, IsolateOptions};
use crate::registry::{PermissionStore, ServiceRegistry};
use crate::router::{ServiceRouter, WorkerResolver};
use crate::spawn::WorkerSpawner;
use crate::vault::{ConfigVault, DEFAULT_QUOTA_BYTES};

#[derive(Debug, Clone)]
pub struct SubstrateConfig {
    pub max_restarts: u32,
    pub memory_threshold_bytes: u64,
    pub vault_secret: String,
    pub vault_quota_bytes: u64,
    pub reload_grace_ms: u64,
    pub monitor_interval_ms: u64,
    /// Event subject → permission required to publish on it.
    pub publish_permissions: HashMap<String, String>,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            memory_threshold_bytes: 512 * 1024 * 1024,
            vault_secret: "corral-dev-vault".to_string(),
            vault_quota_bytes: DEFAULT_QUOTA_BYTES,
            reload_grace_ms: 1000,
            monitor_interval_ms: 1000,
            publish_permissions: HashMap::new(),
        }
    }
}

/// The composed plugin substrate: isolate supervision, service registry,
/// permission store, M-Service router and the context bridge, wired over one
/// message bridge.
pub struct PluginSubstrate {
    pub manager: Arc<IsolateManager>,
    pub registry: Arc<ServiceRegistry>,
    pub permissions: Arc<PermissionStore>,
    pub router: Arc<ServiceRouter>,
    pub context: Arc<PluginContextHost>,
    bridge: Arc<MessageBridge>,
}

impl PluginSubstrate {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        spawner: Arc<dyn WorkerSpawner>,
        pipeline: Option<Arc<AuditPipeline>>,
        cfg: SubstrateConfig,
    ) -> Arc<Self> {
        let bridge = Arc::new(MessageBridge::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            max_restarts: cfg.max_restarts,
            memory_threshold_bytes: cfg.memory_threshold_bytes,
        }));
        let manager = IsolateManager::new(
            spawner,
            Arc::clone(&bridge),
            breaker,
            pipeline,
            IsolateOptions {
                reload_grace_ms: cfg.reload_grace_ms,
                monitor_interval_ms: cfg.monitor_interval_ms,
            },
        );

        let registry = Arc::new(ServiceRegistry::new());
        let permissions = Arc::new(PermissionStore::new());
        let resolver: WorkerResolver = {
            let manager = Arc::clone(&manager);
            Arc::new(move |plugin_id| manager.worker_for(plugin_id))
        };
        let router = Arc::new(ServiceRouter::new(
            Arc::clone(&registry),
            Arc::clone(&permissions),
            Arc::clone(&bridge),
            resolver,
        ));

        let vault = ConfigVault::new(Arc::clone(&store), cfg.vault_secret.clone(), cfg.vault_quota_bytes);
        let context = Arc::new(PluginContextHost::new(
            store,
            Arc::clone(&permissions),
            vault,
            Arc::clone(&router),
            cfg.publish_permissions.clone(),
        ));

        let substrate =
            Arc::new(Self { manager, registry, permissions, router, context, bridge });
        substrate.wire_subscriber();
        substrate
    }

    /// Destroy every isolate. Used at server shutdown.
    pub async fn shutdown(&self) {
        for info in self.manager.list_isolates() {
            let _ = self.manager.destroy_isolate(&info.plugin_id).await;
        }
    }

    /// Route HEALTH frames into the breaker and CONTEXT_REQUEST frames into
    /// the context host, replying on the requesting worker's channel.
    fn wire_subscriber(self: &Arc<Self>) {
        let manager = Arc::clone(&self.manager);
        let context = Arc::clone(&self.context);
        self.bridge.subscribe(Arc::new(move |worker_id, msg| match msg.kind {
            MessageKind::Health => {
                match serde_json::from_value::<HealthReport>(msg.payload.clone()) {
                    Ok(report) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            manager.handle_health(worker_id, report).await;
                        });
                    }
                    Err(error) => debug!(%error, "discarding malformed health frame"),
                }
            }
            MessageKind::ContextRequest => {
                let manager = Arc::clone(&manager);
                let context = Arc::clone(&context);
                let msg = msg.clone();
                tokio::spawn(async move {
                    let Some((plugin_id, worker)) = manager.plugin_for_worker(worker_id) else {
                        return;
                    };
                    let payload = match context.handle(&plugin_id, &msg.payload).await {
                        Ok(data) => json!({"success": true, "data": data}),
                        Err(error) => context_error_payload(&error),
                    };
                    let _ = worker.post(msg.reply(MessageKind::ContextResponse, payload));
                });
            }
            _ => {}
        }));
    }
}

impl std::fmt::Debug for PluginSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSubstrate")
            .field("isolates", &self.manager.list_isolates().len())
            .finish()
    }
}
