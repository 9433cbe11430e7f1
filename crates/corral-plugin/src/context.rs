use std::collections::HashMap;
use std::sync::Arc;

use corral_store::{DocumentStore, StoreOps};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::PluginError;
use crate::registry::PermissionStore;
use crate::router::{RouteRequest, ServiceRouter};
use crate::vault::ConfigVault;

/// Permission required to publish when a subject has no explicit mapping.
const DEFAULT_PUBLISH_PERMISSION: &str = "event:publish";

/// Host side of the plugin context: the only surface a plugin can reach the
/// control plane through. Frames are `{method, params}`; any method outside
/// the fixed five is rejected.
pub struct PluginContextHost {
    store: Arc<dyn DocumentStore>,
    permissions: Arc<PermissionStore>,
    vault: ConfigVault,
    router: Arc<ServiceRouter>,
    /// Subject → permission required to publish on it (the gate runs before
    /// anything reaches the bus).
    publish_permissions: HashMap<String, String>,
    bus: broadcast::Sender<(String, Value)>,
}

impl PluginContextHost {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        permissions: Arc<PermissionStore>,
        vault: ConfigVault,
        router: Arc<ServiceRouter>,
        publish_permissions: HashMap<String, String>,
    ) -> Self {
        let (bus, _) = broadcast::channel(256);
        Self { store, permissions, vault, router, publish_permissions, bus }
    }

    /// Subscribe to events published by plugins.
    pub fn bus(&self) -> broadcast::Receiver<(String, Value)> {
        self.bus.subscribe()
    }

    /// Dispatch one context frame from `plugin_id`.
    pub async fn handle(&self, plugin_id: &str, frame: &Value) -> Result<Value, PluginError> {
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::UnknownContextMethod("<missing>".to_string()))?;
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        debug!(plugin_id, method, "context request");

        match method {
            "getNodes" => {
                self.require(plugin_id, "node:read")?;
                let nodes = self.store.list_nodes().await?;
                Ok(serde_json::to_value(nodes)?)
            }
            "publishEvent" => {
                let subject = params
                    .get("subject")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PluginError::Internal("publishEvent requires a subject".into()))?;
                let required = self
                    .publish_permissions
                    .get(subject)
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_PUBLISH_PERMISSION);
                self.require(plugin_id, required)?;
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                // Nobody listening is fine; the gate already ran.
                let _ = self.bus.send((subject.to_string(), data));
                Ok(json!({"published": true}))
            }
            "getConfig" => Ok(self.vault.get(plugin_id).await?.unwrap_or(Value::Null)),
            "setConfig" => {
                let config = params
                    .get("config")
                    .ok_or_else(|| PluginError::Internal("setConfig requires a config".into()))?;
                self.vault.set(plugin_id, config).await?;
                Ok(json!({"saved": true}))
            }
            "callService" => {
                self.require(plugin_id, "plugin:access")?;
                let service = params
                    .get("service")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PluginError::Internal("callService requires a service".into()))?;
                let service_method = params
                    .get("method")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PluginError::Internal("callService requires a method".into()))?;
                let response = self
                    .router
                    .route(RouteRequest {
                        trace_id: params
                            .get("trace_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        caller: plugin_id.to_string(),
                        service: service.to_string(),
                        method: service_method.to_string(),
                        payload: params.get("params").cloned().unwrap_or(Value::Null),
                        timeout_ms: params.get("timeoutMs").and_then(Value::as_u64),
                    })
                    .await;
                Ok(serde_json::to_value(response)?)
            }
            other => Err(PluginError::UnknownContextMethod(other.to_string())),
        }
    }

    fn require(&self, plugin_id: &str, permission: &str) -> Result<(), PluginError> {
        if self.permissions.has(plugin_id, permission) {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied(format!(
                "plugin '{}' lacks '{}'",
                plugin_id, permission
            )))
        }
    }
}

/// Shape a context failure into the response payload sent back to a worker.
pub fn context_error_payload(error: &PluginError) -> Value {
    match error {
        PluginError::PermissionDenied(message) => {
            json!({"success": false, "error": {"code": "PERMISSION_DENIED", "message": message}})
        }
        other => json!({
            "success": false,
            "error": {"code": "PLUGIN_CONTEXT_ERROR", "message": other.to_string()}
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MessageBridge;
    use crate::registry::ServiceRegistry;
    use crate::vault::DEFAULT_QUOTA_BYTES;
    use corral_store::MemoryStore;

    fn host() -> (Arc<PermissionStore>, PluginContextHost) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let permissions = Arc::new(PermissionStore::new());
        let vault = ConfigVault::new(Arc::clone(&store), "s", DEFAULT_QUOTA_BYTES);
        let router = Arc::new(ServiceRouter::new(
            Arc::new(ServiceRegistry::new()),
            Arc::clone(&permissions),
            Arc::new(MessageBridge::new()),
            Arc::new(|_| None),
        ));
        let mut publish = HashMap::new();
        publish.insert("node.status".to_string(), "node:read".to_string());
        let host = PluginContextHost::new(store, Arc::clone(&permissions), vault, router, publish);
        (permissions, host)
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let (_perms, host) = host();
        let err = host
            .handle("p", &json!({"method": "fsRead", "params": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownContextMethod(_)));
    }

    #[tokio::test]
    async fn get_nodes_requires_permission() {
        let (perms, host) = host();
        let err = host
            .handle("p", &json!({"method": "getNodes"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied(_)));

        perms.grant("p", "node:read");
        let nodes = host.handle("p", &json!({"method": "getNodes"})).await.unwrap();
        assert_eq!(nodes, json!([]));
    }

    #[tokio::test]
    async fn publish_event_uses_subject_mapping() {
        let (perms, host) = host();
        let mut bus = host.bus();

        // Mapped subject requires node:read specifically.
        let err = host
            .handle(
                "p",
                &json!({"method": "publishEvent", "params": {"subject": "node.status", "data": 1}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied(_)));

        perms.grant("p", "node:read");
        host.handle(
            "p",
            &json!({"method": "publishEvent", "params": {"subject": "node.status", "data": 1}}),
        )
        .await
        .unwrap();
        let (subject, data) = bus.recv().await.unwrap();
        assert_eq!(subject, "node.status");
        assert_eq!(data, json!(1));
    }

    #[tokio::test]
    async fn config_round_trip_through_context() {
        let (_perms, host) = host();
        assert_eq!(
            host.handle("p", &json!({"method": "getConfig"})).await.unwrap(),
            Value::Null
        );
        host.handle(
            "p",
            &json!({"method": "setConfig", "params": {"config": {"interval": 5}}}),
        )
        .await
        .unwrap();
        assert_eq!(
            host.handle("p", &json!({"method": "getConfig"})).await.unwrap(),
            json!({"interval": 5})
        );
    }

    #[tokio::test]
    async fn call_service_requires_plugin_access() {
        let (_perms, host) = host();
        let err = host
            .handle(
                "p",
                &json!({"method": "callService", "params": {"service": "s", "method": "m"}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::PermissionDenied(_)));
    }
}
