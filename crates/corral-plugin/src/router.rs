use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::bridge::MessageBridge;
use crate::envelope::{MessageKind, PluginMessage};
use crate::error::PluginError;
use crate::registry::{PermissionStore, ServiceRegistry};
use crate::spawn::WorkerHandle;

/// Resolves a plugin id to its active worker, injected by the isolate
/// manager so the router never holds isolate state of its own.
pub type WorkerResolver = Arc<dyn Fn(&str) -> Option<Arc<WorkerHandle>> + Send + Sync>;

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;
/// Slack granted to the bridge for its own bookkeeping; the per-call
/// timeout always fires first.
const BRIDGE_TIMEOUT_BUFFER_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub trace_id: String,
    pub caller: String,
    pub service: String,
    pub method: String,
    pub payload: Value,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteFault {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RouteFault>,
}

impl RouteResponse {
    fn ok(data: Option<Value>) -> Self {
        Self { success: true, data, error: None }
    }

    fn fail(code: &str, message: impl Into<Option<String>>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(RouteFault { code: code.to_string(), message: message.into() }),
        }
    }
}

/// The M-Service router: permission gate, registry lookup, method check,
/// worker resolution, INVOKE dispatch with a per-call timeout, and response
/// normalization.
pub struct ServiceRouter {
    registry: Arc<ServiceRegistry>,
    permissions: Arc<PermissionStore>,
    bridge: Arc<MessageBridge>,
    resolve_worker: WorkerResolver,
}

impl ServiceRouter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        permissions: Arc<PermissionStore>,
        bridge: Arc<MessageBridge>,
        resolve_worker: WorkerResolver,
    ) -> Self {
        Self { registry, permissions, bridge, resolve_worker }
    }

    pub async fn route(&self, req: RouteRequest) -> RouteResponse {
        if !self.permissions.has(&req.caller, "plugin:access") {
            return RouteResponse::fail(
                "ACCESS_DENIED",
                Some(format!("caller '{}' lacks plugin:access", req.caller)),
            );
        }

        let Some(registration) = self.registry.lookup(&req.service) else {
            return RouteResponse::fail(
                "SERVICE_UNAVAILABLE",
                Some(format!("service '{}' is not registered", req.service)),
            );
        };

        if !registration.methods.is_empty() && !registration.methods.contains(&req.method) {
            return RouteResponse::fail(
                "METHOD_NOT_FOUND",
                Some(format!("service '{}' has no method '{}'", req.service, req.method)),
            );
        }

        let Some(worker) = (self.resolve_worker)(&registration.plugin_id) else {
            return RouteResponse::fail(
                "SERVICE_UNAVAILABLE",
                Some(format!("plugin '{}' has no active worker", registration.plugin_id)),
            );
        };

        let timeout_ms = req.timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS).max(1);
        let envelope = PluginMessage::new(
            MessageKind::Invoke,
            registration.plugin_id.clone(),
            json!({
                "method": format!("{}.{}", req.service, req.method),
                "params": {
                    "trace_id": req.trace_id,
                    "caller": req.caller,
                    "service": req.service,
                    "method": req.method,
                    "payload": req.payload,
                },
                "timeout": timeout_ms,
            }),
        )
        .with_trace(req.trace_id.clone());

        debug!(
            service = %req.service,
            method = %req.method,
            caller = %req.caller,
            target = %registration.plugin_id,
            "routing m-service call"
        );

        let call = self.bridge.send_and_wait(
            &worker,
            envelope,
            Duration::from_millis(timeout_ms + BRIDGE_TIMEOUT_BUFFER_MS),
        );
        match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(Ok(reply)) => normalize(reply.payload),
            Ok(Err(PluginError::Timeout { .. })) | Err(_) => RouteResponse::fail(
                "TIMEOUT",
                Some(format!("call timed out after {}ms", timeout_ms)),
            ),
            Ok(Err(other)) => RouteResponse::fail("SERVICE_UNAVAILABLE", Some(other.to_string())),
        }
    }
}

/// Fold a worker reply into the M-Service response shape. Already-shaped
/// responses pass through with their error codes normalized; a bare value is
/// treated as successful data.
fn normalize(payload: Value) -> RouteResponse {
    match serde_json::from_value::<RouteResponse>(payload.clone()) {
        Ok(resp) if resp.success => RouteResponse::ok(resp.data),
        Ok(resp) => {
            let fault = resp.error.unwrap_or(RouteFault {
                code: "SERVICE_UNAVAILABLE".to_string(),
                message: None,
            });
            let code = match fault.code.as_str() {
                "PERMISSION_DENIED" => "ACCESS_DENIED".to_string(),
                known if is_known_code(known) => known.to_string(),
                _ => "SERVICE_UNAVAILABLE".to_string(),
            };
            RouteResponse { success: false, data: None, error: Some(RouteFault { code, message: fault.message }) }
        }
        Err(_) => RouteResponse::ok(Some(payload)),
    }
}

fn is_known_code(code: &str) -> bool {
    serde_json::from_value::<corral_domain::ErrorKind>(Value::String(code.to_string())).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::{TaskWorkerSpawner, WorkerSpawner};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct Harness {
        spawner: TaskWorkerSpawner,
        router: ServiceRouter,
        workers: Arc<Mutex<HashMap<String, Arc<WorkerHandle>>>>,
        permissions: Arc<PermissionStore>,
        registry: Arc<ServiceRegistry>,
    }

    fn harness(spawner: TaskWorkerSpawner) -> Harness {
        let registry = Arc::new(ServiceRegistry::new());
        let permissions = Arc::new(PermissionStore::new());
        let bridge = Arc::new(MessageBridge::new());
        let workers: Arc<Mutex<HashMap<String, Arc<WorkerHandle>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let resolver_workers = Arc::clone(&workers);
        let router = ServiceRouter::new(
            Arc::clone(&registry),
            Arc::clone(&permissions),
            Arc::clone(&bridge),
            Arc::new(move |plugin_id| resolver_workers.lock().get(plugin_id).cloned()),
        );
        Harness { spawner, router, workers, permissions, registry }
    }

    fn add_worker(h: &Harness, plugin_id: &str) -> Arc<WorkerHandle> {
        let worker = h.spawner.spawn(plugin_id, "entry.bin").unwrap();
        h.workers.lock().insert(plugin_id.to_string(), Arc::clone(&worker));
        worker
    }

    fn request(caller: &str, service: &str, method: &str, payload: Value) -> RouteRequest {
        RouteRequest {
            trace_id: "trace-route".to_string(),
            caller: caller.to_string(),
            service: service.to_string(),
            method: method.to_string(),
            payload,
            timeout_ms: Some(200),
        }
    }

    #[tokio::test]
    async fn routes_invoke_envelope_to_target_worker() {
        let h = harness(TaskWorkerSpawner::echo());
        h.registry.register("plugin.b.profile", "plugin-b", vec!["get".into()]);
        h.permissions.grant("plugin-a", "plugin:access");
        let worker = add_worker(&h, "plugin-b");
        h.router.bridge.attach(&worker, None);

        let resp = h
            .router
            .route(request("plugin-a", "plugin.b.profile", "get", json!({"profileId": "p-1"})))
            .await;
        assert!(resp.success, "{:?}", resp.error);

        // The target observed the full INVOKE envelope.
        let seen = h.spawner.received();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MessageKind::Invoke);
        assert_eq!(seen[0].payload["method"], "plugin.b.profile.get");
        assert_eq!(seen[0].payload["params"]["caller"], "plugin-a");
        assert_eq!(seen[0].payload["params"]["service"], "plugin.b.profile");
        assert_eq!(seen[0].payload["params"]["method"], "get");
        assert_eq!(seen[0].payload["params"]["payload"]["profileId"], "p-1");

        // Echo worker returns params as data.
        assert_eq!(resp.data.unwrap()["payload"]["profileId"], "p-1");
    }

    #[tokio::test]
    async fn denies_caller_without_permission_before_contacting_worker() {
        let h = harness(TaskWorkerSpawner::echo());
        h.registry.register("plugin.b.profile", "plugin-b", vec!["get".into()]);
        let worker = add_worker(&h, "plugin-b");
        h.router.bridge.attach(&worker, None);

        let resp = h
            .router
            .route(request("plugin-a", "plugin.b.profile", "get", json!({})))
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "ACCESS_DENIED");
        assert!(h.spawner.received().is_empty(), "worker must never be contacted");
    }

    #[tokio::test]
    async fn unknown_service_and_method_are_distinct_failures() {
        let h = harness(TaskWorkerSpawner::echo());
        h.permissions.grant("plugin-a", "plugin:access");

        let resp = h.router.route(request("plugin-a", "nope", "get", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, "SERVICE_UNAVAILABLE");

        h.registry.register("svc", "plugin-b", vec!["get".into()]);
        let worker = add_worker(&h, "plugin-b");
        h.router.bridge.attach(&worker, None);
        let resp = h.router.route(request("plugin-a", "svc", "missing", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn empty_method_list_admits_any_method() {
        let h = harness(TaskWorkerSpawner::echo());
        h.permissions.grant("plugin-a", "plugin:access");
        h.registry.register("svc", "plugin-b", vec![]);
        let worker = add_worker(&h, "plugin-b");
        h.router.bridge.attach(&worker, None);

        let resp = h.router.route(request("plugin-a", "svc", "anything", json!({}))).await;
        assert!(resp.success);
    }

    #[tokio::test]
    async fn silent_worker_times_out_with_actual_duration() {
        let h = harness(TaskWorkerSpawner::silent());
        h.permissions.grant("plugin-a", "plugin:access");
        h.registry.register("svc", "plugin-b", vec![]);
        let worker = add_worker(&h, "plugin-b");
        h.router.bridge.attach(&worker, None);

        let resp = h.router.route(request("plugin-a", "svc", "get", json!({}))).await;
        let fault = resp.error.unwrap();
        assert_eq!(fault.code, "TIMEOUT");
        assert!(fault.message.unwrap().contains("200ms"));
    }

    #[tokio::test]
    async fn permission_denied_from_plugin_maps_to_access_denied() {
        let spawner = TaskWorkerSpawner::with_behavior(Arc::new(|msg| {
            Some(msg.reply(
                MessageKind::InvokeResult,
                json!({"success": false, "error": {"code": "PERMISSION_DENIED", "message": "nope"}}),
            ))
        }));
        let h = harness(spawner);
        h.permissions.grant("plugin-a", "plugin:access");
        h.registry.register("svc", "plugin-b", vec![]);
        let worker = add_worker(&h, "plugin-b");
        h.router.bridge.attach(&worker, None);

        let resp = h.router.route(request("plugin-a", "svc", "get", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, "ACCESS_DENIED");
    }

    #[tokio::test]
    async fn unknown_error_code_maps_to_service_unavailable() {
        let spawner = TaskWorkerSpawner::with_behavior(Arc::new(|msg| {
            Some(msg.reply(
                MessageKind::InvokeResult,
                json!({"success": false, "error": {"code": "SOMETHING_ODD"}}),
            ))
        }));
        let h = harness(spawner);
        h.permissions.grant("plugin-a", "plugin:access");
        h.registry.register("svc", "plugin-b", vec![]);
        let worker = add_worker(&h, "plugin-b");
        h.router.bridge.attach(&worker, None);

        let resp = h.router.route(request("plugin-a", "svc", "get", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, "SERVICE_UNAVAILABLE");
    }
}
