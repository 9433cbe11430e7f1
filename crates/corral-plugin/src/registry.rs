use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;

/// One M-Service: a named RPC surface exported by a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    pub service: String,
    pub plugin_id: String,
    pub methods: HashSet<String>,
}

/// Service name → owning plugin, with the inverse plugin → services index
/// maintained in lock step.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    by_service: HashMap<String, ServiceRegistration>,
    by_plugin: HashMap<String, HashSet<String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` for `plugin_id`. Methods are deduplicated; a prior
    /// owner of the same service name is replaced.
    pub fn register(&self, service: &str, plugin_id: &str, methods: Vec<String>) {
        let mut inner = self.services.lock();
        let previous_owner = inner.by_service.get(service).map(|r| r.plugin_id.clone());
        if let Some(previous_owner) = previous_owner {
            if let Some(set) = inner.by_plugin.get_mut(&previous_owner) {
                set.remove(service);
                if set.is_empty() {
                    inner.by_plugin.remove(&previous_owner);
                }
            }
        }
        inner.by_service.insert(
            service.to_string(),
            ServiceRegistration {
                service: service.to_string(),
                plugin_id: plugin_id.to_string(),
                methods: methods.into_iter().collect(),
            },
        );
        inner
            .by_plugin
            .entry(plugin_id.to_string())
            .or_default()
            .insert(service.to_string());
    }

    pub fn unregister(&self, service: &str) {
        let mut inner = self.services.lock();
        if let Some(reg) = inner.by_service.remove(service) {
            if let Some(set) = inner.by_plugin.get_mut(&reg.plugin_id) {
                set.remove(service);
                if set.is_empty() {
                    inner.by_plugin.remove(&reg.plugin_id);
                }
            }
        }
    }

    /// Drop every service owned by `plugin_id` (isolate teardown).
    pub fn unregister_plugin(&self, plugin_id: &str) {
        let mut inner = self.services.lock();
        if let Some(services) = inner.by_plugin.remove(plugin_id) {
            for service in services {
                inner.by_service.remove(&service);
            }
        }
    }

    pub fn lookup(&self, service: &str) -> Option<ServiceRegistration> {
        self.services.lock().by_service.get(service).cloned()
    }

    pub fn plugin_services(&self, plugin_id: &str) -> Vec<String> {
        let inner = self.services.lock();
        let mut services: Vec<String> = inner
            .by_plugin
            .get(plugin_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        services.sort();
        services
    }
}

/// Process-local plugin → permission set.
#[derive(Default)]
pub struct PermissionStore {
    permissions: Mutex<HashMap<String, HashSet<String>>>,
}

impl PermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, plugin_id: &str, permission: &str) {
        self.permissions
            .lock()
            .entry(plugin_id.to_string())
            .or_default()
            .insert(permission.to_string());
    }

    pub fn revoke(&self, plugin_id: &str, permission: &str) {
        if let Some(set) = self.permissions.lock().get_mut(plugin_id) {
            set.remove(permission);
        }
    }

    pub fn has(&self, plugin_id: &str, permission: &str) -> bool {
        self.permissions
            .lock()
            .get(plugin_id)
            .map_or(false, |set| set.contains(permission))
    }

    pub fn clear_plugin(&self, plugin_id: &str) {
        self.permissions.lock().remove(plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_dedups_methods_and_replaces_owner() {
        let registry = ServiceRegistry::new();
        registry.register(
            "plugin.a.profile",
            "plugin-a",
            vec!["get".into(), "get".into(), "list".into()],
        );
        let reg = registry.lookup("plugin.a.profile").unwrap();
        assert_eq!(reg.methods.len(), 2);
        assert_eq!(reg.plugin_id, "plugin-a");

        // New owner steals the name; the old inverse entry is cleaned up.
        registry.register("plugin.a.profile", "plugin-b", vec!["get".into()]);
        assert_eq!(registry.lookup("plugin.a.profile").unwrap().plugin_id, "plugin-b");
        assert!(registry.plugin_services("plugin-a").is_empty());
        assert_eq!(registry.plugin_services("plugin-b"), vec!["plugin.a.profile"]);
    }

    #[test]
    fn unregister_plugin_drops_all_its_services() {
        let registry = ServiceRegistry::new();
        registry.register("svc.one", "p", vec![]);
        registry.register("svc.two", "p", vec![]);
        registry.unregister_plugin("p");
        assert!(registry.lookup("svc.one").is_none());
        assert!(registry.lookup("svc.two").is_none());
    }

    #[test]
    fn permissions_are_per_plugin() {
        let perms = PermissionStore::new();
        perms.grant("a", "plugin:access");
        assert!(perms.has("a", "plugin:access"));
        assert!(!perms.has("b", "plugin:access"));
        perms.revoke("a", "plugin:access");
        assert!(!perms.has("a", "plugin:access"));
    }
}
