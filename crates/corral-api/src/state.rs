use std::sync::Arc;

use corral_audit::AuditPipeline;
use corral_join::JoinController;
use corral_plugin::PluginSubstrate;
use corral_store::DocumentStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub pipeline: Arc<AuditPipeline>,
    pub join: Arc<JoinController>,
    pub substrate: Arc<PluginSubstrate>,
    pub auth_token: Arc<String>,
}
