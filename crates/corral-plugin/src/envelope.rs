use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Init,
    Invoke,
    InvokeResult,
    Health,
    ContextRequest,
    ContextResponse,
    Shutdown,
}

/// One framed message between the host and a plugin worker.
///
/// Request/response correlation is by `id`: a reply carries the id of the
/// message it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMessage {
    pub id: Uuid,
    pub plugin_id: String,
    pub kind: MessageKind,
    /// Wall-clock milliseconds.
    pub timestamp: i64,
    pub trace_id: Option<String>,
    pub payload: Value,
}

impl PluginMessage {
    pub fn new(kind: MessageKind, plugin_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            kind,
            timestamp: Utc::now().timestamp_millis(),
            trace_id: None,
            payload,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Build a reply correlated to this message.
    pub fn reply(&self, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: self.id,
            plugin_id: self.plugin_id.clone(),
            kind,
            timestamp: Utc::now().timestamp_millis(),
            trace_id: self.trace_id.clone(),
            payload,
        }
    }
}
