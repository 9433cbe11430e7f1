use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use corral_join::JoinError;
use serde_json::{json, Map, Value};

pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub retry_after_seconds: Option<u32>,
    /// Extra fields merged into the error object (e.g. the expected lease
    /// generation on a conflict).
    pub extra: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retry_after_seconds: None,
            extra: Map::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = Map::new();
        error.insert("code".to_string(), json!(self.code));
        error.insert("message".to_string(), json!(self.message));
        for (k, v) in self.extra {
            error.insert(k, v);
        }
        let body = Json(json!({ "success": false, "error": Value::Object(error) }));
        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<JoinError> for ApiError {
    fn from(e: JoinError) -> Self {
        let kind = e.kind();
        let status = StatusCode::from_u16(kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut api = ApiError::new(status, kind.code(), e.to_string());
        api.retry_after_seconds = kind.retry_after_seconds();
        if let JoinError::LeaseConflict { expected_generation } = &e {
            api.extra.insert(
                "expected_network_lease_generation".to_string(),
                json!(expected_generation),
            );
            api.extra.insert(
                "rollback_hint".to_string(),
                json!(format!(
                    "re-join with network_lease_generation={}",
                    expected_generation
                )),
            );
        }
        api
    }
}

impl From<corral_store::StoreError> for ApiError {
    fn from(e: corral_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<corral_audit::AuditError> for ApiError {
    fn from(e: corral_audit::AuditError) -> Self {
        match e {
            corral_audit::AuditError::Backpressure { retry_after_seconds } => {
                let mut api = ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "AUDIT_BACKPRESSURE",
                    "audit intake is saturated",
                );
                api.retry_after_seconds = Some(retry_after_seconds);
                api
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}
