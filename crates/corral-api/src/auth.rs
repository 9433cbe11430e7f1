use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use corral_domain::CallerContext;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Authentication middleware for every route — no public endpoints.
///
/// A request must carry the control-plane bearer token; anything else gets a
/// 401 in the standard error envelope. Authenticated requests have a
/// [`CallerContext`] assembled from the `x-trace-id` / `x-node-id` headers
/// inserted into the request extensions, so handlers never reconstruct the
/// caller themselves. A missing trace id gets a generated one, keeping the
/// audit trail correlated even for clients that do not propagate traces.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.auth_token.as_str());
    if !authorized {
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            "ACCESS_DENIED",
            "missing or invalid bearer token",
        )
        .into_response();
    }

    let headers = request.headers();
    let trace_id = headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("trace-{}", Uuid::new_v4()));
    let node_id = headers
        .get("x-node-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    request.extensions_mut().insert(CallerContext {
        trace_id,
        node_id,
        permissions: Default::default(),
    });

    next.run(request).await
}
