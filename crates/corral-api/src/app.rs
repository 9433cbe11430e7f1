use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::authenticate;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/status", get(handlers::status))
        // Node join
        .route("/api/v1/join", post(handlers::join))
        // Task results
        .route("/api/v1/results", post(handlers::results))
        // Audit chain verification
        .route("/api/v1/audit/verify", get(handlers::verify_audit))
        // Auth + caller-context middleware applies to all routes above
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
