use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use corral_audit::EnqueueOptions;
use corral_domain::{AuditEvent, AuditLevel, CallerContext};
use corral_join::JoinRequest;
use corral_store::StoreOps;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Highest accepted `x-call-depth`.
pub const MAX_CALL_DEPTH: i64 = 16;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.count_backlog().await?;
    Ok(StatusCode::OK)
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let backlog = state.store.count_backlog().await?;
    let latest = state.store.latest_log().await?;
    let anchor = state.store.latest_anchor().await?;
    let sequence_state = state.store.load_sequence_state().await?;
    Ok(Json(json!({
        "pipeline": {
            "ready": state.pipeline.is_ready(),
            "backlog": backlog,
            "global_sequence": latest.map(|l| l.sequence).unwrap_or(0),
            "backpressure_hits": sequence_state.backpressure_hits,
            "backpressure_last_at": sequence_state.backpressure_last_at,
        },
        "latest_anchor": anchor.map(|a| json!({"anchor_id": a.anchor_id, "ts": a.ts})),
        "isolates": state.substrate.manager.list_isolates(),
    })))
}

// ── Join ──────────────────────────────────────────────────────────────────────

pub async fn join(
    State(state): State<AppState>,
    Extension(ctx): Extension<CallerContext>,
    headers: HeaderMap,
    Json(req): Json<JoinRequest>,
) -> Result<Json<Value>, ApiError> {
    let wire_version = headers
        .get("x-wire-contract-version")
        .and_then(|v| v.to_str().ok());
    let outcome = state.join.handle_join(req, &ctx, wire_version).await?;
    Ok(Json(json!({ "success": true, "data": outcome })))
}

// ── Task results ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResultsBody {
    pub task_id: String,
    pub status: ResultStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// `x-call-depth`: absent defaults to 0; otherwise an integer in
/// `0..=MAX_CALL_DEPTH`. Returns the offending raw value on rejection.
fn parse_call_depth(headers: &HeaderMap) -> Result<i64, String> {
    let Some(value) = headers.get("x-call-depth") else {
        return Ok(0);
    };
    let raw = value.to_str().map_err(|_| "<unprintable>".to_string())?;
    let depth: i64 = raw.trim().parse().map_err(|_| raw.to_string())?;
    if (0..=MAX_CALL_DEPTH).contains(&depth) {
        Ok(depth)
    } else {
        Err(raw.to_string())
    }
}

pub async fn results(
    State(state): State<AppState>,
    Extension(ctx): Extension<CallerContext>,
    headers: HeaderMap,
    Json(body): Json<ResultsBody>,
) -> Result<Response, ApiError> {
    let node_id = ctx.node_id.clone().unwrap_or_else(|| "unknown".to_string());

    let depth = match parse_call_depth(&headers) {
        Ok(depth) => depth,
        Err(raw) => {
            warn!(raw, task_id = %body.task_id, "rejecting result with invalid call depth");
            let mut meta = BTreeMap::new();
            meta.insert("task_id".to_string(), json!(body.task_id));
            meta.insert("x_call_depth".to_string(), json!(raw));
            let event = AuditEvent {
                ts: Utc::now().timestamp_millis(),
                level: AuditLevel::Warn,
                node_id,
                source: "results".to_string(),
                trace_id: ctx.trace_id,
                content: "Task result rejected: invalid call depth".to_string(),
                meta,
            };
            let opts = EnqueueOptions { route_tag: "results", ..Default::default() };
            if let Err(error) = state.pipeline.record_audit_event(&event, opts).await {
                warn!(%error, "audit of call-depth rejection failed");
            }
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": "INVALID_CALL_DEPTH" })),
            )
                .into_response());
        }
    };

    let mut meta = BTreeMap::new();
    meta.insert("task_id".to_string(), json!(body.task_id));
    meta.insert("result_status".to_string(), json!(body.status));
    meta.insert("call_depth".to_string(), json!(depth));
    if let Some(error) = &body.error {
        meta.insert("error".to_string(), json!(error));
    }
    let event = AuditEvent {
        ts: Utc::now().timestamp_millis(),
        level: AuditLevel::Info,
        node_id,
        source: "results".to_string(),
        trace_id: ctx.trace_id,
        content: "Task result accepted".to_string(),
        meta,
    };
    let opts = EnqueueOptions { route_tag: "results", ..Default::default() };
    state.pipeline.record_audit_event(&event, opts).await?;

    Ok(Json(json!({ "success": true, "ack": true })).into_response())
}

// ── Audit verification ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub limit: Option<usize>,
}

pub async fn verify_audit(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<Value>, ApiError> {
    let report = state
        .pipeline
        .verify_chain(query.limit.unwrap_or(10_000))
        .await?;
    Ok(Json(json!({ "success": true, "data": report })))
}
