use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use corral_api::AppState;
use corral_audit::{AuditPipeline, PipelineConfig};
use corral_config::CoreConfig;
use corral_join::{JoinConfig, JoinController};
use corral_plugin::{PluginSubstrate, SubstrateConfig, TaskWorkerSpawner};
use corral_store::{DocumentStore, MemoryStore};
use serde_json::json;
use uuid::Uuid;

use crate::cli::PersonaArg;
use crate::output;

// ── Serve ─────────────────────────────────────────────────────────────────────

pub async fn serve(
    config_path: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
    auth_token: Option<String>,
) -> Result<()> {
    let cfg = corral_config::load_config(config_path.as_deref())
        .context("Failed to load configuration")?;

    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let port = port.unwrap_or(cfg.server.port);
    let token = match auth_token.or_else(|| cfg.server.auth_token.clone()) {
        Some(token) => token,
        None => {
            let token = generate_token();
            println!("Generated auth token: {}", token);
            token
        }
    };

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    println!("Using in-memory store — state will be lost on server stop");

    let pipeline = AuditPipeline::new(Arc::clone(&store), pipeline_config(&cfg));
    pipeline.start().await.context("Failed to start audit pipeline")?;

    let substrate = PluginSubstrate::new(
        Arc::clone(&store),
        Arc::new(TaskWorkerSpawner::echo()),
        Some(Arc::clone(&pipeline)),
        substrate_config(&cfg),
    );

    let join = Arc::new(JoinController::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        JoinConfig {
            default_org_id: cfg.join.default_org_id.clone(),
            core_ip: cfg.join.core_ip.clone(),
            wire_contract_version: cfg.join.wire_contract_version.clone(),
        },
    ));

    let state = AppState {
        store,
        pipeline: Arc::clone(&pipeline),
        join,
        substrate: Arc::clone(&substrate),
        auth_token: Arc::new(token),
    };
    let app = corral_api::build_app(state);

    let addr = format!("{bind}:{port}");
    println!("Starting corral API server on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let served = axum::serve(listener, app).await;

    substrate.shutdown().await;
    pipeline.stop().await;
    served.context("Server error")
}

fn pipeline_config(cfg: &CoreConfig) -> PipelineConfig {
    PipelineConfig {
        partition_count: cfg.audit.partition_count,
        batch_size: cfg.audit.batch_size,
        flush_interval_ms: cfg.audit.flush_interval_ms,
        anchor_interval_ms: cfg.audit.anchor_interval_ms,
        backlog_soft_limit: cfg.audit.backlog_soft_limit,
        backlog_hard_limit: cfg.audit.backlog_hard_limit,
        lease_duration_ms: cfg.audit.lease_duration_ms,
        max_retry_attempts: cfg.audit.max_retry_attempts,
        hmac_secret: cfg.audit.hmac_secret.clone(),
        hmac_key_id: cfg.audit.hmac_key_id.clone(),
        retired_hmac_secrets: cfg.audit.retired_hmac_secrets.clone(),
        enable_background_loops: true,
    }
}

fn substrate_config(cfg: &CoreConfig) -> SubstrateConfig {
    SubstrateConfig {
        max_restarts: cfg.plugins.max_restarts,
        memory_threshold_bytes: cfg.plugins.memory_threshold_bytes,
        vault_secret: cfg.plugins.vault_secret.clone(),
        vault_quota_bytes: cfg.plugins.vault_quota_bytes,
        reload_grace_ms: cfg.plugins.reload_grace_ms,
        monitor_interval_ms: 1000,
        publish_permissions: cfg.plugins.publish_permissions.clone(),
    }
}

fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

// ── Remote commands ───────────────────────────────────────────────────────────

fn server_url(remote: Option<String>) -> String {
    remote.unwrap_or_else(|| "http://127.0.0.1:8090".to_string())
}

fn resolve_token(token: Option<String>) -> Result<String> {
    token.context("No token. Pass --token or set CORRAL_TOKEN.")
}

async fn api_get(url: &str, token: &str) -> Result<serde_json::Value> {
    let resp = reqwest::Client::new()
        .get(url)
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("Invalid JSON response")?;
    if !status.is_success() {
        anyhow::bail!("Server returned {}: {}", status, body);
    }
    Ok(body)
}

pub async fn status(remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let body = api_get(&format!("{}/status", server_url(remote)), &token).await?;
    print!("{}", output::render_status(&body));
    Ok(())
}

pub async fn verify(remote: Option<String>, token: Option<String>, limit: usize) -> Result<()> {
    let token = resolve_token(token)?;
    let body = api_get(
        &format!("{}/api/v1/audit/verify?limit={}", server_url(remote), limit),
        &token,
    )
    .await?;
    print!("{}", output::render_verify(&body));
    if body["data"]["valid"] != serde_json::Value::Bool(true) {
        anyhow::bail!("Audit chain verification failed");
    }
    Ok(())
}

pub async fn join(
    remote: Option<String>,
    token: Option<String>,
    hwid: String,
    hostname: String,
    persona: PersonaArg,
) -> Result<()> {
    let token = resolve_token(token)?;
    let persona = match persona {
        PersonaArg::Agent => "AGENT",
        PersonaArg::Gig => "GIG",
    };
    let url = format!("{}/api/v1/join", server_url(remote));
    let resp = reqwest::Client::new()
        .post(&url)
        .bearer_auth(&token)
        .json(&json!({ "hwid": hwid, "hostname": hostname, "persona": persona }))
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("Invalid JSON response")?;
    if !status.is_success() {
        anyhow::bail!("Join refused ({}): {}", status, body);
    }
    print!("{}", output::render_join(&body));
    Ok(())
}
