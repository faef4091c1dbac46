//! gns-sshproxy — SSH proxy service.
//!
//! Runs next to the simulator and owns the SSH sessions to lab devices so
//! the MCP server can stay off the management network. Exposes the session
//! manager over a small JSON REST surface (default port 8022) and sweeps
//! idle sessions in the background. All state is in-memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use clap::Parser;
use gns_proto::{DeviceSpec, ErrorCode, ErrorEnvelope, ReadMode};
use gns_ssh::{CleanupScope, CommandOptions, SshError, SshSessionManager, SshTunables};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "gns-sshproxy")]
#[command(about = "SSH proxy service for lab device sessions")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0", env = "SSH_PROXY_HOST")]
    host: String,

    /// Listen port
    #[arg(long, default_value = "8022", env = "SSH_PROXY_PORT")]
    port: u16,

    /// Close sessions idle longer than this many seconds
    #[arg(long, default_value = "1800", env = "SESSION_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: u64,

    /// Idle sweep cadence in seconds
    #[arg(long, default_value = "300", env = "SESSION_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Comma-separated peer proxy URLs for /proxy/registry
    #[arg(long, env = "SSH_PROXY_PEERS")]
    peers: Option<String>,
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ProxyState {
    manager: Arc<SshSessionManager>,
    started_at: Instant,
    peers: Arc<Vec<String>>,
}

// ─── Error mapping ────────────────────────────────────────────────────────────

struct ProxyError(SshError);

impl From<SshError> for ProxyError {
    fn from(e: SshError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, envelope) = match &self.0 {
            SshError::SessionNotFound(node) => (
                StatusCode::NOT_FOUND,
                ErrorEnvelope::new(ErrorCode::SessionNotFound, self.0.to_string())
                    .with_context("node", json!(node))
                    .with_suggested_action("POST /ssh/configure to establish a session"),
            ),
            SshError::JobNotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorEnvelope::new(ErrorCode::JobNotFound, self.0.to_string())
                    .with_context("job_id", json!(id)),
            ),
            SshError::ConnectionFailed(failure) => (
                StatusCode::BAD_GATEWAY,
                ErrorEnvelope::new(ErrorCode::SshConnectionFailed, self.0.to_string())
                    .with_suggested_action(failure.kind.suggested_action())
                    .with_context("failure_kind", json!(failure.kind.as_str()))
                    .with_context("host", json!(failure.host))
                    .with_context("port", json!(failure.port)),
            ),
            SshError::InvalidPattern(_) => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope::new(ErrorCode::InvalidParameter, self.0.to_string()),
            ),
            SshError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorEnvelope::new(ErrorCode::InternalError, self.0.to_string()),
            ),
        };
        (status, Json(envelope.to_value())).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorEnvelope::new(ErrorCode::InvalidParameter, message).to_value()),
    )
        .into_response()
}

// ─── Request bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConfigureBody {
    node_name: String,
    device: DeviceSpec,
    #[serde(default = "default_true")]
    persist: bool,
    #[serde(default)]
    force_recreate: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SendCommandBody {
    node_name: String,
    command: String,
    #[serde(default)]
    read_timeout: Option<u64>,
    #[serde(default)]
    expect_string: Option<String>,
    /// Seconds to wait synchronously; 0 returns a job id immediately.
    #[serde(default)]
    wait_timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ConfigSetBody {
    node_name: String,
    commands: Vec<String>,
    #[serde(default)]
    read_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CleanupBody {
    scope: String,
    #[serde(default)]
    known_nodes: Vec<String>,
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn configure(
    State(state): State<ProxyState>,
    Json(body): Json<ConfigureBody>,
) -> Result<Json<Value>, ProxyError> {
    let outcome = state
        .manager
        .configure(&body.node_name, body.device, body.persist, body.force_recreate)
        .await?;
    Ok(Json(json!({ "ok": true, "session": outcome })))
}

async fn send_command(
    State(state): State<ProxyState>,
    Json(body): Json<SendCommandBody>,
) -> Result<Json<Value>, ProxyError> {
    // Default is a short synchronous wait; callers opt into async with 0.
    let wait_secs = body.wait_timeout.unwrap_or(30.0);
    let options = CommandOptions {
        read_timeout: body.read_timeout.map(Duration::from_secs),
        expect_string: body.expect_string,
        wait_timeout: Duration::from_secs_f64(wait_secs.max(0.0)),
    };
    let outcome = state
        .manager
        .send_command(&body.node_name, &body.command, options)
        .await?;
    Ok(Json(json!({ "ok": true, "result": outcome })))
}

async fn send_config_set(
    State(state): State<ProxyState>,
    Json(body): Json<ConfigSetBody>,
) -> Result<Json<Value>, ProxyError> {
    let job = state
        .manager
        .send_config_set(
            &body.node_name,
            body.commands,
            body.read_timeout.map(Duration::from_secs),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "job": job })))
}

async fn status_all(State(state): State<ProxyState>) -> Json<Value> {
    let sessions = state.manager.status_all().await;
    Json(json!({ "ok": true, "sessions": sessions }))
}

async fn status_one(
    State(state): State<ProxyState>,
    Path(node): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let status = state.manager.session_status(&node).await?;
    Ok(Json(json!({ "ok": true, "session": status })))
}

async fn read_buffer(
    State(state): State<ProxyState>,
    Path(node): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ProxyError> {
    let mode_name = params.get("mode").map(String::as_str).unwrap_or("diff");
    let count = params.get("count").and_then(|v| v.parse().ok());
    let mode = match ReadMode::parse(mode_name, count) {
        Ok(mode) => mode,
        Err(e) => return Ok(bad_request(e)),
    };
    let output = state.manager.read_buffer(&node, mode).await?;
    Ok(Json(json!({ "ok": true, "node_name": node, "output": output })).into_response())
}

async fn history(
    State(state): State<ProxyState>,
    Path(node): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ProxyError> {
    let limit = params.get("limit").and_then(|v| v.parse().ok());
    let search = params.get("search").map(String::as_str);
    let since = params
        .get("since")
        .and_then(|v| v.parse::<chrono::DateTime<chrono::Utc>>().ok());
    let jobs = state.manager.get_history(&node, limit, search, since).await?;
    Ok(Json(json!({ "ok": true, "node_name": node, "jobs": jobs })))
}

async fn job_status(
    State(state): State<ProxyState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let report = state.manager.get_job_status(&job_id).await?;
    Ok(Json(json!({ "ok": true, "job": report })))
}

async fn cleanup(
    State(state): State<ProxyState>,
    Json(body): Json<CleanupBody>,
) -> Result<Response, ProxyError> {
    let scope = match body.scope.as_str() {
        "orphaned" => CleanupScope::Orphaned,
        "all" => CleanupScope::All,
        other => {
            return Ok(bad_request(format!(
                "unknown cleanup scope '{other}' (expected orphaned or all)"
            )));
        }
    };
    let removed = state.manager.cleanup(scope, &body.known_nodes).await;
    Ok(Json(json!({ "ok": true, "removed": removed })).into_response())
}

async fn proxy_status(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "session_count": state.manager.session_count().await,
    }))
}

async fn proxy_registry(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({ "ok": true, "peers": *state.peers }))
}

// ─── Router / main ────────────────────────────────────────────────────────────

fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/ssh/configure", post(configure))
        .route("/ssh/send_command", post(send_command))
        .route("/ssh/send_config_set", post(send_config_set))
        .route("/ssh/status", get(status_all))
        .route("/ssh/status/:node", get(status_one))
        .route("/ssh/buffer/:node", get(read_buffer))
        .route("/ssh/history/:node", get(history))
        .route("/ssh/job/:id", get(job_status))
        .route("/ssh/cleanup", post(cleanup))
        .route("/proxy/status", get(proxy_status))
        .route("/proxy/registry", get(proxy_registry))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("gns_sshproxy=info".parse()?))
        .init();

    let manager = Arc::new(SshSessionManager::new(SshTunables::default()));
    let peers: Vec<String> = cli
        .peers
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let state = ProxyState {
        manager: manager.clone(),
        started_at: Instant::now(),
        peers: Arc::new(peers),
    };

    // Idle sweeper, cancelable at shutdown.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let sweeper = {
        let manager = manager.clone();
        let idle = Duration::from_secs(cli.idle_timeout_secs);
        let interval = Duration::from_secs(cli.sweep_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let closed = manager.sweep_idle(idle).await;
                if !closed.is_empty() {
                    info!(closed = closed.len(), "idle sweep closed ssh sessions");
                }
            }
        })
    };

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gns-sshproxy listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "signal handler failed");
            }
        })
        .await?;

    // Guaranteed release: every session closed before exit.
    let _ = shutdown_tx.send(true);
    sweeper.abort();
    let closed = manager.disconnect_all().await;
    info!(closed, "shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_proxy() -> String {
        let manager = Arc::new(SshSessionManager::default());
        let state = ProxyState {
            manager,
            started_at: Instant::now(),
            peers: Arc::new(vec!["http://peer1:8022".to_string()]),
        };
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_proxy_status_and_registry() {
        let base = spawn_proxy().await;
        let client = reqwest::Client::new();

        let status: Value = client
            .get(format!("{base}/proxy/status"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(status["ok"], true);
        assert_eq!(status["session_count"], 0);

        let registry: Value = client
            .get(format!("{base}/proxy/registry"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(registry["peers"][0], "http://peer1:8022");
    }

    #[tokio::test]
    async fn test_missing_session_returns_envelope() {
        let base = spawn_proxy().await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("{base}/ssh/buffer/ghost"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 404);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["error_code"], "SESSION_NOT_FOUND");
        assert!(body["error"].is_string());
        assert!(body["server_version"].is_string());
    }

    #[tokio::test]
    async fn test_bad_read_mode_is_invalid_parameter() {
        let base = spawn_proxy().await;
        let client = reqwest::Client::new();

        // Mode parsing runs before the session lookup.
        let response = client
            .get(format!("{base}/ssh/buffer/ghost?mode=bogus"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["error_code"], "INVALID_PARAMETER");
    }

    #[tokio::test]
    async fn test_unknown_job_returns_job_not_found() {
        let base = spawn_proxy().await;
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{base}/ssh/job/nope"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 404);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["error_code"], "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cleanup_scope_validation() {
        let base = spawn_proxy().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/ssh/cleanup"))
            .json(&json!({ "scope": "everything" }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 400);

        let response = client
            .post(format!("{base}/ssh/cleanup"))
            .json(&json!({ "scope": "all" }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["removed"], json!([]));
    }
}
