//! GNS3 v3 REST client.
//!
//! Holds the controller connection settings and a bearer token obtained from
//! `POST /v3/access/users/authenticate`. Authentication never blocks server
//! startup: the client is constructed disconnected and a background loop
//! ([`Gns3Client::run_auth_loop`]) acquires the token with exponential
//! backoff, re-acquiring it ahead of expiry. A 401 mid-request triggers one
//! re-authentication and a single retry. GNS3 error payloads surface
//! verbatim so callers see the controller's own message, not a generic
//! status line.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use gns_config::Gns3Settings;
use gns_proto::{Drawing, Gns3Version, Link, LinkEndpoint, Node, Project, Snapshot, Template};
use parking_lot::{Mutex, RwLock};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("GNS3 unreachable at {host}:{port}: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("GNS3 authentication failed: {0}")]
    AuthFailed(String),

    #[error("GNS3 API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("GNS3 request timed out after {0:?}")]
    Timeout(Duration),
}

pub type ClientResult<T> = Result<T, ClientError>;

// ─── Connection state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed { last_error: String },
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed { .. } => "failed",
        }
    }
}

// ─── Tunables ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientTunables {
    /// Timeout for mutating calls.
    pub mutate_timeout: Duration,
    /// Timeout for listing calls.
    pub list_timeout: Duration,
    /// Re-authenticate this long after a successful auth, ahead of the
    /// controller's token expiry.
    pub refresh_interval: Duration,
    /// First backoff step of the auth loop.
    pub backoff_start: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
}

impl Default for ClientTunables {
    fn default() -> Self {
        Self {
            mutate_timeout: Duration::from_secs(10),
            list_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(45 * 60),
            backoff_start: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

/// Backoff ladder: 5s → 10s → 30s → 60s, then doubling to the cap.
fn next_backoff(current: Duration, cap: Duration) -> Duration {
    let next = match current.as_secs() {
        0..=5 => Duration::from_secs(10),
        6..=10 => Duration::from_secs(30),
        11..=30 => Duration::from_secs(60),
        _ => current * 2,
    };
    next.min(cap)
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientShared {
    token: RwLock<Option<String>>,
    state: Mutex<ConnectionState>,
    retry_now: Notify,
}

pub struct Gns3Client {
    http: reqwest::Client,
    settings: Gns3Settings,
    tunables: ClientTunables,
    shared: Arc<ClientShared>,
}

impl Gns3Client {
    pub fn new(settings: Gns3Settings) -> Self {
        Self::with_tunables(settings, ClientTunables::default())
    }

    pub fn with_tunables(settings: Gns3Settings, tunables: ClientTunables) -> Self {
        let mut builder = reqwest::Client::builder();
        if settings.use_tls && !settings.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Self {
            http: builder.build().expect("reqwest client"),
            settings,
            tunables,
            shared: Arc::new(ClientShared {
                token: RwLock::new(None),
                state: Mutex::new(ConnectionState::Disconnected),
                retry_now: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> &Gns3Settings {
        &self.settings
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }

    /// Wake the auth loop immediately, bypassing the backoff timer.
    pub fn retry_now(&self) {
        self.shared.retry_now.notify_one();
    }

    // ── authentication ────────────────────────────────────────────────────

    /// Acquire a bearer token. Updates the connection state either way.
    pub async fn authenticate(&self) -> ClientResult<()> {
        *self.shared.state.lock() = ConnectionState::Connecting;
        let url = format!("{}/access/users/authenticate", self.settings.base_url());

        let result = self
            .http
            .post(&url)
            .json(&json!({
                "username": self.settings.user,
                "password": self.settings.password,
            }))
            .timeout(self.tunables.mutate_timeout)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                let err = self.transport_error(e);
                *self.shared.state.lock() = ConnectionState::Failed {
                    last_error: err.to_string(),
                };
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = decode_error_message(response.text().await.unwrap_or_default());
            let err = if status == StatusCode::UNAUTHORIZED {
                ClientError::AuthFailed(message)
            } else {
                ClientError::Api {
                    status: status.as_u16(),
                    message,
                }
            };
            *self.shared.state.lock() = ConnectionState::Failed {
                last_error: err.to_string(),
            };
            return Err(err);
        }

        let body: Value = response.json().await.map_err(|e| ClientError::Api {
            status: status.as_u16(),
            message: format!("malformed authenticate response: {e}"),
        })?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| ClientError::AuthFailed("response carried no access_token".to_string()))?
            .to_string();

        *self.shared.token.write() = Some(token);
        *self.shared.state.lock() = ConnectionState::Connected;
        info!(host = %self.settings.host, port = self.settings.port, "authenticated to GNS3");
        Ok(())
    }

    /// Background task: keep a valid token at all times.
    ///
    /// Backoff 5s → 10s → 30s → 60s …, capped, reset on success. A
    /// `retry_now` wakes the loop out of any sleep. The refresh branch
    /// re-authenticates ahead of token expiry.
    pub async fn run_auth_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut delay = self.tunables.backoff_start;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.authenticate().await {
                Ok(()) => {
                    delay = self.tunables.backoff_start;
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = self.shared.retry_now.notified() => {
                            debug!("auth refresh requested");
                        }
                        _ = tokio::time::sleep(self.tunables.refresh_interval) => {
                            debug!("refreshing GNS3 token ahead of expiry");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?delay, "GNS3 authentication failed");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = self.shared.retry_now.notified() => {
                            debug!("retry requested, skipping backoff");
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = next_backoff(delay, self.tunables.backoff_cap);
                }
            }
        }
    }

    // ── request plumbing ──────────────────────────────────────────────────

    fn transport_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(self.tunables.mutate_timeout)
        } else {
            ClientError::Unreachable {
                host: self.settings.host.clone(),
                port: self.settings.port,
                reason: e.to_string(),
            }
        }
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> ClientResult<reqwest::Response> {
        let url = format!("{}{path}", self.settings.base_url());
        let mut request = self.http.request(method, &url).timeout(timeout);
        if let Some(token) = self.shared.token.read().as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(timeout)
            } else {
                ClientError::Unreachable {
                    host: self.settings.host.clone(),
                    port: self.settings.port,
                    reason: e.to_string(),
                }
            }
        })
    }

    /// Issue a request; on 401, re-authenticate once and retry. Idempotent
    /// GETs also get a bounded retry on transient 5xx.
    async fn request_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> ClientResult<reqwest::Response> {
        let mut response = self.execute(method.clone(), path, body.as_ref(), timeout).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(path, "token rejected, re-authenticating");
            self.authenticate().await?;
            response = self.execute(method.clone(), path, body.as_ref(), timeout).await?;
        }

        if method == Method::GET && response.status().is_server_error() {
            for _ in 0..2 {
                tokio::time::sleep(Duration::from_millis(250)).await;
                response = self.execute(Method::GET, path, None, timeout).await?;
                if !response.status().is_server_error() {
                    break;
                }
            }
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = decode_error_message(response.text().await.unwrap_or_default());
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let response = self
            .request_raw(Method::GET, path, None, self.tunables.list_timeout)
            .await?;
        response.json().await.map_err(|e| ClientError::Api {
            status: 200,
            message: format!("malformed response body: {e}"),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ClientResult<T> {
        let response = self
            .request_raw(method, path, body, self.tunables.mutate_timeout)
            .await?;
        response.json().await.map_err(|e| ClientError::Api {
            status: 200,
            message: format!("malformed response body: {e}"),
        })
    }

    async fn send_no_content(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ClientResult<()> {
        self.request_raw(method, path, body, self.tunables.mutate_timeout)
            .await
            .map(|_| ())
    }

    // ── version ───────────────────────────────────────────────────────────

    pub async fn version(&self) -> ClientResult<Gns3Version> {
        self.get("/version").await
    }

    // ── projects ──────────────────────────────────────────────────────────

    pub async fn projects(&self) -> ClientResult<Vec<Project>> {
        self.get("/projects").await
    }

    pub async fn project(&self, project_id: &str) -> ClientResult<Project> {
        self.get(&format!("/projects/{project_id}")).await
    }

    pub async fn open_project(&self, project_id: &str) -> ClientResult<Project> {
        self.send_json(Method::POST, &format!("/projects/{project_id}/open"), None)
            .await
    }

    pub async fn close_project(&self, project_id: &str) -> ClientResult<Project> {
        self.send_json(Method::POST, &format!("/projects/{project_id}/close"), None)
            .await
    }

    pub async fn create_project(&self, name: &str) -> ClientResult<Project> {
        self.send_json(Method::POST, "/projects", Some(json!({ "name": name })))
            .await
    }

    pub async fn delete_project(&self, project_id: &str) -> ClientResult<()> {
        self.send_no_content(Method::DELETE, &format!("/projects/{project_id}"), None)
            .await
    }

    // ── nodes ─────────────────────────────────────────────────────────────

    pub async fn nodes(&self, project_id: &str) -> ClientResult<Vec<Node>> {
        self.get(&format!("/projects/{project_id}/nodes")).await
    }

    pub async fn node(&self, project_id: &str, node_id: &str) -> ClientResult<Node> {
        self.get(&format!("/projects/{project_id}/nodes/{node_id}"))
            .await
    }

    /// Instantiate a template at the given canvas position.
    pub async fn create_node_from_template(
        &self,
        project_id: &str,
        template_id: &str,
        x: i32,
        y: i32,
    ) -> ClientResult<Node> {
        self.send_json(
            Method::POST,
            &format!("/projects/{project_id}/templates/{template_id}"),
            Some(json!({ "x": x, "y": y })),
        )
        .await
    }

    pub async fn update_node(
        &self,
        project_id: &str,
        node_id: &str,
        patch: Value,
    ) -> ClientResult<Node> {
        self.send_json(
            Method::PUT,
            &format!("/projects/{project_id}/nodes/{node_id}"),
            Some(patch),
        )
        .await
    }

    pub async fn delete_node(&self, project_id: &str, node_id: &str) -> ClientResult<()> {
        self.send_no_content(
            Method::DELETE,
            &format!("/projects/{project_id}/nodes/{node_id}"),
            None,
        )
        .await
    }

    /// `action` is one of `start`, `stop`, `suspend`, `reload`.
    pub async fn node_action(
        &self,
        project_id: &str,
        node_id: &str,
        action: &str,
    ) -> ClientResult<()> {
        self.send_no_content(
            Method::POST,
            &format!("/projects/{project_id}/nodes/{node_id}/{action}"),
            None,
        )
        .await
    }

    /// Start/stop every node in the project.
    pub async fn all_nodes_action(&self, project_id: &str, action: &str) -> ClientResult<()> {
        self.send_no_content(
            Method::POST,
            &format!("/projects/{project_id}/nodes/{action}"),
            None,
        )
        .await
    }

    // ── links ─────────────────────────────────────────────────────────────

    pub async fn links(&self, project_id: &str) -> ClientResult<Vec<Link>> {
        self.get(&format!("/projects/{project_id}/links")).await
    }

    pub async fn create_link(
        &self,
        project_id: &str,
        endpoints: &[LinkEndpoint],
    ) -> ClientResult<Link> {
        self.send_json(
            Method::POST,
            &format!("/projects/{project_id}/links"),
            Some(json!({ "nodes": endpoints })),
        )
        .await
    }

    pub async fn delete_link(&self, project_id: &str, link_id: &str) -> ClientResult<()> {
        self.send_no_content(
            Method::DELETE,
            &format!("/projects/{project_id}/links/{link_id}"),
            None,
        )
        .await
    }

    // ── templates ─────────────────────────────────────────────────────────

    pub async fn templates(&self) -> ClientResult<Vec<Template>> {
        self.get("/templates").await
    }

    // ── drawings ──────────────────────────────────────────────────────────

    pub async fn drawings(&self, project_id: &str) -> ClientResult<Vec<Drawing>> {
        self.get(&format!("/projects/{project_id}/drawings")).await
    }

    pub async fn create_drawing(&self, project_id: &str, drawing: Value) -> ClientResult<Drawing> {
        self.send_json(
            Method::POST,
            &format!("/projects/{project_id}/drawings"),
            Some(drawing),
        )
        .await
    }

    pub async fn update_drawing(
        &self,
        project_id: &str,
        drawing_id: &str,
        patch: Value,
    ) -> ClientResult<Drawing> {
        self.send_json(
            Method::PUT,
            &format!("/projects/{project_id}/drawings/{drawing_id}"),
            Some(patch),
        )
        .await
    }

    pub async fn delete_drawing(&self, project_id: &str, drawing_id: &str) -> ClientResult<()> {
        self.send_no_content(
            Method::DELETE,
            &format!("/projects/{project_id}/drawings/{drawing_id}"),
            None,
        )
        .await
    }

    // ── snapshots ─────────────────────────────────────────────────────────

    pub async fn snapshots(&self, project_id: &str) -> ClientResult<Vec<Snapshot>> {
        self.get(&format!("/projects/{project_id}/snapshots")).await
    }

    pub async fn create_snapshot(&self, project_id: &str, name: &str) -> ClientResult<Snapshot> {
        self.send_json(
            Method::POST,
            &format!("/projects/{project_id}/snapshots"),
            Some(json!({ "name": name })),
        )
        .await
    }

    pub async fn restore_snapshot(
        &self,
        project_id: &str,
        snapshot_id: &str,
    ) -> ClientResult<Project> {
        self.send_json(
            Method::POST,
            &format!("/projects/{project_id}/snapshots/{snapshot_id}/restore"),
            None,
        )
        .await
    }

    // ── node files (Docker nodes) ─────────────────────────────────────────

    pub async fn read_node_file(
        &self,
        project_id: &str,
        node_id: &str,
        path: &str,
    ) -> ClientResult<String> {
        let response = self
            .request_raw(
                Method::GET,
                &format!("/projects/{project_id}/nodes/{node_id}/files/{path}"),
                None,
                self.tunables.list_timeout,
            )
            .await?;
        response.text().await.map_err(|e| ClientError::Api {
            status: 200,
            message: format!("malformed file body: {e}"),
        })
    }

    pub async fn write_node_file(
        &self,
        project_id: &str,
        node_id: &str,
        path: &str,
        content: &str,
    ) -> ClientResult<()> {
        let url = format!(
            "{}/projects/{project_id}/nodes/{node_id}/files/{path}",
            self.settings.base_url()
        );
        let mut request = self
            .http
            .post(&url)
            .body(content.to_string())
            .timeout(self.tunables.mutate_timeout);
        if let Some(token) = self.shared.token.read().as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Api {
                status: status.as_u16(),
                message: decode_error_message(response.text().await.unwrap_or_default()),
            })
        }
    }
}

/// Pull the controller's own message out of a GNS3 error payload, falling
/// back to the raw body.
fn decode_error_message(body: String) -> String {
    match serde_json::from_str::<Value>(&body) {
        Ok(v) => v["message"]
            .as_str()
            .or_else(|| v["detail"].as_str())
            .map(str::to_string)
            .unwrap_or(body),
        Err(_) => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::routing::{get, post};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct StubState {
        auth_calls: Arc<AtomicUsize>,
        accept_password: &'static str,
    }

    async fn stub_authenticate(
        State(state): State<StubState>,
        axum::Json(body): axum::Json<Value>,
    ) -> (axum::http::StatusCode, axum::Json<Value>) {
        state.auth_calls.fetch_add(1, Ordering::SeqCst);
        if body["password"] == state.accept_password {
            (
                axum::http::StatusCode::OK,
                axum::Json(json!({ "access_token": "tok-1", "token_type": "bearer" })),
            )
        } else {
            (
                axum::http::StatusCode::UNAUTHORIZED,
                axum::Json(json!({ "message": "401: Invalid credentials" })),
            )
        }
    }

    async fn spawn_stub(accept_password: &'static str) -> (u16, Arc<AtomicUsize>) {
        let auth_calls = Arc::new(AtomicUsize::new(0));
        let state = StubState {
            auth_calls: auth_calls.clone(),
            accept_password,
        };
        let app = Router::new()
            .route("/v3/access/users/authenticate", post(stub_authenticate))
            .route(
                "/v3/projects",
                get(|| async {
                    axum::Json(json!([
                        { "project_id": "p-1", "name": "lab", "status": "opened" }
                    ]))
                }),
            )
            .route(
                "/v3/version",
                get(|| async { axum::Json(json!({ "version": "3.0.2", "local": true })) }),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (port, auth_calls)
    }

    fn client_for(port: u16, password: &str) -> Gns3Client {
        Gns3Client::new(Gns3Settings {
            host: "127.0.0.1".to_string(),
            port,
            user: "admin".to_string(),
            password: password.to_string(),
            use_tls: false,
            verify_tls: true,
        })
    }

    #[test]
    fn test_backoff_ladder() {
        let cap = Duration::from_secs(300);
        let mut d = Duration::from_secs(5);
        let mut seen = vec![d.as_secs()];
        for _ in 0..6 {
            d = next_backoff(d, cap);
            seen.push(d.as_secs());
        }
        assert_eq!(seen, vec![5, 10, 30, 60, 120, 240, 300]);
        assert_eq!(next_backoff(cap, cap), cap);
    }

    #[test]
    fn test_decode_error_message() {
        assert_eq!(
            decode_error_message(r#"{"message": "Node already started"}"#.to_string()),
            "Node already started"
        );
        assert_eq!(
            decode_error_message(r#"{"detail": "Not authenticated"}"#.to_string()),
            "Not authenticated"
        );
        assert_eq!(decode_error_message("plain text".to_string()), "plain text");
    }

    #[tokio::test]
    async fn test_starts_disconnected_then_authenticates() {
        let (port, auth_calls) = spawn_stub("secret").await;
        let client = client_for(port, "secret");
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        client.authenticate().await.expect("auth");
        assert!(client.is_connected());
        assert_eq!(auth_calls.load(Ordering::SeqCst), 1);

        let projects = client.projects().await.expect("projects");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "lab");
    }

    #[tokio::test]
    async fn test_bad_credentials_fail_with_controller_message() {
        let (port, _) = spawn_stub("secret").await;
        let client = client_for(port, "wrong");

        let err = client.authenticate().await.expect_err("rejected");
        match &err {
            ClientError::AuthFailed(msg) => assert!(msg.contains("Invalid credentials")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            client.connection_state(),
            ConnectionState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_controller() {
        let client = client_for(1, "secret");
        let err = client.authenticate().await.expect_err("unreachable");
        assert!(matches!(err, ClientError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let (port, _) = spawn_stub("secret").await;
        let client = client_for(port, "secret");
        client.authenticate().await.expect("auth");
        let version = client.version().await.expect("version");
        assert_eq!(version.version, "3.0.2");
    }

    #[tokio::test]
    async fn test_auth_loop_retries_until_reachable() {
        // Loop starts against a dead port; retry_now keeps it spinning fast,
        // then we point at nothing and just verify it stays alive and
        // cancelable.
        let client = Arc::new(client_for(1, "secret"));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(client.clone().run_auth_loop(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.is_connected());
        client.retry_now();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(true).expect("signal shutdown");
        client.retry_now();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits on shutdown")
            .expect("join");
    }
}
