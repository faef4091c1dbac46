//! HTTP client for the SSH proxy service.
//!
//! The proxy owns the actual device sessions; this client forwards the
//! `ssh` tool's actions and passes proxy error envelopes through verbatim
//! so the caller sees the classified failure, not a generic transport
//! message.

use std::time::Duration;

use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum ProxyClientError {
    #[error("SSH proxy unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    /// The proxy answered with an error envelope; surface it as-is.
    #[error("proxy returned an error envelope")]
    Envelope(Value),
}

impl ProxyClientError {
    pub fn into_envelope(self) -> ErrorEnvelope {
        match self {
            Self::Unreachable { url, reason } => {
                ErrorEnvelope::new(ErrorCode::SshProxyUnreachable, "SSH proxy is unreachable")
                    .with_details(reason)
                    .with_context("proxy_url", json!(url))
                    .with_suggested_action(
                        "start gns-sshproxy on the simulator host or fix SSH_PROXY_URL",
                    )
            }
            Self::Envelope(value) => match serde_json::from_value(value.clone()) {
                Ok(envelope) => envelope,
                Err(_) => ErrorEnvelope::new(ErrorCode::SshProxyUnreachable, "malformed proxy error")
                    .with_details(value.to_string()),
            },
        }
    }
}

pub type ProxyResult = Result<Value, ProxyClientError>;

pub struct SshProxyClient {
    http: reqwest::Client,
    base_url: String,
}

impl SshProxyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, body: Value, timeout: Duration) -> ProxyResult {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ProxyClientError::Unreachable {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;
        Self::decode(response).await
    }

    async fn get(&self, path: &str) -> ProxyResult {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ProxyClientError::Unreachable {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> ProxyResult {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            Ok(body)
        } else {
            Err(ProxyClientError::Envelope(body))
        }
    }

    // ── ssh endpoints ─────────────────────────────────────────────────────

    pub async fn configure(&self, body: Value) -> ProxyResult {
        // Establishing a session includes the device dial; give it room.
        self.post("/ssh/configure", body, Duration::from_secs(60)).await
    }

    pub async fn send_command(&self, body: Value, wait_secs: f64) -> ProxyResult {
        // The HTTP timeout must outlive the synchronous wait budget.
        let timeout = Duration::from_secs_f64(wait_secs.max(0.0) + 30.0);
        self.post("/ssh/send_command", body, timeout).await
    }

    pub async fn send_config_set(&self, body: Value) -> ProxyResult {
        self.post("/ssh/send_config_set", body, Duration::from_secs(120)).await
    }

    pub async fn status_all(&self) -> ProxyResult {
        self.get("/ssh/status").await
    }

    pub async fn status(&self, node: &str) -> ProxyResult {
        self.get(&format!("/ssh/status/{node}")).await
    }

    pub async fn read_buffer(&self, node: &str, mode: &str, count: Option<u64>) -> ProxyResult {
        let query = match count {
            Some(n) => format!("?mode={mode}&count={n}"),
            None => format!("?mode={mode}"),
        };
        self.get(&format!("/ssh/buffer/{node}{query}")).await
    }

    pub async fn history(
        &self,
        node: &str,
        limit: Option<u64>,
        search: Option<&str>,
        since: Option<&str>,
    ) -> ProxyResult {
        let mut query = vec![];
        if let Some(n) = limit {
            query.push(format!("limit={n}"));
        }
        if let Some(s) = search {
            query.push(format!("search={s}"));
        }
        if let Some(t) = since {
            query.push(format!("since={t}"));
        }
        let suffix = if query.is_empty() {
            String::new()
        } else {
            format!("?{}", query.join("&"))
        };
        self.get(&format!("/ssh/history/{node}{suffix}")).await
    }

    pub async fn job_status(&self, job_id: &str) -> ProxyResult {
        self.get(&format!("/ssh/job/{job_id}")).await
    }

    pub async fn cleanup(&self, scope: &str, known_nodes: &[String]) -> ProxyResult {
        self.post(
            "/ssh/cleanup",
            json!({ "scope": scope, "known_nodes": known_nodes }),
            Duration::from_secs(60),
        )
        .await
    }

    // ── proxy introspection ───────────────────────────────────────────────

    pub async fn proxy_status(&self) -> ProxyResult {
        self.get("/proxy/status").await
    }

    pub async fn proxy_registry(&self) -> ProxyResult {
        self.get("/proxy/registry").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = SshProxyClient::new("http://localhost:8022/");
        assert_eq!(client.base_url(), "http://localhost:8022");
    }

    #[tokio::test]
    async fn test_unreachable_maps_to_envelope() {
        let client = SshProxyClient::new("http://127.0.0.1:1");
        let err = client.proxy_status().await.expect_err("unreachable");
        let envelope = err.into_envelope();
        assert_eq!(envelope.error_code, ErrorCode::SshProxyUnreachable);
        assert!(envelope.suggested_action.is_some());
    }

    #[test]
    fn test_envelope_passthrough() {
        let upstream = ErrorEnvelope::new(ErrorCode::SessionNotFound, "no SSH session for 'R1'")
            .to_value();
        let err = ProxyClientError::Envelope(upstream);
        let envelope = err.into_envelope();
        assert_eq!(envelope.error_code, ErrorCode::SessionNotFound);
        assert!(envelope.error.contains("R1"));
    }
}
