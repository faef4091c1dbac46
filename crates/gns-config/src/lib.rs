//! Configuration for the gnsops server and SSH proxy.
//!
//! Everything is read from the environment once at startup; binaries layer
//! clap flags on top and CLI values win. Unset variables fall back to the
//! defaults documented on each field.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing::warn;

// ─── GNS3 endpoint ────────────────────────────────────────────────────────────

/// Connection settings for the GNS3 controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gns3Settings {
    /// `GNS3_HOST`, default `localhost`
    pub host: String,
    /// `GNS3_PORT`, default `3080`
    pub port: u16,
    /// `GNS3_USER`, default `admin`
    pub user: String,
    /// `GNS3_PASSWORD`, default empty
    pub password: String,
    /// `GNS3_USE_TLS`, default false
    pub use_tls: bool,
    /// `GNS3_VERIFY_TLS`, default true (only consulted when TLS is on)
    pub verify_tls: bool,
}

impl Gns3Settings {
    /// Base URL including the `/v3` API prefix.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}/v3", self.host, self.port)
    }
}

impl Default for Gns3Settings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3080,
            user: "admin".to_string(),
            password: String::new(),
            use_tls: false,
            verify_tls: true,
        }
    }
}

// ─── Transport ────────────────────────────────────────────────────────────────

/// How the MCP surface is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" | "sse" => Ok(Self::Http),
            other => Err(format!("unknown transport '{other}' (expected stdio or http)")),
        }
    }
}

// ─── Session tunables ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTunables {
    /// `SESSION_IDLE_TIMEOUT_SECS`, default 1800 (30 minutes)
    pub idle_timeout_secs: u64,
    /// `SESSION_SWEEP_INTERVAL_SECS`, default 300 (5 minutes)
    pub sweep_interval_secs: u64,
    /// `SESSION_BUFFER_CAP_BYTES`, default 10 MiB
    pub buffer_cap_bytes: usize,
    /// `SESSION_BUFFER_TRIM_BYTES`, default 5 MiB
    pub buffer_trim_bytes: usize,
    /// `SESSION_PAGE_LINES`, default 50
    pub page_lines: usize,
    /// `SSH_JOB_HISTORY_CAP`, default 1000 per session
    pub job_history_cap: usize,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            sweep_interval_secs: 300,
            buffer_cap_bytes: 10 * 1024 * 1024,
            buffer_trim_bytes: 5 * 1024 * 1024,
            page_lines: 50,
            job_history_cap: 1000,
        }
    }
}

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub gns3: Gns3Settings,
    /// `MCP_TRANSPORT`, default stdio
    pub transport: Transport,
    /// `MCP_LISTEN_HOST`, default `127.0.0.1` (HTTP transport only)
    pub listen_host: String,
    /// `MCP_LISTEN_PORT`, default 8000 (HTTP transport only)
    pub listen_port: u16,
    /// `SSH_PROXY_URL`, default `http://localhost:8022`
    pub ssh_proxy_url: String,
    /// `LOG_LEVEL`, default `info`
    pub log_level: String,
    pub session: SessionTunables,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gns3: Gns3Settings::default(),
            transport: Transport::Stdio,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8000,
            ssh_proxy_url: "http://localhost:8022".to_string(),
            log_level: "info".to_string(),
            session: SessionTunables::default(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function (testable).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let session_defaults = SessionTunables::default();

        Self {
            gns3: Gns3Settings {
                host: get("GNS3_HOST").unwrap_or(defaults.gns3.host),
                port: parse_or(&get, "GNS3_PORT", defaults.gns3.port),
                user: get("GNS3_USER").unwrap_or(defaults.gns3.user),
                password: get("GNS3_PASSWORD").unwrap_or_default(),
                use_tls: parse_or(&get, "GNS3_USE_TLS", false),
                verify_tls: parse_or(&get, "GNS3_VERIFY_TLS", true),
            },
            transport: get("MCP_TRANSPORT")
                .and_then(|v| match v.parse() {
                    Ok(t) => Some(t),
                    Err(e) => {
                        warn!(error = %e, "ignoring MCP_TRANSPORT");
                        None
                    }
                })
                .unwrap_or(defaults.transport),
            listen_host: get("MCP_LISTEN_HOST").unwrap_or(defaults.listen_host),
            listen_port: parse_or(&get, "MCP_LISTEN_PORT", defaults.listen_port),
            ssh_proxy_url: get("SSH_PROXY_URL").unwrap_or(defaults.ssh_proxy_url),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            session: SessionTunables {
                idle_timeout_secs: parse_or(
                    &get,
                    "SESSION_IDLE_TIMEOUT_SECS",
                    session_defaults.idle_timeout_secs,
                ),
                sweep_interval_secs: parse_or(
                    &get,
                    "SESSION_SWEEP_INTERVAL_SECS",
                    session_defaults.sweep_interval_secs,
                ),
                buffer_cap_bytes: parse_or(
                    &get,
                    "SESSION_BUFFER_CAP_BYTES",
                    session_defaults.buffer_cap_bytes,
                ),
                buffer_trim_bytes: parse_or(
                    &get,
                    "SESSION_BUFFER_TRIM_BYTES",
                    session_defaults.buffer_trim_bytes,
                ),
                page_lines: parse_or(&get, "SESSION_PAGE_LINES", session_defaults.page_lines),
                job_history_cap: parse_or(
                    &get,
                    "SSH_JOB_HISTORY_CAP",
                    session_defaults.job_history_cap,
                ),
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable value, using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults_without_env() {
        let s = Settings::from_lookup(|_| None);
        assert_eq!(s.gns3.host, "localhost");
        assert_eq!(s.gns3.port, 3080);
        assert_eq!(s.gns3.user, "admin");
        assert!(!s.gns3.use_tls);
        assert_eq!(s.transport, Transport::Stdio);
        assert_eq!(s.ssh_proxy_url, "http://localhost:8022");
        assert_eq!(s.session.idle_timeout_secs, 1800);
        assert_eq!(s.session.sweep_interval_secs, 300);
        assert_eq!(s.session.job_history_cap, 1000);
    }

    #[test]
    fn test_env_overrides() {
        let vars = [
            ("GNS3_HOST", "gns3.lab"),
            ("GNS3_PORT", "3081"),
            ("GNS3_USE_TLS", "true"),
            ("MCP_TRANSPORT", "http"),
            ("MCP_LISTEN_PORT", "9000"),
            ("SESSION_IDLE_TIMEOUT_SECS", "60"),
        ];
        let s = Settings::from_lookup(lookup(&vars));
        assert_eq!(s.gns3.host, "gns3.lab");
        assert_eq!(s.gns3.port, 3081);
        assert!(s.gns3.use_tls);
        assert_eq!(s.transport, Transport::Http);
        assert_eq!(s.listen_port, 9000);
        assert_eq!(s.session.idle_timeout_secs, 60);
    }

    #[test]
    fn test_unparseable_falls_back() {
        let vars = [("GNS3_PORT", "not-a-port"), ("MCP_TRANSPORT", "carrier-pigeon")];
        let s = Settings::from_lookup(lookup(&vars));
        assert_eq!(s.gns3.port, 3080);
        assert_eq!(s.transport, Transport::Stdio);
    }

    #[test]
    fn test_base_url_scheme() {
        let mut g = Gns3Settings::default();
        assert_eq!(g.base_url(), "http://localhost:3080/v3");
        g.use_tls = true;
        g.host = "gns3.lab".to_string();
        assert_eq!(g.base_url(), "https://gns3.lab:3080/v3");
    }
}
