//! Tool handlers.
//!
//! Every handler follows the same contract: resolve collaborators from the
//! registry, validate parameters, assert project/node scope, execute, and
//! shape the result as JSON. Failures are returned as error envelopes —
//! handlers never panic for runtime conditions.

pub mod console;
pub mod extras;
pub mod link;
pub mod node;
pub mod project;
pub mod ssh;

use std::sync::Arc;

use gns_client::{ClientError, Gns3Client};
use gns_console::ConsoleError;
use gns_proto::{ErrorCode, ErrorEnvelope, Node, Project};
use serde_json::{Map, Value, json};

use crate::AppContext;

pub type ToolOutcome = Result<Value, ErrorEnvelope>;

// ─── Parameter validation ─────────────────────────────────────────────────────

pub fn require_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ErrorEnvelope> {
    match args.get(key) {
        None | Some(Value::Null) => Err(ErrorEnvelope::new(
            ErrorCode::MissingParameter,
            format!("required parameter '{key}' is missing"),
        )
        .with_context("parameter", json!(key))),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(wrong_type(key, "string", other)),
    }
}

pub fn optional_str<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, ErrorEnvelope> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(wrong_type(key, "string", other)),
    }
}

pub fn optional_u64(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, ErrorEnvelope> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| wrong_type(key, "non-negative integer", v)),
    }
}

pub fn optional_i64(args: &Map<String, Value>, key: &str) -> Result<Option<i64>, ErrorEnvelope> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| wrong_type(key, "integer", v)),
    }
}

pub fn optional_f64(args: &Map<String, Value>, key: &str) -> Result<Option<f64>, ErrorEnvelope> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| wrong_type(key, "number", v)),
    }
}

pub fn optional_bool(args: &Map<String, Value>, key: &str) -> Result<Option<bool>, ErrorEnvelope> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(wrong_type(key, "boolean", other)),
    }
}

fn wrong_type(key: &str, expected: &str, got: &Value) -> ErrorEnvelope {
    ErrorEnvelope::new(
        ErrorCode::InvalidParameter,
        format!("parameter '{key}' must be a {expected}"),
    )
    .with_context("parameter", json!(key))
    .with_context("received", got.clone())
}

pub fn invalid_action(tool: &str, action: &str, valid: &[&str]) -> ErrorEnvelope {
    ErrorEnvelope::new(
        ErrorCode::InvalidAction,
        format!("unknown {tool} action '{action}'"),
    )
    .with_context("valid_actions", json!(valid))
}

// ─── Scope resolution ─────────────────────────────────────────────────────────

/// The GNS3 client, gated on connection state. Until the background auth
/// loop acquires a token, every controller-backed tool reports unreachable
/// with enough context to retry.
pub fn gns3(ctx: &AppContext) -> Result<Arc<Gns3Client>, ErrorEnvelope> {
    let client = ctx.registry.get::<Gns3Client>();
    if client.is_connected() {
        Ok(client)
    } else {
        let state = client.connection_state();
        Err(ErrorEnvelope::new(
            ErrorCode::Gns3Unreachable,
            "GNS3 controller is not connected",
        )
        .with_context("host", json!(client.settings().host))
        .with_context("port", json!(client.settings().port))
        .with_context("connection_state", json!(state.label()))
        .with_suggested_action(
            "check that GNS3 is running, then gns3_connection(action=retry)",
        ))
    }
}

/// The currently opened project (project-scoped tools assert one exists).
pub async fn open_project(client: &Gns3Client) -> Result<Project, ErrorEnvelope> {
    let projects = client.projects().await.map_err(client_error)?;
    projects
        .iter()
        .find(|p| p.is_open())
        .cloned()
        .ok_or_else(|| {
            ErrorEnvelope::new(ErrorCode::ProjectNotFound, "no project is open")
                .with_context(
                    "available_projects",
                    json!(projects.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()),
                )
                .with_suggested_action("project(action=open, name=...) first")
        })
}

/// Resolve a node by case-sensitive name; a miss lists every node name.
pub async fn resolve_node(
    client: &Gns3Client,
    project_id: &str,
    name: &str,
) -> Result<Node, ErrorEnvelope> {
    let nodes = client.nodes(project_id).await.map_err(client_error)?;
    nodes.iter().find(|n| n.name == name).cloned().ok_or_else(|| {
        ErrorEnvelope::new(ErrorCode::NodeNotFound, format!("node '{name}' not found"))
            .with_context(
                "available_nodes",
                json!(nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>()),
            )
    })
}

// ─── Error mapping ────────────────────────────────────────────────────────────

pub fn client_error(e: ClientError) -> ErrorEnvelope {
    match e {
        ClientError::Unreachable { host, port, reason } => {
            ErrorEnvelope::new(ErrorCode::Gns3Unreachable, "GNS3 controller is unreachable")
                .with_details(reason)
                .with_context("host", json!(host))
                .with_context("port", json!(port))
        }
        ClientError::AuthFailed(message) => ErrorEnvelope::new(
            ErrorCode::AuthenticationFailed,
            "GNS3 rejected the configured credentials",
        )
        .with_details(message)
        .with_suggested_action("check GNS3_USER / GNS3_PASSWORD"),
        ClientError::Timeout(duration) => ErrorEnvelope::new(
            ErrorCode::Timeout,
            format!("GNS3 request timed out after {duration:?}"),
        ),
        ClientError::Api { status, message } => {
            ErrorEnvelope::new(ErrorCode::Gns3ApiError, format!("GNS3 API error ({status})"))
                .with_details(message)
                .with_context("status", json!(status))
        }
    }
}

pub fn console_error(e: ConsoleError) -> ErrorEnvelope {
    match e {
        ConsoleError::ConnectionFailed { host, port, reason } => ErrorEnvelope::new(
            ErrorCode::ConsoleConnectionFailed,
            format!("could not reach the console at {host}:{port}"),
        )
        .with_details(reason)
        .with_context("host", json!(host))
        .with_context("port", json!(port))
        .with_suggested_action("check the node is started and has a telnet console"),
        ConsoleError::Disconnected(node) => ErrorEnvelope::new(
            ErrorCode::ConsoleDisconnected,
            format!("console session for '{node}' lost its connection"),
        )
        .with_context("node", json!(node))
        .with_suggested_action("send again to auto-reconnect"),
        ConsoleError::SessionNotFound(node) => ErrorEnvelope::new(
            ErrorCode::SessionNotFound,
            format!("no console session for '{node}'"),
        )
        .with_context("node", json!(node))
        .with_suggested_action("console(action=send) auto-connects"),
        ConsoleError::PatternTimeout {
            pattern,
            timeout_secs,
            partial,
        } => ErrorEnvelope::new(
            ErrorCode::Timeout,
            format!("pattern '{pattern}' not matched within {timeout_secs:.1}s"),
        )
        .with_details(partial)
        .with_context("pattern", json!(pattern)),
        ConsoleError::InvalidPattern(e) => {
            ErrorEnvelope::new(ErrorCode::InvalidParameter, format!("invalid wait pattern: {e}"))
        }
        ConsoleError::Io(e) => {
            ErrorEnvelope::new(ErrorCode::InternalError, "console io failure").with_details(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().expect("object").clone()
    }

    #[test]
    fn test_require_str() {
        let a = args(json!({ "name": "R1", "count": 3 }));
        assert_eq!(require_str(&a, "name").expect("present"), "R1");

        let missing = require_str(&a, "absent").expect_err("missing");
        assert_eq!(missing.error_code, ErrorCode::MissingParameter);

        let wrong = require_str(&a, "count").expect_err("wrong type");
        assert_eq!(wrong.error_code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn test_optional_extractors() {
        let a = args(json!({ "x": 5, "flag": true, "ratio": 1.5, "s": "v" }));
        assert_eq!(optional_u64(&a, "x").expect("u64"), Some(5));
        assert_eq!(optional_i64(&a, "x").expect("i64"), Some(5));
        assert_eq!(optional_bool(&a, "flag").expect("bool"), Some(true));
        assert_eq!(optional_f64(&a, "ratio").expect("f64"), Some(1.5));
        assert_eq!(optional_str(&a, "s").expect("str"), Some("v"));
        assert_eq!(optional_u64(&a, "none").expect("absent"), None);
        assert!(optional_u64(&a, "s").is_err());
        assert!(optional_bool(&a, "x").is_err());
    }

    #[test]
    fn test_invalid_action_lists_valid_ones() {
        let envelope = invalid_action("project", "explode", &["list", "open"]);
        assert_eq!(envelope.error_code, ErrorCode::InvalidAction);
        let v = envelope.to_value();
        assert_eq!(v["context"]["valid_actions"][0], "list");
    }

    #[test]
    fn test_client_error_mapping() {
        let e = client_error(ClientError::Api {
            status: 409,
            message: "Node already started".to_string(),
        });
        assert_eq!(e.error_code, ErrorCode::Gns3ApiError);
        assert_eq!(e.details.as_deref(), Some("Node already started"));

        let e = client_error(ClientError::Unreachable {
            host: "gns3.lab".to_string(),
            port: 3080,
            reason: "connection refused".to_string(),
        });
        assert_eq!(e.error_code, ErrorCode::Gns3Unreachable);
        let v = e.to_value();
        assert_eq!(v["context"]["host"], "gns3.lab");
        assert_eq!(v["context"]["port"], 3080);
    }

    #[test]
    fn test_console_error_mapping() {
        let e = console_error(ConsoleError::SessionNotFound("R1".to_string()));
        assert_eq!(e.error_code, ErrorCode::SessionNotFound);

        let e = console_error(ConsoleError::PatternTimeout {
            pattern: "#".to_string(),
            timeout_secs: 5.0,
            partial: "partial text".to_string(),
        });
        assert_eq!(e.error_code, ErrorCode::Timeout);
        assert_eq!(e.details.as_deref(), Some("partial text"));
    }
}
