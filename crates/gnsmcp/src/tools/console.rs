//! `console` tool: telnet console access to lab nodes.

use std::time::Duration;

use gns_console::ConsoleManager;
use gns_proto::{ConsoleType, ErrorCode, ErrorEnvelope, Node, ReadMode};
use serde_json::{Map, Value, json};

use crate::AppContext;
use crate::tools::{
    ToolOutcome, console_error, gns3, invalid_action, open_project, optional_f64, optional_str,
    optional_u64, require_str, resolve_node,
};

const ACTIONS: &[&str] = &["send", "read", "send_and_wait", "status", "disconnect"];

/// Where to dial for a node's console. GNS3 reports `0.0.0.0` when the
/// console listens on every controller interface; substitute the
/// controller's own address.
fn console_endpoint(ctx: &AppContext, node: &Node) -> Result<(String, u16), ErrorEnvelope> {
    if node.console_type != ConsoleType::Telnet {
        return Err(ErrorEnvelope::new(
            ErrorCode::InvalidParameter,
            format!(
                "node '{}' has a {:?} console, not telnet",
                node.name, node.console_type
            ),
        )
        .with_context("console_type", json!(node.console_type)));
    }
    let port = node.console.ok_or_else(|| {
        ErrorEnvelope::new(
            ErrorCode::InvalidParameter,
            format!("node '{}' has no console port; is it started?", node.name),
        )
    })?;
    let host = match node.console_host.as_deref() {
        Some("0.0.0.0") | Some("::") | None => ctx.settings.gns3.host.clone(),
        Some(h) => h.to_string(),
    };
    Ok((host, port))
}

pub async fn handle(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let consoles = ctx.registry.get::<ConsoleManager>();

    match action {
        "send" => {
            let name = require_str(args, "node_name")?;
            let data = require_str(args, "data")?;
            let client = gns3(ctx)?;
            let project = open_project(&client).await?;
            let node = resolve_node(&client, &project.project_id, name).await?;
            let (host, port) = console_endpoint(ctx, &node)?;
            let outcome = consoles
                .send(name, &host, port, data.as_bytes())
                .await
                .map_err(console_error)?;
            Ok(json!({ "sent": outcome }))
        }
        "read" => {
            let name = require_str(args, "node_name")?;
            let mode_name = optional_str(args, "mode")?.unwrap_or("diff");
            let count = optional_u64(args, "count")?;
            let mode = ReadMode::parse(mode_name, count)
                .map_err(|e| ErrorEnvelope::new(ErrorCode::InvalidParameter, e))?;
            let output = consoles.read(name, mode).await.map_err(console_error)?;
            Ok(json!({ "node_name": name, "mode": mode_name, "output": output }))
        }
        "send_and_wait" => {
            let name = require_str(args, "node_name")?;
            let data = require_str(args, "data")?;
            let pattern = require_str(args, "wait_pattern")?;
            let timeout = optional_f64(args, "timeout")?.unwrap_or(30.0);
            if !(0.0..=600.0).contains(&timeout) {
                return Err(ErrorEnvelope::new(
                    ErrorCode::InvalidParameter,
                    "timeout must be between 0 and 600 seconds",
                ));
            }
            let client = gns3(ctx)?;
            let project = open_project(&client).await?;
            let node = resolve_node(&client, &project.project_id, name).await?;
            let (host, port) = console_endpoint(ctx, &node)?;
            let outcome = consoles
                .send_and_wait(
                    name,
                    &host,
                    port,
                    data.as_bytes(),
                    pattern,
                    Duration::from_secs_f64(timeout),
                )
                .await
                .map_err(console_error)?;
            Ok(json!({ "result": outcome }))
        }
        "status" => match optional_str(args, "node_name")? {
            Some(name) => {
                let status = consoles.status(name).await.map_err(console_error)?;
                Ok(json!({ "session": status }))
            }
            None => {
                let sessions = consoles.status_all().await;
                let count = sessions.len();
                Ok(json!({ "sessions": sessions, "count": count }))
            }
        },
        "disconnect" => {
            let name = require_str(args, "node_name")?;
            let closed = consoles.disconnect(name).await.map_err(console_error)?;
            Ok(json!({ "node_name": name, "closed": closed }))
        }
        other => Err(invalid_action("console", other, ACTIONS)),
    }
}
