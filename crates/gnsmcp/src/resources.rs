//! Read-only resources under the `gns3://` scheme.
//!
//! Browsing a resource never mutates anything: console buffers are peeked
//! without advancing diff offsets, and no request reaches a device.

use gns_console::ConsoleManager;
use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Value, json};

use crate::AppContext;
use crate::proxy_client::SshProxyClient;
use crate::tools::{ToolOutcome, client_error, console_error, gns3};

pub const SCHEME: &str = "gns3://";

/// The browsable roots. Deeper URIs (per-project, per-node) are reached by
/// following ids from these listings or via URI templates.
pub fn list() -> Vec<Value> {
    let entry = |uri: &str, name: &str, description: &str| {
        json!({
            "uri": uri,
            "name": name,
            "description": description,
            "mimeType": "application/json",
        })
    };
    vec![
        entry("gns3://projects", "Projects", "All projects on the controller"),
        entry(
            "gns3://sessions/console",
            "Console sessions",
            "Active telnet console sessions",
        ),
        entry(
            "gns3://sessions/ssh",
            "SSH sessions",
            "Active SSH sessions held by the proxy",
        ),
        entry("gns3://proxy/status", "Proxy status", "SSH proxy liveness and counters"),
        entry(
            "gns3://proxy/sessions",
            "Proxy sessions",
            "Session detail as reported by the proxy",
        ),
        entry(
            "gns3://proxy/registry",
            "Proxy registry",
            "Known peer proxies",
        ),
    ]
}

pub fn templates() -> Vec<Value> {
    let entry = |template: &str, name: &str| {
        json!({
            "uriTemplate": template,
            "name": name,
            "mimeType": "application/json",
        })
    };
    vec![
        entry("gns3://projects/{id}", "Project detail"),
        entry("gns3://projects/{id}/nodes", "Project nodes"),
        entry("gns3://projects/{id}/links", "Project links"),
        entry("gns3://projects/{id}/templates", "Available templates"),
        entry("gns3://projects/{id}/drawings", "Project drawings"),
        entry("gns3://projects/{id}/snapshots", "Project snapshots"),
        entry("gns3://sessions/console/{node}", "Console session detail"),
        entry("gns3://sessions/console/{node}/buffer", "Console buffer snapshot"),
        entry("gns3://sessions/ssh/{node}", "SSH session detail"),
        entry("gns3://sessions/ssh/{node}/history", "SSH job history"),
        entry("gns3://sessions/ssh/{node}/buffer", "SSH buffer snapshot"),
    ]
}

fn unknown_uri(uri: &str) -> ErrorEnvelope {
    ErrorEnvelope::new(
        ErrorCode::InvalidParameter,
        format!("unknown resource uri '{uri}'"),
    )
    .with_context(
        "known_roots",
        json!(["gns3://projects", "gns3://sessions/console", "gns3://sessions/ssh", "gns3://proxy"]),
    )
}

pub async fn read(ctx: &AppContext, uri: &str) -> ToolOutcome {
    let path = uri.strip_prefix(SCHEME).ok_or_else(|| unknown_uri(uri))?;
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match segments.as_slice() {
        ["projects"] => {
            let client = gns3(ctx)?;
            let projects = client.projects().await.map_err(client_error)?;
            Ok(json!({ "projects": projects }))
        }
        ["projects", id] => {
            let client = gns3(ctx)?;
            let project = client.project(id).await.map_err(client_error)?;
            Ok(json!({ "project": project }))
        }
        ["projects", id, "nodes"] => {
            let client = gns3(ctx)?;
            let nodes = client.nodes(id).await.map_err(client_error)?;
            Ok(json!({ "nodes": nodes }))
        }
        ["projects", id, "links"] => {
            let client = gns3(ctx)?;
            let links = client.links(id).await.map_err(client_error)?;
            Ok(json!({ "links": links }))
        }
        ["projects", _, "templates"] => {
            let client = gns3(ctx)?;
            let templates = client.templates().await.map_err(client_error)?;
            Ok(json!({ "templates": templates }))
        }
        ["projects", id, "drawings"] => {
            let client = gns3(ctx)?;
            let drawings = client.drawings(id).await.map_err(client_error)?;
            Ok(json!({ "drawings": drawings }))
        }
        ["projects", id, "snapshots"] => {
            let client = gns3(ctx)?;
            let snapshots = client.snapshots(id).await.map_err(client_error)?;
            Ok(json!({ "snapshots": snapshots }))
        }
        ["sessions", "console"] => {
            let consoles = ctx.registry.get::<ConsoleManager>();
            let sessions = consoles.status_all().await;
            Ok(json!({ "sessions": sessions }))
        }
        ["sessions", "console", node] => {
            let consoles = ctx.registry.get::<ConsoleManager>();
            let status = consoles.status(node).await.map_err(console_error)?;
            Ok(json!({ "session": status }))
        }
        ["sessions", "console", node, "buffer"] => {
            let consoles = ctx.registry.get::<ConsoleManager>();
            let content = consoles.peek(node).await.map_err(console_error)?;
            Ok(json!({ "node_name": node, "content": content }))
        }
        ["sessions", "ssh"] | ["proxy", "sessions"] => {
            let proxy = ctx.registry.get::<SshProxyClient>();
            proxy.status_all().await.map_err(|e| e.into_envelope())
        }
        ["sessions", "ssh", node] => {
            let proxy = ctx.registry.get::<SshProxyClient>();
            proxy.status(node).await.map_err(|e| e.into_envelope())
        }
        ["sessions", "ssh", node, "history"] => {
            let proxy = ctx.registry.get::<SshProxyClient>();
            proxy
                .history(node, None, None, None)
                .await
                .map_err(|e| e.into_envelope())
        }
        ["sessions", "ssh", node, "buffer"] => {
            let proxy = ctx.registry.get::<SshProxyClient>();
            proxy
                .read_buffer(node, "all", None)
                .await
                .map_err(|e| e.into_envelope())
        }
        ["proxy", "status"] => {
            let proxy = ctx.registry.get::<SshProxyClient>();
            proxy.proxy_status().await.map_err(|e| e.into_envelope())
        }
        ["proxy", "registry"] => {
            let proxy = ctx.registry.get::<SshProxyClient>();
            proxy.proxy_registry().await.map_err(|e| e.into_envelope())
        }
        _ => Err(unknown_uri(uri)),
    }
}
