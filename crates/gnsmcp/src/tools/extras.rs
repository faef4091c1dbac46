//! Remaining tools: drawings, snapshots, node files, topology export,
//! search, resource queries, and controller connection management.

use gns_client::Gns3Client;
use gns_console::ConsoleManager;
use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Map, Value, json};

use crate::AppContext;
use crate::proxy_client::SshProxyClient;
use crate::tools::{
    ToolOutcome, client_error, gns3, invalid_action, open_project, optional_i64, optional_str,
    optional_u64, require_str,
};

// ─── drawing ──────────────────────────────────────────────────────────────────

const DRAWING_ACTIONS: &[&str] = &["list", "create", "update", "delete"];

/// Build an SVG document from shape parameters. Callers can also pass raw
/// `svg` and skip this entirely.
fn build_svg(args: &Map<String, Value>) -> Result<String, ErrorEnvelope> {
    let shape = require_str(args, "shape")?;
    let width = optional_u64(args, "width")?.unwrap_or(100);
    let height = optional_u64(args, "height")?.unwrap_or(100);
    let fill = optional_str(args, "fill")?.unwrap_or("#ffffff");
    let stroke = optional_str(args, "stroke")?.unwrap_or("#000000");

    let svg = match shape {
        "rect" => format!(
            r#"<svg width="{width}" height="{height}"><rect width="{width}" height="{height}" fill="{fill}" stroke="{stroke}" stroke-width="2"/></svg>"#
        ),
        "ellipse" => format!(
            r#"<svg width="{width}" height="{height}"><ellipse cx="{}" cy="{}" rx="{}" ry="{}" fill="{fill}" stroke="{stroke}" stroke-width="2"/></svg>"#,
            width / 2,
            height / 2,
            width / 2,
            height / 2,
        ),
        "line" => format!(
            r#"<svg width="{width}" height="{height}"><line x1="0" y1="0" x2="{width}" y2="{height}" stroke="{stroke}" stroke-width="2"/></svg>"#
        ),
        "text" => {
            let text = require_str(args, "text")?;
            let font_size = optional_u64(args, "font_size")?.unwrap_or(14);
            let escaped = text
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            format!(
                r#"<svg width="{width}" height="{height}"><text x="0" y="{font_size}" font-family="TypeWriter" font-size="{font_size}" fill="{stroke}">{escaped}</text></svg>"#
            )
        }
        other => {
            return Err(ErrorEnvelope::new(
                ErrorCode::InvalidParameter,
                format!("unknown shape '{other}'"),
            )
            .with_context("valid_shapes", json!(["rect", "ellipse", "line", "text"])));
        }
    };
    Ok(svg)
}

pub async fn drawing(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let client = gns3(ctx)?;
    let project = open_project(&client).await?;

    match action {
        "list" => {
            let drawings = client
                .drawings(&project.project_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "drawings": drawings }))
        }
        "create" => {
            let svg = match optional_str(args, "svg")? {
                Some(raw) => raw.to_string(),
                None => build_svg(args)?,
            };
            let body = json!({
                "svg": svg,
                "x": optional_i64(args, "x")?.unwrap_or(0),
                "y": optional_i64(args, "y")?.unwrap_or(0),
                "z": optional_i64(args, "z")?.unwrap_or(0),
            });
            let created = client
                .create_drawing(&project.project_id, body)
                .await
                .map_err(client_error)?;
            Ok(json!({ "drawing": created }))
        }
        "update" => {
            let drawing_id = require_str(args, "drawing_id")?;
            let mut patch = Map::new();
            if let Some(svg) = optional_str(args, "svg")? {
                patch.insert("svg".to_string(), json!(svg));
            }
            for key in ["x", "y", "z", "rotation"] {
                if let Some(v) = optional_i64(args, key)? {
                    patch.insert(key.to_string(), json!(v));
                }
            }
            if patch.is_empty() {
                return Err(ErrorEnvelope::new(
                    ErrorCode::MissingParameter,
                    "update needs at least one of svg, x, y, z, rotation",
                ));
            }
            let updated = client
                .update_drawing(&project.project_id, drawing_id, Value::Object(patch))
                .await
                .map_err(client_error)?;
            Ok(json!({ "drawing": updated }))
        }
        "delete" => {
            let drawing_id = require_str(args, "drawing_id")?;
            client
                .delete_drawing(&project.project_id, drawing_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "deleted": drawing_id }))
        }
        other => Err(invalid_action("drawing", other, DRAWING_ACTIONS)),
    }
}

// ─── snapshot ─────────────────────────────────────────────────────────────────

const SNAPSHOT_ACTIONS: &[&str] = &["list", "create", "restore"];

pub async fn snapshot(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let client = gns3(ctx)?;
    let project = open_project(&client).await?;

    match action {
        "list" => {
            let snapshots = client
                .snapshots(&project.project_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "snapshots": snapshots }))
        }
        "create" => {
            let name = require_str(args, "name")?;
            let created = client
                .create_snapshot(&project.project_id, name)
                .await
                .map_err(client_error)?;
            Ok(json!({ "snapshot": created }))
        }
        "restore" => {
            let name = require_str(args, "name")?;
            let snapshots = client
                .snapshots(&project.project_id)
                .await
                .map_err(client_error)?;
            let target = snapshots.iter().find(|s| s.name == name).ok_or_else(|| {
                ErrorEnvelope::new(
                    ErrorCode::SnapshotNotFound,
                    format!("snapshot '{name}' not found"),
                )
                .with_context(
                    "available_snapshots",
                    json!(snapshots.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()),
                )
            })?;
            let restored = client
                .restore_snapshot(&project.project_id, &target.snapshot_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "restored": name, "project": restored }))
        }
        other => Err(invalid_action("snapshot", other, SNAPSHOT_ACTIONS)),
    }
}

// ─── node_file ────────────────────────────────────────────────────────────────

const NODE_FILE_ACTIONS: &[&str] = &["read", "write"];

pub async fn node_file(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let name = require_str(args, "node_name")?;
    let path = require_str(args, "path")?;
    if path.starts_with('/') || path.contains("..") {
        return Err(ErrorEnvelope::new(
            ErrorCode::InvalidParameter,
            "path must be relative and must not contain '..'",
        ));
    }

    let client = gns3(ctx)?;
    let project = open_project(&client).await?;
    let node = crate::tools::resolve_node(&client, &project.project_id, name).await?;

    match action {
        "read" => {
            let content = client
                .read_node_file(&project.project_id, &node.node_id, path)
                .await
                .map_err(|e| match e {
                    gns_client::ClientError::Api { status: 404, message } => ErrorEnvelope::new(
                        ErrorCode::FileNotFound,
                        format!("file '{path}' not found on '{name}'"),
                    )
                    .with_details(message),
                    other => client_error(other),
                })?;
            Ok(json!({ "node_name": name, "path": path, "content": content }))
        }
        "write" => {
            let content = require_str(args, "content")?;
            client
                .write_node_file(&project.project_id, &node.node_id, path, content)
                .await
                .map_err(client_error)?;
            Ok(json!({ "node_name": name, "path": path, "bytes": content.len() }))
        }
        other => Err(invalid_action("node_file", other, NODE_FILE_ACTIONS)),
    }
}

// ─── export_topology ──────────────────────────────────────────────────────────

pub async fn export_topology(ctx: &AppContext, _args: &Map<String, Value>) -> ToolOutcome {
    let client = gns3(ctx)?;
    let project = open_project(&client).await?;
    let nodes = client.nodes(&project.project_id).await.map_err(client_error)?;
    let links = client.links(&project.project_id).await.map_err(client_error)?;
    let drawings = client
        .drawings(&project.project_id)
        .await
        .map_err(client_error)?;

    // Ill-formed links stay visible for cleanup.
    let malformed: Vec<&str> = links
        .iter()
        .filter(|l| !l.is_well_formed())
        .map(|l| l.link_id.as_str())
        .collect();

    Ok(json!({
        "project": project,
        "nodes": nodes,
        "links": links,
        "drawings": drawings,
        "malformed_links": malformed,
    }))
}

// ─── search ───────────────────────────────────────────────────────────────────

pub async fn search(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let query = require_str(args, "query")?;
    let scope = optional_str(args, "scope")?.unwrap_or("all");
    if !["all", "nodes", "console", "ssh"].contains(&scope) {
        return Err(ErrorEnvelope::new(
            ErrorCode::InvalidParameter,
            format!("unknown search scope '{scope}'"),
        )
        .with_context("valid_scopes", json!(["all", "nodes", "console", "ssh"])));
    }
    let needle = query.to_lowercase();
    let mut result = Map::new();

    if matches!(scope, "all" | "nodes") {
        match gns3(ctx) {
            Ok(client) => {
                let project = open_project(&client).await?;
                let nodes = client.nodes(&project.project_id).await.map_err(client_error)?;
                let hits: Vec<Value> = nodes
                    .iter()
                    .filter(|n| n.name.to_lowercase().contains(&needle))
                    .map(|n| json!({ "name": n.name, "node_type": n.node_type, "status": n.status }))
                    .collect();
                result.insert("nodes".to_string(), json!(hits));
            }
            Err(e) => {
                result.insert("nodes_error".to_string(), json!(e.error));
            }
        }
    }

    if matches!(scope, "all" | "console") {
        let consoles = ctx.registry.get::<ConsoleManager>();
        let mut hits = Vec::new();
        for status in consoles.status_all().await {
            if let Ok(text) = consoles.peek(&status.node_name).await {
                let count = text.to_lowercase().matches(&needle).count();
                if count > 0 {
                    hits.push(json!({ "node_name": status.node_name, "matches": count }));
                }
            }
        }
        result.insert("console_buffers".to_string(), json!(hits));
    }

    if matches!(scope, "all" | "ssh") {
        let proxy = ctx.registry.get::<SshProxyClient>();
        match proxy.status_all().await {
            Ok(body) => {
                let mut hits = Vec::new();
                let sessions = body["sessions"].as_array().cloned().unwrap_or_default();
                for session in sessions {
                    let Some(node) = session["node_name"].as_str() else {
                        continue;
                    };
                    if let Ok(read) = proxy.read_buffer(node, "all", None).await {
                        let count = read["output"]
                            .as_str()
                            .map(|t| t.to_lowercase().matches(&needle).count())
                            .unwrap_or(0);
                        if count > 0 {
                            hits.push(json!({ "node_name": node, "matches": count }));
                        }
                    }
                }
                result.insert("ssh_buffers".to_string(), json!(hits));
            }
            Err(e) => {
                result.insert("ssh_error".to_string(), json!(e.into_envelope().error));
            }
        }
    }

    result.insert("query".to_string(), json!(query));
    Ok(Value::Object(result))
}

// ─── query_resource ───────────────────────────────────────────────────────────

pub async fn query_resource(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let uri = require_str(args, "uri")?;
    crate::resources::read(ctx, uri).await
}

// ─── gns3_connection ──────────────────────────────────────────────────────────

const CONNECTION_ACTIONS: &[&str] = &["status", "retry", "version"];

pub async fn gns3_connection(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let client = ctx.registry.get::<Gns3Client>();

    match action {
        "status" => Ok(json!({
            "connection_state": client.connection_state().label(),
            "host": client.settings().host,
            "port": client.settings().port,
            "use_tls": client.settings().use_tls,
        })),
        "retry" => {
            // Returns immediately; the auth loop picks the request up.
            client.retry_now();
            Ok(json!({
                "retry_requested": true,
                "connection_state": client.connection_state().label(),
            }))
        }
        "version" => {
            let client = gns3(ctx)?;
            let version = client.version().await.map_err(client_error)?;
            Ok(json!({ "gns3_version": version }))
        }
        other => Err(invalid_action("gns3_connection", other, CONNECTION_ACTIONS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().expect("object").clone()
    }

    #[test]
    fn test_build_svg_rect() {
        let svg = build_svg(&args(json!({
            "shape": "rect", "width": 200, "height": 80, "fill": "#e0e0e0"
        })))
        .expect("svg");
        assert!(svg.contains("<rect"));
        assert!(svg.contains(r#"width="200""#));
        assert!(svg.contains("#e0e0e0"));
    }

    #[test]
    fn test_build_svg_text_escapes_markup() {
        let svg = build_svg(&args(json!({
            "shape": "text", "text": "<core> & edge"
        })))
        .expect("svg");
        assert!(svg.contains("&lt;core&gt; &amp; edge"));
        assert!(!svg.contains("<core>"));
    }

    #[test]
    fn test_build_svg_rejects_unknown_shape() {
        let err = build_svg(&args(json!({ "shape": "hexagon" }))).expect_err("unknown");
        assert_eq!(err.error_code, ErrorCode::InvalidParameter);
    }
}
