//! The fixed tool catalog: names, schemas, annotations, and dispatch.
//!
//! Dispatch is a registry of named handlers keyed by string — the tool name
//! is data, not a method. Unknown names come back as validation envelopes,
//! never as transport errors.

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::AppContext;
use crate::tools;

// ─── Annotations ──────────────────────────────────────────────────────────────

/// Behavioral tags clients use to gate confirmations.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ToolAnnotations {
    pub read_only: bool,
    pub destructive: bool,
    pub idempotent: bool,
    pub creates_resource: bool,
    pub modifies_topology: bool,
}

impl ToolAnnotations {
    const fn read_only() -> Self {
        Self {
            read_only: true,
            destructive: false,
            idempotent: true,
            creates_resource: false,
            modifies_topology: false,
        }
    }

    const fn idempotent() -> Self {
        Self {
            read_only: false,
            destructive: false,
            idempotent: true,
            creates_resource: false,
            modifies_topology: false,
        }
    }

    const fn topology() -> Self {
        Self {
            read_only: false,
            destructive: false,
            idempotent: false,
            creates_resource: true,
            modifies_topology: true,
        }
    }

    const fn destructive() -> Self {
        Self {
            read_only: false,
            destructive: true,
            idempotent: false,
            creates_resource: false,
            modifies_topology: true,
        }
    }
}

// ─── Specs ────────────────────────────────────────────────────────────────────

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub annotations: ToolAnnotations,
    schema: fn() -> Value,
}

fn action_schema(actions: &[&str], extra_properties: Value) -> Value {
    let mut properties = Map::new();
    properties.insert(
        "action".to_string(),
        json!({ "type": "string", "enum": actions }),
    );
    if let Value::Object(extra) = extra_properties {
        properties.extend(extra);
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": ["action"],
    })
}

pub const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "project",
        description: "Manage GNS3 projects: list, open, create, close, delete",
        annotations: ToolAnnotations::idempotent(),
        schema: || {
            action_schema(
                &["list", "status", "open", "create", "close", "delete"],
                json!({ "name": { "type": "string" } }),
            )
        },
    },
    ToolSpec {
        name: "node",
        description: "Manage nodes in the open project: lifecycle, creation from template, placement",
        annotations: ToolAnnotations::idempotent(),
        schema: || {
            action_schema(
                &[
                    "list", "status", "start", "stop", "suspend", "reload", "start_all",
                    "stop_all", "create", "delete", "configure",
                ],
                json!({
                    "name": { "type": "string" },
                    "template": { "type": "string" },
                    "new_name": { "type": "string" },
                    "x": { "type": "integer" },
                    "y": { "type": "integer" },
                    "z": { "type": "integer" },
                    "locked": { "type": "boolean" },
                }),
            )
        },
    },
    ToolSpec {
        name: "set_connection",
        description: "Batch connect/disconnect links; the whole batch is validated before anything is applied",
        annotations: ToolAnnotations::topology(),
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "operations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "action": { "type": "string", "enum": ["connect", "disconnect"] },
                                "a": { "type": "object" },
                                "b": { "type": "object" },
                                "link_id": { "type": "string" },
                            },
                            "required": ["action"],
                        },
                    },
                },
                "required": ["operations"],
            })
        },
    },
    ToolSpec {
        name: "console",
        description: "Telnet console access: send, buffered reads, pattern waits",
        annotations: ToolAnnotations::read_only(),
        schema: || {
            action_schema(
                &["send", "read", "send_and_wait", "status", "disconnect"],
                json!({
                    "node_name": { "type": "string" },
                    "data": { "type": "string" },
                    "mode": { "type": "string", "enum": ["diff", "last_page", "pages", "all", "tail"] },
                    "count": { "type": "integer" },
                    "wait_pattern": { "type": "string" },
                    "timeout": { "type": "number" },
                }),
            )
        },
    },
    ToolSpec {
        name: "ssh",
        description: "SSH device access through the proxy: sessions, commands, jobs, history",
        annotations: ToolAnnotations::idempotent(),
        schema: || {
            action_schema(
                &[
                    "configure", "send_command", "send_config_set", "get_status",
                    "get_history", "get_job_status", "read_buffer", "cleanup",
                ],
                json!({
                    "node_name": { "type": "string" },
                    "host": { "type": "string" },
                    "port": { "type": "integer" },
                    "username": { "type": "string" },
                    "password": { "type": "string" },
                    "device_type": { "type": "string" },
                    "command": { "type": "string" },
                    "commands": { "type": "array", "items": { "type": "string" } },
                    "wait_timeout": { "type": "number" },
                    "read_timeout": { "type": "integer" },
                    "expect_string": { "type": "string" },
                    "job_id": { "type": "string" },
                    "mode": { "type": "string" },
                    "count": { "type": "integer" },
                    "limit": { "type": "integer" },
                    "search": { "type": "string" },
                    "since": { "type": "string" },
                    "scope": { "type": "string", "enum": ["orphaned", "all"] },
                    "persist": { "type": "boolean" },
                    "force_recreate": { "type": "boolean" },
                }),
            )
        },
    },
    ToolSpec {
        name: "drawing",
        description: "Annotate the canvas with SVG drawings",
        annotations: ToolAnnotations::topology(),
        schema: || {
            action_schema(
                &["list", "create", "update", "delete"],
                json!({
                    "svg": { "type": "string" },
                    "shape": { "type": "string", "enum": ["rect", "ellipse", "line", "text"] },
                    "text": { "type": "string" },
                    "drawing_id": { "type": "string" },
                    "x": { "type": "integer" },
                    "y": { "type": "integer" },
                    "z": { "type": "integer" },
                    "width": { "type": "integer" },
                    "height": { "type": "integer" },
                }),
            )
        },
    },
    ToolSpec {
        name: "snapshot",
        description: "Project snapshots: list, create, restore",
        annotations: ToolAnnotations::destructive(),
        schema: || {
            action_schema(
                &["list", "create", "restore"],
                json!({ "name": { "type": "string" } }),
            )
        },
    },
    ToolSpec {
        name: "node_file",
        description: "Read or write files inside Docker nodes",
        annotations: ToolAnnotations::idempotent(),
        schema: || {
            action_schema(
                &["read", "write"],
                json!({
                    "node_name": { "type": "string" },
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                }),
            )
        },
    },
    ToolSpec {
        name: "export_topology",
        description: "Export the open project (nodes, links, drawings) as one JSON document",
        annotations: ToolAnnotations::read_only(),
        schema: || json!({ "type": "object", "properties": {} }),
    },
    ToolSpec {
        name: "search",
        description: "Search node names and console/SSH output buffers",
        annotations: ToolAnnotations::read_only(),
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "scope": { "type": "string", "enum": ["all", "nodes", "console", "ssh"] },
                },
                "required": ["query"],
            })
        },
    },
    ToolSpec {
        name: "query_resource",
        description: "Fetch any gns3:// resource URI (for clients without resource support)",
        annotations: ToolAnnotations::read_only(),
        schema: || {
            json!({
                "type": "object",
                "properties": { "uri": { "type": "string" } },
                "required": ["uri"],
            })
        },
    },
    ToolSpec {
        name: "gns3_connection",
        description: "Controller connection state, immediate retry, and version",
        annotations: ToolAnnotations::read_only(),
        schema: || {
            action_schema(&["status", "retry", "version"], json!({}))
        },
    },
];

/// Tool list in MCP shape.
pub fn list_tools() -> Vec<Value> {
    TOOLS
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
                "inputSchema": (spec.schema)(),
                "annotations": spec.annotations,
            })
        })
        .collect()
}

/// Run a tool. Returns the JSON payload and whether it is an error
/// envelope; the transport layer never sees a Rust error from here.
pub async fn dispatch(ctx: &AppContext, name: &str, args: &Map<String, Value>) -> (Value, bool) {
    debug!(tool = name, "dispatching tool call");

    let outcome = match name {
        "project" => tools::project::handle(ctx, args).await,
        "node" => tools::node::handle(ctx, args).await,
        "set_connection" => tools::link::handle(ctx, args).await,
        "console" => tools::console::handle(ctx, args).await,
        "ssh" => tools::ssh::handle(ctx, args).await,
        "drawing" => tools::extras::drawing(ctx, args).await,
        "snapshot" => tools::extras::snapshot(ctx, args).await,
        "node_file" => tools::extras::node_file(ctx, args).await,
        "export_topology" => tools::extras::export_topology(ctx, args).await,
        "search" => tools::extras::search(ctx, args).await,
        "query_resource" => tools::extras::query_resource(ctx, args).await,
        "gns3_connection" => tools::extras::gns3_connection(ctx, args).await,
        unknown => Err(gns_proto::ErrorEnvelope::new(
            gns_proto::ErrorCode::InvalidParameter,
            format!("unknown tool '{unknown}'"),
        )
        .with_context(
            "available_tools",
            json!(TOOLS.iter().map(|t| t.name).collect::<Vec<_>>()),
        )),
    };

    match outcome {
        Ok(payload) => (payload, false),
        Err(envelope) => (envelope.to_value(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_unique() {
        let mut names: Vec<&str> = TOOLS.iter().map(|t| t.name).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn test_every_tool_has_schema_and_description() {
        for tool in list_tools() {
            assert!(tool["name"].is_string());
            assert!(!tool["description"].as_str().expect("description").is_empty());
            assert_eq!(tool["inputSchema"]["type"], "object");
            assert!(tool["annotations"].is_object());
        }
    }

    #[test]
    fn test_mutating_tools_are_flagged() {
        let spec = |name: &str| TOOLS.iter().find(|t| t.name == name).expect("tool");
        assert!(spec("set_connection").annotations.modifies_topology);
        assert!(spec("snapshot").annotations.destructive);
        assert!(spec("export_topology").annotations.read_only);
        assert!(spec("query_resource").annotations.read_only);
        assert!(!spec("console").annotations.modifies_topology);
    }
}
