//! `node` tool: lifecycle, placement, and configuration of lab nodes.

use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Map, Value, json};

use crate::AppContext;
use crate::tools::{
    ToolOutcome, client_error, gns3, invalid_action, open_project, optional_bool, optional_i64,
    optional_str, require_str, resolve_node,
};

const ACTIONS: &[&str] = &[
    "list", "status", "start", "stop", "suspend", "reload", "start_all", "stop_all", "create",
    "delete", "configure",
];

pub async fn handle(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let client = gns3(ctx)?;
    let project = open_project(&client).await?;

    match action {
        "list" => {
            let nodes = client.nodes(&project.project_id).await.map_err(client_error)?;
            let summary: Vec<Value> = nodes
                .iter()
                .map(|n| {
                    json!({
                        "name": n.name,
                        "node_id": n.node_id,
                        "node_type": n.node_type,
                        "status": n.status,
                        "console": n.console,
                        "console_type": n.console_type,
                    })
                })
                .collect();
            Ok(json!({ "project": project.name, "nodes": summary }))
        }
        "status" => {
            let name = require_str(args, "name")?;
            let node = resolve_node(&client, &project.project_id, name).await?;
            Ok(json!({ "node": node }))
        }
        "start" | "stop" | "suspend" | "reload" => {
            let name = require_str(args, "name")?;
            let node = resolve_node(&client, &project.project_id, name).await?;
            client
                .node_action(&project.project_id, &node.node_id, action)
                .await
                .map_err(client_error)?;
            // Re-read so the caller sees the post-action state.
            let node = client
                .node(&project.project_id, &node.node_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "action": action, "node": node }))
        }
        "start_all" | "stop_all" => {
            let verb = action.trim_end_matches("_all");
            client
                .all_nodes_action(&project.project_id, verb)
                .await
                .map_err(client_error)?;
            Ok(json!({ "action": action, "project": project.name }))
        }
        "create" => {
            let template_name = require_str(args, "template")?;
            let x = optional_i64(args, "x")?.unwrap_or(0) as i32;
            let y = optional_i64(args, "y")?.unwrap_or(0) as i32;

            let templates = client.templates().await.map_err(client_error)?;
            let template = templates
                .iter()
                .find(|t| t.name == template_name)
                .ok_or_else(|| {
                    ErrorEnvelope::new(
                        ErrorCode::TemplateNotFound,
                        format!("template '{template_name}' not found"),
                    )
                    .with_context(
                        "available_templates",
                        json!(templates.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()),
                    )
                })?;
            let node = client
                .create_node_from_template(&project.project_id, &template.template_id, x, y)
                .await
                .map_err(client_error)?;
            Ok(json!({ "node": node }))
        }
        "delete" => {
            let name = require_str(args, "name")?;
            let node = resolve_node(&client, &project.project_id, name).await?;
            client
                .delete_node(&project.project_id, &node.node_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "deleted": name }))
        }
        "configure" => {
            let name = require_str(args, "name")?;
            let node = resolve_node(&client, &project.project_id, name).await?;

            let mut patch = Map::new();
            if let Some(new_name) = optional_str(args, "new_name")? {
                patch.insert("name".to_string(), json!(new_name));
            }
            for key in ["x", "y", "z"] {
                if let Some(v) = optional_i64(args, key)? {
                    patch.insert(key.to_string(), json!(v));
                }
            }
            if let Some(locked) = optional_bool(args, "locked")? {
                patch.insert("locked".to_string(), json!(locked));
            }
            if patch.is_empty() {
                return Err(ErrorEnvelope::new(
                    ErrorCode::MissingParameter,
                    "configure needs at least one of new_name, x, y, z, locked",
                ));
            }
            let renamed = patch.contains_key("name");
            let node = client
                .update_node(&project.project_id, &node.node_id, Value::Object(patch))
                .await
                .map_err(client_error)?;
            // Sessions are keyed by node name, so a rename evicts the old
            // console session.
            if renamed {
                let consoles = ctx.registry.get::<gns_console::ConsoleManager>();
                let _ = consoles.disconnect(name).await;
            }
            Ok(json!({ "node": node, "sessions_invalidated": renamed }))
        }
        other => Err(invalid_action("node", other, ACTIONS)),
    }
}
