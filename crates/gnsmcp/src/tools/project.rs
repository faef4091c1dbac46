//! `project` tool: list/open/create/close/delete lab projects.

use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Map, Value, json};

use crate::AppContext;
use crate::tools::{ToolOutcome, client_error, gns3, invalid_action, open_project, require_str};

const ACTIONS: &[&str] = &["list", "status", "open", "create", "close", "delete"];

pub async fn handle(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let client = gns3(ctx)?;

    match action {
        "list" => {
            let projects = client.projects().await.map_err(client_error)?;
            Ok(json!({ "projects": projects }))
        }
        "status" => {
            let projects = client.projects().await.map_err(client_error)?;
            let open = projects.iter().find(|p| p.is_open());
            Ok(json!({ "open_project": open, "project_count": projects.len() }))
        }
        "open" => {
            let name = require_str(args, "name")?;
            let projects = client.projects().await.map_err(client_error)?;
            let target = projects.iter().find(|p| p.name == name).ok_or_else(|| {
                ErrorEnvelope::new(
                    ErrorCode::ProjectNotFound,
                    format!("project '{name}' not found"),
                )
                .with_context(
                    "available_projects",
                    json!(projects.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()),
                )
            })?;
            // Opening an already-open project is a no-op on the controller,
            // which keeps this action idempotent.
            let opened = client
                .open_project(&target.project_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "project": opened }))
        }
        "create" => {
            let name = require_str(args, "name")?;
            let project = client.create_project(name).await.map_err(client_error)?;
            Ok(json!({ "project": project }))
        }
        "close" => {
            let current = open_project(&client).await?;
            let closed = client
                .close_project(&current.project_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "project": closed }))
        }
        "delete" => {
            let name = require_str(args, "name")?;
            let projects = client.projects().await.map_err(client_error)?;
            let target = projects.iter().find(|p| p.name == name).ok_or_else(|| {
                ErrorEnvelope::new(
                    ErrorCode::ProjectNotFound,
                    format!("project '{name}' not found"),
                )
                .with_context(
                    "available_projects",
                    json!(projects.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()),
                )
            })?;
            client
                .delete_project(&target.project_id)
                .await
                .map_err(client_error)?;
            Ok(json!({ "deleted": name }))
        }
        other => Err(invalid_action("project", other, ACTIONS)),
    }
}
