//! `set_connection` tool: batched link operations behind the two-phase
//! validator. Phase 1 is pure and vetoes the whole batch on the first
//! conflict; phase 2 applies the plan in list order and reports (never
//! rolls back) a mid-batch controller failure.

use gns_links::{LinkOp, PlannedOp, validate_operations};
use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Map, Value, json};

use crate::AppContext;
use crate::tools::{ToolOutcome, client_error, gns3, open_project};

pub async fn handle(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let raw_ops = args.get("operations").ok_or_else(|| {
        ErrorEnvelope::new(
            ErrorCode::MissingParameter,
            "required parameter 'operations' is missing",
        )
    })?;
    let ops: Vec<LinkOp> = serde_json::from_value(raw_ops.clone()).map_err(|e| {
        ErrorEnvelope::new(ErrorCode::InvalidParameter, "malformed operations list")
            .with_details(e.to_string())
    })?;
    if ops.is_empty() {
        return Err(ErrorEnvelope::new(
            ErrorCode::InvalidParameter,
            "operations list is empty",
        ));
    }

    let client = gns3(ctx)?;
    let project = open_project(&client).await?;
    let nodes = client.nodes(&project.project_id).await.map_err(client_error)?;
    let links = client.links(&project.project_id).await.map_err(client_error)?;

    // Phase 1: no side effects unless the whole batch validates.
    let planned = validate_operations(&nodes, &links, &ops).map_err(|failure| {
        let mut envelope = ErrorEnvelope::new(failure.error_code, failure.error.clone())
            .with_context("operation_index", json!(failure.operation_index));
        for (key, value) in failure.context {
            envelope = envelope.with_context(key, value);
        }
        envelope
    })?;

    // Phase 2: list order, stop-and-report on controller failure.
    let mut completed: Vec<Value> = Vec::with_capacity(planned.len());
    for (index, op) in planned.into_iter().enumerate() {
        let result = match &op {
            PlannedOp::Connect { a, b } => client
                .create_link(
                    &project.project_id,
                    &[
                        gns_proto::LinkEndpoint {
                            node_id: a.node_id.clone(),
                            adapter_number: a.adapter_number,
                            port_number: a.port_number,
                        },
                        gns_proto::LinkEndpoint {
                            node_id: b.node_id.clone(),
                            adapter_number: b.adapter_number,
                            port_number: b.port_number,
                        },
                    ],
                )
                .await
                .map(|link| json!({ "action": "connect", "link_id": link.link_id, "a": a, "b": b })),
            PlannedOp::Disconnect { link_id } => client
                .delete_link(&project.project_id, link_id)
                .await
                .map(|()| json!({ "action": "disconnect", "link_id": link_id })),
        };
        match result {
            Ok(entry) => completed.push(entry),
            Err(e) => {
                // Validation removes intra-batch conflicts, so landing here
                // means a race with an external change. Partial application
                // is reported, not rolled back.
                let reason = client_error(e);
                return Err(ErrorEnvelope::new(
                    ErrorCode::Gns3ApiError,
                    format!("batch stopped at operation {index}: {}", reason.error),
                )
                .with_details(reason.details.unwrap_or_default())
                .with_context("completed", json!(completed))
                .with_context("failed", json!({ "index": index, "reason": reason.error })));
            }
        }
    }

    Ok(json!({ "completed": completed }))
}
