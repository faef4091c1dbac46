//! `ssh` tool: device CLI access through the SSH proxy service.
//!
//! The proxy owns the sessions; this handler validates parameters, shapes
//! the request body, and passes the proxy's own error envelopes through
//! untouched so classified failures (auth vs refused vs unreachable) reach
//! the caller intact.

use gns_proto::{ErrorCode, ErrorEnvelope};
use serde_json::{Map, Value, json};

use crate::AppContext;
use crate::proxy_client::SshProxyClient;
use crate::tools::{
    ToolOutcome, client_error, gns3, invalid_action, open_project, optional_bool, optional_f64,
    optional_str, optional_u64, require_str,
};

const ACTIONS: &[&str] = &[
    "configure",
    "send_command",
    "send_config_set",
    "get_status",
    "get_history",
    "get_job_status",
    "read_buffer",
    "cleanup",
];

pub async fn handle(ctx: &AppContext, args: &Map<String, Value>) -> ToolOutcome {
    let action = require_str(args, "action")?;
    let proxy = ctx.registry.get::<SshProxyClient>();

    let result = match action {
        "configure" => {
            let node = require_str(args, "node_name")?;
            let host = require_str(args, "host")?;
            let username = require_str(args, "username")?;
            let password = require_str(args, "password")?;
            let device = json!({
                "device_type": optional_str(args, "device_type")?.unwrap_or("linux"),
                "host": host,
                "port": optional_u64(args, "port")?.unwrap_or(22),
                "username": username,
                "password": password,
                "secret": optional_str(args, "secret")?,
                "key_file": optional_str(args, "key_file")?,
                "timeout": optional_u64(args, "timeout")?,
            });
            proxy
                .configure(json!({
                    "node_name": node,
                    "device": device,
                    "persist": optional_bool(args, "persist")?.unwrap_or(true),
                    "force_recreate": optional_bool(args, "force_recreate")?.unwrap_or(false),
                }))
                .await
        }
        "send_command" => {
            let node = require_str(args, "node_name")?;
            let command = require_str(args, "command")?;
            let wait_timeout = optional_f64(args, "wait_timeout")?.unwrap_or(30.0);
            if wait_timeout < 0.0 {
                return Err(ErrorEnvelope::new(
                    ErrorCode::InvalidParameter,
                    "wait_timeout must not be negative",
                ));
            }
            proxy
                .send_command(
                    json!({
                        "node_name": node,
                        "command": command,
                        "read_timeout": optional_u64(args, "read_timeout")?,
                        "expect_string": optional_str(args, "expect_string")?,
                        "wait_timeout": wait_timeout,
                    }),
                    wait_timeout,
                )
                .await
        }
        "send_config_set" => {
            let node = require_str(args, "node_name")?;
            let commands = args
                .get("commands")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ErrorEnvelope::new(
                        ErrorCode::MissingParameter,
                        "required parameter 'commands' (list of strings) is missing",
                    )
                })?;
            if commands.iter().any(|c| !c.is_string()) {
                return Err(ErrorEnvelope::new(
                    ErrorCode::InvalidParameter,
                    "'commands' must contain only strings",
                ));
            }
            proxy
                .send_config_set(json!({
                    "node_name": node,
                    "commands": commands,
                    "read_timeout": optional_u64(args, "read_timeout")?,
                }))
                .await
        }
        "get_status" => match optional_str(args, "node_name")? {
            Some(node) => proxy.status(node).await,
            None => proxy.status_all().await,
        },
        "get_history" => {
            let node = require_str(args, "node_name")?;
            proxy
                .history(
                    node,
                    optional_u64(args, "limit")?,
                    optional_str(args, "search")?,
                    optional_str(args, "since")?,
                )
                .await
        }
        "get_job_status" => {
            let job_id = require_str(args, "job_id")?;
            proxy.job_status(job_id).await
        }
        "read_buffer" => {
            let node = require_str(args, "node_name")?;
            let mode = optional_str(args, "mode")?.unwrap_or("diff");
            proxy
                .read_buffer(node, mode, optional_u64(args, "count")?)
                .await
        }
        "cleanup" => {
            let scope = optional_str(args, "scope")?.unwrap_or("orphaned");
            let known_nodes = match scope {
                // Orphan detection needs the authoritative node list.
                "orphaned" => {
                    let client = gns3(ctx)?;
                    let project = open_project(&client).await?;
                    client
                        .nodes(&project.project_id)
                        .await
                        .map_err(client_error)?
                        .into_iter()
                        .map(|n| n.name)
                        .collect()
                }
                _ => Vec::new(),
            };
            proxy.cleanup(scope, &known_nodes).await
        }
        other => return Err(invalid_action("ssh", other, ACTIONS)),
    };

    result.map_err(|e| e.into_envelope())
}
