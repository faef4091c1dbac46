//! MCP request handling over JSON-RPC.
//!
//! Transport-agnostic: stdio and HTTP both feed raw request values through
//! [`McpServer::handle`]. Tool failures are payload-level (`isError` on the
//! call result); only malformed requests produce JSON-RPC errors.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::AppContext;
use crate::protocol::{
    INVALID_PARAMS, INVALID_REQUEST, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::{catalog, prompts, resources};

pub struct McpServer {
    ctx: Arc<AppContext>,
}

impl McpServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Handle one raw frame. Returns `None` for notifications (no id) and
    /// unparseable notifications-like garbage is answered with id null.
    pub async fn handle_raw(&self, raw: &str) -> Option<String> {
        let response = match serde_json::from_str::<JsonRpcRequest>(raw) {
            Ok(request) => self.handle(request).await?,
            Err(e) => JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("parse error: {e}")),
        };
        match serde_json::to_string(&response) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "failed to serialize response");
                None
            }
        }
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        debug!(method = %request.method, "mcp request");

        // Notifications get no response.
        if id.is_none() {
            return None;
        }
        let id = id.unwrap_or(Value::Null);

        let params = match request.params {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Some(JsonRpcResponse::failure(
                    id,
                    INVALID_REQUEST,
                    "params must be an object",
                ));
            }
        };

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                    "resources": {},
                    "prompts": {},
                },
                "serverInfo": {
                    "name": "gnsmcp",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": catalog::list_tools() })),
            "tools/call" => self.call_tool(&params).await,
            "resources/list" => Ok(json!({ "resources": resources::list() })),
            "resources/templates/list" => {
                Ok(json!({ "resourceTemplates": resources::templates() }))
            }
            "resources/read" => self.read_resource(&params).await,
            "prompts/list" => Ok(json!({ "prompts": prompts::list() })),
            "prompts/get" => {
                let name = match params.get("name").and_then(Value::as_str) {
                    Some(n) => n,
                    None => {
                        return Some(JsonRpcResponse::failure(
                            id,
                            INVALID_PARAMS,
                            "prompts/get requires 'name'",
                        ));
                    }
                };
                let args = params
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                match prompts::get(name, &args) {
                    Ok(prompt) => Ok(prompt),
                    Err(envelope) => {
                        return Some(JsonRpcResponse::failure(
                            id,
                            INVALID_PARAMS,
                            envelope.error,
                        ));
                    }
                }
            }
            other => {
                return Some(JsonRpcResponse::failure(
                    id,
                    METHOD_NOT_FOUND,
                    format!("unknown method '{other}'"),
                ));
            }
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(message) => JsonRpcResponse::failure(id, INVALID_PARAMS, message),
        })
    }

    async fn call_tool(&self, params: &Map<String, Value>) -> Result<Value, String> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or("tools/call requires 'name'")?;
        let arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let (payload, is_error) = catalog::dispatch(&self.ctx, name, &arguments).await;
        let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        }))
    }

    async fn read_resource(&self, params: &Map<String, Value>) -> Result<Value, String> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or("resources/read requires 'uri'")?;
        let payload = match resources::read(&self.ctx, uri).await {
            Ok(value) => value,
            // Resource failures ride inside the contents, like tool errors.
            Err(envelope) => envelope.to_value(),
        };
        let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": text,
            }],
        }))
    }
}
