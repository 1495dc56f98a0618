//! Request dispatch for the front server.

use serde::Deserialize;
use serde_json::{Value, json};
use switchyard_mux::Gateway;
use switchyard_mux::jsonrpc::{
    ErrorObject, JsonRpcResponse, PROTOCOL_VERSION, RequestId, error_codes,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// `serverInfo` block returned from `initialize`.
fn server_info(gateway: &Gateway) -> Value {
    json!({
        "name": gateway.settings().name,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

pub(crate) struct Session {
    gateway: Gateway,
    responses: mpsc::UnboundedSender<JsonRpcResponse>,
}

impl Session {
    pub(crate) fn new(gateway: Gateway, responses: mpsc::UnboundedSender<JsonRpcResponse>) -> Self {
        Self { gateway, responses }
    }

    pub(crate) fn reply(&self, response: JsonRpcResponse) {
        if self.responses.send(response).is_err() {
            tracing::debug!("Response dropped, writer is gone");
        }
    }

    fn fail(&self, id: Option<RequestId>, code: i64, message: impl Into<String>) {
        self.reply(JsonRpcResponse::failure(id, ErrorObject::new(code, message)));
    }

    /// Handle one request line. Methods that touch the gateway are spawned
    /// onto `calls`; the rest are answered inline.
    pub(crate) fn handle_line(&self, line: &str, calls: &mut JoinSet<()>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Unparseable request line: {e}");
                self.fail(None, error_codes::PARSE_ERROR, format!("Parse error: {e}"));
                return;
            }
        };
        if !value.is_object() {
            self.fail(
                None,
                error_codes::INVALID_REQUEST,
                "Invalid request: expected a JSON object",
            );
            return;
        }
        let message: IncomingMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                self.fail(
                    None,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {e}"),
                );
                return;
            }
        };

        let Some(method) = message.method else {
            tracing::debug!("Ignoring message without a method (id {:?})", message.id);
            return;
        };
        let Some(id) = message.id else {
            tracing::debug!("Notification '{method}' received");
            return;
        };

        match method.as_str() {
            "initialize" => self.reply(JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": server_info(&self.gateway),
                }),
            )),
            "ping" => self.reply(JsonRpcResponse::success(id, json!({}))),
            "tools/list" => self.list_tools(id, calls),
            "tools/call" => self.call_tool(id, message.params, calls),
            other => self.fail(
                Some(id),
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        }
    }

    fn list_tools(&self, id: RequestId, calls: &mut JoinSet<()>) {
        let gateway = self.gateway.clone();
        let responses = self.responses.clone();
        // The registry read lock is async, so the reply is built off the read loop.
        calls.spawn(async move {
            let entries = gateway.list_tools().await;
            let tools: Vec<_> = entries.iter().map(|e| e.to_catalog_tool()).collect();
            let response = match serde_json::to_value(&tools) {
                Ok(tools) => JsonRpcResponse::success(id, json!({ "tools": tools })),
                Err(e) => JsonRpcResponse::failure(
                    Some(id),
                    ErrorObject::new(error_codes::INTERNAL_ERROR, e.to_string()),
                ),
            };
            let _ = responses.send(response);
        });
    }

    fn call_tool(&self, id: RequestId, params: Option<Value>, calls: &mut JoinSet<()>) {
        let Some(params) = params.and_then(|p| serde_json::from_value::<CallParams>(p).ok())
        else {
            self.fail(
                Some(id),
                error_codes::INVALID_PARAMS,
                "Invalid params: tools/call requires a tool name",
            );
            return;
        };

        let gateway = self.gateway.clone();
        let responses = self.responses.clone();
        calls.spawn(async move {
            let response = match gateway.call_tool(&params.name, params.arguments).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(Some(id), e.into_error_object()),
            };
            let _ = responses.send(response);
        });
    }
}
