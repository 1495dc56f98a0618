//! JSON-RPC 2.0 wire types shared by the child side and the front server.
//!
//! Inbound child traffic is classified into [`ChildMessage`] variants by
//! response id and envelope shape; anything that fits none of them is
//! ignorable noise.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use std::fmt;

/// MCP protocol version sent in every handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Id of the handshake (`initialize`) request sent to each child.
pub const HANDSHAKE_ID: u64 = 1;

/// Id of the catalog (`tools/list`) request sent to each child.
pub const CATALOG_ID: u64 = 2;

/// First id handed out for tool calls; lower ids are reserved.
pub const FIRST_CALL_ID: u64 = 3;

/// Standard JSON-RPC and MCP error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_TIMEOUT: i64 = -32001;
}

/// A request identifier, compared exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl RequestId {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self::Number(n)),
            Value::String(s) => Some(Self::String(s)),
            _ => None,
        }
    }

    /// The id as a call key, if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n.as_u64(),
            Self::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id.into())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// An outbound JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    /// `None` serializes as `null`, used when the request id is unknown.
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

fn default_error_code() -> i64 {
    error_codes::INTERNAL_ERROR
}

/// A JSON-RPC 2.0 error object.
///
/// Children sometimes omit the code; it defaults to internal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default = "default_error_code")]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A tool as advertised by a child in its catalog report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
    /// Every other field the child sent (annotations, title, ...), verbatim.
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, Value>,
}

/// Deserialize a field so that an explicit `null` is still `Some(Value::Null)`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Loose view of any inbound JSON-RPC envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct CatalogResult {
    tools: Vec<Value>,
}

impl CatalogResult {
    /// Keep every well-formed descriptor; a bad entry costs only itself.
    fn into_descriptors(self) -> Vec<ToolDescriptor> {
        self.tools
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<ToolDescriptor>(raw.clone()) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    tracing::warn!("Dropping malformed tool descriptor {raw}: {e}");
                    None
                }
            })
            .collect()
    }
}

/// A classified message read from a child's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildMessage {
    /// Successful response to the handshake request.
    HandshakeAck(Value),
    /// Error response to the handshake request.
    HandshakeRejected(ErrorObject),
    /// The child's tool catalog.
    CatalogReport(Vec<ToolDescriptor>),
    /// Error response to the catalog request.
    CatalogRejected(ErrorObject),
    /// Response to a tool call, matched later by id.
    CallResponse {
        id: RequestId,
        outcome: Result<Value, ErrorObject>,
    },
    /// Notification sent by the child.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Request initiated by the child.
    Request { id: RequestId, method: String },
}

impl ChildMessage {
    /// Classify a framed JSON object. Returns `None` for anything that is not
    /// a recognisable request, notification or response.
    pub fn classify(value: Value) -> Option<Self> {
        let envelope: Envelope = serde_json::from_value(value).ok()?;
        let id = match envelope.id {
            Some(Value::Null) | None => None,
            Some(raw) => Some(RequestId::from_value(raw)?),
        };

        if let Some(method) = envelope.method {
            return Some(match id {
                Some(id) => Self::Request { id, method },
                None => Self::Notification {
                    method,
                    params: envelope.params,
                },
            });
        }

        let id = id?;
        let outcome = match (envelope.result, envelope.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => return None,
        };

        let reserved = id.as_u64().filter(|n| *n < FIRST_CALL_ID);
        match (reserved, outcome) {
            (Some(HANDSHAKE_ID), Ok(result)) => Some(Self::HandshakeAck(result)),
            (Some(HANDSHAKE_ID), Err(error)) => Some(Self::HandshakeRejected(error)),
            (Some(CATALOG_ID), Ok(result)) => {
                let catalog: CatalogResult = serde_json::from_value(result).ok()?;
                Some(Self::CatalogReport(catalog.into_descriptors()))
            }
            (Some(CATALOG_ID), Err(error)) => Some(Self::CatalogRejected(error)),
            (_, outcome) => Some(Self::CallResponse { id, outcome }),
        }
    }
}
