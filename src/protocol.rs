//! JSON-RPC 2.0 envelopes exchanged with the tool server
//!
//! Outgoing messages are typed structs; incoming lines are classified by the
//! members they carry, since the child may emit responses, notifications and
//! its own requests on the same stream.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Value of the `jsonrpc` member on every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for an unsupported method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Method names used by the bridge
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const LOG_MESSAGE: &str = "notifications/message";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Request sent to the child
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

/// Notification sent to the child (no response expected)
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

/// Error reply to a request the child initiated
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    pub jsonrpc: &'static str,
    /// Echoed verbatim from the child's request
    pub id: JsonValue,
    pub error: RpcError,
}

/// Anything the bridge writes to the child's stdin
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Request(Request),
    Notification(OutgoingNotification),
    ErrorReply(ErrorReply),
}

impl Outgoing {
    pub fn request(id: u64, method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Outgoing::Request(Request {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<JsonValue>) -> Self {
        Outgoing::Notification(OutgoingNotification {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        })
    }

    pub fn error_reply(id: JsonValue, code: i64, message: impl Into<String>) -> Self {
        Outgoing::ErrorReply(ErrorReply {
            jsonrpc: JSONRPC_VERSION,
            id,
            error: RpcError {
                code: Some(code),
                message: message.into(),
                data: None,
            },
        })
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// Response to one of our requests
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Absent on Failure envelopes the child could not correlate
    pub id: Option<u64>,
    pub outcome: std::result::Result<JsonValue, RpcError>,
}

/// Notification emitted by the child
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

/// Request initiated by the child
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    pub id: JsonValue,
    pub method: String,
    pub params: Option<JsonValue>,
}

/// A recognized incoming envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
    Request(ServerRequest),
}

impl Incoming {
    /// Classify a decoded JSON value, returning `None` for shapes that are not
    /// JSON-RPC envelopes we can act on.
    pub fn classify(value: JsonValue) -> Option<Incoming> {
        let JsonValue::Object(mut obj) = value else {
            return None;
        };

        let id = obj.remove("id").filter(|v| !v.is_null());

        if let Some(JsonValue::String(method)) = obj.remove("method") {
            let params = obj.remove("params");
            return Some(match id {
                Some(id) => Incoming::Request(ServerRequest { id, method, params }),
                None => Incoming::Notification(Notification { method, params }),
            });
        }

        // Our ids are always unsigned integers; anything else is not ours
        let id = match id {
            Some(value) => Some(value.as_u64()?),
            None => None,
        };

        if let Some(error) = obj.remove("error") {
            let error: RpcError = serde_json::from_value(error).ok()?;
            return Some(Incoming::Response(Response {
                id,
                outcome: Err(error),
            }));
        }

        let result = obj.remove("result")?;
        Some(Incoming::Response(Response {
            id: Some(id?),
            outcome: Ok(result),
        }))
    }
}

/// Name and version of either side of the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Params of the `initialize` request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: JsonValue,
    pub client_info: Implementation,
}

/// Result of the `initialize` request, parsed leniently
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Option<JsonValue>,
    #[serde(default)]
    pub server_info: Option<Implementation>,
}

/// One entry of the tool catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
}

/// Params of `tools/list`
#[derive(Debug, Default, Serialize)]
pub struct ToolListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// One page of `tools/list`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolListPage {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Params of `tools/call`
#[derive(Debug, Serialize)]
pub struct ToolCallParams<'a> {
    pub name: &'a str,
    pub arguments: JsonValue,
}

/// Params of `notifications/cancelled`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams<'a> {
    pub request_id: u64,
    pub reason: &'a str,
}
