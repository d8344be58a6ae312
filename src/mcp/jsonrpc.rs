//! JSON-RPC 2.0 envelope shared by the in-process channel and the external
//! transports.
//!
//! Frames are decoded exactly once, at the transport boundary, into
//! [`JsonRpcMessage`]. Anything that is not a well-formed request,
//! notification, or response decodes to `None` and is dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
pub const RESOURCE_NOT_FOUND: i64 = -32002;
/// Default code for handler failures that do not carry their own.
pub const SERVER_ERROR: i64 = -32000;
pub const CONNECTION_CLOSED: i64 = -32000;
pub const REQUEST_TIMEOUT: i64 = -32001;
pub const UNSUPPORTED_VERSION: i64 = 4001;
pub const TOOL_NOT_FOUND: i64 = 4004;
pub const EXECUTION_FAILED: i64 = 5001;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(value) => write!(f, "{value}"),
            RequestId::String(value) => f.write_str(value),
        }
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

/// A JSON-RPC error object, also used as the error type of every protocol
/// operation in this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method '{method}' not found"))
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(RESOURCE_NOT_FOUND, format!("Resource not found: {uri}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(SERVER_ERROR, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message)
    }

    pub fn unsupported_version(client: &str, server: &str) -> Self {
        Self::new(
            UNSUPPORTED_VERSION,
            format!("Unsupported protocol version. Client: {client}, Server: {server}"),
        )
    }

    pub fn tool_not_found(name: &str) -> Self {
        Self::new(TOOL_NOT_FOUND, format!("Tool '{name}' not found"))
    }

    pub fn execution_failed(message: &str) -> Self {
        Self::new(
            EXECUTION_FAILED,
            format!("Tool execution failed: {message}"),
        )
    }

    pub fn disconnected() -> Self {
        Self::new(CONNECTION_CLOSED, "Disconnected")
    }

    pub fn timeout(method: &str) -> Self {
        Self::new(REQUEST_TIMEOUT, format!("Request '{method}' timed out"))
    }

    pub fn is_method_not_found(&self) -> bool {
        self.code == METHOD_NOT_FOUND
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, RpcError>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, outcome: Result<Value, RpcError>) -> Self {
        JsonRpcMessage::Response { id, outcome }
    }

    /// Classify a decoded JSON value by shape: `method` makes it a request
    /// (or a notification without `id`), `id` without `method` a response.
    pub fn decode(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };

        if let Some(method) = object.remove("method") {
            let method = method.as_str()?.to_string();
            let params = object.remove("params");
            return match object.remove("id") {
                None | Some(Value::Null) => Some(JsonRpcMessage::Notification { method, params }),
                Some(id) => Some(JsonRpcMessage::Request {
                    id: serde_json::from_value(id).ok()?,
                    method,
                    params,
                }),
            };
        }

        let id: RequestId = serde_json::from_value(object.remove("id")?).ok()?;
        if let Some(error) = object.remove("error") {
            let error: RpcError = serde_json::from_value(error).ok()?;
            return Some(JsonRpcMessage::Response {
                id,
                outcome: Err(error),
            });
        }
        let result = object.remove("result").unwrap_or(Value::Null);
        Some(JsonRpcMessage::Response {
            id,
            outcome: Ok(result),
        })
    }

    /// Decode a text frame. Batches (JSON arrays) yield one entry per
    /// well-formed member.
    pub fn decode_frame(text: &str) -> Vec<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items.into_iter().filter_map(Self::decode).collect(),
            Ok(value) => Self::decode(value).into_iter().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
        match self {
            JsonRpcMessage::Request { id, method, params } => {
                object.insert("id".to_string(), json!(id));
                object.insert("method".to_string(), json!(method));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            JsonRpcMessage::Notification { method, params } => {
                object.insert("method".to_string(), json!(method));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            JsonRpcMessage::Response { id, outcome } => {
                object.insert("id".to_string(), json!(id));
                match outcome {
                    Ok(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    Err(error) => {
                        object.insert("error".to_string(), json!(error));
                    }
                }
            }
        }
        Value::Object(object)
    }
}
