//! Catalog shapes exchanged by `tools/list`, `resources/list` and
//! `resources/read`, with parsers that accept both the current result
//! objects and the older bare-array replies.

use crate::mcp::jsonrpc::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version spoken by the in-process endpoints and offered to
/// external servers.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
/// Versions accepted from external servers during negotiation.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];
/// Version string of the dotted `mcp.*` method family.
pub const LEGACY_PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "parameters", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    #[default]
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAnnotations {
    #[serde(default)]
    pub cache_policy: CachePolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub annotations: ResourceAnnotations,
}

impl ResourceInfo {
    pub fn is_dynamic(&self) -> bool {
        self.annotations.cache_policy == CachePolicy::Dynamic
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, RpcError> {
    serde_json::from_value(value)
        .map_err(|err| RpcError::internal(format!("Invalid {what} payload: {err}")))
}

/// `{"tools": [...]}` or a bare array.
pub fn parse_tool_list(result: Value) -> Result<Vec<ToolInfo>, RpcError> {
    match result {
        Value::Array(_) => decode(result, "tools/list"),
        Value::Object(mut object) => match object.remove("tools") {
            Some(tools) => decode(tools, "tools/list"),
            None => Ok(Vec::new()),
        },
        Value::Null => Ok(Vec::new()),
        _ => Err(RpcError::internal("Invalid tools/list payload")),
    }
}

/// `{"resources": [...]}` or a bare array.
pub fn parse_resource_list(result: Value) -> Result<Vec<ResourceInfo>, RpcError> {
    match result {
        Value::Array(_) => decode(result, "resources/list"),
        Value::Object(mut object) => match object.remove("resources") {
            Some(resources) => decode(resources, "resources/list"),
            None => Ok(Vec::new()),
        },
        Value::Null => Ok(Vec::new()),
        _ => Err(RpcError::internal("Invalid resources/list payload")),
    }
}

/// `{"contents": [...]}`, a bare array, or a single contents object.
pub fn parse_resource_contents(result: Value) -> Result<Vec<ResourceContents>, RpcError> {
    match result {
        Value::Array(_) => decode(result, "resources/read"),
        Value::Object(mut object) => match object.remove("contents") {
            Some(contents) => decode(contents, "resources/read"),
            None => decode::<ResourceContents>(Value::Object(object), "resources/read")
                .map(|contents| vec![contents]),
        },
        _ => Err(RpcError::internal("Invalid resources/read payload")),
    }
}
