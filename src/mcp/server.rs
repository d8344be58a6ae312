//! In-process MCP server: a tool and resource registry answering the
//! protocol methods over an [`Endpoint`].

use crate::mcp::client::McpClient;
use crate::mcp::endpoint::{channel_pair, ChannelEnd, Endpoint};
use crate::mcp::jsonrpc::RpcError;
use crate::mcp::types::{
    ResourceAnnotations, ResourceInfo, ToolInfo, LEGACY_PROTOCOL_VERSION, MCP_PROTOCOL_VERSION,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
pub type ResourceHandler =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ResourceData, String>> + Send + Sync>;

/// What a resource handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceData {
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

#[derive(Clone)]
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    handler: ToolHandler,
}

impl ToolRegistration {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.parameters.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ResourceRegistration {
    pub info: ResourceInfo,
    handler: ResourceHandler,
}

impl ResourceRegistration {
    pub fn new<F, Fut>(info: ResourceInfo, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceData, String>> + Send + 'static,
    {
        Self {
            info,
            handler: Arc::new(move || Box::pin(handler())),
        }
    }
}

/// Convenience constructor for the common case of a named resource.
pub fn resource_info(
    uri: impl Into<String>,
    name: impl Into<String>,
    mime_type: Option<&str>,
    annotations: ResourceAnnotations,
) -> ResourceInfo {
    ResourceInfo {
        uri: uri.into(),
        name: name.into(),
        title: None,
        description: None,
        mime_type: mime_type.map(str::to_string),
        size: None,
        annotations,
    }
}

#[derive(Default)]
struct Registry {
    tools: RwLock<Vec<ToolRegistration>>,
    resources: RwLock<Vec<ResourceRegistration>>,
}

impl Registry {
    fn tools(&self) -> Vec<ToolRegistration> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn tool(&self, name: &str) -> Option<ToolRegistration> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|tool| tool.name == name)
            .cloned()
    }

    fn resources(&self) -> Vec<ResourceRegistration> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn resource(&self, uri: &str) -> Option<ResourceRegistration> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|resource| resource.info.uri == uri)
            .cloned()
    }
}

/// A tool/resource registry that can serve any number of channels.
#[derive(Clone, Default)]
pub struct McpServer {
    registry: Arc<Registry>,
}

impl McpServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any existing tool with the same name.
    pub fn register_tool(&self, tool: ToolRegistration) {
        let mut tools = self
            .registry
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = tools.iter().position(|existing| existing.name == tool.name) {
            warn!(tool = %tool.name, "Tool is already registered; overwriting");
            tools.remove(index);
        }
        debug!(tool = %tool.name, "Registered tool");
        tools.push(tool);
    }

    /// Register a resource, replacing any existing resource with the same URI.
    pub fn register_resource(&self, resource: ResourceRegistration) {
        let mut resources = self
            .registry
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = resources
            .iter()
            .position(|existing| existing.info.uri == resource.info.uri)
        {
            warn!(uri = %resource.info.uri, "Resource is already registered; overwriting");
            resources.remove(index);
        }
        debug!(uri = %resource.info.uri, "Registered resource");
        resources.push(resource);
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry
            .tools()
            .into_iter()
            .map(|tool| tool.name)
            .collect()
    }

    /// Attach the protocol handlers to an endpoint over `channel`.
    pub fn serve(&self, channel: ChannelEnd) -> Endpoint {
        let endpoint = Endpoint::new("server", channel);

        endpoint.on_request("initialize", |params| async move {
            let requested = params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if requested != MCP_PROTOCOL_VERSION {
                return Err(RpcError::unsupported_version(
                    &requested,
                    MCP_PROTOCOL_VERSION,
                ));
            }
            Ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")}
            }))
        });
        endpoint.on_request("mcp.initialize", |params| async move {
            let requested = params
                .as_ref()
                .and_then(|p| p.get("version"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if requested != LEGACY_PROTOCOL_VERSION {
                return Err(RpcError::unsupported_version(
                    &requested,
                    LEGACY_PROTOCOL_VERSION,
                ));
            }
            Ok(json!({
                "version": LEGACY_PROTOCOL_VERSION,
                "capabilities": ["tools", "resources"]
            }))
        });

        let registry = self.registry.clone();
        endpoint.on_request("tools/list", move |_| {
            let tools: Vec<ToolInfo> = registry.tools().iter().map(ToolRegistration::info).collect();
            async move { Ok(json!({ "tools": tools })) }
        });
        let registry = self.registry.clone();
        endpoint.on_request("mcp.tools.list", move |_| {
            let tools: Vec<Value> = registry
                .tools()
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect();
            async move { Ok(Value::Array(tools)) }
        });

        for method in ["tools/call", "mcp.tools.call"] {
            let registry = self.registry.clone();
            endpoint.on_request(method, move |params| call_tool(registry.clone(), params));
        }

        let registry = self.registry.clone();
        endpoint.on_request("resources/list", move |_| {
            let resources: Vec<ResourceInfo> =
                registry.resources().into_iter().map(|r| r.info).collect();
            async move { Ok(json!({ "resources": resources })) }
        });
        let registry = self.registry.clone();
        endpoint.on_request("mcp.resources.list", move |_| {
            let resources: Vec<ResourceInfo> =
                registry.resources().into_iter().map(|r| r.info).collect();
            async move { Ok(json!(resources)) }
        });

        for method in ["resources/read", "mcp.resources.read"] {
            let registry = self.registry.clone();
            endpoint.on_request(method, move |params| read_resource(registry.clone(), params));
        }

        endpoint
    }

    /// A client wired to a fresh endpoint of this server.
    pub fn connect(&self) -> McpClient {
        let (server_end, client_end) = channel_pair();
        let server = self.serve(server_end);
        McpClient::attached(client_end, server)
    }
}

async fn call_tool(registry: Arc<Registry>, params: Option<Value>) -> Result<Value, RpcError> {
    let params = params.unwrap_or_default();
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(tool) = registry.tool(name) else {
        return Err(RpcError::tool_not_found(name));
    };

    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    debug!(tool = %tool.name, "Executing tool");
    match (tool.handler)(arguments).await {
        Ok(result) => Ok(json!({ "success": true, "result": result })),
        Err(message) => {
            Err(RpcError::execution_failed(&message).with_data(json!({ "message": message })))
        }
    }
}

async fn read_resource(registry: Arc<Registry>, params: Option<Value>) -> Result<Value, RpcError> {
    let uri = params
        .as_ref()
        .and_then(|p| p.get("uri"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let Some(resource) = registry.resource(&uri) else {
        return Err(RpcError::resource_not_found(&uri));
    };

    let data = (resource.handler)()
        .await
        .map_err(|err| RpcError::internal(format!("Failed to read resource {uri}: {err}")))?;
    Ok(json!({ "contents": [encode_contents(&resource.info, data)] }))
}

fn encode_contents(info: &ResourceInfo, data: ResourceData) -> Value {
    let mut contents = json!({
        "uri": info.uri,
        "name": info.name,
    });
    if let Some(title) = &info.title {
        contents["title"] = json!(title);
    }

    let (mime_type, field, payload) = match data {
        ResourceData::Text(text) => (
            info.mime_type.clone().unwrap_or_else(|| "text/plain".to_string()),
            "text",
            text,
        ),
        ResourceData::Json(value) => (
            info.mime_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string()),
            "text",
            value.to_string(),
        ),
        ResourceData::Binary(bytes) => (
            info.mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            "blob",
            STANDARD.encode(bytes),
        ),
    };
    contents["mimeType"] = json!(mime_type);
    contents[field] = json!(payload);
    contents
}

/// Session-wide holder of the in-process server with an explicit
/// create/reset lifecycle.
#[derive(Default)]
pub struct ServerRegistry {
    current: std::sync::Mutex<Option<McpServer>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing server, or build one and run `setup` on it once.
    pub fn create_or_get_server(&self, setup: impl FnOnce(&McpServer)) -> McpServer {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(server) = current.as_ref() {
            return server.clone();
        }
        let server = McpServer::new();
        setup(&server);
        *current = Some(server.clone());
        server
    }

    pub fn reset(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
