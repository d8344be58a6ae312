use crate::mcp::endpoint::{ChannelEnd, Endpoint};
use crate::mcp::jsonrpc::RpcError;
use crate::mcp::types::{
    parse_resource_contents, parse_resource_list, parse_tool_list, ResourceContents,
    ResourceInfo, ToolInfo, MCP_PROTOCOL_VERSION,
};
use crate::mcp::McpSource;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

/// Client half of the in-process protocol pair.
///
/// Every operation initializes on first use; the handshake runs once even
/// when several callers race for it, because they queue on the init lock.
pub struct McpClient {
    endpoint: Endpoint,
    init: Mutex<Option<Value>>,
    // Keeps the serving side alive for clients built by `McpServer::connect`.
    _peer: Option<Endpoint>,
}

impl McpClient {
    pub fn new(channel: ChannelEnd) -> Self {
        Self {
            endpoint: Endpoint::new("client", channel),
            init: Mutex::new(None),
            _peer: None,
        }
    }

    pub(crate) fn attached(channel: ChannelEnd, peer: Endpoint) -> Self {
        Self {
            _peer: Some(peer),
            ..Self::new(channel)
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.init.lock().await.is_some()
    }

    async fn ensure_initialized(&self) -> Result<Value, RpcError> {
        let mut state = self.init.lock().await;
        if let Some(result) = state.as_ref() {
            return Ok(result.clone());
        }

        let result = self
            .endpoint
            .send_request(
                "initialize",
                Some(json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")}
                })),
            )
            .await?;

        let server_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if server_version != MCP_PROTOCOL_VERSION {
            return Err(RpcError::unsupported_version(
                MCP_PROTOCOL_VERSION,
                server_version,
            ));
        }

        debug!(protocol_version = server_version, "In-process client initialized");
        *state = Some(result.clone());
        Ok(result)
    }
}

#[async_trait]
impl McpSource for McpClient {
    async fn initialize(&self) -> Result<Value, RpcError> {
        self.ensure_initialized().await
    }

    async fn load_tools(&self) -> Result<Vec<ToolInfo>, RpcError> {
        self.ensure_initialized().await?;
        parse_tool_list(self.endpoint.send_request("tools/list", None).await?)
    }

    async fn load_resources(&self) -> Result<Vec<ResourceInfo>, RpcError> {
        self.ensure_initialized().await?;
        parse_resource_list(self.endpoint.send_request("resources/list", None).await?)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        self.ensure_initialized().await?;
        self.endpoint
            .send_request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, RpcError> {
        self.ensure_initialized().await?;
        parse_resource_contents(
            self.endpoint
                .send_request("resources/read", Some(json!({ "uri": uri })))
                .await?,
        )
    }

    async fn disconnect(&self) {
        self.endpoint.close().await;
    }
}
