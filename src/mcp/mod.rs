//! MCP protocol core: JSON-RPC framing, the in-process server/client pair,
//! external transports, and the aggregating router.

pub mod aggregator;
pub mod client;
pub mod endpoint;
pub mod jsonrpc;
pub mod server;
pub mod transport;
pub mod types;

use async_trait::async_trait;
use jsonrpc::RpcError;
use serde_json::Value;
use types::{ResourceContents, ResourceInfo, ToolInfo};

/// Anything that can answer the client side of the protocol: the in-process
/// client as well as the WebSocket and streamable HTTP adapters.
#[async_trait]
pub trait McpSource: Send + Sync {
    async fn initialize(&self) -> Result<Value, RpcError>;

    async fn load_tools(&self) -> Result<Vec<ToolInfo>, RpcError>;

    async fn load_resources(&self) -> Result<Vec<ResourceInfo>, RpcError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError>;

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, RpcError>;

    /// Tear down background work and reject anything still outstanding.
    async fn disconnect(&self);
}
