//! Adapters for out-of-process MCP servers.
//!
//! Both adapters put an [`Endpoint`] in front of a background connection
//! task: the endpoint owns request ids, pending entries and timeouts, the
//! connection task moves frames between the endpoint's channel and the
//! network. The handshake and the modern/legacy method selection are
//! shared through [`RemoteProtocol`].

use crate::core::config::McpServerConfig;
use crate::mcp::endpoint::Endpoint;
use crate::mcp::jsonrpc::{JsonRpcMessage, RequestId, RpcError, CONNECTION_CLOSED};
use crate::mcp::types::{
    parse_resource_contents, parse_resource_list, parse_tool_list, ResourceContents,
    ResourceInfo, ToolInfo, LEGACY_PROTOCOL_VERSION, MCP_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::McpSource;
use crate::utils::url::expand_placeholders;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

pub mod streamable_http;
#[cfg(test)]
pub(crate) mod test_support;
pub mod websocket;

pub use streamable_http::StreamableHttpSource;
pub use websocket::WebSocketSource;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Default per-request timeout for external servers.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Supported external transport backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum McpTransportKind {
    #[default]
    #[serde(rename = "ws", alias = "websocket")]
    WebSocket,
    #[serde(rename = "sse", alias = "http", alias = "streamable-http")]
    Sse,
}

pub fn apply_streamable_http_client_post_headers(
    request: reqwest::RequestBuilder,
) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_streamable_http_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

/// Exponential reconnect delay: `base * 2^attempt`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Connection settings after `${NAME}` expansion.
#[derive(Debug, Clone)]
pub struct ResolvedServer {
    pub id: String,
    pub url: String,
    pub post_url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub protocols: Vec<String>,
    pub request_timeout: Duration,
    pub open_event_stream: bool,
}

impl ResolvedServer {
    pub fn resolve(id: &str, config: &McpServerConfig, env: &HashMap<String, String>) -> Self {
        Self {
            id: id.to_string(),
            url: expand_placeholders(&config.url, env),
            post_url: config
                .post_url
                .as_deref()
                .map(|url| expand_placeholders(url, env)),
            headers: config
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), expand_placeholders(value, env)))
                .collect(),
            protocols: config.protocols.clone(),
            request_timeout: Duration::from_millis(
                config.timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            open_event_stream: config.open_event_stream,
        }
    }
}

/// Build the adapter for one configured server.
pub fn connect_source(
    id: &str,
    config: &McpServerConfig,
    env: &HashMap<String, String>,
) -> Arc<dyn McpSource> {
    let resolved = ResolvedServer::resolve(id, config, env);
    match config.kind {
        McpTransportKind::WebSocket => Arc::new(WebSocketSource::connect(resolved)),
        McpTransportKind::Sse => Arc::new(StreamableHttpSource::connect(resolved)),
    }
}

/// Error reply standing in for a response the transport could not deliver.
pub(crate) fn transport_failure(id: RequestId, message: impl Into<String>) -> Value {
    JsonRpcMessage::response(id, Err(RpcError::new(CONNECTION_CLOSED, message))).to_value()
}

pub(crate) fn request_id_of(frame: &Value) -> Option<RequestId> {
    frame.get("method")?;
    serde_json::from_value(frame.get("id")?.clone()).ok()
}

/// Outcome of the `initialize` exchange.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub legacy: bool,
    pub protocol_version: String,
    pub result: Value,
}

/// Transport-specific steps around the shared protocol logic.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Runs once, right after a successful handshake. Failures are logged
    /// by the implementation and never fail the handshake.
    async fn on_initialized(&self, endpoint: &Endpoint, negotiated: &Negotiated);

    async fn shutdown(&self);
}

pub(crate) struct RemoteProtocol {
    server_id: String,
    endpoint: Endpoint,
    state: Mutex<Option<Negotiated>>,
}

impl RemoteProtocol {
    pub(crate) fn new(server_id: String, endpoint: Endpoint) -> Self {
        Self {
            server_id,
            endpoint,
            state: Mutex::new(None),
        }
    }

    async fn ensure_initialized(&self, hooks: &dyn SessionHooks) -> Result<Negotiated, RpcError> {
        let mut state = self.state.lock().await;
        if let Some(negotiated) = state.as_ref() {
            return Ok(negotiated.clone());
        }

        let negotiated = self.handshake().await?;
        debug!(
            server_id = %self.server_id,
            protocol_version = %negotiated.protocol_version,
            legacy = negotiated.legacy,
            "MCP server initialized"
        );
        hooks.on_initialized(&self.endpoint, &negotiated).await;
        *state = Some(negotiated.clone());
        Ok(negotiated)
    }

    async fn handshake(&self) -> Result<Negotiated, RpcError> {
        let modern = self
            .endpoint
            .send_request(
                "initialize",
                Some(json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")}
                })),
            )
            .await;

        match modern {
            Ok(result) => {
                let version = result
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version.as_str()) {
                    return Err(RpcError::unsupported_version(MCP_PROTOCOL_VERSION, &version));
                }
                Ok(Negotiated {
                    legacy: false,
                    protocol_version: version,
                    result,
                })
            }
            Err(err) if err.is_method_not_found() => {
                debug!(server_id = %self.server_id, "Falling back to legacy initialize");
                let result = self
                    .endpoint
                    .send_request(
                        "mcp.initialize",
                        Some(json!({
                            "version": LEGACY_PROTOCOL_VERSION,
                            "capabilities": ["tools"]
                        })),
                    )
                    .await?;
                let version = result
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if version != LEGACY_PROTOCOL_VERSION {
                    return Err(RpcError::unsupported_version(LEGACY_PROTOCOL_VERSION, &version));
                }
                Ok(Negotiated {
                    legacy: true,
                    protocol_version: version,
                    result,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Modern method first; the dotted legacy name only when the server says
    /// the modern one does not exist.
    async fn request(
        &self,
        negotiated: &Negotiated,
        modern: &str,
        legacy: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        if negotiated.legacy {
            return self.endpoint.send_request(legacy, params).await;
        }
        match self.endpoint.send_request(modern, params.clone()).await {
            Err(err) if err.is_method_not_found() => {
                debug!(server_id = %self.server_id, method = modern, fallback = legacy, "Retrying with legacy method name");
                self.endpoint.send_request(legacy, params).await
            }
            other => other,
        }
    }
}

/// An external server reached through transport `H`.
pub struct RemoteSource<H> {
    protocol: RemoteProtocol,
    hooks: H,
}

#[async_trait]
impl<H: SessionHooks> McpSource for RemoteSource<H> {
    async fn initialize(&self) -> Result<Value, RpcError> {
        self.protocol
            .ensure_initialized(&self.hooks)
            .await
            .map(|negotiated| negotiated.result)
    }

    async fn load_tools(&self) -> Result<Vec<ToolInfo>, RpcError> {
        let negotiated = self.protocol.ensure_initialized(&self.hooks).await?;
        parse_tool_list(
            self.protocol
                .request(&negotiated, "tools/list", "mcp.tools.list", None)
                .await?,
        )
    }

    async fn load_resources(&self) -> Result<Vec<ResourceInfo>, RpcError> {
        let negotiated = self.protocol.ensure_initialized(&self.hooks).await?;
        parse_resource_list(
            self.protocol
                .request(&negotiated, "resources/list", "mcp.resources.list", None)
                .await?,
        )
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        let negotiated = self.protocol.ensure_initialized(&self.hooks).await?;
        self.protocol
            .request(
                &negotiated,
                "tools/call",
                "mcp.tools.call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, RpcError> {
        let negotiated = self.protocol.ensure_initialized(&self.hooks).await?;
        parse_resource_contents(
            self.protocol
                .request(
                    &negotiated,
                    "resources/read",
                    "mcp.resources.read",
                    Some(json!({ "uri": uri })),
                )
                .await?,
        )
    }

    async fn disconnect(&self) {
        debug!(server_id = %self.protocol.server_id, "Disconnecting MCP server");
        self.hooks.shutdown().await;
        self.protocol.endpoint.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(8));
        let delays: Vec<u128> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_survives_many_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(10));
        }
    }

    #[test]
    fn resolve_expands_placeholders() {
        let config = McpServerConfig {
            kind: McpTransportKind::Sse,
            url: "https://${HOST}/mcp".to_string(),
            headers: [("Authorization".to_string(), "Bearer ${TOKEN}".to_string())]
                .into_iter()
                .collect(),
            timeout_ms: Some(1500),
            ..McpServerConfig::default()
        };
        let env: HashMap<String, String> = [
            ("HOST".to_string(), "example.test".to_string()),
            ("TOKEN".to_string(), "secret".to_string()),
        ]
        .into_iter()
        .collect();

        let resolved = ResolvedServer::resolve("remote", &config, &env);
        assert_eq!(resolved.url, "https://example.test/mcp");
        assert_eq!(
            resolved.headers,
            vec![("Authorization".to_string(), "Bearer secret".to_string())]
        );
        assert_eq!(resolved.request_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn transport_kind_accepts_aliases() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: McpTransportKind,
        }
        let parsed: Wrapper = toml::from_str("kind = \"websocket\"").expect("parse");
        assert_eq!(parsed.kind, McpTransportKind::WebSocket);
        let parsed: Wrapper = toml::from_str("kind = \"sse\"").expect("parse");
        assert_eq!(parsed.kind, McpTransportKind::Sse);
    }

    #[test]
    fn protocol_header_ignored_when_blank() {
        let client = reqwest::Client::new();
        let request = apply_streamable_http_protocol_version_header(
            client.post("https://example.com"),
            Some("  "),
        )
        .build()
        .expect("request");
        assert!(request.headers().get(MCP_PROTOCOL_VERSION_HEADER).is_none());
    }
}
