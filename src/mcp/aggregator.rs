//! One routing façade over the in-process catalog and any number of
//! external servers.
//!
//! Internal tools keep their bare names; external tools are exposed as
//! `<server_id>_<name>`. A bare name routes only when exactly one source
//! defines it.

use crate::mcp::jsonrpc::RpcError;
use crate::mcp::types::{ResourceContents, ResourceInfo, ToolInfo};
use crate::mcp::McpSource;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Synthetic tool exposed when at least one resource is dynamic.
pub const READ_RESOURCE_TOOL: &str = "mcp_read_resource";
/// Static resource text folded into the system prompt is cut at this many
/// characters.
pub const STATIC_SNIPPET_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Nothing has been connected yet.
    Idle,
    Connected,
    PartialConnected,
    Error,
}

impl AggregateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateStatus::Idle => "idle",
            AggregateStatus::Connected => "connected",
            AggregateStatus::PartialConnected => "partial_connected",
            AggregateStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceId {
    Internal,
    External(String),
}

impl SourceId {
    fn qualify(&self, name: &str) -> String {
        match self {
            SourceId::Internal => name.to_string(),
            SourceId::External(id) => format!("{id}_{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedTool {
    /// Name the model sees and calls.
    pub qualified_name: String,
    pub source: SourceId,
    pub info: ToolInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedResource {
    pub source: SourceId,
    pub info: ResourceInfo,
}

/// Pre-fetched text of a static resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnippet {
    pub uri: String,
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub id: String,
    pub connected: bool,
    pub last_error: Option<String>,
    pub tool_count: usize,
}

/// Post-merge allow/block filtering on qualified names. A non-empty
/// allow-list wins and the block-list is then ignored.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
}

impl ToolFilter {
    pub fn new(allowed: Vec<String>, blocked: Vec<String>) -> Self {
        Self { allowed, blocked }
    }

    pub fn permits(&self, qualified_name: &str) -> bool {
        if !self.allowed.is_empty() {
            return self.allowed.iter().any(|name| name == qualified_name);
        }
        !self.blocked.iter().any(|name| name == qualified_name)
    }
}

/// What the conversation loop needs from the tool layer.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// Tools currently offered to the model, under the names it should use.
    fn tool_catalog(&self) -> Vec<ToolInfo>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError>;
}

struct SourceCatalog {
    source: SourceId,
    tools: Vec<ToolInfo>,
    resources: Vec<ResourceInfo>,
}

struct Catalog {
    internal: Option<SourceCatalog>,
    externals: Vec<SourceCatalog>,
    servers: Vec<ServerStatus>,
    internal_error: Option<String>,
    snippets: Vec<ResourceSnippet>,
    status: AggregateStatus,
}

pub struct Aggregator {
    internal: Arc<dyn McpSource>,
    externals: Vec<(String, Arc<dyn McpSource>)>,
    filter: ToolFilter,
    catalog: RwLock<Catalog>,
}

impl Aggregator {
    pub fn new(
        internal: Arc<dyn McpSource>,
        externals: Vec<(String, Arc<dyn McpSource>)>,
        filter: ToolFilter,
    ) -> Self {
        Self {
            internal,
            externals,
            filter,
            catalog: RwLock::new(Catalog {
                internal: None,
                externals: Vec::new(),
                servers: Vec::new(),
                internal_error: None,
                snippets: Vec::new(),
                status: AggregateStatus::Idle,
            }),
        }
    }

    /// Connect the in-process source, then every external server
    /// concurrently, then pre-fetch static resources.
    pub async fn connect(&self) -> AggregateStatus {
        self.connect_internal().await;
        self.connect_externals().await;
        self.preload_static_resources().await;
        self.status()
    }

    /// Load the in-process catalog. Usable on its own so a host can start
    /// with internal tools while external servers are still connecting.
    pub async fn connect_internal(&self) {
        let loaded = load_source(SourceId::Internal, self.internal.as_ref()).await;
        let mut catalog = self.write();
        match loaded {
            Ok(source) => {
                debug!(tools = source.tools.len(), resources = source.resources.len(), "Internal catalog loaded");
                catalog.internal = Some(source);
                catalog.internal_error = None;
            }
            Err(err) => {
                warn!(error = %err, "Internal MCP endpoint failed to initialize");
                catalog.internal = None;
                catalog.internal_error = Some(err.to_string());
            }
        }
        catalog.status = derive_status(&catalog);
    }

    /// Initialize all external servers independently. Each server's tools
    /// join the catalog as soon as that server answers; a failing server is
    /// recorded in [`ServerStatus`] and contributes no tools.
    pub async fn connect_externals(&self) {
        {
            let mut catalog = self.write();
            catalog.externals.clear();
            catalog.servers.clear();
        }

        let mut attempts: FuturesUnordered<_> = self
            .externals
            .iter()
            .map(|(id, source)| async move {
                let loaded = load_source(SourceId::External(id.clone()), source.as_ref()).await;
                (id.clone(), loaded)
            })
            .collect();

        while let Some((id, loaded)) = attempts.next().await {
            let mut catalog = self.write();
            match loaded {
                Ok(source) => {
                    info!(server_id = %id, tools = source.tools.len(), "MCP server connected");
                    catalog.servers.push(ServerStatus {
                        id,
                        connected: true,
                        last_error: None,
                        tool_count: source.tools.len(),
                    });
                    catalog.externals.push(source);
                }
                Err(err) => {
                    warn!(server_id = %id, error = %err, "MCP server unavailable");
                    catalog.servers.push(ServerStatus {
                        id,
                        connected: false,
                        last_error: Some(err.to_string()),
                        tool_count: 0,
                    });
                }
            }
            // Keep configuration order regardless of who answered first.
            let order = |id: &str| {
                self.externals
                    .iter()
                    .position(|(server_id, _)| server_id == id)
                    .unwrap_or(usize::MAX)
            };
            catalog.externals.sort_by_key(|source| match &source.source {
                SourceId::External(id) => order(id),
                SourceId::Internal => 0,
            });
            catalog.servers.sort_by_key(|server| order(&server.id));
            catalog.status = derive_status(&catalog);
        }
    }

    /// Read every static resource once. Unreadable or binary-only resources
    /// are skipped.
    pub async fn preload_static_resources(&self) {
        let wanted: Vec<MergedResource> = self
            .resources()
            .into_iter()
            .filter(|resource| !resource.info.is_dynamic())
            .collect();

        let reads = wanted.iter().map(|resource| async move {
            let outcome = match self.source(&resource.source) {
                Some(source) => source.read_resource(&resource.info.uri).await,
                None => Err(RpcError::resource_not_found(&resource.info.uri)),
            };
            (resource, outcome)
        });

        let mut snippets = Vec::new();
        for (resource, outcome) in join_all(reads).await {
            match outcome {
                Ok(contents) => {
                    let text = contents_text(&contents);
                    if text.is_empty() {
                        continue;
                    }
                    snippets.push(ResourceSnippet {
                        uri: resource.info.uri.clone(),
                        name: resource.info.name.clone(),
                        text: truncate_chars(&text, STATIC_SNIPPET_LIMIT),
                    });
                }
                Err(err) => {
                    warn!(uri = %resource.info.uri, error = %err, "Failed to preload static resource");
                }
            }
        }
        self.write().snippets = snippets;
    }

    pub fn status(&self) -> AggregateStatus {
        self.read().status
    }

    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        self.read().servers.clone()
    }

    pub fn internal_error(&self) -> Option<String> {
        self.read().internal_error.clone()
    }

    pub fn static_snippets(&self) -> Vec<ResourceSnippet> {
        self.read().snippets.clone()
    }

    /// Merged and filtered tools, internal first, plus the resource reader
    /// when a dynamic resource exists.
    pub fn tools(&self) -> Vec<MergedTool> {
        let catalog = self.read();
        let mut tools: Vec<MergedTool> = catalog
            .internal
            .iter()
            .chain(catalog.externals.iter())
            .flat_map(|source| {
                source.tools.iter().map(|info| MergedTool {
                    qualified_name: source.source.qualify(&info.name),
                    source: source.source.clone(),
                    info: info.clone(),
                })
            })
            .filter(|tool| self.filter.permits(&tool.qualified_name))
            .collect();

        let has_dynamic = catalog
            .internal
            .iter()
            .chain(catalog.externals.iter())
            .any(|source| source.resources.iter().any(ResourceInfo::is_dynamic));
        if has_dynamic && self.filter.permits(READ_RESOURCE_TOOL) {
            tools.push(MergedTool {
                qualified_name: READ_RESOURCE_TOOL.to_string(),
                source: SourceId::Internal,
                info: read_resource_tool(),
            });
        }
        tools
    }

    pub fn resources(&self) -> Vec<MergedResource> {
        let catalog = self.read();
        catalog
            .internal
            .iter()
            .chain(catalog.externals.iter())
            .flat_map(|source| {
                source.resources.iter().map(|info| MergedResource {
                    source: source.source.clone(),
                    info: info.clone(),
                })
            })
            .collect()
    }

    /// Route a read to the source that listed `uri`, preferring the
    /// in-process catalog.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, RpcError> {
        let owner = self
            .resources()
            .into_iter()
            .find(|resource| resource.info.uri == uri)
            .map(|resource| resource.source)
            .ok_or_else(|| RpcError::resource_not_found(uri))?;
        let source = self
            .source(&owner)
            .ok_or_else(|| RpcError::resource_not_found(uri))?;
        source.read_resource(uri).await
    }

    /// Tear down every external connection and the in-process client.
    pub async fn disconnect(&self) {
        join_all(self.externals.iter().map(|(_, source)| source.disconnect())).await;
        self.internal.disconnect().await;
    }

    fn resolve(&self, name: &str) -> Result<MergedTool, RpcError> {
        let tools = self.tools();
        let bare: Vec<&MergedTool> = tools
            .iter()
            .filter(|tool| tool.info.name == name && tool.qualified_name != READ_RESOURCE_TOOL)
            .collect();

        match bare.len() {
            1 => return Ok(bare[0].clone()),
            0 => {}
            _ => {
                let options: Vec<&str> = bare
                    .iter()
                    .map(|tool| tool.qualified_name.as_str())
                    .collect();
                return Err(RpcError::invalid_params(format!(
                    "Tool '{name}' is ambiguous; use a qualified name: {}",
                    options.join(", ")
                )));
            }
        }

        tools
            .into_iter()
            .find(|tool| tool.qualified_name == name)
            .ok_or_else(|| RpcError::tool_not_found(name))
    }

    fn source(&self, id: &SourceId) -> Option<Arc<dyn McpSource>> {
        match id {
            SourceId::Internal => Some(self.internal.clone()),
            SourceId::External(id) => self
                .externals
                .iter()
                .find(|(server_id, _)| server_id == id)
                .map(|(_, source)| source.clone()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ToolRouter for Aggregator {
    fn tool_catalog(&self) -> Vec<ToolInfo> {
        self.tools()
            .into_iter()
            .map(|tool| ToolInfo {
                name: tool.qualified_name,
                ..tool.info
            })
            .collect()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        if name == READ_RESOURCE_TOOL
            && self
                .tools()
                .iter()
                .any(|tool| tool.qualified_name == READ_RESOURCE_TOOL)
        {
            let uri = arguments
                .get("uri")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("Missing required argument 'uri'"))?;
            let contents = self.read_resource(uri).await?;
            return Ok(json!({ "contents": contents }));
        }

        let tool = self.resolve(name)?;
        let source = self
            .source(&tool.source)
            .ok_or_else(|| RpcError::tool_not_found(name))?;
        debug!(tool = %tool.qualified_name, "Routing tool call");
        source.call_tool(&tool.info.name, arguments).await
    }
}

async fn load_source(id: SourceId, source: &dyn McpSource) -> Result<SourceCatalog, RpcError> {
    source.initialize().await?;
    let tools = source.load_tools().await?;
    let resources = match source.load_resources().await {
        Ok(resources) => resources,
        Err(err) => {
            debug!(source = ?id, error = %err, "Resource listing unavailable");
            Vec::new()
        }
    };
    Ok(SourceCatalog {
        source: id,
        tools,
        resources,
    })
}

fn derive_status(catalog: &Catalog) -> AggregateStatus {
    if catalog.internal_error.is_some() {
        return AggregateStatus::Error;
    }
    if catalog.internal.is_none() {
        return AggregateStatus::Idle;
    }
    if catalog.servers.iter().all(|server| server.connected) {
        AggregateStatus::Connected
    } else {
        AggregateStatus::PartialConnected
    }
}

fn read_resource_tool() -> ToolInfo {
    ToolInfo {
        name: READ_RESOURCE_TOOL.to_string(),
        description: "Read the current contents of a dynamic resource by URI.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "uri": {"type": "string", "description": "Resource URI"}
            },
            "required": ["uri"]
        }),
    }
}

fn contents_text(contents: &[ResourceContents]) -> String {
    contents
        .iter()
        .filter_map(|item| item.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}
