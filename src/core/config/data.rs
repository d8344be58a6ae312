use crate::mcp::transport::McpTransportKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:1234/v1";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOOL_LOOPS: usize = 5;
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 8000;
pub const DEFAULT_HISTORY_DEPTH_HOURS: u64 = 24;
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// How the tool catalog reaches the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolsMode {
    /// `tools` + `tool_choice: "auto"` in the completion request.
    #[default]
    Api,
    /// Only the textual list in the system prompt.
    Prompt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    Warn,
    Revise,
}

/// Opt-in second pass over each final assistant answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub mode: ValidationMode,
    /// Extra criteria appended to the validator instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

/// One `[mcp_servers.<id>]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(rename = "type", default)]
    pub kind: McpTransportKind,
    pub url: String,
    /// POST target when it differs from the event-stream URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub open_event_stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tool_loops: Option<usize>,
    /// Token budget for every completion request
    pub max_context_tokens: Option<usize>,
    /// Stored messages older than this are dropped on load
    pub history_depth_hours: Option<u64>,
    pub streaming: Option<bool>,
    #[serde(default)]
    pub tools_mode: ToolsMode,
    /// Appended to the generated system prompt
    pub custom_prompt: Option<String>,
    /// Shown before the first exchange, never sent to the model
    pub greeting: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_tools: Vec<String>,
    pub validation: Option<ValidationConfig>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    /// Values for `${NAME}` placeholders in server URLs and headers
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Overrides for user-facing strings and prompt templates
    #[serde(default)]
    pub strings: HashMap<String, String>,
}

impl Config {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    /// Configured key, else `OPENAI_API_KEY`. Blank values count as unset.
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn max_tool_loops(&self) -> usize {
        self.max_tool_loops.unwrap_or(DEFAULT_MAX_TOOL_LOOPS).max(1)
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens.unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS)
    }

    pub fn history_depth_hours(&self) -> u64 {
        self.history_depth_hours
            .unwrap_or(DEFAULT_HISTORY_DEPTH_HOURS)
    }

    pub fn streaming(&self) -> bool {
        self.streaming.unwrap_or(false)
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.mcp_servers
            .iter()
            .filter(|(_, server)| server.is_enabled())
    }
}

/// Render a path with the home directory abbreviated to `~`.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
