pub mod data;
pub mod io;

pub use data::{
    Config, McpServerConfig, ToolsMode, ValidationConfig, ValidationMode, DEFAULT_BASE_URL,
    DEFAULT_MODEL,
};
pub use io::ConfigError;
