//! Command-line interface parsing and handling
//!
//! This module parses the command line, assembles a session from the
//! configuration and dispatches to the chosen command.

pub mod builtins;
pub mod chat;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::cli::builtins::register_builtins;
use crate::cli::chat::run_chat;
use crate::core::config::{Config, ConfigError};
use crate::core::history::{storage_key, ChatHistory, FileStore, KeyValueStore, MemoryStore};
use crate::mcp::aggregator::{Aggregator, ToolFilter, ToolRouter};
use crate::mcp::server::McpServer;
use crate::mcp::transport::connect_source;
use crate::mcp::McpSource;
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "palaver")]
#[command(about = "A line-based chat client that lets the model call MCP tools")]
#[command(
    long_about = "Palaver drives an OpenAI-compatible chat completions endpoint and lets the \
model call tools served in-process or by external MCP servers over WebSocket or \
streamable HTTP.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    API key used when the config file has none\n\
  RUST_LOG          Overrides the log filter\n\n\
Chat commands:\n\
  /tools            List the tools offered to the model\n\
  /clear            Clear the conversation and its stored history\n\
  /quit             Leave the chat"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Model to use for chat
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Base URL of the chat completions API
    #[arg(short = 'b', long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Print replies as they stream in
    #[arg(long, global = true)]
    pub stream: bool,

    /// Debug logging for palaver on stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Enable logging to specified file
    #[arg(short = 'l', long, global = true)]
    pub log: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat interface (default)
    Chat,
    /// Connect all tool sources and list what the model would see
    Tools,
    /// Delete the stored conversation for the configured model and endpoint
    ClearHistory,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("❌ {err}");
            std::process::exit(1);
        }
    };

    match args.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat(config, args.log).await,
        Commands::Tools => {
            list_tools(&config).await;
            Ok(())
        }
        Commands::ClearHistory => {
            let history = open_history(&config);
            history.clear().await;
            println!("✅ Cleared history for {}", history.storage_key());
            Ok(())
        }
    }
}

/// The config file with command-line overrides applied.
pub fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(model) = &args.model {
        config.model = Some(model.clone());
    }
    if let Some(base_url) = &args.base_url {
        config.base_url = Some(base_url.clone());
    }
    if args.stream {
        config.streaming = Some(true);
    }
    Ok(config)
}

/// Built-in tools plus every enabled external server, not yet connected.
pub fn build_aggregator(config: &Config) -> Aggregator {
    let server = McpServer::new();
    register_builtins(&server, config);
    let internal: Arc<dyn McpSource> = Arc::new(server.connect());

    let externals = config
        .enabled_servers()
        .map(|(id, server)| (id.clone(), connect_source(id, server, &config.env)))
        .collect();

    Aggregator::new(
        internal,
        externals,
        ToolFilter::new(config.allowed_tools.clone(), config.blocked_tools.clone()),
    )
}

/// History for the configured model, endpoint and key. Falls back to an
/// in-memory store when there is no data directory.
pub fn open_history(config: &Config) -> ChatHistory {
    let store: Arc<dyn KeyValueStore> = match FileStore::default_location() {
        Some(store) => Arc::new(store),
        None => {
            warn!("No data directory available; history will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };
    let key = storage_key(
        config.model(),
        config.base_url(),
        config.api_key().as_deref(),
    );
    ChatHistory::new(store, key, config.history_depth_hours())
}

async fn list_tools(config: &Config) {
    let aggregator = build_aggregator(config);
    let status = aggregator.connect().await;

    print_tool_catalog(&aggregator);

    if let Some(err) = aggregator.internal_error() {
        println!("\nBuilt-in tools failed to load: {err}");
    }
    let servers = aggregator.server_statuses();
    if !servers.is_empty() {
        println!("\nServers:");
        for server in servers {
            match (server.connected, server.last_error) {
                (true, _) => println!("  ✅ {} ({} tools)", server.id, server.tool_count),
                (false, Some(err)) => println!("  ❌ {}: {err}", server.id),
                (false, None) => println!("  ❌ {}", server.id),
            }
        }
    }
    println!("\nStatus: {}", status.as_str());

    aggregator.disconnect().await;
}

pub(crate) fn print_tool_catalog(router: &dyn ToolRouter) {
    let tools = router.tool_catalog();
    if tools.is_empty() {
        println!("No tools available.");
        return;
    }
    println!("Available tools:");
    for tool in tools {
        if tool.description.is_empty() {
            println!("  • {}", tool.name);
        } else {
            println!("  • {}: {}", tool.name, tool.description);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_is_the_default_command() {
        let args = Args::try_parse_from(["palaver"]).expect("parse");
        assert!(args.command.is_none());

        let args = Args::try_parse_from(["palaver", "tools", "-m", "qwen3", "--stream"])
            .expect("parse");
        assert!(matches!(args.command, Some(Commands::Tools)));
        assert_eq!(args.model.as_deref(), Some("qwen3"));
        assert!(args.stream);
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = \"from-file\"\nbase_url = \"http://file/v1\"\n")
            .expect("write");

        let args = Args::try_parse_from([
            "palaver",
            "--config",
            path.to_str().expect("utf-8 path"),
            "-b",
            "http://flag/v1",
        ])
        .expect("parse");
        let config = load_config(&args).expect("load");

        assert_eq!(config.model(), "from-file");
        assert_eq!(config.base_url(), "http://flag/v1");
        assert!(!config.streaming());
    }

    #[tokio::test]
    async fn builtins_reach_the_catalog_without_external_servers() {
        let aggregator = build_aggregator(&Config::default());
        aggregator.connect().await;

        let names: Vec<String> = aggregator
            .tool_catalog()
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert!(names.contains(&"get_current_time".to_string()));
        assert!(names.contains(&"echo".to_string()));
        assert_eq!(
            aggregator
                .static_snippets()
                .iter()
                .map(|snippet| snippet.uri.as_str())
                .collect::<Vec<_>>(),
            vec![builtins::CONFIG_RESOURCE_URI]
        );
    }
}
