//! Palaver is a chat core that lets an LLM call tools over the Model Context
//! Protocol.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the conversation loop: context trimming, reply parsing,
//!   tool execution, validation and history persistence.
//! - [`mcp`] provides the protocol side: JSON-RPC endpoints, the in-process
//!   server/client pair, WebSocket and streamable HTTP adapters, and the
//!   aggregator that merges them into one tool catalog.
//! - [`api`] defines the chat completions payloads.
//! - [`cli`] is the `palaver` binary's line-based host.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
