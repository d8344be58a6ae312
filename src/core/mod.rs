pub mod chat_stream;
pub mod completion;
pub mod config;
pub mod context;
pub mod history;
pub mod message;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod strings;
pub mod validator;
