//! Line-based chat loop on stdin/stdout.

use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::warn;

use crate::cli::{build_aggregator, open_history, print_tool_catalog};
use crate::core::completion::OpenAiBackend;
use crate::core::config::Config;
use crate::core::message::{Message, Role};
use crate::core::orchestrator::{ChatSession, SessionOptions, TurnOutcome};
use crate::core::prompt::build_system_prompt;
use crate::core::strings::Strings;
use crate::mcp::aggregator::{Aggregator, ToolRouter};
use crate::utils::logging::TranscriptLog;

pub async fn run_chat(config: Config, log_file: Option<String>) -> Result<(), Box<dyn Error>> {
    let transcript = TranscriptLog::new(log_file)?;
    let strings = Strings::new(config.strings.clone());

    let aggregator = Arc::new(build_aggregator(&config));
    aggregator.connect_internal().await;
    aggregator.preload_static_resources().await;

    let system_prompt = session_prompt(&aggregator, &strings, config.custom_prompt.as_deref());
    let backend = Arc::new(OpenAiBackend::new(config.base_url(), config.api_key()));
    let session = Arc::new(
        ChatSession::new(
            backend,
            aggregator.clone(),
            SessionOptions::from_config(&config),
            strings.clone(),
            system_prompt,
        )
        .with_history(open_history(&config)),
    );

    // External servers join in the background; the prompt is rebuilt once
    // they have all answered or failed.
    let externals = tokio::spawn({
        let aggregator = aggregator.clone();
        let session = session.clone();
        let custom_prompt = config.custom_prompt.clone();
        async move {
            aggregator.connect_externals().await;
            aggregator.preload_static_resources().await;
            for server in aggregator.server_statuses().iter().filter(|s| !s.connected) {
                eprintln!(
                    "\n⚠️  MCP server '{}' unavailable: {}",
                    server.id,
                    server.last_error.as_deref().unwrap_or("unknown error")
                );
            }
            session.set_system_prompt(session_prompt(
                &aggregator,
                &strings,
                custom_prompt.as_deref(),
            ));
        }
    });
    let restored = session.restore_history().await;

    eprintln!("🚀 Starting palaver {}", env!("CARGO_PKG_VERSION"));
    eprintln!("📡 Using model: {}", config.model());
    eprintln!("🌐 API endpoint: {}", config.base_url());
    eprintln!(
        "🔧 Tools: {} built in, {} server(s) connecting",
        aggregator.tool_catalog().len(),
        config.enabled_servers().count()
    );
    if transcript.is_active() {
        eprintln!("📝 Transcript: {}", transcript.status());
    }
    if restored > 0 {
        eprintln!("🕘 Restored {restored} messages");
    }
    eprintln!("💡 /tools lists tools, /clear resets the conversation, /quit exits");

    for message in session.display_messages(false) {
        print_message(&message);
    }

    let mut live = session.subscribe_streaming();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                session.clear().await;
                println!("History cleared.");
            }
            "/tools" => print_tool_catalog(aggregator.as_ref()),
            text => {
                let before = session.messages().len();
                let streamed = run_turn(&session, &mut live, text).await;
                let added = session.messages().into_iter().skip(before);
                for message in added {
                    if let Err(err) = transcript.log_message(&message) {
                        warn!(error = %err, "Failed to write transcript");
                    }
                    if message.role == Role::Assistant {
                        print_reply(&message, &streamed);
                    }
                }
            }
        }
    }

    externals.abort();
    aggregator.disconnect().await;
    Ok(())
}

fn session_prompt(aggregator: &Aggregator, strings: &Strings, custom_prompt: Option<&str>) -> String {
    build_system_prompt(
        strings,
        &aggregator.tool_catalog(),
        &aggregator.static_snippets(),
        custom_prompt,
    )
}

/// Sends one message, echoing streamed text as it arrives. Returns the text
/// already shown for the last streamed reply.
async fn run_turn(
    session: &ChatSession,
    live: &mut watch::Receiver<Option<String>>,
    text: &str,
) -> String {
    let mut shown = String::new();
    let turn = session.send_message(text);
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            Ok(()) = live.changed() => {
                let current = live.borrow_and_update().clone();
                if let Some(current) = current {
                    shown = echo_delta(&shown, &current);
                }
            }
        }
    };
    if !shown.is_empty() {
        println!();
    }

    match outcome {
        TurnOutcome::Busy => eprintln!("⏳ Still working on the previous message"),
        TurnOutcome::Silent => eprintln!("(no reply)"),
        _ => {}
    }
    shown
}

fn echo_delta(shown: &str, current: &str) -> String {
    match current.strip_prefix(shown) {
        Some(delta) => print!("{delta}"),
        None => print!("\n{current}"),
    }
    let _ = std::io::stdout().flush();
    current.to_string()
}

fn print_reply(message: &Message, streamed: &str) {
    let Some(text) = message.display_text() else {
        return;
    };
    if !streamed.is_empty() && text.trim() == streamed.trim() {
        return;
    }
    println!("{text}\n");
}

fn print_message(message: &Message) {
    let Some(text) = message.display_text() else {
        return;
    };
    match message.role {
        Role::User => println!("You: {text}\n"),
        _ => println!("{text}\n"),
    }
}
