//! The conversation loop.
//!
//! A turn appends the user message and then alternates completion calls with
//! tool execution until the model answers in text, goes silent, or the tool
//! round limit is hit. Malformed replies get at most one corrective retry of
//! each kind per turn.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{AssistantReply, ChatMessage, ChatRequest};
use crate::core::completion::{ChatError, CompletionBackend};
use crate::core::config::{Config, ToolsMode, ValidationConfig};
use crate::core::context::{ContextManager, DisplayOptions};
use crate::core::history::ChatHistory;
use crate::core::message::{Message, Role, ToolCallRef};
use crate::core::parser::{parse_reply, ParsedReply};
use crate::core::prompt::tool_definitions;
use crate::core::strings::{self, Strings};
use crate::core::validator::{Correction, Validator};
use crate::mcp::aggregator::ToolRouter;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tool_loops: usize,
    pub max_context_tokens: usize,
    pub tools_mode: ToolsMode,
    pub streaming: bool,
    pub greeting: Option<String>,
    pub validation: Option<ValidationConfig>,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model().to_string(),
            temperature: config.temperature(),
            max_tool_loops: config.max_tool_loops(),
            max_context_tokens: config.max_context_tokens(),
            tools_mode: config.tools_mode,
            streaming: config.streaming(),
            greeting: config.greeting.clone(),
            validation: config.validation.clone(),
        }
    }
}

/// Per-turn bookkeeping. Each repair path fires at most once per turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnContext {
    pub tool_rounds: usize,
    pub completion_calls: usize,
    pub empty_args_retry_used: bool,
    pub control_tag_retry_used: bool,
    pub clarify_used: bool,
    pending_instruction: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model answered in text.
    Answered,
    /// The model produced nothing, even when asked to clarify.
    Silent,
    /// An error message was appended to the conversation.
    Failed(ChatError),
    /// Another turn is still running; the message was dropped.
    Busy,
    /// Blank input.
    Ignored,
}

enum Step {
    Retry,
    Continue,
    Done(TurnOutcome),
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChatSession {
    backend: Arc<dyn CompletionBackend>,
    tools: Arc<dyn ToolRouter>,
    context: ContextManager,
    strings: Strings,
    options: SessionOptions,
    history: Option<ChatHistory>,
    messages: Mutex<Vec<Message>>,
    last_turn: Mutex<TurnContext>,
    processing: AtomicBool,
    streaming: watch::Sender<Option<String>>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<dyn ToolRouter>,
        options: SessionOptions,
        strings: Strings,
        system_prompt: String,
    ) -> Self {
        let (streaming, _) = watch::channel(None);
        Self {
            backend,
            tools,
            context: ContextManager::new(options.max_context_tokens),
            strings,
            options,
            history: None,
            messages: Mutex::new(vec![Message::system(system_prompt)]),
            last_turn: Mutex::new(TurnContext::default()),
            processing: AtomicBool::new(false),
            streaming,
        }
    }

    pub fn with_history(mut self, history: ChatHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Replace the conversation with whatever the store still holds.
    /// Returns the number of restored messages.
    pub async fn restore_history(&self) -> usize {
        let Some(history) = &self.history else {
            return 0;
        };
        let restored = history.load().await;
        let count = restored.len();
        self.with_messages(|messages| {
            messages.truncate(1);
            messages.extend(restored);
        });
        debug!(count, "Restored chat history");
        count
    }

    pub fn messages(&self) -> Vec<Message> {
        self.with_messages(|messages| messages.clone())
    }

    pub fn display_messages(&self, include_tool_messages: bool) -> Vec<Message> {
        let messages = self.messages();
        self.context.display_messages(
            &messages,
            &DisplayOptions {
                greeting: self.options.greeting.as_deref(),
                include_tool_messages,
            },
        )
    }

    pub fn set_system_prompt(&self, prompt: String) {
        self.with_messages(|messages| messages[0] = Message::system(prompt));
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn last_turn(&self) -> TurnContext {
        self.last_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Live text of the reply currently being streamed, `None` between
    /// replies.
    pub fn subscribe_streaming(&self) -> watch::Receiver<Option<String>> {
        self.streaming.subscribe()
    }

    pub fn streaming_message(&self) -> Option<String> {
        self.streaming.borrow().clone()
    }

    pub async fn clear(&self) {
        self.with_messages(|messages| messages.truncate(1));
        if let Some(history) = &self.history {
            history.clear().await;
        }
    }

    pub async fn send_message(&self, text: &str) -> TurnOutcome {
        let text = text.trim();
        if text.is_empty() {
            return TurnOutcome::Ignored;
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Turn already in progress; ignoring message");
            return TurnOutcome::Busy;
        }
        let _guard = BusyGuard(&self.processing);

        self.push(Message::user(text));
        let mut turn = TurnContext::default();
        let outcome = self.run_turn(&mut turn, text).await;

        if let TurnOutcome::Failed(err) = &outcome {
            let message = self.error_text(err);
            warn!(error = %err, "Turn failed");
            self.push(Message::assistant(
                self.strings
                    .format(strings::ERROR_MESSAGE, &[("message", message.as_str())]),
            ));
        }
        *self.last_turn.lock().unwrap_or_else(PoisonError::into_inner) = turn;

        if let Some(history) = &self.history {
            history.save(&self.messages()).await;
        }
        outcome
    }

    async fn run_turn(&self, turn: &mut TurnContext, question: &str) -> TurnOutcome {
        loop {
            let reply = match self.request_completion(turn).await {
                Ok(reply) => reply,
                Err(err) => return TurnOutcome::Failed(err),
            };
            let parsed = parse_reply(&reply);

            match self.handle_reply(turn, parsed, question).await {
                Step::Retry => continue,
                Step::Continue => {
                    if turn.tool_rounds >= self.options.max_tool_loops {
                        return TurnOutcome::Failed(ChatError::LoopLimit);
                    }
                }
                Step::Done(outcome) => return outcome,
            }
        }
    }

    async fn handle_reply(&self, turn: &mut TurnContext, parsed: ParsedReply, question: &str) -> Step {
        if !parsed.has_tool_calls() {
            if parsed.degenerate && !turn.empty_args_retry_used {
                info!("Model returned an empty payload; asking it to retry");
                turn.empty_args_retry_used = true;
                turn.pending_instruction = Some(self.strings.get(strings::EMPTY_ARGUMENTS_RETRY));
                return Step::Retry;
            }
            if parsed.unparsed_control_tags && !turn.control_tag_retry_used {
                info!("Model returned raw control tags; asking for tool_calls");
                turn.control_tag_retry_used = true;
                turn.pending_instruction = Some(self.strings.get(strings::CONTROL_TAG_RETRY));
                return Step::Retry;
            }
        }

        if parsed.has_tool_calls() {
            if turn.tool_rounds >= self.options.max_tool_loops {
                return Step::Done(TurnOutcome::Failed(ChatError::LoopLimit));
            }
            let content = parsed.has_content().then(|| parsed.content.clone());
            let mut message = Message::assistant_tool_calls(content, parsed.tool_calls.clone());
            message.reasoning = parsed.reasoning;
            self.push(message);

            let responses = self.execute_tool_calls(&parsed.tool_calls).await;
            self.with_messages(|messages| messages.extend(responses));
            turn.tool_rounds += 1;
            return Step::Continue;
        }

        if parsed.has_content() {
            let mut message = Message::assistant(parsed.content.clone());
            message.reasoning = parsed.reasoning;
            self.push(message);
            self.validate(question, &parsed.content).await;
            return Step::Done(TurnOutcome::Answered);
        }

        if !turn.clarify_used {
            info!("Model returned nothing; asking for a clarifying question");
            turn.clarify_used = true;
            turn.pending_instruction = Some(self.strings.get(strings::CLARIFY_RETRY));
            return Step::Retry;
        }
        Step::Done(TurnOutcome::Silent)
    }

    async fn request_completion(&self, turn: &mut TurnContext) -> Result<AssistantReply, ChatError> {
        let instruction = turn.pending_instruction.take().map(Message::system);
        let mut messages: Vec<ChatMessage> = {
            let snapshot = self.messages();
            let reserved = instruction
                .as_ref()
                .map(|message| self.context.message_tokens(message))
                .unwrap_or(0);
            self.context.api_messages_reserving(&snapshot, reserved)
        };
        if let Some(instruction) = instruction {
            messages.push(instruction.to_api_message());
        }

        let catalog = self.tools.tool_catalog();
        let offer_tools = self.options.tools_mode == ToolsMode::Api && !catalog.is_empty();
        let request = ChatRequest {
            model: self.options.model.clone(),
            messages,
            tools: offer_tools.then(|| tool_definitions(&catalog)),
            tool_choice: offer_tools.then(|| "auto".to_string()),
            temperature: self.options.temperature,
            stream: false,
        };
        turn.completion_calls += 1;
        debug!(
            call = turn.completion_calls,
            messages = request.messages.len(),
            tools = catalog.len(),
            "Requesting completion"
        );

        if !self.options.streaming {
            return self.backend.complete(&request).await;
        }

        let mut live = String::new();
        let streaming = &self.streaming;
        let mut on_chunk = |chunk: &str| {
            live.push_str(chunk);
            streaming.send_replace(Some(live.clone()));
        };
        let result = self.backend.complete_streaming(&request, &mut on_chunk).await;
        self.streaming.send_replace(None);
        result
    }

    /// Runs every call concurrently and returns one tool message per call,
    /// in call order.
    async fn execute_tool_calls(&self, calls: &[ToolCallRef]) -> Vec<Message> {
        let available: HashSet<String> = self
            .tools
            .tool_catalog()
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        join_all(
            calls
                .iter()
                .map(|call| self.execute_tool_call(call, &available)),
        )
        .await
    }

    async fn execute_tool_call(&self, call: &ToolCallRef, available: &HashSet<String>) -> Message {
        let content = match call.arguments.parse() {
            Err(err) => {
                debug!(tool = %call.name, error = %err, "Tool arguments are not valid JSON");
                self.tool_error(strings::INVALID_ARGUMENTS_FORMAT, &[("error_message", err.as_str())])
            }
            Ok(_) if !available.contains(&call.name) => {
                warn!(tool = %call.name, "Model called an unknown tool");
                self.tool_error(strings::TOOL_NOT_REGISTERED, &[("tool_name", call.name.as_str())])
            }
            Ok(arguments) => match self.tools.call_tool(&call.name, arguments).await {
                Ok(Value::Null) => self.tool_error(strings::TOOL_RESPONSE_ERROR, &[]),
                Ok(result) => {
                    debug!(tool = %call.name, "Tool call succeeded");
                    result.to_string()
                }
                Err(err) => {
                    warn!(tool = %call.name, error = %err, "Tool call failed");
                    self.tool_error(
                        strings::TOOL_EXECUTION_ERROR,
                        &[("error_message", err.message.as_str())],
                    )
                }
            },
        };
        Message::tool(call.id.clone(), content)
    }

    fn tool_error(&self, key: &str, args: &[(&str, &str)]) -> String {
        json!({ "error": self.strings.format(key, args) }).to_string()
    }

    async fn validate(&self, question: &str, answer: &str) {
        let Some(config) = &self.options.validation else {
            return;
        };
        let validator = Validator {
            backend: self.backend.as_ref(),
            config,
            strings: &self.strings,
            model: &self.options.model,
        };
        match validator.review(Some(question), answer).await {
            Some(Correction::Warn(warning)) => self.push(Message::assistant(warning)),
            Some(Correction::Revise(revision)) => self.with_messages(|messages| {
                if let Some(last) = messages.iter_mut().rev().find(|m| m.role == Role::Assistant) {
                    last.content = Some(revision);
                }
            }),
            None => {}
        }
    }

    fn error_text(&self, err: &ChatError) -> String {
        match err {
            ChatError::Api { status, message } => self.strings.api_error(*status, message.as_deref()),
            ChatError::Stream(message) => message.clone(),
            ChatError::Network(message) => self
                .strings
                .format(strings::NETWORK_ERROR, &[("error_message", message.as_str())]),
            ChatError::Decode(message) => self
                .strings
                .format(strings::DECODE_ERROR, &[("error_message", message.as_str())]),
            ChatError::LoopLimit => self.strings.get(strings::LOOP_LIMIT_REACHED),
        }
    }

    fn push(&self, message: Message) {
        self.with_messages(|messages| messages.push(message));
    }

    fn with_messages<R>(&self, f: impl FnOnce(&mut Vec<Message>) -> R) -> R {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut messages)
    }
}
