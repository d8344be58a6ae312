//! Token accounting and the context window sent to the model.
//!
//! The canonical history is never modified here. A [`ContextWindow`] marks the
//! oldest non-system messages that do not fit the budget; the API projection
//! leaves them out and the display projection flags them.

use std::sync::Arc;

use crate::api::ChatMessage;
use crate::core::message::{Message, Role};

/// Fixed cost added to every message on top of its text.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;
const CHARS_PER_TOKEN: f64 = 3.5;

pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Roughly one token per 3.5 characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproximateTokenizer;

impl Tokenizer for ApproximateTokenizer {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f64 / CHARS_PER_TOKEN).ceil() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    /// Index of the first non-system message.
    start: usize,
    /// Index of the oldest message that is still sent.
    first_kept: usize,
    pub total_tokens: usize,
    pub kept_tokens: usize,
}

impl ContextWindow {
    pub fn is_excluded(&self, index: usize) -> bool {
        index >= self.start && index < self.first_kept
    }

    pub fn excluded_count(&self) -> usize {
        self.first_kept - self.start
    }

    pub fn first_kept(&self) -> usize {
        self.first_kept
    }
}

#[derive(Debug, Clone, Default)]
pub struct DisplayOptions<'a> {
    pub greeting: Option<&'a str>,
    pub include_tool_messages: bool,
}

#[derive(Clone)]
pub struct ContextManager {
    tokenizer: Arc<dyn Tokenizer>,
    budget: usize,
}

impl ContextManager {
    pub fn new(budget: usize) -> Self {
        Self::with_tokenizer(budget, Arc::new(ApproximateTokenizer))
    }

    pub fn with_tokenizer(budget: usize, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer, budget }
    }

    pub fn message_tokens(&self, message: &Message) -> usize {
        let count = |text: &str| self.tokenizer.count(text);
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|call| count(&call.name) + count(&call.arguments.to_json_string()))
            .sum();

        count(message.role.as_str())
            + message.content.as_deref().map(count).unwrap_or(0)
            + calls
            + message.tool_call_id.as_deref().map(count).unwrap_or(0)
            + MESSAGE_OVERHEAD_TOKENS
    }

    pub fn total_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|message| self.message_tokens(message)).sum()
    }

    pub fn window(&self, messages: &[Message]) -> ContextWindow {
        self.window_reserving(messages, 0)
    }

    /// As [`window`](Self::window), with `reserved` tokens held back for
    /// text appended after the history.
    pub fn window_reserving(&self, messages: &[Message], reserved: usize) -> ContextWindow {
        let budget = self.budget.saturating_sub(reserved);
        let start = usize::from(messages.first().is_some_and(Message::is_system));
        let costs: Vec<usize> = messages.iter().map(|m| self.message_tokens(m)).collect();
        let total_tokens: usize = costs.iter().sum();

        if total_tokens <= budget {
            return ContextWindow {
                start,
                first_kept: start,
                total_tokens,
                kept_tokens: total_tokens,
            };
        }

        let mut running: usize = costs[..start].iter().sum();
        let mut first_kept = messages.len();
        for index in (start..messages.len()).rev() {
            if running + costs[index] > budget {
                break;
            }
            running += costs[index];
            first_kept = index;
        }

        // A tool response is meaningless without the call that produced it.
        while first_kept < messages.len() && messages[first_kept].role == Role::Tool {
            running -= costs[first_kept];
            first_kept += 1;
        }

        ContextWindow {
            start,
            first_kept,
            total_tokens,
            kept_tokens: running,
        }
    }

    /// What the completion endpoint receives.
    pub fn api_messages(&self, messages: &[Message]) -> Vec<ChatMessage> {
        self.api_messages_reserving(messages, 0)
    }

    pub fn api_messages_reserving(&self, messages: &[Message], reserved: usize) -> Vec<ChatMessage> {
        let window = self.window_reserving(messages, reserved);
        messages
            .iter()
            .enumerate()
            .filter(|(index, _)| !window.is_excluded(*index))
            .map(|(_, message)| message.to_api_message())
            .collect()
    }

    /// What a user sees: no system messages, no bare tool-call stubs, and
    /// evicted messages flagged rather than removed.
    pub fn display_messages(&self, messages: &[Message], options: &DisplayOptions<'_>) -> Vec<Message> {
        let window = self.window(messages);
        let greeting = options
            .greeting
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(|text| {
                let mut message = Message::assistant(text);
                message.timestamp = None;
                message
            });

        let history = messages.iter().enumerate().filter_map(|(index, message)| {
            let visible = match message.role {
                Role::System => false,
                Role::Tool => options.include_tool_messages,
                Role::Assistant => message.display_text().is_some(),
                Role::User => true,
            };
            visible.then(|| {
                let mut copy = message.clone();
                copy.excluded_from_context = window.is_excluded(index);
                copy
            })
        });

        greeting.into_iter().chain(history).collect()
    }
}
