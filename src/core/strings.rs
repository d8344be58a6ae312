//! User-facing text and prompt templates. Every entry can be replaced from
//! the `[strings]` config table; `{name}` placeholders are filled at use.

use std::collections::HashMap;

pub const SYSTEM_PROMPT: &str = "system_prompt";
pub const SYSTEM_PROMPT_WITH_TOOLS: &str = "system_prompt_with_tools";
pub const RESOURCES_HEADER: &str = "resources_header";
pub const TOOL_NOT_REGISTERED: &str = "tool_not_registered";
pub const TOOL_EXECUTION_ERROR: &str = "tool_execution_error";
pub const INVALID_ARGUMENTS_FORMAT: &str = "invalid_arguments_format";
pub const SYSTEM_ERROR: &str = "system_error";
pub const TOOL_RESPONSE_ERROR: &str = "tool_response_error";
pub const API_ERROR: &str = "api_error";
pub const INVALID_API_KEY: &str = "invalid_api_key";
pub const INVALID_ENDPOINT: &str = "invalid_endpoint";
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
pub const INVALID_REQUEST: &str = "invalid_request";
pub const INTERNAL_SERVER_ERROR: &str = "internal_server_error";
pub const NETWORK_ERROR: &str = "network_error";
pub const DECODE_ERROR: &str = "decode_error";
pub const LOOP_LIMIT_REACHED: &str = "loop_limit_reached";
pub const ERROR_MESSAGE: &str = "error_message";
pub const EMPTY_ARGUMENTS_RETRY: &str = "empty_arguments_retry";
pub const CONTROL_TAG_RETRY: &str = "control_tag_retry";
pub const CLARIFY_RETRY: &str = "clarify_retry";
pub const VALIDATOR_INSTRUCTION: &str = "validator_instruction";
pub const VALIDATION_WARNING: &str = "validation_warning";

const DEFAULTS: &[(&str, &str)] = &[
    (
        SYSTEM_PROMPT,
        "You are a helpful assistant. You can perform actions using strictly defined tools.

Rules:
1. All actions are performed ONLY through tool calls.
2. If there is not enough information - clarify with the user.
3. Respond in the language of the user.
4. When calling tools, use ONLY standard OpenAI API tool_calls.
5. IMPORTANT: If your model doesn't support native tool_calls, use this format in your response:
   {\"name\": \"tool_name\", \"arguments\": {...parameters...}}
   You can wrap it in markdown: ```json\\n{\"name\": \"...\", \"arguments\": {...}}\\n```
6. DO NOT return just data for the tool - always specify the tool name in the \"name\" field.",
    ),
    (
        SYSTEM_PROMPT_WITH_TOOLS,
        "You are a helpful assistant. You can perform actions using strictly defined tools.

Available tools:
{tools_list}

Rules:
1. All actions are performed ONLY through tool calls.
2. If there is not enough information - clarify with the user.
3. Respond in the language of the user.
4. Tool call FORMAT:
   - Preferred: use standard OpenAI API tool_calls
   - Alternative: {\"name\": \"tool_name\", \"arguments\": {...parameters...}}
   - For multiple calls: [{\"name\": \"tool1\", \"arguments\": {...}}, {\"name\": \"tool2\", \"arguments\": {...}}]
   - Can wrap in markdown: ```json\\n{\"name\": \"...\", \"arguments\": {...}}\\n```
5. IMPORTANT: The \"name\" field must contain the TOOL NAME from the list above, NOT user data!",
    ),
    (RESOURCES_HEADER, "Available resources:"),
    (TOOL_NOT_REGISTERED, "Tool '{tool_name}' is not registered"),
    (TOOL_EXECUTION_ERROR, "Execution error: {error_message}"),
    (INVALID_ARGUMENTS_FORMAT, "Invalid argument format: {error_message}"),
    (SYSTEM_ERROR, "System error: {error_message}"),
    (TOOL_RESPONSE_ERROR, "No response received from tool"),
    (API_ERROR, "API error: {status}"),
    (INVALID_API_KEY, " - Invalid API key"),
    (INVALID_ENDPOINT, " - Invalid endpoint"),
    (RATE_LIMIT_EXCEEDED, " - Rate limit exceeded"),
    (INVALID_REQUEST, " - Invalid request"),
    (INTERNAL_SERVER_ERROR, " - Internal server error"),
    (NETWORK_ERROR, "Network error: {error_message}"),
    (DECODE_ERROR, "Unreadable response: {error_message}"),
    (
        LOOP_LIMIT_REACHED,
        "Processing limit reached. Simplify your request.",
    ),
    (ERROR_MESSAGE, "⚠️ Error: {message}"),
    (
        EMPTY_ARGUMENTS_RETRY,
        "Your previous reply was an empty JSON object. Either call one of the available tools with a tool name and its arguments, or answer the user in plain text.",
    ),
    (
        CONTROL_TAG_RETRY,
        "Your previous reply contained raw control tags instead of a tool call. Convert it into a proper tool_calls entry with the tool name and JSON arguments, or answer in plain text.",
    ),
    (
        CLARIFY_RETRY,
        "Your previous reply was empty. Ask the user one short clarifying question about what they need.",
    ),
    (
        VALIDATOR_INSTRUCTION,
        "You review assistant answers. Check the answer below against the conversation for factual errors, unsupported claims and instructions that were not followed. Respond ONLY with JSON: {\"valid\": true|false, \"note\": \"short reason\", \"revision\": \"corrected answer or empty\"}.",
    ),
    (VALIDATION_WARNING, "⚠️ This answer may be inaccurate: {note}"),
];

#[derive(Debug, Clone, Default)]
pub struct Strings {
    overrides: HashMap<String, String>,
}

impl Strings {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// The override for `key`, else the built-in text, else the key itself.
    pub fn get(&self, key: &str) -> String {
        if let Some(value) = self.overrides.get(key) {
            return value.clone();
        }
        DEFAULTS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, text)| (*text).to_string())
            .unwrap_or_else(|| key.to_string())
    }

    pub fn format(&self, key: &str, args: &[(&str, &str)]) -> String {
        fill(&self.get(key), args)
    }

    /// `API error: <status>` plus the status-specific suffix.
    pub fn api_error(&self, status: u16, provider_message: Option<&str>) -> String {
        let mut text = self.format(API_ERROR, &[("status", status.to_string().as_str())]);
        match status {
            401 => text.push_str(&self.get(INVALID_API_KEY)),
            404 => text.push_str(&self.get(INVALID_ENDPOINT)),
            429 => text.push_str(&self.get(RATE_LIMIT_EXCEEDED)),
            400 => match provider_message.filter(|message| !message.trim().is_empty()) {
                Some(message) => {
                    text.push_str(" - ");
                    text.push_str(message.trim());
                }
                None => text.push_str(&self.get(INVALID_REQUEST)),
            },
            500 => text.push_str(&self.get(INTERNAL_SERVER_ERROR)),
            _ => {}
        }
        text
    }
}

/// Replace every `{name}` with its value. Unknown placeholders stay.
pub fn fill(template: &str, args: &[(&str, &str)]) -> String {
    args.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{name}}}"), value)
    })
}
