//! Normalizes assistant replies into tool calls plus display text.
//!
//! Models express tool calls in several dialects. Native `tool_calls` win;
//! otherwise the content is tried, in order, for vendor control tags, fenced
//! JSON blocks, a bare JSON object or array, and a legacy bracketed call
//! embedded in prose. Anything that does not parse stays as display text.

use serde_json::Value;
use tracing::debug;

use crate::api::AssistantReply;
use crate::core::message::{ToolArguments, ToolCallRef};
use crate::utils::ids::generate_tool_call_id;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const MESSAGE_TAG: &str = "<|message|>";
const FUNCTIONS_PREFIX: &str = "functions.";
const CONTROL_TAGS: &[&str] = &[
    "<|constrain|>",
    "<|message|>",
    "<|channel|>",
    "<|start|>",
    "<|call|>",
    "<|end|>",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReply {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRef>,
    /// The reply was an empty object such as `{"": {}}`.
    pub degenerate: bool,
    /// Control tags were present but no call could be recovered from them.
    pub unparsed_control_tags: bool,
}

impl ParsedReply {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

pub fn parse_reply(reply: &AssistantReply) -> ParsedReply {
    let raw = reply.content.as_deref().unwrap_or_default();
    let (text, reasoning) = split_reasoning(raw);

    let native: Vec<ToolCallRef> = reply
        .tool_calls
        .iter()
        .flatten()
        .filter(|call| !call.function.name.trim().is_empty())
        .map(|call| {
            let arguments = match &call.function.arguments {
                Value::String(raw) => ToolArguments::Text(raw.clone()),
                Value::Null => ToolArguments::default(),
                other => ToolArguments::Value(other.clone()),
            };
            let id = call
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_tool_call_id);
            ToolCallRef::new(id, call.function.name.trim(), arguments)
        })
        .collect();

    if !native.is_empty() {
        return ParsedReply {
            content: text,
            reasoning,
            tool_calls: native,
            ..ParsedReply::default()
        };
    }

    let mut parsed = parse_content(&text);
    parsed.reasoning = reasoning;
    parsed
}

fn parse_content(text: &str) -> ParsedReply {
    let mut parsed = ParsedReply {
        content: text.to_string(),
        ..ParsedReply::default()
    };

    if CONTROL_TAGS.iter().any(|tag| text.contains(tag)) {
        match parse_control_tags(text) {
            Some((call, display)) => {
                debug!(tool = %call.name, "Recovered tool call from control tags");
                parsed.tool_calls.push(call);
                parsed.content = display;
            }
            None => parsed.unparsed_control_tags = true,
        }
        return parsed;
    }

    if let Some((calls, display, degenerate)) = parse_fenced(text) {
        parsed.tool_calls = calls;
        parsed.content = display;
        parsed.degenerate = degenerate;
        return parsed;
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if is_degenerate(&value) {
                parsed.degenerate = true;
                parsed.content.clear();
                return parsed;
            }
            if let Some(calls) = calls_from_value(&value) {
                parsed.tool_calls = calls;
                parsed.content.clear();
                return parsed;
            }
        }
    }

    if let Some((calls, display)) = parse_bracketed(text) {
        parsed.tool_calls = calls;
        parsed.content = display;
    }
    parsed
}

fn split_reasoning(content: &str) -> (String, Option<String>) {
    // ASCII lowercasing keeps byte offsets valid for the original text.
    let lower = content.to_ascii_lowercase();
    let Some(start) = lower.find(THINK_OPEN) else {
        return (content.trim().to_string(), None);
    };
    let Some(close) = lower[start..].find(THINK_CLOSE) else {
        return (content.trim().to_string(), None);
    };
    let end = start + close;

    let reasoning = content[start + THINK_OPEN.len()..end].trim().to_string();
    let display = join_around(&content[..start], &content[end + THINK_CLOSE.len()..]);
    (display, (!reasoning.is_empty()).then_some(reasoning))
}

fn join_around(before: &str, after: &str) -> String {
    let before = before.trim_end();
    let after = after.trim_start();
    if before.is_empty() || after.is_empty() {
        format!("{before}{after}").trim().to_string()
    } else {
        format!("{before} {after}").trim().to_string()
    }
}

fn parse_control_tags(text: &str) -> Option<(ToolCallRef, String)> {
    let message_at = text.find(MESSAGE_TAG)?;
    let name = function_name(&text[..message_at])?;

    let body = text[message_at + MESSAGE_TAG.len()..].trim_start();
    let arguments = match first_json_value(body) {
        Some(value @ Value::Object(_)) => value,
        _ => return None,
    };

    let display = text
        .find("<|")
        .map(|first_tag| text[..first_tag].trim().to_string())
        .unwrap_or_default();
    let call = ToolCallRef::new(
        generate_tool_call_id(),
        name,
        ToolArguments::Value(arguments),
    );
    Some((call, display))
}

/// The tool name from `functions.<name>` or `to=functions.<name>`.
fn function_name(header: &str) -> Option<&str> {
    let start = header.rfind(FUNCTIONS_PREFIX)? + FUNCTIONS_PREFIX.len();
    let rest = &header[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(rest.len());
    let name = &rest[..end];
    (!name.is_empty()).then_some(name)
}

/// The leading JSON value of `text`, ignoring whatever follows it.
fn first_json_value(text: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
}

/// Tool calls from every ```json (or untagged) fence. `None` when no fence
/// held a call or a degenerate payload.
fn parse_fenced(text: &str) -> Option<(Vec<ToolCallRef>, String, bool)> {
    let mut calls = Vec::new();
    let mut degenerate = false;
    let mut display = String::new();
    let mut cursor = 0;
    let mut matched = false;

    while let Some(open_rel) = text[cursor..].find("```") {
        let open = cursor + open_rel;
        let after_fence = open + 3;
        let Some(line_end_rel) = text[after_fence..].find('\n') else {
            break;
        };
        let language = text[after_fence..after_fence + line_end_rel].trim();
        let body_start = after_fence + line_end_rel + 1;
        let Some(close_rel) = text[body_start..].find("```") else {
            break;
        };
        let close = body_start + close_rel;
        let block_end = close + 3;

        let body = text[body_start..close].trim();
        let consumed = if language.is_empty() || language.eq_ignore_ascii_case("json") {
            match serde_json::from_str::<Value>(body) {
                Ok(value) if is_degenerate(&value) => {
                    degenerate = true;
                    true
                }
                Ok(value) => match calls_from_value(&value) {
                    Some(found) => {
                        calls.extend(found);
                        true
                    }
                    None => false,
                },
                Err(_) => false,
            }
        } else {
            false
        };

        display.push_str(&text[cursor..open]);
        if consumed {
            matched = true;
        } else {
            display.push_str(&text[open..block_end]);
        }
        cursor = block_end;
    }

    if !matched {
        return None;
    }
    display.push_str(&text[cursor..]);
    Some((calls, display.trim().to_string(), degenerate))
}

/// A `[ ... ]` span inside prose that decodes either as an array of calls or,
/// with the brackets stripped, as a single call object.
fn parse_bracketed(text: &str) -> Option<(Vec<ToolCallRef>, String)> {
    let open = text.find('[')?;
    let mut search_from = open + 1;

    while let Some(close_rel) = text[search_from..].find(']') {
        let close = search_from + close_rel;
        let span = &text[open..=close];
        let inner = &text[open + 1..close];

        let calls = serde_json::from_str::<Value>(span)
            .ok()
            .and_then(|value| calls_from_value(&value))
            .or_else(|| {
                serde_json::from_str::<Value>(inner)
                    .ok()
                    .filter(Value::is_object)
                    .and_then(|value| calls_from_value(&value))
            });
        if let Some(calls) = calls {
            let display = join_around(&text[..open], &text[close + 1..]);
            return Some((calls, display));
        }
        search_from = close + 1;
    }
    None
}

/// `{}` or an object whose keys are all blank with empty values.
fn is_degenerate(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    object.iter().all(|(key, inner)| {
        key.trim().is_empty()
            && match inner {
                Value::Null => true,
                Value::Object(map) => map.is_empty(),
                Value::String(text) => text.trim().is_empty(),
                _ => false,
            }
    })
}

fn calls_from_value(value: &Value) -> Option<Vec<ToolCallRef>> {
    match value {
        Value::Array(items) if !items.is_empty() => items.iter().map(call_from_value).collect(),
        Value::Object(_) => call_from_value(value).map(|call| vec![call]),
        _ => None,
    }
}

fn call_from_value(value: &Value) -> Option<ToolCallRef> {
    let object = value.as_object()?;
    let target = object
        .get("function")
        .filter(|function| function.is_object())
        .unwrap_or(value);
    let name = target.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let arguments = match target.get("arguments").or_else(|| target.get("parameters")) {
        None | Some(Value::Null) => ToolArguments::default(),
        Some(Value::String(raw)) => ToolArguments::Text(raw.clone()),
        Some(other) => ToolArguments::Value(other.clone()),
    };
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_tool_call_id);
    Some(ToolCallRef::new(id, name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ReplyToolCall, ReplyToolFunction};
    use serde_json::json;

    fn text_reply(content: &str) -> AssistantReply {
        AssistantReply {
            content: Some(content.to_string()),
            tool_calls: None,
        }
    }

    fn canonical(parsed: &ParsedReply) -> Vec<(String, Value)> {
        parsed
            .tool_calls
            .iter()
            .map(|call| (call.name.clone(), call.arguments.parse().expect("arguments")))
            .collect()
    }

    #[test]
    fn every_dialect_yields_the_same_calls() {
        let expected = vec![("x".to_string(), json!({"a": 1}))];

        let bare = parse_reply(&text_reply(r#"[{"name":"x","arguments":{"a":1}}]"#));
        let native = parse_reply(&AssistantReply {
            content: None,
            tool_calls: Some(vec![ReplyToolCall {
                id: Some("call_1".to_string()),
                function: ReplyToolFunction {
                    name: "x".to_string(),
                    arguments: json!("{\"a\":1}"),
                },
            }]),
        });
        let fenced = parse_reply(&text_reply(
            "```json\n[{\"name\":\"x\",\"arguments\":{\"a\":1}}]\n```",
        ));
        let tagged = parse_reply(&text_reply(
            "<|constrain|>functions.x json<|message|>{\"a\":1}<|call|>",
        ));

        for parsed in [&bare, &native, &fenced, &tagged] {
            assert_eq!(canonical(parsed), expected);
            assert!(!parsed.has_content(), "unexpected text: {:?}", parsed.content);
        }
        assert_eq!(native.tool_calls[0].id, "call_1");
    }

    #[test]
    fn channel_header_names_the_function() {
        let parsed = parse_reply(&text_reply(
            "<|start|>assistant<|channel|>commentary to=functions.get_weather <|constrain|>json<|message|>{\"city\":\"Oslo\"}",
        ));
        assert_eq!(
            canonical(&parsed),
            vec![("get_weather".to_string(), json!({"city": "Oslo"}))]
        );
        assert!(!parsed.unparsed_control_tags);
    }

    #[test]
    fn control_tags_without_a_call_are_flagged() {
        let parsed = parse_reply(&text_reply("<|channel|>analysis<|message|>thinking out loud"));
        assert!(parsed.tool_calls.is_empty());
        assert!(parsed.unparsed_control_tags);
        assert_eq!(parsed.content, "<|channel|>analysis<|message|>thinking out loud");
    }

    #[test]
    fn think_block_becomes_reasoning() {
        let parsed = parse_reply(&text_reply("<THINK>user wants a joke</think>\nWhy did the crab..."));
        assert_eq!(parsed.reasoning.as_deref(), Some("user wants a joke"));
        assert_eq!(parsed.content, "Why did the crab...");

        let native = parse_reply(&AssistantReply {
            content: Some("<think>plan</think>".to_string()),
            tool_calls: Some(vec![ReplyToolCall {
                id: None,
                function: ReplyToolFunction {
                    name: "lookup".to_string(),
                    arguments: json!({"q": "x"}),
                },
            }]),
        });
        assert_eq!(native.reasoning.as_deref(), Some("plan"));
        assert_eq!(native.content, "");
        assert!(native.tool_calls[0].id.starts_with("toolcall_"));
    }

    #[test]
    fn degenerate_payloads_are_detected() {
        assert!(parse_reply(&text_reply(r#"{"": {}}"#)).degenerate);
        assert!(parse_reply(&text_reply("```json\n{\"\": {}}\n```")).degenerate);
        assert!(!parse_reply(&text_reply(r#"{"name":"x"}"#)).degenerate);
    }

    #[test]
    fn legacy_bracket_call_inside_prose() {
        let parsed = parse_reply(&text_reply(
            r#"Let me check [{"name":"lookup","arguments":{"q":"rust"}}] now"#,
        ));
        assert_eq!(
            canonical(&parsed),
            vec![("lookup".to_string(), json!({"q": "rust"}))]
        );
        assert_eq!(parsed.content, "Let me check now");
    }

    #[test]
    fn unrecognized_json_stays_visible() {
        for content in [
            r#"{"temperature": 21}"#,
            "[not json]",
            "Here you go:\n```json\n{\"total\": 3}\n```",
            "```python\nprint('hi')\n```",
        ] {
            let parsed = parse_reply(&text_reply(content));
            assert!(parsed.tool_calls.is_empty(), "{content}");
            assert_eq!(parsed.content, content.trim());
            assert!(!parsed.degenerate);
        }
    }

    #[test]
    fn object_with_function_wrapper_and_string_arguments() {
        let parsed = parse_reply(&text_reply(
            r#"{"type":"function","function":{"name":"echo","arguments":"{\"text\":\"hi\"}"}}"#,
        ));
        assert_eq!(
            canonical(&parsed),
            vec![("echo".to_string(), json!({"text": "hi"}))]
        );
    }
}
