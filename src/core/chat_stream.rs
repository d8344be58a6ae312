use std::collections::BTreeMap;

use futures_util::StreamExt;
use memchr::memchr;
use serde_json::Value;
use tracing::debug;

use crate::api::{AssistantReply, ChatResponse, ReplyToolCall, ReplyToolFunction};
use crate::core::completion::ChatError;

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Rebuilds one assistant message from streamed deltas. Tool calls are keyed
/// by their `index`; name and argument fragments are concatenated in
/// arrival order.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame in. Returns the content text it added, if any.
    pub fn apply(&mut self, response: ChatResponse) -> Option<String> {
        let choice = response.choices.into_iter().next()?;
        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }

        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let index = delta.index.unwrap_or_else(|| self.implied_index(delta.id.as_deref()));
            let entry = self.tool_calls.entry(index).or_default();
            if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                entry.id = Some(id);
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    entry.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    entry.arguments.push_str(&arguments);
                }
            }
        }

        let content = choice.delta.content.filter(|text| !text.is_empty())?;
        self.content.push_str(&content);
        Some(content)
    }

    // Deltas without an index continue the latest call unless they bring a
    // new id.
    fn implied_index(&self, id: Option<&str>) -> u32 {
        let last = self.tool_calls.iter().next_back();
        match (last, id) {
            (None, _) => 0,
            (Some((index, call)), Some(id)) if call.id.as_deref() != Some(id) => index + 1,
            (Some((index, _)), _) => *index,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn into_reply(self) -> AssistantReply {
        let tool_calls: Vec<ReplyToolCall> = self
            .tool_calls
            .into_values()
            .filter(|call| !call.name.trim().is_empty())
            .map(|call| ReplyToolCall {
                id: call.id,
                function: ReplyToolFunction {
                    name: call.name,
                    arguments: Value::String(call.arguments),
                },
            })
            .collect();

        AssistantReply {
            content: (!self.content.is_empty()).then_some(self.content),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        }
    }
}

enum PayloadOutcome {
    Continue,
    Done,
    Failed(String),
}

fn handle_data_payload(
    payload: &str,
    accumulator: &mut StreamAccumulator,
    on_chunk: &mut (dyn FnMut(&str) + Send),
) -> PayloadOutcome {
    if payload == "[DONE]" {
        return PayloadOutcome::Done;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(content) = accumulator.apply(response) {
                on_chunk(&content);
            }
            PayloadOutcome::Continue
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return PayloadOutcome::Continue;
            }
            PayloadOutcome::Failed(format_api_error(payload))
        }
    }
}

fn process_sse_line(
    line: &str,
    accumulator: &mut StreamAccumulator,
    on_chunk: &mut (dyn FnMut(&str) + Send),
) -> PayloadOutcome {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, accumulator, on_chunk))
        .unwrap_or(PayloadOutcome::Continue)
}

/// Read a `text/event-stream` completion body to the end (or `[DONE]`),
/// forwarding content fragments to `on_chunk` as they arrive.
pub async fn read_chat_stream(
    response: reqwest::Response,
    on_chunk: &mut (dyn FnMut(&str) + Send),
) -> Result<AssistantReply, ChatError> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut accumulator = StreamAccumulator::new();

    while let Some(chunk) = stream.next().await {
        let chunk_bytes = chunk.map_err(|err| ChatError::Network(err.to_string()))?;
        buffer.extend_from_slice(&chunk_bytes);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let outcome = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(line) => process_sse_line(line.trim(), &mut accumulator, on_chunk),
                Err(err) => {
                    debug!(error = %err, "Invalid UTF-8 in stream");
                    PayloadOutcome::Continue
                }
            };
            buffer.drain(..=newline_pos);

            match outcome {
                PayloadOutcome::Continue => {}
                PayloadOutcome::Done => return Ok(finish(accumulator)),
                PayloadOutcome::Failed(message) => return Err(ChatError::Stream(message)),
            }
        }
    }

    if let Ok(line) = std::str::from_utf8(&buffer) {
        if let PayloadOutcome::Failed(message) =
            process_sse_line(line.trim(), &mut accumulator, on_chunk)
        {
            return Err(ChatError::Stream(message));
        }
    }
    Ok(finish(accumulator))
}

fn finish(accumulator: StreamAccumulator) -> AssistantReply {
    debug!(
        finish_reason = accumulator.finish_reason().unwrap_or("none"),
        content_len = accumulator.content().len(),
        "Completion stream ended"
    );
    accumulator.into_reply()
}

pub(crate) fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
                }
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> ChatResponse {
        serde_json::from_value(value).expect("frame")
    }

    #[test]
    fn process_sse_line_handles_spacing_variants() {
        let variants = [
            (
                r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
                "Hello",
                "data: [DONE]",
            ),
            (
                r#"data:{"choices":[{"delta":{"content":"World"}}]}"#,
                "World",
                "data:[DONE]",
            ),
        ];

        for (chunk_line, expected_chunk, done_line) in variants {
            let mut accumulator = StreamAccumulator::new();
            let mut chunks = Vec::new();
            let mut on_chunk = |text: &str| chunks.push(text.to_string());

            assert!(matches!(
                process_sse_line(chunk_line, &mut accumulator, &mut on_chunk),
                PayloadOutcome::Continue
            ));
            assert!(matches!(
                process_sse_line(done_line, &mut accumulator, &mut on_chunk),
                PayloadOutcome::Done
            ));
            assert_eq!(chunks, vec![expected_chunk.to_string()]);
            assert_eq!(accumulator.content(), expected_chunk);
        }
    }

    #[test]
    fn process_sse_line_routes_stream_errors() {
        let mut accumulator = StreamAccumulator::new();
        let mut on_chunk = |_: &str| {};
        let error_line = r#"data: {"error":{"message":"internal server error"}}"#;

        match process_sse_line(error_line, &mut accumulator, &mut on_chunk) {
            PayloadOutcome::Failed(text) => {
                let expected = r#"API Error: internal server error
```json
{
  "error": {
    "message": "internal server error"
  }
}
```"#;
                assert_eq!(text, expected);
            }
            _ => panic!("expected a stream error"),
        }
    }

    #[test]
    fn accumulator_joins_tool_call_fragments_by_index() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.apply(frame(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_a", "type": "function", "function": {"name": "search", "arguments": ""}},
        ]}}]})));
        accumulator.apply(frame(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 1, "id": "call_b", "function": {"name": "get_", "arguments": "{}"}},
            {"index": 0, "function": {"arguments": "{\"q\":"}},
        ]}}]})));
        accumulator.apply(frame(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"rust\"}"}},
            {"index": 1, "function": {"name": "time"}},
        ]}, "finish_reason": "tool_calls"}]})));

        assert_eq!(accumulator.finish_reason(), Some("tool_calls"));
        let reply = accumulator.into_reply();
        assert_eq!(reply.content, None);
        let calls = reply.tool_calls.expect("tool calls");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_deref(), Some("call_a"));
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(calls[0].function.arguments, json!("{\"q\":\"rust\"}"));
        assert_eq!(calls[1].function.name, "get_time");
        assert_eq!(calls[1].function.arguments, json!("{}"));
    }

    #[test]
    fn accumulator_handles_missing_indexes() {
        let mut accumulator = StreamAccumulator::new();
        accumulator.apply(frame(json!({"choices": [{"delta": {"tool_calls": [
            {"id": "a", "function": {"name": "one", "arguments": "{"}},
        ]}}]})));
        accumulator.apply(frame(json!({"choices": [{"delta": {"tool_calls": [
            {"function": {"arguments": "}"}},
        ]}}]})));
        accumulator.apply(frame(json!({"choices": [{"delta": {"tool_calls": [
            {"id": "b", "function": {"name": "two", "arguments": "{}"}},
        ]}}]})));

        let calls = accumulator.into_reply().tool_calls.expect("tool calls");
        let summary: Vec<(String, Value)> = calls
            .into_iter()
            .map(|call| (call.function.name, call.function.arguments))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("one".to_string(), json!("{}")),
                ("two".to_string(), json!("{}")),
            ]
        );
    }

    #[test]
    fn format_api_error_prettifies_json_with_summary() {
        let raw = r#"{"error":{"message":"model overloaded","type":"invalid_request_error"}}"#;
        let formatted = format_api_error(raw);

        let expected = r#"API Error: model overloaded
```json
{
  "error": {
    "message": "model overloaded",
    "type": "invalid_request_error"
  }
}
```"#;
        assert_eq!(formatted, expected);
    }

    #[test]
    fn format_api_error_handles_json_without_summary() {
        let raw = r#"{"status":"failed"}"#;
        let formatted = format_api_error(raw);

        let expected = r#"API Error:
```json
{
  "status": "failed"
}
```"#;
        assert_eq!(formatted, expected);
    }

    #[test]
    fn format_api_error_handles_xml_and_plaintext() {
        let xml = "<error>bad</error>";
        let plain = "api failure";

        let formatted_xml = format_api_error(xml);
        let formatted_plain = format_api_error(plain);

        assert_eq!(formatted_xml, "API Error:\n```xml\n<error>bad</error>\n```");
        assert_eq!(formatted_plain, "API Error:\n```\napi failure\n```");
    }
}
