use crate::api::{ChatMessage, ChatToolCall, ChatToolCallFunction};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

/// Tool-call arguments as the model produced them: a JSON-encoded string
/// (native `tool_calls`) or an already structured value (content dialects).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    Text(String),
    Value(Value),
}

impl ToolArguments {
    /// Decode to a JSON value. Blank strings mean "no arguments".
    pub fn parse(&self) -> Result<Value, String> {
        match self {
            ToolArguments::Text(raw) if raw.trim().is_empty() => Ok(Value::Object(Map::new())),
            ToolArguments::Text(raw) => {
                serde_json::from_str(raw.trim()).map_err(|err| err.to_string())
            }
            ToolArguments::Value(Value::Null) => Ok(Value::Object(Map::new())),
            ToolArguments::Value(value) => Ok(value.clone()),
        }
    }

    /// Wire form for the completion API, which always expects a string.
    pub fn to_json_string(&self) -> String {
        match self {
            ToolArguments::Text(raw) => raw.clone(),
            ToolArguments::Value(Value::Null) => "{}".to_string(),
            ToolArguments::Value(value) => value.to_string(),
        }
    }
}

impl Default for ToolArguments {
    fn default() -> Self {
        ToolArguments::Value(Value::Object(Map::new()))
    }
}

/// A single model-requested invocation in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCallRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Text recovered from a `<think>` block; never sent back to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Only ever set on display projections.
    #[serde(
        rename = "excludedFromContext",
        default,
        skip_serializing_if = "is_false"
    )]
    pub excluded_from_context: bool,
    /// Creation time in epoch milliseconds, carried into persisted records.
    #[serde(skip)]
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
            excluded_from_context: false,
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()))
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCallRef>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.tool_calls = tool_calls;
        message
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, Some(content.into()));
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Content with surrounding whitespace removed, or `None` when blank.
    pub fn display_text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    pub fn to_api_message(&self) -> ChatMessage {
        let tool_calls = if self.tool_calls.is_empty() {
            None
        } else {
            Some(
                self.tool_calls
                    .iter()
                    .map(|call| ChatToolCall {
                        id: call.id.clone(),
                        kind: "function".to_string(),
                        function: ChatToolCallFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.to_json_string(),
                        },
                    })
                    .collect(),
            )
        };

        ChatMessage {
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_parse_strings_and_values() {
        let text = ToolArguments::Text("{\"a\":1}".to_string());
        assert_eq!(text.parse().expect("parse"), json!({"a": 1}));

        let value = ToolArguments::Value(json!({"a": 1}));
        assert_eq!(value.parse().expect("parse"), json!({"a": 1}));
        assert_eq!(value.to_json_string(), "{\"a\":1}");

        let blank = ToolArguments::Text("  ".to_string());
        assert_eq!(blank.parse().expect("parse"), json!({}));

        assert!(ToolArguments::Text("{oops".to_string()).parse().is_err());
    }

    #[test]
    fn api_message_never_carries_exclusion_flag() {
        let mut message = Message::user("hello");
        message.excluded_from_context = true;
        let api = serde_json::to_value(message.to_api_message()).expect("serialize");
        assert_eq!(api, json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn assistant_tool_calls_serialize_as_function_calls() {
        let message = Message::assistant_tool_calls(
            None,
            vec![ToolCallRef::new(
                "call-1",
                "lookup",
                ToolArguments::Value(json!({"q": "x"})),
            )],
        );
        let api = serde_json::to_value(message.to_api_message()).expect("serialize");
        assert_eq!(
            api,
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call-1",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}
                }]
            })
        );
    }

    #[test]
    fn display_flag_round_trips_under_wire_name() {
        let mut message = Message::assistant("old");
        message.excluded_from_context = true;
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["excludedFromContext"], json!(true));
        assert!(Role::try_from("moderator").is_err());
    }
}
