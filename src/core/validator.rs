//! Optional second opinion on final answers. Any failure counts as a pass.

use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatRequest};
use crate::core::completion::CompletionBackend;
use crate::core::config::{ValidationConfig, ValidationMode};
use crate::core::message::Message;
use crate::core::strings::{self, Strings};

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid,
    Invalid {
        note: String,
        revision: Option<String>,
    },
}

/// What the conversation should do with a failed verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    /// Append this warning after the answer.
    Warn(String),
    /// Replace the answer text.
    Revise(String),
}

pub struct Validator<'a> {
    pub backend: &'a dyn CompletionBackend,
    pub config: &'a ValidationConfig,
    pub strings: &'a Strings,
    pub model: &'a str,
}

impl Validator<'_> {
    pub async fn review(&self, question: Option<&str>, answer: &str) -> Option<Correction> {
        let verdict = self.check(question, answer).await;
        correction_for(verdict, self.config.mode, self.strings)
    }

    pub async fn check(&self, question: Option<&str>, answer: &str) -> Verdict {
        let mut instruction = self.strings.get(strings::VALIDATOR_INSTRUCTION);
        if let Some(extra) = self
            .config
            .instruction
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            instruction.push_str("\n\n");
            instruction.push_str(extra);
        }

        let review = format!(
            "Question:\n{}\n\nAnswer:\n{}",
            question.unwrap_or_default(),
            answer
        );
        let request = ChatRequest {
            model: self.model.to_string(),
            messages: vec![
                ChatMessage::system(instruction),
                Message::user(review).to_api_message(),
            ],
            tools: None,
            tool_choice: None,
            temperature: 0.0,
            stream: false,
        };

        match self.backend.complete(&request).await {
            Ok(reply) => parse_verdict(reply.content.as_deref().unwrap_or_default()),
            Err(err) => {
                warn!(error = %err, "Validation request failed; accepting answer");
                Verdict::Valid
            }
        }
    }
}

pub fn correction_for(verdict: Verdict, mode: ValidationMode, strings: &Strings) -> Option<Correction> {
    let Verdict::Invalid { note, revision } = verdict else {
        return None;
    };
    match (mode, revision) {
        (ValidationMode::Revise, Some(revision)) => Some(Correction::Revise(revision)),
        _ => Some(Correction::Warn(
            strings.format(strings::VALIDATION_WARNING, &[("note", note.as_str())]),
        )),
    }
}

/// Reads `{valid, note, revision}` out of the validator's reply, tolerating
/// fences and surrounding prose.
pub fn parse_verdict(text: &str) -> Verdict {
    let Some(start) = text.find('{') else {
        debug!("Validator reply had no JSON; accepting answer");
        return Verdict::Valid;
    };
    let value = serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok);

    let Some(value) = value else {
        return Verdict::Valid;
    };
    if value.get("valid").and_then(Value::as_bool) != Some(false) {
        return Verdict::Valid;
    }

    let text_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };
    Verdict::Invalid {
        note: text_field("note").unwrap_or_default(),
        revision: text_field("revision"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AssistantReply;
    use crate::core::completion::ChatError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedBackend {
        reply: Result<AssistantReply, ChatError>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl CompletionBackend for FixedBackend {
        async fn complete(&self, request: &ChatRequest) -> Result<AssistantReply, ChatError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone()
        }
    }

    #[test]
    fn verdicts_are_read_leniently() {
        assert_eq!(parse_verdict("not json at all"), Verdict::Valid);
        assert_eq!(parse_verdict(r#"{"valid": true, "note": "fine"}"#), Verdict::Valid);
        assert_eq!(parse_verdict(r#"{"note": "missing flag"}"#), Verdict::Valid);
        assert_eq!(
            parse_verdict("```json\n{\"valid\": false, \"note\": \"wrong year\", \"revision\": \"\"}\n```"),
            Verdict::Invalid {
                note: "wrong year".to_string(),
                revision: None,
            }
        );
    }

    #[test]
    fn revise_mode_without_revision_falls_back_to_warning() {
        let strings = Strings::default();
        let verdict = Verdict::Invalid {
            note: "wrong year".to_string(),
            revision: None,
        };
        assert_eq!(
            correction_for(verdict, ValidationMode::Revise, &strings),
            Some(Correction::Warn(
                "⚠️ This answer may be inaccurate: wrong year".to_string()
            ))
        );

        let verdict = Verdict::Invalid {
            note: "n".to_string(),
            revision: Some("It was 1969.".to_string()),
        };
        assert_eq!(
            correction_for(verdict, ValidationMode::Revise, &strings),
            Some(Correction::Revise("It was 1969.".to_string()))
        );
        assert_eq!(correction_for(Verdict::Valid, ValidationMode::Warn, &strings), None);
    }

    #[tokio::test]
    async fn failed_validation_call_accepts_the_answer() {
        let backend = FixedBackend {
            reply: Err(ChatError::Network("refused".to_string())),
            seen: Mutex::new(Vec::new()),
        };
        let config = ValidationConfig {
            mode: ValidationMode::Warn,
            instruction: Some("Check dates.".to_string()),
        };
        let strings = Strings::default();
        let validator = Validator {
            backend: &backend,
            config: &config,
            strings: &strings,
            model: "m",
        };

        assert_eq!(validator.review(Some("When?"), "1970").await, None);
        let seen = backend.seen.lock().unwrap();
        let system = seen[0].messages[0].content.as_deref().unwrap_or_default();
        assert!(system.ends_with("\n\nCheck dates."));
        assert!(seen[0].tools.is_none());
    }
}
