//! Completion backends: the seam between the conversation loop and an
//! OpenAI-compatible `chat/completions` endpoint.

use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::api::{AssistantReply, ChatCompletion, ChatRequest};
use crate::core::chat_stream::{extract_error_summary, read_chat_stream};
use crate::utils::url::construct_api_url;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatError {
    /// Non-2xx status, with the provider's `error.message` when it sent one.
    Api { status: u16, message: Option<String> },
    /// An error payload delivered inside an event stream.
    Stream(String),
    Network(String),
    Decode(String),
    LoopLimit,
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Api {
                status,
                message: Some(message),
            } => write!(f, "API error {status}: {message}"),
            ChatError::Api { status, .. } => write!(f, "API error {status}"),
            ChatError::Stream(message) => write!(f, "{message}"),
            ChatError::Network(message) => write!(f, "network error: {message}"),
            ChatError::Decode(message) => write!(f, "could not decode completion: {message}"),
            ChatError::LoopLimit => write!(f, "tool loop limit reached"),
        }
    }
}

impl std::error::Error for ChatError {}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<AssistantReply, ChatError>;

    /// Streamed variant. Backends without streaming support deliver the whole
    /// content as a single chunk.
    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AssistantReply, ChatError> {
        let reply = self.complete(request).await?;
        if let Some(content) = reply.content.as_deref().filter(|text| !text.is_empty()) {
            on_chunk(content);
        }
        Ok(reply)
    }
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response, ChatError> {
        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        debug!(url = %chat_url, model = %request.model, stream = request.stream, "Sending completion request");

        let mut http_request = self
            .client
            .post(chat_url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = &self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = http_request
            .json(request)
            .send()
            .await
            .map_err(|err| ChatError::Network(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            debug!(status, body = %body, "Completion request failed");
            return Err(ChatError::Api {
                status,
                message: provider_message(&body),
            });
        }
        Ok(response)
    }
}

fn provider_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| extract_error_summary(&value))
        .filter(|summary| !summary.is_empty())
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<AssistantReply, ChatError> {
        let response = self.send(request).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|err| ChatError::Decode(err.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| ChatError::Decode("response has no choices".to_string()))
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<AssistantReply, ChatError> {
        let mut request = request.clone();
        request.stream = true;
        let response = self.send(&request).await?;
        read_chat_stream(response, on_chunk).await
    }
}
