//! Model client for AI inference using OpenAI-compatible API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use super::messages::ChatMessage;
use super::stream::{sse_chunks, ChunkStream};

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Model returned an empty response")]
    EmptyResponse,
}

/// What a model call yields: the full text, or a lazy sequence of fragments.
pub enum Completion {
    Text(String),
    Stream(ChunkStream),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The model capability consumed by the agent loop.
///
/// Implementations make exactly one attempt per call; retry policy belongs to
/// the caller.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        streaming: bool,
    ) -> Result<Completion, ModelError>;

    /// Model identifier, reported in events.
    fn model_name(&self) -> &str;
}

/// Configuration for the AI model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub extra_body: HashMap<String, Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gui-owl-7b".to_string(),
            max_tokens: 2048,
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.0,
            extra_body: HashMap::new(),
        }
    }
}

impl ModelConfig {
    /// Create a new ModelConfig with custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new ModelConfig with custom API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Create a new ModelConfig with custom model name.
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = penalty;
        self
    }

    /// Add a provider-specific field to every request body.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_body.insert(key.into(), value);
        self
    }
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Client for interacting with OpenAI-compatible vision-language models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    /// Create a new ModelClient with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ModelConfig::default())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, messages: &[ChatMessage], streaming: bool) -> Value {
        let mut body = json!({
            "model": self.config.model_name,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
            "stream": streaming,
        });
        if let Some(obj) = body.as_object_mut() {
            for (key, value) in &self.config.extra_body {
                obj.insert(key.clone(), value.clone());
            }
        }
        body
    }

    fn parse_completion(body: ChatCompletionResponse) -> Result<String, ModelError> {
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelError::ParseError("missing choices[0].message.content".into()))?;
        if content.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(content)
    }
}

#[async_trait]
impl ModelGateway for ModelClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        streaming: bool,
    ) -> Result<Completion, ModelError> {
        let body = self.request_body(messages, streaming);
        debug!(
            model = %self.config.model_name,
            messages = messages.len(),
            streaming,
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        if streaming {
            Ok(Completion::Stream(sse_chunks(response.bytes_stream())))
        } else {
            let parsed: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| ModelError::ParseError(e.to_string()))?;
            Ok(Completion::Text(Self::parse_completion(parsed)?))
        }
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_default() {
        let config = ModelConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000/v1");
        assert_eq!(config.max_tokens, 2048);
        assert!(config.extra_body.is_empty());
    }

    #[test]
    fn test_request_body_merges_extra_fields() {
        let client = ModelClient::new(
            ModelConfig::default()
                .with_base_url("http://example.test/v1/")
                .with_extra("skip_special_tokens", json!(false)),
        );
        let body = client.request_body(&[ChatMessage::user("hi")], true);

        assert_eq!(client.endpoint(), "http://example.test/v1/chat/completions");
        assert_eq!(body["stream"], true);
        assert_eq!(body["skip_special_tokens"], false);
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn test_parse_completion() {
        let body: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "<tool_call>{}</tool_call>"}}]
        }))
        .unwrap();
        assert_eq!(
            ModelClient::parse_completion(body).unwrap(),
            "<tool_call>{}</tool_call>"
        );

        let empty: ChatCompletionResponse =
            serde_json::from_value(json!({"choices": [{"message": {"content": "  "}}]})).unwrap();
        assert!(matches!(
            ModelClient::parse_completion(empty),
            Err(ModelError::EmptyResponse)
        ));

        let missing: ChatCompletionResponse =
            serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            ModelClient::parse_completion(missing),
            Err(ModelError::ParseError(_))
        ));
    }
}
