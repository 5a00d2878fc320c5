//! Ollama chat model
//!
//! Talks to Ollama's `/api/chat` endpoint without streaming. Local models have
//! no price, so every call reports a cost of zero and counts as one call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Message, Model, ModelError, ModelResponse};

/// Connection settings for an Ollama server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server (e.g., "http://localhost:11434")
    pub base_url: String,
    /// Model to use (e.g., "qwen3")
    pub model: String,
    pub temperature: f64,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3".to_string(),
            temperature: 0.0,
            request_timeout_secs: 600,
        }
    }
}

/// Wire form of a message; `full_content` never leaves the process
#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

/// Response from /api/chat
#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatReply,
}

/// [`Model`] backed by Ollama's chat API
#[derive(Clone)]
pub struct OllamaModel {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaModel {
    pub fn new(config: OllamaConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    fn request_body(&self, messages: &[Message]) -> serde_json::Value {
        let wire: Vec<WireMessage<'_>> = messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();

        serde_json::json!({
            "model": self.config.model,
            "messages": wire,
            "stream": false,
            "options": {
                "temperature": self.config.temperature
            }
        })
    }
}

#[async_trait]
impl Model for OllamaModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn query(&self, messages: &[Message]) -> Result<ModelResponse, ModelError> {
        let endpoint = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        let body = self.request_body(messages);

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)?;
        Ok(ModelResponse::text(chat_response.message.content))
    }
}
