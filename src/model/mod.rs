//! Language model collaborator
//!
//! The agent loop only needs one capability from a model: turn a list of
//! messages into a reply. Accounting is returned per call (`calls_delta`,
//! `cost_delta`) and accumulated by the caller, so limit checks never depend on
//! hidden counters inside the model object.

pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ollama::{OllamaConfig, OllamaModel};

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in the conversation
///
/// `content` is what the model sees. When an observation has been compressed,
/// `full_content` keeps the original text for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            full_content: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A user message whose visible content replaces a longer original
    pub fn compressed(content: impl Into<String>, full_content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            full_content: Some(full_content.into()),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.full_content.is_some()
    }

    /// The uncompressed form: `content` holds the original text and no
    /// `full_content` remains.
    pub fn expanded(&self) -> Message {
        match &self.full_content {
            Some(full) => Message::new(self.role, full.clone()),
            None => self.clone(),
        }
    }
}

/// Reply from a single model invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    /// Number of billable calls this invocation consumed
    pub calls_delta: u32,
    /// Cost of this invocation in the provider's currency
    pub cost_delta: f64,
}

impl ModelResponse {
    /// A single-call response with no cost attached
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            calls_delta: 1,
            cost_delta: 0.0,
        }
    }
}

/// Error type for model invocations
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("empty response from model")]
    EmptyResponse,
    #[error("{0}")]
    Other(String),
}

/// Anything that can answer a conversation
#[async_trait]
pub trait Model: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    async fn query(&self, messages: &[Message]) -> Result<ModelResponse, ModelError>;
}
