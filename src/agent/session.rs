//! Per-run agent state
//!
//! `messages` is the live context and may be compressed or summarized.
//! `full_messages` is append-only and always holds the original text, so
//! `full_messages.len() >= messages.len()` for the whole run.

use std::time::Instant;

use serde::Serialize;

use crate::model::{Message, ModelResponse};

/// Why the loop called the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallKind {
    MainQuery,
    ObservationReasoning,
    HistorySummarization,
}

impl ModelCallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCallKind::MainQuery => "main_query",
            ModelCallKind::ObservationReasoning => "observation_reasoning",
            ModelCallKind::HistorySummarization => "history_summarization",
        }
    }
}

/// One model invocation, as sent and as answered
#[derive(Debug, Clone, Serialize)]
pub struct ModelCallRecord {
    pub kind: ModelCallKind,
    pub messages: Vec<Message>,
    pub response: Message,
    /// Number of messages folded into the summary, for summarization calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarized_messages: Option<usize>,
}

/// The mutable state of one task run
#[derive(Debug, Clone)]
pub struct AgentSession {
    messages: Vec<Message>,
    full_messages: Vec<Message>,
    model_calls: Vec<ModelCallRecord>,
    actions: Vec<String>,
    /// Model calls consumed so far, side calls included
    pub n_calls: u64,
    /// Spend so far
    pub cost: f64,
    /// Loop iterations so far
    pub steps: u64,
    pub started_at: Instant,
}

impl Default for AgentSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentSession {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            full_messages: Vec::new(),
            model_calls: Vec::new(),
            actions: Vec::new(),
            n_calls: 0,
            cost: 0.0,
            steps: 0,
            started_at: Instant::now(),
        }
    }

    /// Append to the live context and to the full record
    pub fn push(&mut self, message: Message) {
        self.full_messages.push(message.expanded());
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Swap the live context; the full record is untouched
    pub(crate) fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn full_messages(&self) -> &[Message] {
        &self.full_messages
    }

    pub fn model_calls(&self) -> &[ModelCallRecord] {
        &self.model_calls
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub(crate) fn record_action(&mut self, command: &str) {
        self.actions.push(command.to_string());
    }

    /// Account for a model call and keep it in the audit trail
    pub(crate) fn record_call(
        &mut self,
        kind: ModelCallKind,
        messages: Vec<Message>,
        response: &ModelResponse,
        summarized_messages: Option<usize>,
    ) {
        self.n_calls += u64::from(response.calls_delta);
        self.cost += response.cost_delta;
        self.model_calls.push(ModelCallRecord {
            kind,
            messages,
            response: Message::assistant(response.content.clone()),
            summarized_messages,
        });
    }

    /// True when either budget is spent; a zero limit means unlimited
    pub fn limits_exceeded(&self, step_limit: u64, cost_limit: f64) -> bool {
        (step_limit > 0 && self.n_calls >= step_limit) || (cost_limit > 0.0 && self.cost >= cost_limit)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
