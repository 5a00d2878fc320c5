//! Context budgeting
//!
//! Decides when an observation is too long to keep verbatim and when the
//! conversation as a whole must be summarized. Nothing here performs I/O: the
//! agent loop issues the model calls these decisions ask for and hands the
//! results back to be folded into the message list.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use super::config::AgentConfig;
use crate::model::{Message, Role};

const OBSERVATION_SYSTEM_PROMPT: &str = "You are a helpful assistant that analyzes command outputs.";
const SUMMARY_SYSTEM_PROMPT: &str = "You are a helpful assistant that summarizes conversation history.";

/// Messages at the head of the conversation that summarization never touches:
/// the system prompt and the task prompt.
const PINNED_MESSAGES: usize = 2;

/// Estimates how many model tokens a piece of text occupies
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Four characters per token
#[derive(Debug, Clone, Copy, Default)]
pub struct CharHeuristic;

impl CharHeuristic {
    pub const CHARS_PER_TOKEN: usize = 4;
}

impl TokenCounter for CharHeuristic {
    fn count(&self, text: &str) -> usize {
        text.chars().count() / Self::CHARS_PER_TOKEN
    }
}

/// What to summarize and the rendered history to summarize it from
#[derive(Debug, Clone, PartialEq)]
pub struct SummarizationPlan {
    /// Indices into the live messages that will be folded into the summary
    pub range: Range<usize>,
    pub history: String,
}

impl SummarizationPlan {
    pub fn message_count(&self) -> usize {
        self.range.len()
    }
}

#[derive(Clone)]
pub struct ContextManager {
    counter: Arc<dyn TokenCounter>,
    max_observation_tokens: usize,
    max_context_tokens: usize,
    keep_recent_messages: usize,
    max_history_chars: usize,
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("max_observation_tokens", &self.max_observation_tokens)
            .field("max_context_tokens", &self.max_context_tokens)
            .field("keep_recent_messages", &self.keep_recent_messages)
            .field("max_history_chars", &self.max_history_chars)
            .finish_non_exhaustive()
    }
}

impl ContextManager {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            counter: Arc::new(CharHeuristic),
            max_observation_tokens: config.max_observation_tokens,
            max_context_tokens: config.max_context_tokens,
            keep_recent_messages: config.keep_recent_messages,
            max_history_chars: config.max_history_chars,
        }
    }

    /// Swap in a different token estimator, e.g. an exact tokenizer
    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// With the default counter the estimate floors, so this fires from
    /// `4 * (max + 1)` characters, not from `4 * max + 1`.
    pub fn should_compress(&self, observation: &str) -> bool {
        self.tokens(observation) > self.max_observation_tokens
    }

    /// Side-call conversation asking the model to condense an observation
    pub fn compression_request(&self, prompt: String) -> Vec<Message> {
        vec![Message::system(OBSERVATION_SYSTEM_PROMPT), Message::user(prompt)]
    }

    /// The live message for a compressed observation; the original stays in
    /// `full_content`.
    pub fn compressed_observation(&self, summary: &str, observation: &str) -> Message {
        Message::compressed(
            format!("<observation_summary>\n{summary}\n</observation_summary>"),
            observation,
        )
    }

    pub fn context_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.tokens(&m.content)).sum()
    }

    /// Returns a plan when summarization is enabled, the context is over
    /// budget and there is enough history between the pinned head and the
    /// recent tail to be worth summarizing.
    pub fn plan_summarization(&self, messages: &[Message]) -> Option<SummarizationPlan> {
        if self.max_context_tokens == 0 {
            return None;
        }
        let tokens = self.context_tokens(messages);
        if tokens <= self.max_context_tokens {
            return None;
        }
        // Strictly more than keep_recent + 4; equality is not enough
        if messages.len() <= self.keep_recent_messages + 4 {
            tracing::debug!(
                tokens,
                messages = messages.len(),
                "Context over budget but too few messages to summarize"
            );
            return None;
        }

        let range = PINNED_MESSAGES..messages.len() - self.keep_recent_messages;
        if range.len() < 2 {
            return None;
        }

        let history = self.render_history(&messages[range.clone()]);
        Some(SummarizationPlan { range, history })
    }

    /// `[ROLE]: content` blocks, cut down to the middle when too long
    fn render_history(&self, messages: &[Message]) -> String {
        let history = messages
            .iter()
            .map(|m| format!("[{}]: {}", m.role.as_str().to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let total = history.chars().count();
        if total <= self.max_history_chars {
            return history;
        }

        let half = self.max_history_chars / 2;
        let head_end = byte_offset(&history, half);
        let tail_start = byte_offset(&history, total - half);
        format!(
            "{}\n\n[... {} messages truncated for summarization ...]\n\n{}",
            &history[..head_end],
            messages.len(),
            &history[tail_start..]
        )
    }

    /// Side-call conversation asking the model to summarize the history
    pub fn summary_request(&self, prompt: String) -> Vec<Message> {
        vec![Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(prompt)]
    }

    /// Rebuild the live context as `[system, task + summary, recent...]`
    pub fn apply_summary(&self, messages: &[Message], plan: &SummarizationPlan, summary: &str) -> Vec<Message> {
        let initial = messages
            .get(1)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let merged = Message::new(
            Role::User,
            format!(
                "{initial}\n\n<conversation_summary>\n{summary}\n</conversation_summary>\n\n\
                 [Continue from where we left off.]"
            ),
        );

        let mut rebuilt = Vec::with_capacity(PINNED_MESSAGES + self.keep_recent_messages);
        rebuilt.extend(messages.first().cloned());
        rebuilt.push(merged);
        rebuilt.extend_from_slice(&messages[plan.range.end..]);
        rebuilt
    }
}

/// Byte offset of the `n`th character
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}
