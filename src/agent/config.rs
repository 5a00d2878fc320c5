//! Agent configuration
//!
//! Assembled once before a run and never mutated afterwards. Every field has
//! a default so a TOML `[agent]` section only needs the values it changes.

use serde::{Deserialize, Serialize};

/// Marker lines that end a run when they open a command's output
pub const DEFAULT_COMPLETION_MARKERS: [&str; 2] = [
    "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT",
    "MINI_SWE_AGENT_FINAL_OUTPUT",
];

/// Configuration for the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// First message of every conversation
    pub system_template: String,
    /// Task prompt; receives `{{task}}`
    pub instance_template: String,
    /// Sent after a command times out; receives `{{action}}` and `{{output}}`
    pub timeout_template: String,
    /// Sent when a reply does not hold exactly one action; receives `{{actions}}`
    pub format_error_template: String,
    /// Wraps command output; receives `{{output}}` and `{{returncode}}`
    pub action_observation_template: String,
    /// Pattern whose first capture group is the command
    pub action_regex: String,
    pub completion_markers: Vec<String>,
    /// Maximum model calls per run, 0 = unlimited
    pub step_limit: u64,
    /// Maximum spend per run, 0 = unlimited
    pub cost_limit: f64,

    /// Prompt used to compress long observations; receives `{{observation}}`
    pub observation_reasoning_template: String,
    pub max_observation_tokens: usize,

    /// Prompt used to summarize old turns; receives `{{history}}`
    pub history_summary_template: String,
    /// Summarize when the live context grows past this, 0 = never
    pub max_context_tokens: usize,
    /// Messages at the tail that are never summarized
    pub keep_recent_messages: usize,
    /// Upper bound on the rendered history fed to the summarizer
    pub max_history_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_template: "You are a helpful assistant that can do anything.".to_string(),
            instance_template: "Your task: {{task}}. Please reply with a single shell command in triple backticks. \
                 To finish, the first line of the output of the shell command must be \
                 'COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT'."
                .to_string(),
            timeout_template: "The last command <command>{{action}}</command> timed out and has been killed.\n\
                 The output of the command was:\n <output>\n{{output}}\n</output>\n\
                 Please try another command and make sure to avoid those requiring interactive input."
                .to_string(),
            format_error_template:
                "Please always provide EXACTLY ONE action in triple backticks, found {{actions}} actions."
                    .to_string(),
            action_observation_template:
                "<returncode>{{returncode}}</returncode>\n<output>\n{{output}}</output>".to_string(),
            action_regex: r"```bash\s*\n(.*?)\n```".to_string(),
            completion_markers: DEFAULT_COMPLETION_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            step_limit: 0,
            cost_limit: 3.0,
            observation_reasoning_template: "The following observation is very long. Please analyze it and provide a concise summary \
                 focusing on the key information relevant to completing the task. Include:\n\
                 1. What the command did\n\
                 2. Key outputs or results\n\
                 3. Any errors or issues\n\
                 4. Next steps to consider\n\n\
                 Observation:\n{{observation}}\n\n\
                 Provide your analysis in 2-3 paragraphs."
                .to_string(),
            max_observation_tokens: 1000,
            history_summary_template: "Below is the conversation history so far. Please provide a concise summary that captures:\n\
                 1. The original task/goal\n\
                 2. Key actions taken and their results\n\
                 3. Current state and progress\n\
                 4. Important information for next steps\n\n\
                 Conversation history:\n{{history}}\n\n\
                 Provide a focused summary in 3-5 paragraphs."
                .to_string(),
            max_context_tokens: 0,
            keep_recent_messages: 4,
            max_history_chars: 64_000,
        }
    }
}
