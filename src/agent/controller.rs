//! Agent loop - drives one task from prompt to terminal outcome
//!
//! Each step asks the model for exactly one shell command, runs it in the
//! environment and feeds the observation back. Recoverable problems (a reply
//! without exactly one action, a command timeout) become a note to the model;
//! the run ends only when a command submits its output or a budget runs out.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::action::{completion_output, Action, ActionParser};
use super::config::AgentConfig;
use super::context::{ContextManager, TokenCounter};
use super::session::{AgentSession, ModelCallKind, ModelCallRecord};
use super::template::{TemplateContext, TemplateError};
use crate::metrics::{
    AGENT_RUNS, AGENT_STEPS, HISTORY_SUMMARIZATIONS, MODEL_CALLS, MODEL_CALL_DURATION,
    OBSERVATIONS_COMPRESSED,
};
use crate::model::{Message, Model, ModelError, ModelResponse};
use crate::sandbox::{Environment, ExecError, ExecOutput};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// A command printed a completion marker
    Submitted,
    /// The step or cost budget was spent
    LimitsExceeded,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Submitted => "Submitted",
            ExitStatus::LimitsExceeded => "LimitsExceeded",
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one loop iteration
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// An action ran; holds the rendered observation
    Continue(String),
    /// Recoverable problem; the note is sent to the model as the next turn
    Retry(String),
    /// Terminal
    Done(ExitStatus, String),
}

/// Failures that abort a run instead of being fed back to the model
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("invalid action regex: {0}")]
    ActionRegex(#[from] regex::Error),
    #[error("environment error: {0}")]
    Environment(#[from] ExecError),
}

/// The agent state machine
///
/// Owns the session for the duration of [`AgentLoop::run`]; the session of the
/// last run stays readable until the next one starts.
pub struct AgentLoop<E: Environment + ?Sized> {
    model: Arc<dyn Model>,
    env: Arc<E>,
    config: Arc<AgentConfig>,
    parser: ActionParser,
    context: ContextManager,
    base_vars: TemplateContext,
    vars: TemplateContext,
    session: AgentSession,
    run_id: String,
}

impl<E: Environment + ?Sized> AgentLoop<E> {
    pub fn new(model: Arc<dyn Model>, env: Arc<E>, config: Arc<AgentConfig>) -> Result<Self, AgentError> {
        let parser = ActionParser::new(&config.action_regex)?;
        let context = ContextManager::new(&config);
        let base_vars = TemplateContext::new()
            .with("model_name", model.name())
            .with("step_limit", config.step_limit.to_string())
            .with("cost_limit", config.cost_limit.to_string());

        Ok(Self {
            model,
            env,
            config,
            parser,
            context,
            vars: base_vars.clone(),
            base_vars,
            session: AgentSession::new(),
            run_id: String::new(),
        })
    }

    /// Replace the default four-characters-per-token estimate
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.context = self.context.with_counter(counter);
        self
    }

    /// Extra variable available to every template
    pub fn with_template_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_vars = self.base_vars.with(key, value);
        self
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    /// Id of the current or last run
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Every message of the run with compressed observations expanded
    pub fn full_messages(&self) -> &[Message] {
        self.session.full_messages()
    }

    pub fn model_calls(&self) -> &[ModelCallRecord] {
        self.session.model_calls()
    }

    /// Commands executed so far, in order
    pub fn actions(&self) -> &[String] {
        self.session.actions()
    }

    /// Run `task` until it is submitted or a budget runs out
    pub async fn run(&mut self, task: &str) -> Result<(ExitStatus, String), AgentError> {
        self.session = AgentSession::new();
        self.run_id = Uuid::now_v7().to_string();
        self.vars = self.base_vars.clone().with("task", task);

        let span = info_span!(
            "agent_run",
            run_id = %self.run_id,
            model = %self.model.name(),
            otel.name = "agent_run"
        );
        let result = self.run_steps().instrument(span).await;

        let status = match &result {
            Ok((status, _)) => status.as_str(),
            Err(_) => "error",
        };
        AGENT_RUNS.with_label_values(&[status]).inc();
        AGENT_STEPS.observe(self.session.steps as f64);
        result
    }

    async fn run_steps(&mut self) -> Result<(ExitStatus, String), AgentError> {
        let system = self.vars.render(&self.config.system_template, &[])?;
        let instance = self.vars.render(&self.config.instance_template, &[])?;
        self.session.push(Message::system(system));
        self.session.push(Message::user(instance));
        info!(run_id = %self.run_id, "Starting agent run");

        loop {
            self.session.steps += 1;
            debug!(
                step = self.session.steps,
                model_calls = self.session.n_calls,
                cost = self.session.cost,
                elapsed_secs = self.session.elapsed().as_secs_f64(),
                "Agent step"
            );

            match self.step().await? {
                StepOutcome::Continue(_) => {}
                StepOutcome::Retry(note) => {
                    debug!(step = self.session.steps, "Recoverable step failure, re-prompting");
                    self.session.push(Message::user(note));
                }
                StepOutcome::Done(status, message) => {
                    info!(
                        run_id = %self.run_id,
                        exit_status = %status,
                        steps = self.session.steps,
                        model_calls = self.session.n_calls,
                        cost = self.session.cost,
                        elapsed_secs = self.session.elapsed().as_secs_f64(),
                        "Agent run finished"
                    );
                    self.session.push(Message::user(message.clone()));
                    return Ok((status, message));
                }
            }
        }
    }

    /// Query, parse, execute, observe
    pub async fn step(&mut self) -> Result<StepOutcome, AgentError> {
        let content = match self.query().await? {
            ControlFlow::Continue(content) => content,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };
        let action = match self.parse_action(&content)? {
            ControlFlow::Continue(action) => action,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };
        let output = match self.execute_action(&action).await? {
            ControlFlow::Continue(output) => output,
            ControlFlow::Break(outcome) => return Ok(outcome),
        };
        let observation = self.observe(&output).await?;
        Ok(StepOutcome::Continue(observation))
    }

    /// Ask the model for its next reply
    ///
    /// Breaks with `LimitsExceeded` instead of calling the model once a budget
    /// is spent. Summarizes the history first when the context is over budget.
    pub async fn query(&mut self) -> Result<ControlFlow<StepOutcome, String>, AgentError> {
        if self
            .session
            .limits_exceeded(self.config.step_limit, self.config.cost_limit)
        {
            warn!(
                model_calls = self.session.n_calls,
                cost = self.session.cost,
                step_limit = self.config.step_limit,
                cost_limit = self.config.cost_limit,
                "Limits exceeded"
            );
            return Ok(ControlFlow::Break(StepOutcome::Done(
                ExitStatus::LimitsExceeded,
                String::new(),
            )));
        }

        self.summarize_if_needed().await?;

        let messages = self.session.messages().to_vec();
        let response = self.call_model(ModelCallKind::MainQuery, messages, None).await?;
        self.session.push(Message::assistant(response.content.clone()));
        Ok(ControlFlow::Continue(response.content))
    }

    /// Extract the single action from a reply, or break with a format note
    pub fn parse_action(&self, content: &str) -> Result<ControlFlow<StepOutcome, Action>, AgentError> {
        match self.parser.parse(content) {
            Ok(action) => Ok(ControlFlow::Continue(action)),
            Err(found) => {
                debug!(found, "Reply did not contain exactly one action");
                let note = self
                    .vars
                    .render(&self.config.format_error_template, &[("actions", found.to_string().as_str())])?;
                Ok(ControlFlow::Break(StepOutcome::Retry(note)))
            }
        }
    }

    /// Run an action; breaks on submission or timeout
    pub async fn execute_action(
        &mut self,
        action: &Action,
    ) -> Result<ControlFlow<StepOutcome, ExecOutput>, AgentError> {
        self.session.record_action(&action.raw_text);

        let span = info_span!(
            "execute_action",
            run_id = %self.run_id,
            command_len = action.raw_text.len(),
            otel.name = "execute_action"
        );
        match self.env.execute(&action.raw_text, None, None).instrument(span).await {
            Ok(output) => {
                if let Some(submission) = completion_output(&output.output, &self.config.completion_markers) {
                    return Ok(ControlFlow::Break(StepOutcome::Done(
                        ExitStatus::Submitted,
                        submission,
                    )));
                }
                Ok(ControlFlow::Continue(output))
            }
            Err(ExecError::Timeout { output }) => {
                warn!(run_id = %self.run_id, "Action timed out");
                let note = self.vars.render(
                    &self.config.timeout_template,
                    &[("action", action.raw_text.as_str()), ("output", output.as_str())],
                )?;
                Ok(ControlFlow::Break(StepOutcome::Retry(note)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Render the observation and append it, compressed when too long
    async fn observe(&mut self, output: &ExecOutput) -> Result<String, AgentError> {
        let returncode = output.returncode.to_string();
        let observation = self.vars.render(
            &self.config.action_observation_template,
            &[("output", output.output.as_str()), ("returncode", returncode.as_str())],
        )?;

        if !self.context.should_compress(&observation) {
            self.session.push(Message::user(observation.clone()));
            return Ok(observation);
        }

        debug!(
            tokens = self.context.tokens(&observation),
            max_tokens = self.config.max_observation_tokens,
            "Compressing observation"
        );
        let prompt = self.vars.render(
            &self.config.observation_reasoning_template,
            &[("observation", observation.as_str())],
        )?;
        let request = self.context.compression_request(prompt);
        let response = self
            .call_model(ModelCallKind::ObservationReasoning, request, None)
            .await?;
        OBSERVATIONS_COMPRESSED.inc();

        let message = self.context.compressed_observation(&response.content, &observation);
        self.session.push(message);
        Ok(observation)
    }

    async fn summarize_if_needed(&mut self) -> Result<(), AgentError> {
        let Some(plan) = self.context.plan_summarization(self.session.messages()) else {
            return Ok(());
        };

        let prompt = self.vars.render(
            &self.config.history_summary_template,
            &[("history", plan.history.as_str())],
        )?;
        let request = self.context.summary_request(prompt);
        let response = self
            .call_model(
                ModelCallKind::HistorySummarization,
                request,
                Some(plan.message_count()),
            )
            .await?;

        let before = self.session.messages().len();
        let rebuilt = self
            .context
            .apply_summary(self.session.messages(), &plan, &response.content);
        self.session.replace_messages(rebuilt);
        HISTORY_SUMMARIZATIONS.inc();
        info!(
            run_id = %self.run_id,
            summarized = plan.message_count(),
            before,
            after = self.session.messages().len(),
            "Summarized conversation history"
        );
        Ok(())
    }

    /// Invoke the model, account for it and keep the record
    async fn call_model(
        &mut self,
        kind: ModelCallKind,
        messages: Vec<Message>,
        summarized_messages: Option<usize>,
    ) -> Result<ModelResponse, AgentError> {
        let span = info_span!(
            "model_call",
            run_id = %self.run_id,
            kind = kind.as_str(),
            messages = messages.len(),
            otel.name = "model_call"
        );
        let started = Instant::now();
        let response = self.model.query(&messages).instrument(span).await?;
        let elapsed = started.elapsed().as_secs_f64();

        MODEL_CALLS.with_label_values(&[kind.as_str()]).inc();
        MODEL_CALL_DURATION
            .with_label_values(&[kind.as_str()])
            .observe(elapsed);
        debug!(
            kind = kind.as_str(),
            duration_ms = elapsed * 1000.0,
            reply_len = response.content.len(),
            "Model call completed"
        );

        self.session
            .record_call(kind, messages, &response, summarized_messages);
        Ok(response)
    }
}
