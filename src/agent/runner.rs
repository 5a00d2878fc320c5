//! Task runner
//!
//! One task = one sandbox + one agent loop. The sandbox is released on every
//! exit path of [`run_task`], panics included. [`run_batch`] runs many tasks
//! on a bounded number of workers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{stream, FutureExt, StreamExt};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};

use super::config::AgentConfig;
use super::controller::{AgentError, AgentLoop, ExitStatus};
use super::session::AgentSession;
use super::template::{TemplateContext, TemplateError};
use crate::model::Model;
use crate::sandbox::{ClientConfig, ExecError, RemoteExecutionClient, StartError};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to start sandbox: {0}")]
    Start(#[from] StartError),
    #[error("startup command exited with {returncode}: {output}")]
    StartupFailed { returncode: i32, output: String },
    #[error("startup command failed: {0}")]
    StartupExec(#[source] ExecError),
    #[error("startup command template: {0}")]
    StartupTemplate(#[from] TemplateError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Everything a finished run leaves behind
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub exit_status: ExitStatus,
    pub message: String,
    pub run_id: String,
    pub session: AgentSession,
}

/// Settings shared by every task of a batch
#[derive(Clone)]
pub struct TaskSettings {
    pub model: Arc<dyn Model>,
    pub agent: Arc<AgentConfig>,
    pub client: ClientConfig,
    /// Run right after the sandbox starts; a non-zero exit aborts the task.
    /// Rendered as a template with `{{task}}` bound.
    pub startup_command: Option<String>,
}

/// Acquire a sandbox, run the agent on `task`, release the sandbox
pub async fn run_task(settings: &TaskSettings, task: &str) -> Result<TaskOutcome, RunError> {
    let client = Arc::new(RemoteExecutionClient::connect(settings.client.clone()).await?);

    let result = AssertUnwindSafe(drive(settings, Arc::clone(&client), task))
        .catch_unwind()
        .await;
    client.cleanup().await;

    match result {
        Ok(outcome) => outcome,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

async fn drive(
    settings: &TaskSettings,
    client: Arc<RemoteExecutionClient>,
    task: &str,
) -> Result<TaskOutcome, RunError> {
    if let Some(template) = settings.startup_command.as_deref() {
        let command = TemplateContext::new().with("task", task).render(template, &[])?;
        let output = client
            .execute(&command, None, None)
            .await
            .map_err(RunError::StartupExec)?;
        if output.returncode != 0 {
            return Err(RunError::StartupFailed {
                returncode: output.returncode,
                output: output.output,
            });
        }
    }

    let mut agent = AgentLoop::new(
        Arc::clone(&settings.model),
        client,
        Arc::clone(&settings.agent),
    )?;
    let (exit_status, message) = agent.run(task).await?;

    Ok(TaskOutcome {
        exit_status,
        message,
        run_id: agent.run_id().to_string(),
        session: agent.session().clone(),
    })
}

/// One line of batch output
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub index: usize,
    pub task: String,
    /// Exit status, or "error" / "panic" when the run did not finish
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub steps: u64,
    pub model_calls: u64,
    pub cost: f64,
    pub actions: usize,
    pub elapsed_secs: f64,
}

impl TaskReport {
    fn new(index: usize, task: String, result: Result<TaskOutcome, RunError>, elapsed: Duration) -> Self {
        match result {
            Ok(outcome) => Self {
                index,
                task,
                status: outcome.exit_status.to_string(),
                message: outcome.message,
                run_id: Some(outcome.run_id),
                steps: outcome.session.steps,
                model_calls: outcome.session.n_calls,
                cost: outcome.session.cost,
                actions: outcome.session.actions().len(),
                elapsed_secs: elapsed.as_secs_f64(),
            },
            Err(e) => Self::failed(index, task, "error", e.to_string(), elapsed),
        }
    }

    fn failed(index: usize, task: String, status: &str, message: String, elapsed: Duration) -> Self {
        Self {
            index,
            task,
            status: status.to_string(),
            message,
            run_id: None,
            steps: 0,
            model_calls: 0,
            cost: 0.0,
            actions: 0,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Run `tasks` with at most `workers` in flight; reports come back in
/// completion order.
pub async fn run_batch(settings: TaskSettings, tasks: Vec<String>, workers: usize) -> Vec<TaskReport> {
    let settings = Arc::new(settings);
    info!(tasks = tasks.len(), workers, "Starting batch");

    stream::iter(tasks.into_iter().enumerate())
        .map(|(index, task)| {
            let settings = Arc::clone(&settings);
            async move {
                let started = Instant::now();
                let span = info_span!("task", index);
                let handle = {
                    let task = task.clone();
                    tokio::spawn(
                        async move { run_task(&settings, &task).await }.instrument(span),
                    )
                };

                match handle.await {
                    Ok(result) => {
                        if let Err(e) = &result {
                            error!(index, error = %e, "Task failed");
                        }
                        TaskReport::new(index, task, result, started.elapsed())
                    }
                    Err(join_error) => {
                        error!(index, error = %join_error, "Task panicked");
                        TaskReport::failed(index, task, "panic", join_error.to_string(), started.elapsed())
                    }
                }
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await
}
