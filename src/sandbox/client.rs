//! Remote execution client
//!
//! One client owns one sandbox on a remote server. Starting and cleaning up
//! are retried on connection and timeout failures; executing a command is
//! never retried, since running a command twice can be worse than failing once.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::protocol::{
    CleanupRequest, ExecuteRequest, ExecuteResponse, SandboxConfig, StartRequest, StartResponse,
};
use crate::metrics::CLIENT_START_ATTEMPTS;

/// Output of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub returncode: i32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// The command was killed by its timeout; `output` holds what it printed
    #[error("command timed out")]
    Timeout { output: String },
    #[error("sandbox is not running")]
    NotStarted,
}

/// Where agent actions run
#[async_trait]
pub trait Environment: Send + Sync {
    /// Run `command` in `cwd` (the sandbox default when `None`) for at most
    /// `timeout` (the configured default when `None`).
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("sandbox server unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("sandbox server refused to start a container ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("sandbox server did not return a container id")]
    MissingContainerId,
    #[error("sandbox already started: {0}")]
    AlreadyStarted(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

/// Identifies the sandbox a client owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxHandle {
    pub container_id: String,
    pub server_url: String,
}

/// Runtime settings for a [`RemoteExecutionClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the sandbox server (e.g., "http://localhost:9527")
    pub server_url: String,
    pub sandbox: SandboxConfig,
    /// Default limit for a single command
    pub command_timeout: Duration,
    /// Attempts made by `start` and `cleanup`
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Added to the image pull timeout to bound a `/start` request
    pub start_margin: Duration,
    /// Minimum time an `/execute` request is allowed to take
    pub execute_floor: Duration,
    /// Added to the command timeout so the server's own timeout fires first
    pub execute_margin: Duration,
    pub cleanup_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:9527".to_string(),
            sandbox: SandboxConfig::default(),
            command_timeout: Duration::from_secs(1800),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            start_margin: Duration::from_secs(10),
            execute_floor: Duration::from_secs(1800),
            execute_margin: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.pull_timeout) + self.start_margin
    }

    pub fn execute_request_timeout(&self, command_timeout: Duration) -> Duration {
        self.execute_floor.max(command_timeout + self.execute_margin)
    }
}

/// Errors worth another attempt: the request never got an answer
fn is_retryable(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

/// HTTP client for one remote sandbox
pub struct RemoteExecutionClient {
    config: ClientConfig,
    base_url: String,
    http: reqwest::Client,
    container_id: Mutex<Option<String>>,
}

impl RemoteExecutionClient {
    /// Build a client without starting a sandbox
    pub fn new(config: ClientConfig) -> Result<Self, StartError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        let base_url = config.server_url.trim_end_matches('/').to_string();

        Ok(Self {
            config,
            base_url,
            http,
            container_id: Mutex::new(None),
        })
    }

    /// Build a client and start its sandbox
    pub async fn connect(config: ClientConfig) -> Result<Self, StartError> {
        let client = Self::new(config)?;
        client.start().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// The running sandbox, if any
    pub async fn handle(&self) -> Option<SandboxHandle> {
        self.container_id.lock().await.clone().map(|container_id| SandboxHandle {
            container_id,
            server_url: self.base_url.clone(),
        })
    }

    /// Ask the server for a new sandbox
    ///
    /// Makes at most `max_retries` attempts, retrying only when the server
    /// could not be reached or did not answer in time. An error response is
    /// returned immediately because container creation is not idempotent.
    pub async fn start(&self) -> Result<SandboxHandle, StartError> {
        let mut slot = self.container_id.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Err(StartError::AlreadyStarted(existing.clone()));
        }

        let span = info_span!("sandbox_start", server = %self.base_url, image = %self.config.sandbox.image);
        let container_id = self.start_with_retry().instrument(span).await?;
        *slot = Some(container_id.clone());

        Ok(SandboxHandle {
            container_id,
            server_url: self.base_url.clone(),
        })
    }

    async fn start_with_retry(&self) -> Result<String, StartError> {
        let endpoint = self.endpoint("start");
        let body = StartRequest {
            config: self.config.sandbox.clone(),
        };
        let max_retries = self.config.max_retries.max(1);
        let timeout = self.config.start_timeout();
        let mut last_error = None;

        info!("Requesting a new sandbox");
        for attempt in 1..=max_retries {
            let result = self
                .http
                .post(&endpoint)
                .json(&body)
                .timeout(timeout)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        CLIENT_START_ATTEMPTS.with_label_values(&["fatal"]).inc();
                        let body = response.text().await.unwrap_or_default();
                        error!(attempt, status = status.as_u16(), "Sandbox start rejected");
                        return Err(StartError::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    let parsed: StartResponse = response.json().await?;
                    if parsed.container_id.is_empty() {
                        CLIENT_START_ATTEMPTS.with_label_values(&["fatal"]).inc();
                        return Err(StartError::MissingContainerId);
                    }

                    CLIENT_START_ATTEMPTS.with_label_values(&["success"]).inc();
                    info!(attempt, container_id = %parsed.container_id, "Sandbox started");
                    return Ok(parsed.container_id);
                }
                Err(e) if is_retryable(&e) => {
                    CLIENT_START_ATTEMPTS.with_label_values(&["retryable"]).inc();
                    if attempt < max_retries {
                        warn!(
                            attempt,
                            max_retries,
                            error = %e,
                            delay_ms = self.config.retry_delay.as_millis() as u64,
                            "Sandbox start attempt failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    } else {
                        error!(attempt, error = %e, "All sandbox start attempts failed");
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    CLIENT_START_ATTEMPTS.with_label_values(&["fatal"]).inc();
                    return Err(StartError::Request(e));
                }
            }
        }

        match last_error {
            Some(source) => Err(StartError::Unreachable {
                attempts: max_retries,
                source,
            }),
            None => Err(StartError::MissingContainerId),
        }
    }

    /// Run one command in the sandbox
    ///
    /// Transport failures and error responses come back as an output with
    /// return code -1 so the agent can see them and decide what to do.
    pub async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        let container_id = self
            .container_id
            .lock()
            .await
            .clone()
            .ok_or(ExecError::NotStarted)?;

        let command_timeout = timeout.unwrap_or(self.config.command_timeout);
        let cwd = cwd
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.config.sandbox.cwd);
        let request = ExecuteRequest {
            container_id: container_id.clone(),
            command: command.to_string(),
            cwd: cwd.to_string(),
            timeout: Some(command_timeout.as_secs().max(1)),
            env: self.config.sandbox.env.clone(),
            forward_env: self.config.sandbox.forward_env.clone(),
        };
        let request_timeout = self.config.execute_request_timeout(command_timeout);

        let span = info_span!("sandbox_execute", container_id = %container_id, command_len = command.len());
        match self.post_execute(&request, request_timeout).instrument(span).await {
            Ok(response) if response.timed_out => {
                warn!(container_id = %container_id, "Command timed out");
                Err(ExecError::Timeout {
                    output: response.output,
                })
            }
            Ok(response) => {
                debug!(container_id = %container_id, returncode = response.returncode, "Command finished");
                Ok(ExecOutput {
                    output: response.output,
                    returncode: response.returncode,
                })
            }
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Failed to execute command remotely");
                Ok(ExecOutput {
                    output: format!("Error communicating with server: {e}"),
                    returncode: -1,
                })
            }
        }
    }

    async fn post_execute(
        &self,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecuteResponse, reqwest::Error> {
        self.http
            .post(self.endpoint("execute"))
            .json(request)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Release the sandbox
    ///
    /// Never fails: problems are logged and the server's container timeout
    /// reclaims anything left behind. Only the first call talks to the
    /// server.
    pub async fn cleanup(&self) {
        let Some(container_id) = self.container_id.lock().await.take() else {
            debug!("No sandbox to clean up");
            return;
        };

        let span = info_span!("sandbox_cleanup", container_id = %container_id);
        self.send_cleanup(&container_id).instrument(span).await;
    }

    async fn send_cleanup(&self, container_id: &str) {
        let endpoint = self.endpoint("cleanup");
        let body = CleanupRequest {
            container_id: container_id.to_string(),
        };
        let max_retries = self.config.max_retries.max(1);

        for attempt in 1..=max_retries {
            let result = self
                .http
                .post(&endpoint)
                .json(&body)
                .timeout(self.config.cleanup_timeout)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!("Cleanup request accepted");
                    return;
                }
                Ok(response) => {
                    warn!(
                        status = response.status().as_u16(),
                        "Cleanup request rejected, container might be orphaned"
                    );
                    return;
                }
                Err(e) if is_retryable(&e) => {
                    if attempt < max_retries {
                        warn!(attempt, max_retries, error = %e, "Cleanup attempt failed, retrying");
                        tokio::time::sleep(self.config.retry_delay).await;
                    } else {
                        warn!(
                            attempts = max_retries,
                            error = %e,
                            "Failed to send cleanup request, container might be orphaned"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to send cleanup request, container might be orphaned");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Environment for RemoteExecutionClient {
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        RemoteExecutionClient::execute(self, command, cwd, timeout).await
    }
}
