//! Container runtime
//!
//! The server talks to containers through [`ContainerRuntime`]. [`DockerCli`]
//! drives a docker-compatible CLI (`docker`, `podman`) with `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::protocol::{SandboxConfig, TIMEOUT_NOTICE, TIMEOUT_RETURN_CODE};

/// Grace period for `stop` before falling back to `rm -f`
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long output is still read after the exec process exits. A background
/// job can hold the pipes open long after the command itself finished.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{action} failed: {stderr}")]
    Command { action: &'static str, stderr: String },
    #[error("timed out after {0:?} while starting container")]
    LaunchTimeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One command to run inside a container
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub container_id: String,
    pub command: String,
    pub cwd: String,
    /// Resolved `KEY=VALUE` pairs, in the order they are passed
    pub env: Vec<(String, String)>,
    /// `None` runs without a limit
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub output: String,
    pub returncode: i32,
    pub timed_out: bool,
}

/// How a container was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Stopped,
    Removed,
}

impl Teardown {
    pub fn as_str(&self) -> &'static str {
        match self {
            Teardown::Stopped => "stop",
            Teardown::Removed => "rm",
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a long-lived container named `name`; returns its id
    async fn launch(&self, name: &str, config: &SandboxConfig) -> Result<String, RuntimeError>;

    async fn exec(&self, spec: ExecSpec) -> Result<ExecResult, RuntimeError>;

    /// Stop the container, removing it forcibly if stopping fails
    async fn teardown(&self, container_id: &str) -> Result<Teardown, RuntimeError>;
}

/// Variables for an exec: forwarded names first (skipped when `lookup` has no
/// value), then the literal pairs.
pub fn resolve_env<'a>(
    forward: &[String],
    literal: impl IntoIterator<Item = (&'a String, &'a String)>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = forward
        .iter()
        .filter_map(|key| lookup(key).map(|value| (key.clone(), value)))
        .collect();
    env.extend(literal.into_iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Runtime backed by a docker-compatible command line
#[derive(Debug, Clone)]
pub struct DockerCli {
    executable: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> RuntimeError {
        RuntimeError::Spawn {
            program: self.executable.clone(),
            source,
        }
    }

    /// Arguments for `run`, without the executable
    pub fn launch_args(name: &str, config: &SandboxConfig) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            config.cwd.clone(),
        ];
        args.extend(config.run_args.iter().cloned());
        args.push(config.image.clone());
        args.push("sleep".to_string());
        args.push(config.container_timeout.clone());
        args
    }

    /// Arguments for `exec`, without the executable
    pub fn exec_args(spec: &ExecSpec) -> Vec<String> {
        let cwd = if spec.cwd.is_empty() { "/" } else { spec.cwd.as_str() };
        let mut args = vec!["exec".to_string(), "-w".to_string(), cwd.to_string()];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.container_id.clone());
        args.push("bash".to_string());
        args.push("-lc".to_string());
        args.push(spec.command.clone());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn launch(&self, name: &str, config: &SandboxConfig) -> Result<String, RuntimeError> {
        let limit = Duration::from_secs(config.pull_timeout);
        let mut cmd = self.command();
        cmd.args(Self::launch_args(name, config));

        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| RuntimeError::LaunchTimeout(limit))?
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(RuntimeError::Command {
                action: "container run",
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn exec(&self, spec: ExecSpec) -> Result<ExecResult, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(Self::exec_args(&spec))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut merged = Vec::new();

        let run = async {
            let collect = collect_merged(stdout, stderr, &mut merged);
            tokio::pin!(collect);
            let exited = tokio::select! {
                _ = &mut collect => None,
                status = child.wait() => Some(status),
            };
            match exited {
                Some(status) => {
                    if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut collect).await.is_err() {
                        tracing::debug!(
                            container_id = %spec.container_id,
                            "Output still open after exit, detaching"
                        );
                    }
                    status
                }
                None => child.wait().await,
            }
        };
        let status = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };

        match status {
            Some(status) => Ok(ExecResult {
                output: String::from_utf8_lossy(&merged).into_owned(),
                returncode: status?.code().unwrap_or(-1),
                timed_out: false,
            }),
            None => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(container_id = %spec.container_id, error = %e, "Failed to kill timed out exec");
                }
                let mut output = String::from_utf8_lossy(&merged).into_owned();
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(TIMEOUT_NOTICE);
                Ok(ExecResult {
                    output,
                    returncode: TIMEOUT_RETURN_CODE,
                    timed_out: true,
                })
            }
        }
    }

    async fn teardown(&self, container_id: &str) -> Result<Teardown, RuntimeError> {
        let mut stop = self.command();
        stop.args(["stop", container_id]);
        match tokio::time::timeout(STOP_TIMEOUT, stop.output()).await {
            Ok(Ok(output)) if output.status.success() => return Ok(Teardown::Stopped),
            Ok(Ok(output)) => tracing::debug!(
                container_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "stop failed, removing"
            ),
            Ok(Err(e)) => tracing::debug!(container_id, error = %e, "stop failed, removing"),
            Err(_) => tracing::debug!(container_id, "stop timed out, removing"),
        }

        let mut rm = self.command();
        rm.args(["rm", "-f", container_id]);
        let output = rm.output().await.map_err(|e| self.spawn_error(e))?;
        if output.status.success() {
            Ok(Teardown::Removed)
        } else {
            Err(RuntimeError::Command {
                action: "container rm",
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Read both pipes until they close, appending chunks in arrival order
async fn collect_merged<O, E>(stdout: Option<O>, stderr: Option<E>, sink: &mut Vec<u8>)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    enum Pipe {
        Out,
        Err,
    }

    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut stdout = stdout;
    let mut stderr = stderr;

    while stdout.is_some() || stderr.is_some() {
        let (pipe, read) = tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => (Pipe::Out, read),
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => (Pipe::Err, read),
        };
        match (pipe, read) {
            (Pipe::Out, Some(n)) => sink.extend_from_slice(&out_buf[..n]),
            (Pipe::Out, None) => stdout = None,
            (Pipe::Err, Some(n)) => sink.extend_from_slice(&err_buf[..n]),
            (Pipe::Err, None) => stderr = None,
        }
    }
}

/// `None` on EOF, error or a closed pipe
async fn read_chunk<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    match pipe.as_mut()?.read(buf).await {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}
