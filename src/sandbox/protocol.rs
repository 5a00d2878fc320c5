//! Wire types shared by the sandbox client and server
//!
//! All endpoints take and return JSON bodies:
//!
//! | Endpoint   | Request            | Response            |
//! |------------|--------------------|---------------------|
//! | `/start`   | [`StartRequest`]   | [`StartResponse`]   |
//! | `/execute` | [`ExecuteRequest`] | [`ExecuteResponse`] |
//! | `/cleanup` | [`CleanupRequest`] | [`CleanupResponse`] |
//!
//! Failures are reported with a non-2xx status and an [`ErrorBody`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Return code reported for a command killed by its timeout
pub const TIMEOUT_RETURN_CODE: i32 = 124;

/// Line appended to the output of a command killed by its timeout
pub const TIMEOUT_NOTICE: &str = "Command timed out.";

/// How to build a sandbox container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    /// Working directory inside the container
    pub cwd: String,
    /// Literal variables set on every command
    pub env: BTreeMap<String, String>,
    /// Variables copied by name from the server's own environment
    pub forward_env: Vec<String>,
    /// Extra arguments for the container `run` command
    pub run_args: Vec<String>,
    /// Lifetime of the container's keep-alive process, in `sleep` syntax
    /// (e.g. "6h"). Orphaned sandboxes die when it elapses.
    pub container_timeout: String,
    /// Seconds allowed for pulling and launching the image
    pub pull_timeout: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            cwd: "/".to_string(),
            env: BTreeMap::new(),
            forward_env: Vec::new(),
            run_args: vec!["--rm".to_string()],
            container_timeout: "6h".to_string(),
            pull_timeout: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub config: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    /// Empty when the server did not report one
    #[serde(default)]
    pub container_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub container_id: String,
    pub command: String,
    /// Working directory override; empty means "/"
    #[serde(default)]
    pub cwd: String,
    /// Seconds before the command is killed; absent means no limit
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
}

/// Merged stdout/stderr and exit status of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
    pub returncode: i32,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub status: String,
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
