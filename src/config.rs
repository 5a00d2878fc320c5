//! File configuration
//!
//! A TOML file with `[agent]`, `[sandbox]` and `[model]` sections. Every field
//! is optional. The file is read once at startup and the resulting structs are
//! shared read-only.
//!
//! ```toml
//! [agent]
//! step_limit = 50
//! max_context_tokens = 24000
//!
//! [sandbox]
//! server_url = "http://10.0.0.5:9527"
//! image = "python:3.11-slim"
//! timeout = 120
//!
//! [model]
//! model = "qwen3"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::model::OllamaConfig;
use crate::sandbox::{ClientConfig, SandboxConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub sandbox: SandboxSection,
    pub model: OllamaConfig,
}

/// `[sandbox]`: where the server is, what to run, how patient to be
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub server_url: String,
    #[serde(flatten)]
    pub container: SandboxConfig,
    /// Default per-command timeout in seconds
    pub timeout: u64,
    pub max_retries: u32,
    /// Seconds between start/cleanup attempts
    pub retry_delay: u64,
    /// Command run once after the sandbox starts
    pub startup_command: Option<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:9527".to_string(),
            container: SandboxConfig::default(),
            timeout: 1800,
            max_retries: 3,
            retry_delay: 5,
            startup_command: None,
        }
    }
}

impl SandboxSection {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.server_url.clone(),
            sandbox: self.container.clone(),
            command_timeout: Duration::from_secs(self.timeout),
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay),
            ..ClientConfig::default()
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
