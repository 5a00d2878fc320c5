//! shellvisor - LLM shell agents driving remote command sandboxes
//!
//! An agent solves a task by repeatedly asking a language model for one shell
//! command, running it in an isolated container on a sandbox server, and
//! feeding the output back until the model submits or a budget runs out.
//!
//! # Modules
//!
//! - `agent` - the control loop, context budgeting and the task runner
//! - `model` - message types and the `Model` trait (Ollama implementation)
//! - `sandbox` - HTTP client and server for remote sandboxes
//! - `config` - TOML file configuration
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - tracing-subscriber and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use shellvisor::agent::{AgentConfig, AgentLoop};
//! use shellvisor::model::{OllamaConfig, OllamaModel};
//! use shellvisor::sandbox::{ClientConfig, RemoteExecutionClient};
//!
//! let client = Arc::new(RemoteExecutionClient::connect(ClientConfig::default()).await?);
//! let model = Arc::new(OllamaModel::new(OllamaConfig::default())?);
//! let mut agent = AgentLoop::new(model, client.clone(), Arc::new(AgentConfig::default()))?;
//! let (status, message) = agent.run("print the kernel version").await?;
//! client.cleanup().await;
//! ```

pub mod agent;
pub mod config;
pub mod metrics;
pub mod model;
pub mod sandbox;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentLoop, ExitStatus};
pub use model::{Message, Model, Role};
pub use sandbox::{Environment, RemoteExecutionClient};
