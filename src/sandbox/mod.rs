//! Remote sandboxes
//!
//! A sandbox is one long-lived container on a server, addressed by an opaque
//! container id. [`server`] owns the containers and [`client`] drives exactly
//! one of them on behalf of an agent run.

pub mod client;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::{
    ClientConfig, Environment, ExecError, ExecOutput, RemoteExecutionClient, SandboxHandle,
    StartError,
};
pub use protocol::{SandboxConfig, TIMEOUT_RETURN_CODE};
pub use runtime::{ContainerRuntime, DockerCli, RuntimeError};
pub use server::{router, serve, ServerConfig, ServerState};
