//! Sandbox execution server
//!
//! Turns `/start`, `/execute` and `/cleanup` requests into container
//! operations. The only shared state is the map of sandboxes this process
//! has launched; no agent logic lives here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::protocol::{
    CleanupRequest, CleanupResponse, ErrorBody, ExecuteRequest, ExecuteResponse, StartRequest,
    StartResponse,
};
use super::runtime::{resolve_env, ContainerRuntime, ExecSpec, RuntimeError};
use crate::metrics::{
    self, ACTIVE_SANDBOXES, SANDBOX_CLEANUPS, SANDBOX_EXECUTIONS, SANDBOX_EXECUTION_DURATION,
    SANDBOX_STARTS,
};

/// Prefix of every container name this server creates
pub const CONTAINER_PREFIX: &str = "shellvisor";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Docker-compatible CLI used to manage containers
    pub executable: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9527)),
            executable: "docker".to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to start container: {0}")]
    Launch(#[source] RuntimeError),

    #[error("failed to execute command: {0}")]
    Exec(#[source] RuntimeError),

    #[error("failed to encode metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Launch(_) | ApiError::Exec(_) | ApiError::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

/// A sandbox launched by this server
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub created_at: SystemTime,
}

#[derive(Clone)]
pub struct ServerState {
    runtime: Arc<dyn ContainerRuntime>,
    sandboxes: Arc<Mutex<HashMap<String, SandboxRecord>>>,
}

impl ServerState {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            sandboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn sandbox_count(&self) -> usize {
        self.sandboxes.lock().await.len()
    }

    pub async fn record(&self, container_id: &str) -> Option<SandboxRecord> {
        self.sandboxes.lock().await.get(container_id).cloned()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sandboxes: usize,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/execute", post(execute))
        .route("/cleanup", post(cleanup))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

/// Bind and serve until Ctrl-C
pub async fn serve(config: &ServerConfig, runtime: Arc<dyn ContainerRuntime>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        addr = %listener.local_addr()?,
        executable = %config.executable,
        "Sandbox server listening"
    );

    axum::serve(listener, router(ServerState::new(runtime)))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down sandbox server");
        })
        .await
}

async fn start(
    State(state): State<ServerState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let config = request.config;
    if config.image.trim().is_empty() {
        return Err(ApiError::InvalidInput("config.image must not be empty".to_string()));
    }

    let container_name = format!("{CONTAINER_PREFIX}-{}", Uuid::now_v7().simple());
    info!(name = %container_name, image = %config.image, "Starting container");

    let container_id = match state.runtime.launch(&container_name, &config).await {
        Ok(id) if id.is_empty() => container_name.clone(),
        Ok(id) => id,
        Err(e) => {
            SANDBOX_STARTS.with_label_values(&["error"]).inc();
            error!(name = %container_name, error = %e, "Failed to start container");
            return Err(ApiError::Launch(e));
        }
    };

    let mut sandboxes = state.sandboxes.lock().await;
    sandboxes.insert(
        container_id.clone(),
        SandboxRecord {
            container_id: container_id.clone(),
            container_name: container_name.clone(),
            image: config.image,
            created_at: SystemTime::now(),
        },
    );
    ACTIVE_SANDBOXES.set(sandboxes.len() as i64);
    drop(sandboxes);

    SANDBOX_STARTS.with_label_values(&["success"]).inc();
    info!(name = %container_name, container_id = %container_id, "Started container");

    Ok(Json(StartResponse {
        container_id,
        status: "started".to_string(),
    }))
}

async fn execute(
    State(state): State<ServerState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    if request.container_id.is_empty() {
        return Err(ApiError::InvalidInput("container_id must not be empty".to_string()));
    }
    if state.record(&request.container_id).await.is_none() {
        warn!(container_id = %request.container_id, "Executing in a container this server did not start");
    }

    let short_id: String = request.container_id.chars().take(12).collect();
    info!(container_id = %short_id, command = %request.command, "Executing command");

    let spec = ExecSpec {
        env: resolve_env(&request.forward_env, &request.env, |key| std::env::var(key).ok()),
        container_id: request.container_id,
        command: request.command,
        cwd: request.cwd,
        timeout: request.timeout.map(std::time::Duration::from_secs),
    };

    let started = Instant::now();
    let result = state.runtime.exec(spec).await;
    SANDBOX_EXECUTION_DURATION.observe(started.elapsed().as_secs_f64());

    match result {
        Ok(result) => {
            let status = if result.timed_out {
                "timeout"
            } else if result.returncode == 0 {
                "success"
            } else {
                "error"
            };
            SANDBOX_EXECUTIONS.with_label_values(&[status]).inc();
            if result.timed_out {
                warn!(container_id = %short_id, "Command timed out");
            }

            Ok(Json(ExecuteResponse {
                output: result.output,
                returncode: result.returncode,
                timed_out: result.timed_out,
            }))
        }
        Err(e) => {
            SANDBOX_EXECUTIONS.with_label_values(&["failed"]).inc();
            error!(container_id = %short_id, error = %e, "Failed to execute command");
            Err(ApiError::Exec(e))
        }
    }
}

async fn cleanup(
    State(state): State<ServerState>,
    Json(request): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let container_id = request.container_id;
    if container_id.is_empty() {
        return Err(ApiError::InvalidInput("container_id must not be empty".to_string()));
    }

    let mut sandboxes = state.sandboxes.lock().await;
    let record = sandboxes.remove(&container_id);
    ACTIVE_SANDBOXES.set(sandboxes.len() as i64);
    drop(sandboxes);

    if let Some(record) = &record {
        info!(
            container_id = %container_id,
            name = %record.container_name,
            age_secs = record.created_at.elapsed().map(|d| d.as_secs()).unwrap_or_default(),
            "Cleaning up container"
        );
    } else {
        warn!(container_id = %container_id, "Cleaning up a container this server did not start");
    }

    let runtime = Arc::clone(&state.runtime);
    let id = container_id.clone();
    tokio::spawn(async move {
        match runtime.teardown(&id).await {
            Ok(method) => {
                SANDBOX_CLEANUPS.with_label_values(&[method.as_str()]).inc();
                info!(container_id = %id, method = method.as_str(), "Container removed");
            }
            Err(e) => {
                SANDBOX_CLEANUPS.with_label_values(&["failed"]).inc();
                warn!(container_id = %id, error = %e, "Failed to remove container");
            }
        }
    });

    Ok(Json(CleanupResponse {
        status: "cleanup process started".to_string(),
        container_id,
    }))
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sandboxes: state.sandbox_count().await,
    })
}

async fn metrics_text() -> Result<impl IntoResponse, ApiError> {
    let body = metrics::gather_text()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
