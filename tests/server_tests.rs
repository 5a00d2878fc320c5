//! Integration tests for the sandbox server
//!
//! Requests go straight into the router; containers are simulated by an
//! in-memory runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use shellvisor::sandbox::protocol::{SandboxConfig, TIMEOUT_RETURN_CODE};
use shellvisor::sandbox::runtime::{ContainerRuntime, ExecResult, ExecSpec, RuntimeError, Teardown};
use shellvisor::sandbox::{router, ServerState};
use tower::ServiceExt;

#[derive(Clone, Copy, PartialEq)]
enum Launch {
    Ok,
    EmptyId,
    Fail,
}

struct FakeRuntime {
    launch: Launch,
    launches: AtomicUsize,
    execs: Mutex<Vec<ExecSpec>>,
    teardowns: AtomicUsize,
    slow_teardown: bool,
}

impl FakeRuntime {
    fn new(launch: Launch) -> Self {
        Self {
            launch,
            launches: AtomicUsize::new(0),
            execs: Mutex::default(),
            teardowns: AtomicUsize::new(0),
            slow_teardown: false,
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(&self, name: &str, _config: &SandboxConfig) -> Result<String, RuntimeError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        match self.launch {
            Launch::Ok => Ok(format!("id-{name}")),
            Launch::EmptyId => Ok(String::new()),
            Launch::Fail => Err(RuntimeError::Command {
                action: "run",
                stderr: "Unable to find image 'nope:latest' locally".to_string(),
            }),
        }
    }

    async fn exec(&self, spec: ExecSpec) -> Result<ExecResult, RuntimeError> {
        self.execs.lock().unwrap().push(spec.clone());
        if spec.command.starts_with("sleep") {
            return Ok(ExecResult {
                output: "Command timed out.".to_string(),
                returncode: TIMEOUT_RETURN_CODE,
                timed_out: true,
            });
        }
        Ok(ExecResult {
            output: format!("ran {}\n", spec.command),
            returncode: 0,
            timed_out: false,
        })
    }

    async fn teardown(&self, _container_id: &str) -> Result<Teardown, RuntimeError> {
        if self.slow_teardown {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(Teardown::Stopped)
    }
}

fn app(runtime: Arc<FakeRuntime>) -> (Router, ServerState) {
    let state = ServerState::new(runtime);
    (router(state.clone()), state)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn start_body(image: &str) -> Value {
    json!({"config": {"image": image}})
}

/// Test that /start launches a container and tracks it
#[tokio::test]
async fn test_start() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, state) = app(runtime.clone());

    let (status, body) = post(&app, "/start", start_body("alpine")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "started");
    let id = body["container_id"].as_str().unwrap();
    assert!(id.starts_with("id-shellvisor-"));
    assert_eq!(state.sandbox_count().await, 1);
    assert_eq!(state.record(id).await.unwrap().image, "alpine");
}

/// Test that concurrent starts get distinct containers
#[tokio::test]
async fn test_concurrent_starts() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, state) = app(runtime.clone());

    let (first, second) = tokio::join!(
        post(&app, "/start", start_body("alpine")),
        post(&app, "/start", start_body("alpine")),
    );

    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);
    assert_ne!(first.1["container_id"], second.1["container_id"]);
    assert_eq!(runtime.launches.load(Ordering::SeqCst), 2);
    assert_eq!(state.sandbox_count().await, 2);
}

/// Test that a runtime without an id falls back to the container name
#[tokio::test]
async fn test_start_empty_id_uses_name() {
    let (app, state) = app(Arc::new(FakeRuntime::new(Launch::EmptyId)));

    let (status, body) = post(&app, "/start", start_body("alpine")).await;

    assert_eq!(status, StatusCode::OK);
    let id = body["container_id"].as_str().unwrap();
    assert!(id.starts_with("shellvisor-"));
    assert_eq!(state.record(id).await.unwrap().container_name, id);
}

/// Test that a missing image is rejected before launching
#[tokio::test]
async fn test_start_requires_image() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, _) = app(runtime.clone());

    let (status, body) = post(&app, "/start", json!({"config": {}})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("image"));
    assert_eq!(runtime.launches.load(Ordering::SeqCst), 0);
}

/// Test that a launch failure is a 500 carrying the runtime's message
#[tokio::test]
async fn test_start_launch_failure() {
    let (app, state) = app(Arc::new(FakeRuntime::new(Launch::Fail)));

    let (status, body) = post(&app, "/start", start_body("nope")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("Unable to find image"));
    assert_eq!(state.sandbox_count().await, 0);
}

/// Test that malformed JSON never reaches the runtime
#[tokio::test]
async fn test_start_malformed_body() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, _) = app(runtime.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/start")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;

    assert!(status.is_client_error());
    assert_eq!(runtime.launches.load(Ordering::SeqCst), 0);
}

/// Test that /execute passes the request through to the runtime
#[tokio::test]
async fn test_execute() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, _) = app(runtime.clone());
    let (_, started) = post(&app, "/start", start_body("alpine")).await;
    let id = started["container_id"].as_str().unwrap().to_string();

    let (status, body) = post(
        &app,
        "/execute",
        json!({
            "container_id": id,
            "command": "ls -la",
            "cwd": "/work",
            "timeout": 30,
            "env": {"LANG": "C"}
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "ran ls -la\n");
    assert_eq!(body["returncode"], 0);
    assert_eq!(body["timed_out"], false);

    let execs = runtime.execs.lock().unwrap().clone();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].container_id, id);
    assert_eq!(execs[0].cwd, "/work");
    assert_eq!(execs[0].timeout, Some(Duration::from_secs(30)));
    assert_eq!(execs[0].env, vec![("LANG".to_string(), "C".to_string())]);
}

/// Test that a missing timeout means no limit
#[tokio::test]
async fn test_execute_without_timeout() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, _) = app(runtime.clone());

    let (status, _) = post(&app, "/execute", json!({"container_id": "abc", "command": "true"})).await;

    assert_eq!(status, StatusCode::OK);
    let execs = runtime.execs.lock().unwrap().clone();
    assert_eq!(execs[0].timeout, None);
    assert_eq!(execs[0].cwd, "");
}

/// Test that a timed-out command reports 124 and the flag
#[tokio::test]
async fn test_execute_timeout() {
    let (app, _) = app(Arc::new(FakeRuntime::new(Launch::Ok)));

    let (status, body) = post(
        &app,
        "/execute",
        json!({"container_id": "abc", "command": "sleep 100", "timeout": 1}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["returncode"], 124);
    assert_eq!(body["timed_out"], true);
}

/// Test that /execute requires a container id
#[tokio::test]
async fn test_execute_requires_container_id() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, _) = app(runtime.clone());

    let (status, body) = post(&app, "/execute", json!({"container_id": "", "command": "ls"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(runtime.execs.lock().unwrap().is_empty());
}

/// Test that /cleanup answers before the container is gone
#[tokio::test]
async fn test_cleanup_returns_immediately() {
    let mut runtime = FakeRuntime::new(Launch::Ok);
    runtime.slow_teardown = true;
    let runtime = Arc::new(runtime);
    let (app, state) = app(runtime.clone());
    let (_, started) = post(&app, "/start", start_body("alpine")).await;
    let id = started["container_id"].as_str().unwrap().to_string();

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(5),
        post(&app, "/cleanup", json!({"container_id": id})),
    )
    .await
    .expect("cleanup should not wait for teardown");

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cleanup process started");
    assert_eq!(body["container_id"], id);
    assert_eq!(state.sandbox_count().await, 0);
    assert_eq!(runtime.teardowns.load(Ordering::SeqCst), 0);
}

/// Test that cleanup eventually tears the container down
#[tokio::test]
async fn test_cleanup_tears_down() {
    let runtime = Arc::new(FakeRuntime::new(Launch::Ok));
    let (app, _) = app(runtime.clone());

    let (status, _) = post(&app, "/cleanup", json!({"container_id": "unknown"})).await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..50 {
        if runtime.teardowns.load(Ordering::SeqCst) == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("teardown never ran");
}

/// Test the health and metrics endpoints
#[tokio::test]
async fn test_health_and_metrics() {
    let (app, _) = app(Arc::new(FakeRuntime::new(Launch::Ok)));
    post(&app, "/start", start_body("alpine")).await;

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health, json!({"status": "ok", "sandboxes": 1}));

    let (status, body) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("shellvisor_sandbox_starts_total"));
}
