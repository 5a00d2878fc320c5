//! Prometheus metrics
//!
//! Registered once in the default registry. The sandbox server exposes them on
//! `GET /metrics`; the agent side records into the same registry so a process
//! running batches can export them too.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox server
    // ─────────────────────────────────────────────────────────────────────────────

    /// Container launches handled by `/start`.
    ///
    /// Labels:
    /// - status: "success" or "error"
    pub static ref SANDBOX_STARTS: IntCounterVec = register_int_counter_vec!(
        "shellvisor_sandbox_starts_total",
        "Sandbox containers launched",
        &["status"]
    ).expect("failed to register SANDBOX_STARTS metric");

    /// Commands run by `/execute`.
    ///
    /// Labels:
    /// - status: "success", "error" (non-zero exit), "timeout" or "failed" (could not run)
    pub static ref SANDBOX_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "shellvisor_sandbox_executions_total",
        "Commands executed inside sandboxes",
        &["status"]
    ).expect("failed to register SANDBOX_EXECUTIONS metric");

    pub static ref SANDBOX_EXECUTION_DURATION: Histogram = register_histogram!(
        "shellvisor_sandbox_execution_duration_seconds",
        "Wall time of sandbox command executions",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]
    ).expect("failed to register SANDBOX_EXECUTION_DURATION metric");

    /// Sandboxes known to the server right now.
    pub static ref ACTIVE_SANDBOXES: IntGauge = register_int_gauge!(
        "shellvisor_active_sandboxes",
        "Sandboxes currently registered with the server"
    ).expect("failed to register ACTIVE_SANDBOXES metric");

    /// Background teardown results.
    ///
    /// Labels:
    /// - method: "stop", "rm" (fallback after a failed or slow stop) or "failed"
    pub static ref SANDBOX_CLEANUPS: IntCounterVec = register_int_counter_vec!(
        "shellvisor_sandbox_cleanups_total",
        "Sandbox teardowns by method",
        &["method"]
    ).expect("failed to register SANDBOX_CLEANUPS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox client
    // ─────────────────────────────────────────────────────────────────────────────

    /// Individual `/start` attempts made by clients.
    ///
    /// Labels:
    /// - outcome: "success", "retryable" or "fatal"
    pub static ref CLIENT_START_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "shellvisor_client_start_attempts_total",
        "Sandbox start attempts made by the remote client",
        &["outcome"]
    ).expect("failed to register CLIENT_START_ATTEMPTS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent loop
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished agent runs.
    ///
    /// Labels:
    /// - exit_status: "Submitted", "LimitsExceeded" or "error"
    pub static ref AGENT_RUNS: IntCounterVec = register_int_counter_vec!(
        "shellvisor_agent_runs_total",
        "Agent runs by exit status",
        &["exit_status"]
    ).expect("failed to register AGENT_RUNS metric");

    pub static ref AGENT_STEPS: Histogram = register_histogram!(
        "shellvisor_agent_steps",
        "Loop iterations per agent run",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0]
    ).expect("failed to register AGENT_STEPS metric");

    /// Model invocations made by the loop, side calls included.
    ///
    /// Labels:
    /// - kind: "main_query", "observation_reasoning" or "history_summarization"
    pub static ref MODEL_CALLS: IntCounterVec = register_int_counter_vec!(
        "shellvisor_model_calls_total",
        "Model invocations by kind",
        &["kind"]
    ).expect("failed to register MODEL_CALLS metric");

    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "shellvisor_model_call_duration_seconds",
        "Latency of model invocations",
        &["kind"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("failed to register MODEL_CALL_DURATION metric");

    pub static ref OBSERVATIONS_COMPRESSED: IntCounter = register_int_counter!(
        "shellvisor_observations_compressed_total",
        "Observations replaced by a model-written summary"
    ).expect("failed to register OBSERVATIONS_COMPRESSED metric");

    pub static ref HISTORY_SUMMARIZATIONS: IntCounter = register_int_counter!(
        "shellvisor_history_summarizations_total",
        "Times the live context was summarized"
    ).expect("failed to register HISTORY_SUMMARIZATIONS metric");
}

/// Render the default registry in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_metrics() {
        MODEL_CALLS.with_label_values(&["main_query"]).inc();
        let text = gather_text().unwrap();
        assert!(text.contains("shellvisor_model_calls_total"));
    }
}
