//! Integration tests for the agent loop
//!
//! The model is scripted and the environment is an in-memory fake, so these
//! tests exercise the state machine, limits and context budgeting without
//! any network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shellvisor::agent::{AgentConfig, AgentError, AgentLoop, ExitStatus, ModelCallKind, TokenCounter};
use shellvisor::model::{Message, Model, ModelError, ModelResponse, Role};
use shellvisor::sandbox::{Environment, ExecError, ExecOutput};

const SUBMIT: &str = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT";

fn bash(command: &str) -> String {
    format!("I will run this.\n```bash\n{command}\n```")
}

/// Replies to main queries from a script; side calls get a fixed summary
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    cost_per_call: f64,
}

impl ScriptedModel {
    fn new(replies: &[String]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().cloned().collect()),
            cost_per_call: 0.0,
        }
    }

    fn repeating(reply: String, times: usize) -> Self {
        Self::new(&vec![reply; times])
    }

    fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn query(&self, messages: &[Message]) -> Result<ModelResponse, ModelError> {
        let first = messages.first().map(|m| m.content.as_str()).unwrap_or_default();
        let content = if first.contains("analyzes command outputs") {
            "the command printed a lot of x".to_string()
        } else if first.contains("summarizes conversation history") {
            "earlier steps echoed things".to_string()
        } else {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ModelError::Other("script exhausted".to_string()))?
        };
        Ok(ModelResponse {
            content,
            calls_delta: 1,
            cost_delta: self.cost_per_call,
        })
    }
}

/// Records commands; submits when the command mentions the marker
#[derive(Default)]
struct FakeEnv {
    commands: Mutex<Vec<String>>,
    scripted: Mutex<VecDeque<Result<ExecOutput, ExecError>>>,
}

impl FakeEnv {
    fn with_results(results: Vec<Result<ExecOutput, ExecError>>) -> Self {
        Self {
            commands: Mutex::default(),
            scripted: Mutex::new(results.into()),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Environment for FakeEnv {
    async fn execute(
        &self,
        command: &str,
        _cwd: Option<&str>,
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some(result) = self.scripted.lock().unwrap().pop_front() {
            return result;
        }
        let output = if command.contains(SUBMIT) {
            format!("{SUBMIT}\nall done")
        } else {
            format!("ran: {command}\n")
        };
        Ok(ExecOutput {
            output,
            returncode: 0,
        })
    }
}

fn agent(model: ScriptedModel, env: Arc<FakeEnv>, config: AgentConfig) -> AgentLoop<FakeEnv> {
    AgentLoop::new(Arc::new(model), env, Arc::new(config)).unwrap()
}

#[tokio::test]
async fn test_submit_on_first_action() {
    let env = Arc::new(FakeEnv::default());
    let model = ScriptedModel::new(&[bash(&format!("echo {SUBMIT}"))]);
    let mut agent = agent(model, env.clone(), AgentConfig::default());

    let (status, message) = agent.run("say hi").await.unwrap();

    assert_eq!(status, ExitStatus::Submitted);
    assert_eq!(message, "all done");
    assert_eq!(env.commands(), vec![format!("echo {SUBMIT}")]);
    assert_eq!(agent.actions(), &[format!("echo {SUBMIT}")]);

    let messages = agent.session().messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, Role::System);
    assert!(messages[1].content.contains("say hi"));
    assert_eq!(messages[2].role, Role::Assistant);
    assert_eq!(messages[3], Message::user("all done"));

    let calls = agent.model_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, ModelCallKind::MainQuery);
    assert_eq!(calls[0].messages.len(), 2);
}

#[tokio::test]
async fn test_format_errors_are_recovered() {
    let env = Arc::new(FakeEnv::default());
    let model = ScriptedModel::new(&[
        "I think I am done.".to_string(),
        format!("{}\n{}", bash("ls"), bash("pwd")),
        bash(&format!("echo {SUBMIT}")),
    ]);
    let mut agent = agent(model, env.clone(), AgentConfig::default());

    let (status, _) = agent.run("list files").await.unwrap();
    assert_eq!(status, ExitStatus::Submitted);

    let messages = agent.session().messages();
    assert_eq!(
        messages[3].content,
        "Please always provide EXACTLY ONE action in triple backticks, found 0 actions."
    );
    assert_eq!(
        messages[5].content,
        "Please always provide EXACTLY ONE action in triple backticks, found 2 actions."
    );
    // Only the well-formed reply reached the environment
    assert_eq!(env.commands().len(), 1);
    assert_eq!(agent.session().steps, 3);
}

#[tokio::test]
async fn test_step_limit() {
    let env = Arc::new(FakeEnv::default());
    let model = ScriptedModel::repeating(bash("ls"), 10);
    let config = AgentConfig {
        step_limit: 2,
        ..AgentConfig::default()
    };
    let mut agent = agent(model, env.clone(), config);

    let (status, message) = agent.run("loop forever").await.unwrap();

    assert_eq!(status, ExitStatus::LimitsExceeded);
    assert_eq!(message, "");
    assert_eq!(agent.session().n_calls, 2);
    assert_eq!(env.commands().len(), 2);
    // The terminal message is appended as a final user turn
    assert_eq!(agent.session().messages().last(), Some(&Message::user("")));
}

#[tokio::test]
async fn test_cost_limit() {
    let env = Arc::new(FakeEnv::default());
    let model = ScriptedModel::repeating(bash("ls"), 10).with_cost(0.6);
    let config = AgentConfig {
        step_limit: 0,
        cost_limit: 1.0,
        ..AgentConfig::default()
    };
    let mut agent = agent(model, env.clone(), config);

    let (status, _) = agent.run("spend money").await.unwrap();

    assert_eq!(status, ExitStatus::LimitsExceeded);
    assert_eq!(agent.session().n_calls, 2);
    assert!((agent.session().cost - 1.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_timeout_is_recoverable() {
    let env = Arc::new(FakeEnv::with_results(vec![Err(ExecError::Timeout {
        output: "partial line".to_string(),
    })]));
    let model = ScriptedModel::new(&[bash("sleep 999"), bash(&format!("echo {SUBMIT}"))]);
    let mut agent = agent(model, env.clone(), AgentConfig::default());

    let (status, _) = agent.run("wait").await.unwrap();
    assert_eq!(status, ExitStatus::Submitted);

    let note = &agent.session().messages()[3].content;
    assert!(note.contains("<command>sleep 999</command> timed out"));
    assert!(note.contains("partial line"));
    assert_eq!(agent.actions(), &["sleep 999".to_string(), format!("echo {SUBMIT}")]);
}

#[tokio::test]
async fn test_environment_failure_aborts_run() {
    let env = Arc::new(FakeEnv::with_results(vec![Err(ExecError::NotStarted)]));
    let model = ScriptedModel::new(&[bash("ls")]);
    let mut agent = agent(model, env, AgentConfig::default());

    let err = agent.run("anything").await.unwrap_err();
    assert!(matches!(err, AgentError::Environment(ExecError::NotStarted)));
}

#[tokio::test]
async fn test_model_failure_aborts_run() {
    let env = Arc::new(FakeEnv::default());
    let model = ScriptedModel::new(&[]);
    let mut agent = agent(model, env, AgentConfig::default());

    let err = agent.run("anything").await.unwrap_err();
    assert!(matches!(err, AgentError::Model(_)));
}

#[tokio::test]
async fn test_nonzero_returncode_is_an_observation() {
    let env = Arc::new(FakeEnv::with_results(vec![Ok(ExecOutput {
        output: "No such file\n".to_string(),
        returncode: 2,
    })]));
    let model = ScriptedModel::new(&[bash("cat missing"), bash(&format!("echo {SUBMIT}"))]);
    let mut agent = agent(model, env, AgentConfig::default());

    agent.run("read a file").await.unwrap();
    assert_eq!(
        agent.session().messages()[3].content,
        "<returncode>2</returncode>\n<output>\nNo such file\n</output>"
    );
}

#[tokio::test]
async fn test_long_observation_is_compressed() {
    let long_output = "x".repeat(400);
    let env = Arc::new(FakeEnv::with_results(vec![
        Ok(ExecOutput {
            output: long_output.clone(),
            returncode: 0,
        }),
        Ok(ExecOutput {
            output: "short".to_string(),
            returncode: 0,
        }),
    ]));
    let model = ScriptedModel::new(&[
        bash("print-lots"),
        bash("print-little"),
        bash(&format!("echo {SUBMIT}")),
    ]);
    let config = AgentConfig {
        max_observation_tokens: 50,
        ..AgentConfig::default()
    };
    let mut agent = agent(model, env, config);

    agent.run("inspect output").await.unwrap();

    let observation = format!("<returncode>0</returncode>\n<output>\n{long_output}</output>");
    let messages = agent.session().messages();
    assert_eq!(
        messages[3].content,
        "<observation_summary>\nthe command printed a lot of x\n</observation_summary>"
    );
    assert_eq!(messages[3].full_content.as_deref(), Some(observation.as_str()));

    // Short observations pass through untouched
    assert!(!messages[5].is_compressed());
    assert_eq!(
        messages[5].content,
        "<returncode>0</returncode>\n<output>\nshort</output>"
    );

    // The full record carries the original text and no full_content
    let full = agent.full_messages();
    assert_eq!(full[3].content, observation);
    assert!(full[3].full_content.is_none());
    let json = serde_json::to_value(&full[3]).unwrap();
    assert!(json.get("full_content").is_none());

    let kinds: Vec<_> = agent.model_calls().iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ModelCallKind::MainQuery,
            ModelCallKind::ObservationReasoning,
            ModelCallKind::MainQuery,
            ModelCallKind::MainQuery,
        ]
    );
    assert!(agent.model_calls()[1].messages[1].content.contains(&observation));
}

#[tokio::test]
async fn test_history_summarization_keeps_task_and_recent_turns() {
    let env = Arc::new(FakeEnv::default());
    let mut replies: Vec<String> = (0..5).map(|i| bash(&format!("echo step {i}"))).collect();
    replies.push(bash(&format!("echo {SUBMIT}")));
    let model = ScriptedModel::new(&replies);
    let keep_recent = 2;
    let config = AgentConfig {
        max_context_tokens: 60,
        keep_recent_messages: keep_recent,
        ..AgentConfig::default()
    };
    let mut agent = agent(model, env, config);

    let (status, message) = agent.run("echo a few things").await.unwrap();
    assert_eq!(status, ExitStatus::Submitted);
    assert_eq!(message, "all done");

    let full = agent.full_messages();
    let calls = agent.model_calls();
    let kinds: Vec<_> = calls.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ModelCallKind::MainQuery,
            ModelCallKind::MainQuery,
            ModelCallKind::MainQuery,
            ModelCallKind::HistorySummarization,
            ModelCallKind::MainQuery,
            ModelCallKind::MainQuery,
            ModelCallKind::HistorySummarization,
            ModelCallKind::MainQuery,
        ]
    );

    for (i, call) in calls.iter().enumerate() {
        if call.kind != ModelCallKind::HistorySummarization {
            continue;
        }
        assert_eq!(call.summarized_messages, Some(4));
        assert!(call.messages[1].content.contains("[ASSISTANT]: "));

        // The query right after a summary sees the rebuilt context
        let next = &calls[i + 1].messages;
        assert_eq!(next.len(), 2 + keep_recent);
        assert_eq!(next[0], full[0]);
        assert!(next[1].content.starts_with(&full[1].content));
        assert!(next[1].content.contains("<conversation_summary>\nearlier steps echoed things\n</conversation_summary>"));
    }

    // Six steps of assistant + user turns on top of the two seed messages
    assert_eq!(full.len(), 14);
    assert!(full.len() >= agent.session().messages().len());
    assert_eq!(agent.actions().len(), 6);
}

#[tokio::test]
async fn test_custom_token_counter() {
    struct Everything;
    impl TokenCounter for Everything {
        fn count(&self, _text: &str) -> usize {
            1_000_000
        }
    }

    let env = Arc::new(FakeEnv::default());
    let model = ScriptedModel::new(&[bash("ls"), bash(&format!("echo {SUBMIT}"))]);
    let mut agent = agent(model, env, AgentConfig::default()).with_token_counter(Arc::new(Everything));

    agent.run("tiny").await.unwrap();
    assert!(agent.session().messages()[3].is_compressed());
}

#[tokio::test]
async fn test_runs_are_independent() {
    let env = Arc::new(FakeEnv::default());
    let model = ScriptedModel::new(&[bash(&format!("echo {SUBMIT}")), bash(&format!("echo {SUBMIT}"))]);
    let mut agent = agent(model, env, AgentConfig::default());

    agent.run("first").await.unwrap();
    let first_run = agent.run_id().to_string();
    agent.run("second").await.unwrap();

    assert_ne!(agent.run_id(), first_run);
    assert_eq!(agent.full_messages().len(), 4);
    assert!(agent.full_messages()[1].content.contains("second"));
    assert_eq!(agent.model_calls().len(), 1);
}

#[test]
fn test_invalid_action_regex() {
    let config = AgentConfig {
        action_regex: "(unclosed".to_string(),
        ..AgentConfig::default()
    };
    let result = AgentLoop::new(
        Arc::new(ScriptedModel::new(&[])),
        Arc::new(FakeEnv::default()),
        Arc::new(config),
    );
    assert!(matches!(result, Err(AgentError::ActionRegex(_))));
}

#[tokio::test]
async fn test_undefined_template_variable() {
    let config = AgentConfig {
        instance_template: "Do {{task}} in {{workspace}}".to_string(),
        ..AgentConfig::default()
    };
    let env = Arc::new(FakeEnv::default());
    let mut missing = agent(ScriptedModel::new(&[]), env.clone(), config.clone());
    assert!(matches!(missing.run("x").await, Err(AgentError::Template(_))));

    let model = ScriptedModel::new(&[bash(&format!("echo {SUBMIT}"))]);
    let mut provided = agent(model, env, config).with_template_var("workspace", "/src");
    provided.run("x").await.unwrap();
    assert_eq!(provided.session().messages()[1].content, "Do x in /src");
}
