//! Agent loop for shell-driven task solving
//!
//! # Architecture
//!
//! ```text
//! Task → AgentLoop → Model.query(messages)
//!            ↓
//!        ActionParser (exactly one ```bash block)
//!            ↓
//!        Environment.execute → RemoteExecutionClient → sandbox server
//!            ↓
//!        observation ─→ ContextManager (compress / summarize)
//!            ↓
//!        next prompt … until Submitted or LimitsExceeded
//! ```

pub mod action;
pub mod config;
pub mod context;
pub mod controller;
pub mod runner;
pub mod session;
pub mod template;

pub use action::{Action, ActionParser};
pub use config::AgentConfig;
pub use context::{CharHeuristic, ContextManager, SummarizationPlan, TokenCounter};
pub use controller::{AgentError, AgentLoop, ExitStatus, StepOutcome};
pub use runner::{run_batch, run_task, RunError, TaskOutcome, TaskReport, TaskSettings};
pub use session::{AgentSession, ModelCallKind, ModelCallRecord};
pub use template::{TemplateContext, TemplateError};
