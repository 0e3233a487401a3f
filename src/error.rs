use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskKey;
use crate::gate::GateId;
use crate::orchestration::RunId;

/// Reasons a delegation plan is refused before any task runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Delegation plan has no tasks")]
    Empty,

    #[error("Duplicate task key: {0}")]
    DuplicateTask(TaskKey),

    #[error("Task {0} depends on itself")]
    SelfDependency(TaskKey),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskKey, dependency: TaskKey },

    #[error("Unknown task template: {0}")]
    UnknownTemplate(TaskKey),

    #[error("Task {task} references unknown agent {agent}")]
    UnknownAgent { task: TaskKey, agent: String },

    #[error("Dependency cycle detected: {}", format_cycle(.0))]
    CycleDetected(Vec<TaskKey>),
}

fn format_cycle(cycle: &[TaskKey]) -> String {
    cycle
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid plan: {0}")]
    PlanValidation(#[from] PlanError),

    #[error("Invalid transition for task {task_key}: {reason}")]
    InvalidTaskTransition { task_key: TaskKey, reason: String },

    #[error("Delegation planning failed: {0}")]
    Planning(String),

    #[error("Task {task_key} failed: {message}")]
    Worker { task_key: TaskKey, message: String },

    #[error("Gate timed out for {agent_name} ({timeout:?})")]
    GateTimeout {
        agent_name: String,
        timeout: Duration,
    },

    #[error("Run rejected by user at {agent_name}'s gate")]
    GateRejected { agent_name: String },

    #[error("Gate not found or already resolved: {gate_id} (run {run_id})")]
    GateNotFound { run_id: RunId, gate_id: GateId },

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {0} already has a subscriber")]
    AlreadySubscribed(RunId),

    #[error("Run {0} is already executing")]
    AlreadyStarted(RunId),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether this error ends a run (as opposed to being reported to a caller only).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::GateNotFound { .. }
                | Error::RunNotFound(_)
                | Error::AlreadySubscribed(_)
                | Error::AlreadyStarted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
