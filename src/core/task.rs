//! Task data model for the delegation DAG.
//!
//! A task is one templated piece of work handed to a worker agent. Nodes are
//! built once from a validated plan and never change while the run executes;
//! outputs are recorded once and are read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique key of a task within a plan (the catalog template key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(pub String);

impl TaskKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Ready -> Running -> AwaitingGate -> Completed`, or `Failed`
/// from any non-terminal state. A failed task fails the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on unresolved dependencies.
    #[default]
    Pending,
    /// All dependencies completed; not yet dispatched.
    Ready,
    /// Worker call in flight.
    Running,
    /// Output produced, blocked on a human decision.
    AwaitingGate,
    /// Output recorded and visible to dependents.
    Completed,
    /// Task failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::AwaitingGate => write!(f, "awaiting_gate"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// A single node of the delegation DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique key of this task.
    pub key: TaskKey,
    /// Catalog key of the agent that performs the task.
    pub agent_ref: String,
    /// Keys of the tasks whose output this task consumes.
    pub dependencies: BTreeSet<TaskKey>,
    /// Whether the worker call may overlap with other worker calls.
    #[serde(default = "default_allow_parallel")]
    pub allow_parallel: bool,
}

fn default_allow_parallel() -> bool {
    true
}

impl TaskNode {
    /// Create a node with no dependencies that may run in parallel.
    pub fn new(key: impl Into<TaskKey>, agent_ref: &str) -> Self {
        Self {
            key: key.into(),
            agent_ref: agent_ref.to_string(),
            dependencies: BTreeSet::new(),
            allow_parallel: true,
        }
    }

    /// Builder: add dependencies.
    pub fn depends_on<I, K>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<TaskKey>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Builder: require the worker call to run alone.
    pub fn exclusive(mut self) -> Self {
        self.allow_parallel = false;
        self
    }

    /// Human-readable agent name (`market_analyst` -> `Market Analyst`).
    pub fn agent_name(&self) -> String {
        display_name(&self.agent_ref)
    }
}

/// The textual result of one task plus provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_key: TaskKey,
    pub agent_name: String,
    pub text: String,
}

impl TaskOutput {
    pub fn new(task_key: TaskKey, agent_name: &str, text: impl Into<String>) -> Self {
        Self {
            task_key,
            agent_name: agent_name.to_string(),
            text: text.into(),
        }
    }
}

/// Title-case an agent key, turning underscores into spaces.
pub fn display_name(agent_ref: &str) -> String {
    agent_ref
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
