//! Run identity, per-run context and run results.

use crate::core::task::TaskOutput;
use crate::error::Result;
use crate::events::{EventStream, RunEvent};
use crate::gate::{GateRegistry, GatingMode};
use crate::orchestration::plan::ExecutionPlan;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Everything one run owns: its gate table, its event sink and its
/// cancellation tokens. Passed explicitly to every engine call.
pub struct RunContext {
    pub id: RunId,
    pub prompt: String,
    pub mode: GatingMode,
    pub events: Arc<EventStream>,
    pub gates: Arc<GateRegistry>,
    /// Cancelled by the caller to abandon the run.
    pub cancel: CancellationToken,
    /// Cancelled when the run ends for any reason. Child of `cancel`.
    pub(crate) halt: CancellationToken,
    completed: Mutex<Vec<TaskOutput>>,
}

impl RunContext {
    pub fn new(prompt: impl Into<String>, mode: GatingMode) -> Self {
        let id = RunId::new();
        let cancel = CancellationToken::new();
        let halt = cancel.child_token();
        Self {
            id,
            prompt: prompt.into(),
            mode,
            events: Arc::new(EventStream::new(id)),
            gates: Arc::new(GateRegistry::new()),
            cancel,
            halt,
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Whether the run has ended or been cancelled.
    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    pub(crate) fn record(&self, output: TaskOutput) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
    }

    /// Outputs recorded so far, in completion order.
    pub fn completed(&self) -> Vec<TaskOutput> {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self, plan: Option<ExecutionPlan>) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            prompt: self.prompt.clone(),
            mode: self.mode,
            plan,
            completed: self.completed(),
        }
    }

    /// Emit a task-level event. Dropped once the run has halted, so nothing
    /// a detached task says can follow the run's final `ERROR`.
    pub(crate) fn publish(&self, event: RunEvent) -> bool {
        self.events.emit_unless_halted(event, &self.halt)
    }

    /// Release every blocked waiter and close the event stream.
    pub(crate) fn teardown(&self) {
        self.halt.cancel();
        self.gates.cleanup(self.id);
        self.events.close();
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("halted", &self.is_halted())
            .finish()
    }
}

/// Durable state of a run: enough to continue it in a new process without
/// re-running completed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub prompt: String,
    pub mode: GatingMode,
    /// Absent when the run was captured before planning finished.
    pub plan: Option<ExecutionPlan>,
    pub completed: Vec<TaskOutput>,
}

impl RunSnapshot {
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    Finished,
    Failed { message: String },
    Cancelled,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    #[serde(flatten)]
    pub status: RunStatus,
    pub final_output: Option<String>,
    /// Recorded task outputs, in completion order.
    pub outputs: Vec<TaskOutput>,
}

impl RunReport {
    pub fn is_finished(&self) -> bool {
        self.status == RunStatus::Finished
    }
}
