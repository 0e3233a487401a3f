//! External capabilities consumed by the engine.
//!
//! Planning, the per-task reasoning loop and final synthesis are black
//! boxes behind these traits. Implementations must be safe to call
//! concurrently for independent tasks.

use crate::core::task::{TaskKey, TaskOutput};
use crate::error::Result;
use crate::events::Activity;
use crate::orchestration::engine::TaskScope;
use crate::orchestration::plan::{AgentProfile, Catalog, PlanEntry};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Turns a free-text request into `(task_key, dependencies)` entries.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, prompt: &str, catalog: &Catalog) -> Result<Vec<PlanEntry>>;
}

/// Input for one worker call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub task_key: TaskKey,
    pub agent_name: String,
    /// Opening of the agent's system prompt, built from its profile.
    pub persona: String,
    pub agent: AgentProfile,
    /// Fully composed instruction, dependency context included.
    pub description: String,
    /// Full text of each direct dependency's output.
    pub context: BTreeMap<TaskKey, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerOutput {
    pub text: String,
    /// Set when the worker wants a human checkpoint after this task.
    pub gate_recommendation: Option<String>,
}

impl WorkerOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            gate_recommendation: None,
        }
    }

    pub fn recommending_gate(mut self, reason: impl Into<String>) -> Self {
        self.gate_recommendation = Some(reason.into());
        self
    }
}

/// Produces one task's textual output.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, request: WorkerRequest, scope: &TaskScope) -> Result<WorkerOutput>;
}

/// Merges several terminal outputs into one deliverable.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn combine(&self, prompt: &str, outputs: &[TaskOutput]) -> Result<String>;
}

/// Planner that always returns the same entries.
#[derive(Debug, Clone, Default)]
pub struct StaticPlanner {
    entries: Vec<PlanEntry>,
}

impl StaticPlanner {
    pub fn new(entries: Vec<PlanEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _prompt: &str, _catalog: &Catalog) -> Result<Vec<PlanEntry>> {
        Ok(self.entries.clone())
    }
}

/// Joins outputs as `## <Agent>` sections in the given order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionSynthesizer;

#[async_trait]
impl Synthesizer for SectionSynthesizer {
    async fn combine(&self, _prompt: &str, outputs: &[TaskOutput]) -> Result<String> {
        Ok(outputs
            .iter()
            .map(|o| format!("## {}\n{}", o.agent_name, o.text))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

/// Offline worker: asks for every gated tool the agent carries, then
/// answers with its own instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn run(&self, request: WorkerRequest, scope: &TaskScope) -> Result<WorkerOutput> {
        for tool in &request.agent.tools {
            scope.approve_tool(tool).await?;
            scope.activity(Activity::ToolCall, format!("{} (dry run)", tool));
        }
        scope.activity(Activity::LlmGenerating, "");
        Ok(WorkerOutput::text(format!(
            "{} completed the task.\n\n{}\n\n{}",
            request.agent_name, request.persona, request.description
        )))
    }
}
