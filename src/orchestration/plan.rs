//! Catalog resolution and task prompt composition.
//!
//! A planner returns bare `(task_key, dependencies)` entries. Resolution
//! joins them with the catalog of task templates and agent profiles,
//! removes leader tasks (the leader coordinates, it does not execute) and
//! yields an `ExecutionPlan` whose order is the gating order.

use crate::core::dag::DependencyGraph;
use crate::core::task::{TaskKey, TaskNode};
use crate::error::{PlanError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Persona of a worker agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentProfile {
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentProfile {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    /// Leaders plan and synthesize; they never run as a task.
    pub fn is_leader(&self) -> bool {
        self.role.to_lowercase().contains("leader")
    }

    /// Opening lines of a worker's system prompt.
    pub fn persona(&self, agent_name: &str) -> String {
        format!(
            "You are {}.\nRole: {}\nGoal: {}\nBackstory: {}",
            agent_name,
            self.role.trim(),
            self.goal.trim(),
            self.backstory.trim()
        )
    }
}

/// A reusable task description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// May contain a `{prompt}` placeholder.
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    /// Catalog key of the agent that performs this task.
    pub agent: String,
    #[serde(default = "default_true")]
    pub allow_parallel: bool,
}

fn default_true() -> bool {
    true
}

impl TaskTemplate {
    pub fn new(agent: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            expected_output: String::new(),
            agent: agent.into(),
            allow_parallel: true,
        }
    }

    pub fn expecting(mut self, expected_output: impl Into<String>) -> Self {
        self.expected_output = expected_output.into();
        self
    }
}

/// Agents and task templates available to the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Catalog {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentProfile>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskTemplate>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, key: impl Into<String>, profile: AgentProfile) -> Self {
        self.agents.insert(key.into(), profile);
        self
    }

    pub fn with_task(mut self, key: impl Into<String>, template: TaskTemplate) -> Self {
        self.tasks.insert(key.into(), template);
        self
    }
}

/// One planner decision: run `task_key` after `dependencies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub task_key: TaskKey,
    #[serde(default)]
    pub dependencies: Vec<TaskKey>,
}

impl PlanEntry {
    pub fn new<I, K>(task_key: impl Into<TaskKey>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<TaskKey>,
    {
        Self {
            task_key: task_key.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

/// A task ready for execution: graph node plus everything the worker needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub node: TaskNode,
    pub template: TaskTemplate,
    pub agent: AgentProfile,
}

impl PlannedTask {
    pub fn key(&self) -> &TaskKey {
        &self.node.key
    }

    pub fn agent_name(&self) -> String {
        self.node.agent_name()
    }
}

/// Resolved plan, in execution (gating) order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionPlan {
    tasks: Vec<PlannedTask>,
}

impl ExecutionPlan {
    pub fn new(tasks: Vec<PlannedTask>) -> Self {
        Self { tasks }
    }

    /// Join planner entries with the catalog.
    ///
    /// Dependency keys are not checked against the plan here; that is the
    /// graph's job when the run starts.
    pub fn resolve(
        entries: &[PlanEntry],
        catalog: &Catalog,
    ) -> std::result::Result<Self, PlanError> {
        let mut resolved = Vec::with_capacity(entries.len());
        for entry in entries {
            let template = catalog
                .tasks
                .get(entry.task_key.as_str())
                .ok_or_else(|| PlanError::UnknownTemplate(entry.task_key.clone()))?;
            let agent =
                catalog
                    .agents
                    .get(&template.agent)
                    .ok_or_else(|| PlanError::UnknownAgent {
                        task: entry.task_key.clone(),
                        agent: template.agent.clone(),
                    })?;
            resolved.push((entry, template, agent));
        }

        let leaders: HashSet<&TaskKey> = resolved
            .iter()
            .filter(|(_, _, agent)| agent.is_leader())
            .map(|(entry, _, _)| &entry.task_key)
            .collect();

        let tasks: Vec<PlannedTask> = resolved
            .iter()
            .filter(|(entry, _, _)| !leaders.contains(&entry.task_key))
            .map(|(entry, template, agent)| {
                let node = TaskNode {
                    key: entry.task_key.clone(),
                    agent_ref: template.agent.clone(),
                    dependencies: entry
                        .dependencies
                        .iter()
                        .filter(|dep| !leaders.contains(dep))
                        .cloned()
                        .collect(),
                    allow_parallel: template.allow_parallel,
                };
                PlannedTask {
                    node,
                    template: (*template).clone(),
                    agent: (*agent).clone(),
                }
            })
            .collect();

        if tasks.is_empty() {
            return Err(PlanError::Empty);
        }
        Ok(Self { tasks })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[PlannedTask] {
        &self.tasks
    }

    pub fn task(&self, key: &TaskKey) -> Option<&PlannedTask> {
        self.tasks.iter().find(|t| t.key() == key)
    }

    pub fn nodes(&self) -> Vec<TaskNode> {
        self.tasks.iter().map(|t| t.node.clone()).collect()
    }

    /// Build (and so validate) the dependency graph for this plan.
    pub fn graph(&self) -> std::result::Result<DependencyGraph, PlanError> {
        DependencyGraph::build(self.nodes())
    }
}

/// Compose the full instruction handed to a worker.
///
/// `context` holds `(agent name, full output)` pairs for the direct
/// dependencies, in plan order.
pub fn compose_task_prompt(
    template: &TaskTemplate,
    prompt: &str,
    context: &[(String, String)],
) -> String {
    let description = template.description.trim();
    let mut composed = if description.contains("{prompt}") {
        description.replace("{prompt}", prompt)
    } else {
        format!("{}\n\nUser's request: {}", description, prompt)
    };

    if !context.is_empty() {
        let sections: Vec<String> = context
            .iter()
            .map(|(agent, text)| format!("--- Output from {} ---\n{}", agent, text))
            .collect();
        composed.push_str("\n\n## Context from previous agents\n\n");
        composed.push_str(&sections.join("\n\n"));
    }

    let expected = template.expected_output.trim();
    if !expected.is_empty() {
        composed.push_str("\n\n## Expected Output\n");
        composed.push_str(expected);
    }
    composed
}

/// A plan file: catalog plus planner entries.
///
/// ```toml
/// [agents.writer]
/// role = "Writer"
///
/// [tasks.draft]
/// agent = "writer"
/// description = "Draft a post about {prompt}"
///
/// [[plan]]
/// task_key = "draft"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlanDocument {
    #[serde(flatten)]
    pub catalog: Catalog,
    #[serde(default)]
    pub plan: Vec<PlanEntry>,
}

impl PlanDocument {
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn resolve(&self) -> std::result::Result<ExecutionPlan, PlanError> {
        ExecutionPlan::resolve(&self.plan, &self.catalog)
    }
}
