//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted worker that records when each task started and finished
//! - A recording synthesizer
//! - Catalogs and plans built from `(task, dependencies)` lists
//! - Running an engine while answering gates from the test

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crewrun::core::task::TaskOutput;
use crewrun::events::{Activity, EventEnvelope, RunEvent};
use crewrun::gate::GateResponse;
use crewrun::orchestration::{
    AgentProfile, Catalog, EngineConfig, ExecutionEngine, ExecutionPlan, PlanEntry, RunContext,
    RunReport, Synthesizer, TaskScope, TaskTemplate, Worker, WorkerOutput, WorkerRequest,
};
use crewrun::{Error, Result};

/// One recorded worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerCall {
    pub key: String,
    pub description: String,
    pub persona: String,
    pub context: HashMap<String, String>,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Worker whose behavior per task is scripted up front.
#[derive(Default)]
pub struct ScriptedWorker {
    delays: HashMap<String, Duration>,
    failures: HashSet<String>,
    recommendations: HashMap<String, String>,
    tools: HashMap<String, String>,
    outputs: HashMap<String, String>,
    calls: Mutex<Vec<WorkerCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, key: &str, millis: u64) -> Self {
        self.delays.insert(key.to_string(), Duration::from_millis(millis));
        self
    }

    pub fn failing(mut self, key: &str) -> Self {
        self.failures.insert(key.to_string());
        self
    }

    pub fn recommending(mut self, key: &str, reason: &str) -> Self {
        self.recommendations.insert(key.to_string(), reason.to_string());
        self
    }

    pub fn using_tool(mut self, key: &str, tool: &str) -> Self {
        self.tools.insert(key.to_string(), tool.to_string());
        self
    }

    pub fn with_output(mut self, key: &str, text: &str) -> Self {
        self.outputs.insert(key.to_string(), text.to_string());
        self
    }

    pub fn calls(&self) -> Vec<WorkerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call(&self, key: &str) -> WorkerCall {
        self.calls()
            .into_iter()
            .find(|c| c.key == key)
            .unwrap_or_else(|| panic!("task {} was never called", key))
    }

    pub fn called_keys(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.key).collect()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn finish(&self, index: usize) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap()[index].finished = Some(Instant::now());
    }
}

/// Default output text of a scripted task.
pub fn output_of(key: &str) -> String {
    format!("Result of {}. More detail follows.", key)
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(&self, request: WorkerRequest, scope: &TaskScope) -> Result<WorkerOutput> {
        let key = request.task_key.as_str().to_string();
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(WorkerCall {
                key: key.clone(),
                description: request.description.clone(),
                persona: request.persona.clone(),
                context: request
                    .context
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                    .collect(),
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        scope.activity(Activity::LlmGenerating, "");
        if let Some(tool) = self.tools.get(&key) {
            if let Err(e) = scope.approve_tool(tool).await {
                self.finish(index);
                return Err(e);
            }
            scope.activity(Activity::ToolCall, tool.clone());
        }
        if let Some(delay) = self.delays.get(&key) {
            tokio::time::sleep(*delay).await;
        }
        self.finish(index);

        if self.failures.contains(&key) {
            return Err(Error::Capability(format!("{} exploded", key)));
        }
        let text = self
            .outputs
            .get(&key)
            .cloned()
            .unwrap_or_else(|| output_of(&key));
        let output = WorkerOutput::text(text);
        Ok(match self.recommendations.get(&key) {
            Some(reason) => output.recommending_gate(reason.clone()),
            None => output,
        })
    }
}

/// Synthesizer that records what it was asked to combine.
#[derive(Default)]
pub struct RecordingSynthesizer {
    pub calls: Mutex<Vec<Vec<TaskOutput>>>,
}

#[async_trait]
impl Synthesizer for RecordingSynthesizer {
    async fn combine(&self, _prompt: &str, outputs: &[TaskOutput]) -> Result<String> {
        self.calls.lock().unwrap().push(outputs.to_vec());
        Ok(outputs
            .iter()
            .map(|o| o.task_key.as_str().to_string())
            .collect::<Vec<_>>()
            .join("+"))
    }
}

/// Agent display name for a task key (`a` runs as `Agent A`).
pub fn agent_of(key: &str) -> String {
    format!("Agent {}", key.to_uppercase())
}

/// Catalog with one agent and one template per task key.
pub fn catalog(keys: &[&str]) -> Catalog {
    keys.iter().fold(Catalog::new(), |catalog, key| {
        let agent = format!("agent_{}", key);
        catalog
            .with_agent(agent.clone(), AgentProfile::new(format!("Specialist {}", key)))
            .with_task(*key, TaskTemplate::new(agent, format!("Do {} for {{prompt}}", key)))
    })
}

pub fn entries(tasks: &[(&str, &[&str])]) -> Vec<PlanEntry> {
    tasks
        .iter()
        .map(|(key, deps)| PlanEntry::new(*key, deps.iter().copied()))
        .collect()
}

/// Resolve a plan from `(task, dependencies)` pairs, in the given order.
pub fn plan(tasks: &[(&str, &[&str])]) -> ExecutionPlan {
    let keys: Vec<&str> = tasks.iter().map(|(key, _)| *key).collect();
    ExecutionPlan::resolve(&entries(tasks), &catalog(&keys)).unwrap()
}

/// a -> b -> c
pub fn chain_plan() -> ExecutionPlan {
    plan(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])
}

/// a, b independent; c joins them.
pub fn fan_in_plan() -> ExecutionPlan {
    plan(&[("a", &[]), ("b", &[]), ("c", &["a", "b"])])
}

pub fn engine(worker: Arc<ScriptedWorker>, config: EngineConfig) -> ExecutionEngine {
    ExecutionEngine::new(worker, Arc::new(RecordingSynthesizer::default()), config)
}

pub fn engine_with_synthesizer(
    worker: Arc<ScriptedWorker>,
    synthesizer: Arc<RecordingSynthesizer>,
) -> ExecutionEngine {
    ExecutionEngine::new(worker, synthesizer, EngineConfig::default())
}

/// Execute a plan, answering each gate with whatever `respond` returns.
/// `None` leaves the gate unanswered.
pub async fn run_with<F>(
    engine: ExecutionEngine,
    run: Arc<RunContext>,
    plan: ExecutionPlan,
    seeded: Vec<TaskOutput>,
    mut respond: F,
) -> (RunReport, Vec<EventEnvelope>)
where
    F: FnMut(&RunEvent) -> Option<GateResponse>,
{
    let mut subscription = run.events.subscribe().unwrap();
    let handle = {
        let run = run.clone();
        tokio::spawn(async move { engine.execute_seeded(run, plan, seeded).await })
    };

    let mut events = Vec::new();
    while let Some(envelope) = subscription.recv().await {
        if let RunEvent::GateRequested { gate_id, .. } = &envelope.event {
            if let Some(response) = respond(&envelope.event) {
                run.gates.resolve(run.id, *gate_id, response);
            }
        }
        events.push(envelope);
    }
    (handle.await.unwrap(), events)
}

/// Execute a plan approving every gate.
pub async fn run_approving(
    engine: ExecutionEngine,
    run: Arc<RunContext>,
    plan: ExecutionPlan,
) -> (RunReport, Vec<EventEnvelope>) {
    run_with(engine, run, plan, Vec::new(), |_| {
        Some(GateResponse::approve(""))
    })
    .await
}

pub fn count(events: &[EventEnvelope], kind: &str) -> usize {
    events.iter().filter(|e| e.event.kind() == kind).count()
}

pub fn gate_reasons(events: &[EventEnvelope]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            RunEvent::GateRequested {
                agent_name, reason, ..
            } => Some((agent_name.clone(), reason.clone())),
            _ => None,
        })
        .collect()
}
