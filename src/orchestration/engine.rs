//! Execution engine for delegation runs.
//!
//! The engine turns an `ExecutionPlan` into a `DependencyGraph` and drives
//! it to completion. Every ready task runs as its own tokio task. When a
//! task's output is recorded, the dependents it unblocks are dispatched
//! immediately, so a node starts the moment its own dependencies are done
//! rather than when a whole level finishes.
//!
//! All fatal failures (invalid plan, worker error, rejected or unanswered
//! gate, cancellation) end in the same place: one `ERROR` event, one
//! `RUN_FINISHED` event, then teardown. Callers get a `RunReport`, never an
//! `Err`.

use crate::core::dag::DependencyGraph;
use crate::core::summary::{summarize, DEFAULT_SUMMARY_LIMIT};
use crate::core::task::{TaskKey, TaskOutput};
use crate::error::{Error, Result};
use crate::events::{Activity, RunEvent};
use crate::gate::{
    gate_question, should_gate, should_gate_tool_call, tool_gate_question, GateRequest,
    GateResponse, GateSource, GatingMode,
};
use crate::orchestration::capabilities::{Synthesizer, Worker, WorkerRequest};
use crate::orchestration::plan::{compose_task_prompt, ExecutionPlan};
use crate::orchestration::run::{RunContext, RunId, RunReport, RunStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long a gate waits for a human before the run fails.
pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Tunables for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub gate_timeout: Duration,
    /// Lookahead window of the output summarizer.
    pub summary_limit: usize,
    /// Cap on simultaneous worker calls; `None` is unbounded.
    pub max_concurrent_tasks: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gate_timeout: DEFAULT_GATE_TIMEOUT,
            summary_limit: DEFAULT_SUMMARY_LIMIT,
            max_concurrent_tasks: None,
        }
    }
}

/// Handle a worker gets for the task it is running.
///
/// Lets the worker report activity and ask for tool approval on behalf of
/// its agent.
pub struct TaskScope {
    run: Arc<RunContext>,
    task_key: TaskKey,
    agent_name: String,
    gate_timeout: Duration,
}

impl TaskScope {
    pub fn run_id(&self) -> RunId {
        self.run.id
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.task_key
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn mode(&self) -> GatingMode {
        self.run.mode
    }

    /// True once the run has ended; the worker's result will be discarded.
    pub fn is_cancelled(&self) -> bool {
        self.run.is_halted()
    }

    /// Forward a fine-grained activity notification for this agent.
    pub fn activity(&self, activity: Activity, details: impl Into<String>) {
        self.run.publish(RunEvent::AgentActivity {
            agent_name: self.agent_name.clone(),
            activity,
            details: details.into(),
        });
    }

    /// Ask for permission before running a tool.
    ///
    /// Returns `Ok(())` when the tool may run, either because it is not
    /// gated or because a human approved it. A rejection or timeout is an
    /// error the worker should propagate; it fails the run.
    pub async fn approve_tool(&self, tool_name: &str) -> Result<()> {
        let (gate, reason) = should_gate_tool_call(self.run.mode, tool_name, false);
        if !gate {
            return Ok(());
        }
        self.await_gate(GateRequest {
            task_key: self.task_key.clone(),
            agent_name: self.agent_name.clone(),
            question: tool_gate_question(&self.agent_name, tool_name),
            context: format!("Tool: {}", tool_name),
            reason: reason.to_string(),
            source: GateSource::ToolCall,
        })
        .await
        .map(|_| ())
    }

    /// Create a gate, announce it, and block until it is answered.
    async fn await_gate(&self, request: GateRequest) -> Result<GateResponse> {
        if self.run.is_halted() {
            return Err(Error::Cancelled);
        }

        let (gate_id, handle) = self.run.gates.create_gate(self.run.id, request);
        let gate = handle.gate().clone();
        info!(
            run_id = %self.run.id,
            %gate_id,
            task_key = %gate.task_key,
            reason = %gate.reason,
            "awaiting approval"
        );
        self.run.publish(RunEvent::GateRequested {
            gate_id,
            run_id: self.run.id,
            agent_name: gate.agent_name.clone(),
            question: gate.question,
            context: gate.context,
            reason: gate.reason,
            gate_source: gate.source,
        });

        let response = tokio::select! {
            response = self.run.gates.wait(handle, self.gate_timeout) => response,
            _ = self.run.halt.cancelled() => return Err(Error::Cancelled),
        };

        match response {
            Ok(response) if response.is_approved() => Ok(response),
            Ok(response) => {
                warn!(run_id = %self.run.id, %gate_id, note = %response.note, "gate rejected");
                Err(Error::GateRejected {
                    agent_name: gate.agent_name,
                })
            }
            Err(e) => {
                error!(run_id = %self.run.id, %gate_id, "gate unanswered: {}", e);
                Err(e)
            }
        }
    }
}

/// Worker-call admission: an optional global cap plus a lane lock that
/// exclusive tasks take for writing.
struct Limits {
    slots: Option<Arc<Semaphore>>,
    lane: Arc<RwLock<()>>,
}

#[derive(Debug)]
struct WorkerPermit {
    _shared: Option<OwnedRwLockReadGuard<()>>,
    _exclusive: Option<OwnedRwLockWriteGuard<()>>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl Limits {
    fn new(max_concurrent_tasks: Option<usize>) -> Self {
        Self {
            slots: max_concurrent_tasks.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            lane: Arc::new(RwLock::new(())),
        }
    }

    async fn acquire(&self, allow_parallel: bool) -> Result<WorkerPermit> {
        let (shared, exclusive) = if allow_parallel {
            (Some(self.lane.clone().read_owned().await), None)
        } else {
            (None, Some(self.lane.clone().write_owned().await))
        };
        let slot = match &self.slots {
            Some(slots) => Some(
                slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)?,
            ),
            None => None,
        };
        Ok(WorkerPermit {
            _shared: shared,
            _exclusive: exclusive,
            _slot: slot,
        })
    }
}

/// State shared by the task units of one run.
struct TaskRunner {
    run: Arc<RunContext>,
    plan: Arc<ExecutionPlan>,
    graph: Arc<RwLock<DependencyGraph>>,
    worker: Arc<dyn Worker>,
    limits: Limits,
    config: EngineConfig,
}

impl TaskRunner {
    fn emit(&self, event: RunEvent) {
        self.run.publish(event);
    }

    /// Handoff (when there are inputs) and intent, sent once the task holds
    /// its worker permit.
    fn announce(&self, agent_name: &str, role: &str, sections: &[(String, String)]) {
        if !sections.is_empty() {
            let source_agents: Vec<String> =
                sections.iter().map(|(agent, _)| agent.clone()).collect();
            self.emit(RunEvent::TaskHandoff {
                receiving_agent: agent_name.to_string(),
                summary: format!("Receiving outputs from {}", source_agents.join(", ")),
                source_agents,
            });
        }
        self.emit(RunEvent::AgentIntent {
            agent_name: agent_name.to_string(),
            message: format!("Started working as {}.", role.trim().to_lowercase()),
        });
    }

    /// One task from handoff to recorded output. Returns the dependents it
    /// made ready.
    async fn run_task(&self, key: TaskKey) -> Result<Vec<TaskKey>> {
        let task = self
            .plan
            .task(&key)
            .ok_or_else(|| Error::InvalidTaskTransition {
                task_key: key.clone(),
                reason: "task is not part of the plan".to_string(),
            })?;
        let agent_name = task.agent_name();

        // Dependency outputs are immutable once recorded; copy them out.
        let (inputs, is_last) = {
            let graph = self.graph.read().await;
            (graph.context_for(&key), graph.is_last(&key))
        };
        let sections: Vec<(String, String)> = inputs
            .iter()
            .map(|o| (o.agent_name.clone(), o.text.clone()))
            .collect();

        let request = WorkerRequest {
            task_key: key.clone(),
            agent_name: agent_name.clone(),
            persona: task.agent.persona(&agent_name),
            agent: task.agent.clone(),
            description: compose_task_prompt(&task.template, &self.run.prompt, &sections),
            context: inputs
                .into_iter()
                .map(|o| (o.task_key, o.text))
                .collect::<BTreeMap<_, _>>(),
        };
        let scope = TaskScope {
            run: self.run.clone(),
            task_key: key.clone(),
            agent_name: agent_name.clone(),
            gate_timeout: self.config.gate_timeout,
        };

        let result = {
            let _permit = self.limits.acquire(task.node.allow_parallel).await?;
            if self.run.is_halted() {
                return Err(Error::Cancelled);
            }
            self.graph.write().await.mark_started(&key)?;
            debug!(run_id = %self.run.id, task_key = %key, "worker started");
            self.announce(&agent_name, &task.agent.role, &sections);
            self.worker.run(request, &scope).await
        };

        // The run may have ended while the worker was busy.
        if self.run.is_halted() {
            return Err(Error::Cancelled);
        }
        let output = result.map_err(|e| match e {
            Error::GateRejected { .. } | Error::GateTimeout { .. } | Error::Cancelled => e,
            other => Error::Worker {
                task_key: key.clone(),
                message: other.to_string(),
            },
        })?;

        self.emit(RunEvent::AgentActivity {
            agent_name: agent_name.clone(),
            activity: Activity::Idle,
            details: String::new(),
        });
        let summary = summarize(&output.text, self.config.summary_limit);
        self.emit(RunEvent::TaskSummary {
            agent_name: agent_name.clone(),
            summary: summary.clone(),
            full_output: output.text.clone(),
        });

        let leader_recommended = match &output.gate_recommendation {
            Some(reason) => {
                self.emit(RunEvent::GateRecommended {
                    agent_name: agent_name.clone(),
                    reason: reason.clone(),
                });
                true
            }
            None => false,
        };

        let mut text = output.text;
        let (gate, reason) = should_gate(self.run.mode, is_last, leader_recommended);
        if gate {
            self.graph.write().await.mark_awaiting_gate(&key)?;
            let response = scope
                .await_gate(GateRequest {
                    task_key: key.clone(),
                    agent_name: agent_name.clone(),
                    question: gate_question(&agent_name, is_last),
                    context: summary,
                    reason: reason.to_string(),
                    source: GateSource::TaskComplete,
                })
                .await?;
            let note = response.note.trim();
            if !note.is_empty() {
                text = format!("{}\n\n[Human feedback]: {}", text, note);
            }
        }

        let output = TaskOutput::new(key.clone(), &agent_name, text);
        let newly_ready = {
            let mut graph = self.graph.write().await;
            if self.run.is_halted() {
                return Err(Error::Cancelled);
            }
            graph.complete(&key, output.clone())?
        };
        self.run.record(output);
        info!(run_id = %self.run.id, task_key = %key, unblocked = newly_ready.len(), "task completed");
        Ok(newly_ready)
    }
}

/// Drives runs with the given capabilities.
pub struct ExecutionEngine {
    worker: Arc<dyn Worker>,
    synthesizer: Arc<dyn Synthesizer>,
    config: EngineConfig,
}

/// Tears the run down however `execute` exits, including when its future
/// is dropped.
struct Teardown<'a>(&'a RunContext);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

impl ExecutionEngine {
    pub fn new(
        worker: Arc<dyn Worker>,
        synthesizer: Arc<dyn Synthesizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            worker,
            synthesizer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a plan from scratch.
    pub async fn execute(&self, run: Arc<RunContext>, plan: ExecutionPlan) -> RunReport {
        self.execute_seeded(run, plan, Vec::new()).await
    }

    /// Run a plan whose `completed` outputs were recorded by an earlier run.
    /// Seeded tasks are not re-run and emit no events.
    pub async fn execute_seeded(
        &self,
        run: Arc<RunContext>,
        plan: ExecutionPlan,
        completed: Vec<TaskOutput>,
    ) -> RunReport {
        let _teardown = Teardown(&run);
        self.start(&run);
        let result = self.drive(&run, plan, completed).await;
        self.finish(&run, result)
    }

    /// End a run that failed before it had a plan.
    pub fn abort(&self, run: &RunContext, err: Error) -> RunReport {
        let _teardown = Teardown(run);
        self.start(run);
        self.finish(run, Err(err))
    }

    fn start(&self, run: &RunContext) {
        info!(run_id = %run.id, mode = %run.mode, "run started");
        run.events.emit(RunEvent::RunStarted {
            run_id: run.id,
            prompt: run.prompt.clone(),
        });
    }

    fn finish(&self, run: &RunContext, result: Result<String>) -> RunReport {
        let (status, final_output) = match result {
            Ok(final_output) => {
                info!(run_id = %run.id, "run finished");
                (RunStatus::Finished, Some(final_output))
            }
            Err(e) => {
                // Detached units check this before publishing anything.
                run.halt.cancel();
                let message = e.to_string();
                match &e {
                    Error::Cancelled => info!(run_id = %run.id, "run cancelled"),
                    _ => error!(run_id = %run.id, "run failed: {}", message),
                }
                run.events.emit(RunEvent::Error {
                    message: message.clone(),
                });
                let status = match e {
                    Error::Cancelled => RunStatus::Cancelled,
                    _ => RunStatus::Failed { message },
                };
                (status, None)
            }
        };
        run.events.emit(RunEvent::RunFinished { run_id: run.id });

        RunReport {
            run_id: run.id,
            status,
            final_output,
            outputs: run.completed(),
        }
    }

    async fn drive(
        &self,
        run: &Arc<RunContext>,
        plan: ExecutionPlan,
        completed: Vec<TaskOutput>,
    ) -> Result<String> {
        let mut graph = plan.graph()?;
        if !completed.is_empty() {
            debug!(run_id = %run.id, seeded = completed.len(), "resuming with recorded outputs");
            graph.seed(completed.iter().cloned())?;
            for output in completed {
                run.record(output);
            }
        }

        let runner = Arc::new(TaskRunner {
            run: run.clone(),
            plan: Arc::new(plan),
            graph: Arc::new(RwLock::new(graph)),
            worker: self.worker.clone(),
            limits: Limits::new(self.config.max_concurrent_tasks),
            config: self.config.clone(),
        });

        let mut units: JoinSet<Result<Vec<TaskKey>>> = JoinSet::new();
        let initial = runner.graph.read().await.ready_tasks();
        for key in initial {
            Self::dispatch(&mut units, &runner, key);
        }

        loop {
            tokio::select! {
                _ = run.cancel.cancelled() => {
                    units.detach_all();
                    return Err(Error::Cancelled);
                }
                joined = units.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(newly_ready))) => {
                        for key in newly_ready {
                            Self::dispatch(&mut units, &runner, key);
                        }
                    }
                    Some(Ok(Err(e))) => {
                        // In-flight units finish on their own; their results are dropped.
                        units.detach_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        units.detach_all();
                        return Err(Error::TaskJoin(e.to_string()));
                    }
                },
            }
        }

        let terminal = {
            let graph = runner.graph.read().await;
            if !graph.all_complete() {
                return Err(Error::TaskJoin(format!(
                    "run stalled with {} task(s) unfinished",
                    graph.pending_count()
                )));
            }
            graph
                .terminal_tasks()
                .iter()
                .filter_map(|key| graph.output(key).cloned())
                .collect::<Vec<_>>()
        };

        match terminal.as_slice() {
            [single] => Ok(single.text.clone()),
            outputs => {
                debug!(run_id = %run.id, outputs = outputs.len(), "synthesizing final output");
                self.synthesizer
                    .combine(&run.prompt, outputs)
                    .await
                    .map_err(|e| match e {
                        Error::Synthesis(_) => e,
                        other => Error::Synthesis(other.to_string()),
                    })
            }
        }
    }

    fn dispatch(
        units: &mut JoinSet<Result<Vec<TaskKey>>>,
        runner: &Arc<TaskRunner>,
        key: TaskKey,
    ) {
        debug!(run_id = %runner.run.id, task_key = %key, "dispatching");
        let runner = runner.clone();
        units.spawn(async move {
            let result = runner.run_task(key.clone()).await;
            if let Err(e) = &result {
                let _ = runner.graph.write().await.mark_failed(&key, &e.to_string());
            }
            result
        });
    }
}
