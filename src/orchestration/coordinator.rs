//! Run lifecycle for the transport layer.
//!
//! The coordinator owns every live run: it creates the run context, plans
//! it, hands it to the engine and drops it once the run has ended. Gate
//! resolution, cancellation and snapshots go through it by run id.

use crate::core::task::TaskOutput;
use crate::error::{Error, Result};
use crate::events::EventSubscription;
use crate::gate::{Gate, GateAction, GateId, GateResponse, GatingMode};
use crate::orchestration::capabilities::Planner;
use crate::orchestration::engine::ExecutionEngine;
use crate::orchestration::plan::{Catalog, ExecutionPlan};
use crate::orchestration::run::{RunContext, RunId, RunReport, RunSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct RunEntry {
    context: Arc<RunContext>,
    plan: Option<ExecutionPlan>,
    seeded: Vec<TaskOutput>,
    started: bool,
}

/// A run claimed for execution.
struct StartedRun {
    context: Arc<RunContext>,
    plan: Option<ExecutionPlan>,
    seeded: Vec<TaskOutput>,
}

type RunTable = Mutex<HashMap<RunId, RunEntry>>;

/// Removes a run from the table however its execution ends.
struct Deregister<'a> {
    runs: &'a RunTable,
    run_id: RunId,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        lock(self.runs).remove(&self.run_id);
        debug!(run_id = %self.run_id, "run deregistered");
    }
}

fn lock(runs: &RunTable) -> MutexGuard<'_, HashMap<RunId, RunEntry>> {
    runs.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RunCoordinator {
    engine: ExecutionEngine,
    planner: Arc<dyn Planner>,
    catalog: Catalog,
    runs: RunTable,
}

impl RunCoordinator {
    pub fn new(engine: ExecutionEngine, planner: Arc<dyn Planner>, catalog: Catalog) -> Self {
        Self {
            engine,
            planner,
            catalog,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Register a new run. Nothing executes until `execute` or `spawn`.
    pub fn create_run(&self, prompt: impl Into<String>, mode: GatingMode) -> RunId {
        self.register(RunContext::new(prompt, mode), None, Vec::new())
    }

    /// Register a run that continues from a snapshot. Completed tasks keep
    /// their recorded outputs and are not executed again.
    pub fn resume(&self, snapshot: RunSnapshot) -> RunId {
        let context = RunContext::new(snapshot.prompt, snapshot.mode);
        info!(
            run_id = %context.id,
            resumed_from = %snapshot.run_id,
            completed = snapshot.completed.len(),
            "resuming run"
        );
        self.register(context, snapshot.plan, snapshot.completed)
    }

    fn register(
        &self,
        context: RunContext,
        plan: Option<ExecutionPlan>,
        seeded: Vec<TaskOutput>,
    ) -> RunId {
        let run_id = context.id;
        lock(&self.runs).insert(
            run_id,
            RunEntry {
                context: Arc::new(context),
                plan,
                seeded,
                started: false,
            },
        );
        debug!(%run_id, "run registered");
        run_id
    }

    fn context(&self, run_id: RunId) -> Result<Arc<RunContext>> {
        lock(&self.runs)
            .get(&run_id)
            .map(|entry| entry.context.clone())
            .ok_or(Error::RunNotFound(run_id))
    }

    /// Take the event stream of a run. One subscriber per run.
    pub fn subscribe(&self, run_id: RunId) -> Result<EventSubscription> {
        self.context(run_id)?.events.subscribe()
    }

    fn claim(&self, run_id: RunId) -> Result<StartedRun> {
        let mut runs = lock(&self.runs);
        let entry = runs.get_mut(&run_id).ok_or(Error::RunNotFound(run_id))?;
        if entry.started {
            return Err(Error::AlreadyStarted(run_id));
        }
        entry.started = true;
        Ok(StartedRun {
            context: entry.context.clone(),
            plan: entry.plan.clone(),
            seeded: std::mem::take(&mut entry.seeded),
        })
    }

    /// Plan and execute a run to the end.
    ///
    /// Run-level failures are reported in the `RunReport` and on the event
    /// stream; `Err` only means the run could not be started.
    pub async fn execute(&self, run_id: RunId) -> Result<RunReport> {
        let started = self.claim(run_id)?;
        Ok(self.drive(started).await)
    }

    /// Like `execute`, on a background task.
    pub fn spawn(self: &Arc<Self>, run_id: RunId) -> Result<JoinHandle<RunReport>> {
        let started = self.claim(run_id)?;
        let coordinator = Arc::clone(self);
        Ok(tokio::spawn(async move { coordinator.drive(started).await }))
    }

    async fn drive(&self, started: StartedRun) -> RunReport {
        let StartedRun {
            context,
            plan,
            seeded,
        } = started;
        let _deregister = Deregister {
            runs: &self.runs,
            run_id: context.id,
        };

        let plan = match plan {
            Some(plan) => Ok(plan),
            None => {
                tokio::select! {
                    plan = self.plan_run(&context) => plan,
                    _ = context.cancel.cancelled() => Err(Error::Cancelled),
                }
            }
        };

        match plan {
            Ok(plan) => {
                if let Some(entry) = lock(&self.runs).get_mut(&context.id) {
                    entry.plan = Some(plan.clone());
                }
                self.engine.execute_seeded(context, plan, seeded).await
            }
            Err(e) => self.engine.abort(&context, e),
        }
    }

    async fn plan_run(&self, run: &RunContext) -> Result<ExecutionPlan> {
        let entries = self
            .planner
            .plan(&run.prompt, &self.catalog)
            .await
            .map_err(|e| match e {
                Error::Planning(_) => e,
                other => Error::Planning(other.to_string()),
            })?;
        debug!(run_id = %run.id, tasks = entries.len(), "plan received");
        Ok(ExecutionPlan::resolve(&entries, &self.catalog)?)
    }

    /// Answer a pending gate.
    pub fn resolve_gate(
        &self,
        run_id: RunId,
        gate_id: GateId,
        action: GateAction,
        note: impl Into<String>,
    ) -> Result<()> {
        let context = self.context(run_id)?;
        let response = GateResponse {
            action,
            note: note.into(),
        };
        if context.gates.resolve(run_id, gate_id, response) {
            info!(%run_id, %gate_id, ?action, "gate resolved");
            Ok(())
        } else {
            warn!(%run_id, %gate_id, "resolution for unknown or settled gate");
            Err(Error::GateNotFound { run_id, gate_id })
        }
    }

    pub fn pending_gates(&self, run_id: RunId) -> Result<Vec<Gate>> {
        let context = self.context(run_id)?;
        Ok(context.gates.pending(run_id))
    }

    /// Abandon a run. A run that never started is finished on the spot.
    pub fn cancel(&self, run_id: RunId) -> Result<()> {
        let unstarted = {
            let mut runs = lock(&self.runs);
            let entry = runs.get(&run_id).ok_or(Error::RunNotFound(run_id))?;
            if entry.started {
                entry.context.cancel.cancel();
                None
            } else {
                runs.remove(&run_id).map(|entry| entry.context)
            }
        };

        info!(%run_id, "run cancelled");
        if let Some(context) = unstarted {
            context.cancel.cancel();
            self.engine.abort(&context, Error::Cancelled);
        }
        Ok(())
    }

    /// Capture what a run has done so far.
    pub fn snapshot(&self, run_id: RunId) -> Result<RunSnapshot> {
        let runs = lock(&self.runs);
        let entry = runs.get(&run_id).ok_or(Error::RunNotFound(run_id))?;
        let mut snapshot = entry.context.snapshot(entry.plan.clone());
        // A resumed run that has not started yet still owes its seed.
        if !entry.started {
            snapshot.completed.extend(entry.seeded.iter().cloned());
        }
        Ok(snapshot)
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        lock(&self.runs).keys().copied().collect()
    }
}
