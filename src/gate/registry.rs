//! Pending approval checkpoints.
//!
//! The `GateRegistry` holds every unresolved gate of every live run. A gate
//! pairs the request shown to the human with a oneshot sender; the waiting
//! task holds the receiver. A oneshot keeps the value until it is read, so
//! a resolution that lands before the waiter starts waiting is not lost.

use crate::core::task::TaskKey;
use crate::error::{Error, Result};
use crate::gate::policy::GateSource;
use crate::orchestration::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier for a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateId(pub Uuid);

impl GateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for GateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The human decision on a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Approve,
    Reject,
}

impl std::str::FromStr for GateAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "y" | "yes" => Ok(GateAction::Approve),
            "reject" | "n" | "no" => Ok(GateAction::Reject),
            other => Err(format!("action must be 'approve' or 'reject' (got {:?})", other)),
        }
    }
}

/// Response recorded for a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResponse {
    pub action: GateAction,
    #[serde(default)]
    pub note: String,
}

impl GateResponse {
    pub fn approve(note: impl Into<String>) -> Self {
        Self {
            action: GateAction::Approve,
            note: note.into(),
        }
    }

    pub fn reject(note: impl Into<String>) -> Self {
        Self {
            action: GateAction::Reject,
            note: note.into(),
        }
    }

    /// Synthetic response handed to waiters when their run is torn down.
    pub fn cancelled() -> Self {
        Self::reject("Run ended before the gate was resolved")
    }

    pub fn is_approved(&self) -> bool {
        self.action == GateAction::Approve
    }
}

/// What the engine asks the human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRequest {
    pub task_key: TaskKey,
    pub agent_name: String,
    pub question: String,
    pub context: String,
    pub reason: String,
    pub source: GateSource,
}

/// A pending suspension point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub gate_id: GateId,
    pub run_id: RunId,
    pub task_key: TaskKey,
    pub agent_name: String,
    pub question: String,
    pub context: String,
    pub reason: String,
    pub source: GateSource,
    pub created_at: DateTime<Utc>,
}

/// Handle the gated task blocks on.
#[derive(Debug)]
pub struct GateWaitHandle {
    gate: Gate,
    rx: oneshot::Receiver<GateResponse>,
}

impl GateWaitHandle {
    pub fn gate(&self) -> &Gate {
        &self.gate
    }
}

struct PendingGate {
    gate: Gate,
    tx: oneshot::Sender<GateResponse>,
}

/// Table of unresolved gates, keyed by run.
#[derive(Default)]
pub struct GateRegistry {
    runs: Mutex<HashMap<RunId, HashMap<GateId, PendingGate>>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RunId, HashMap<GateId, PendingGate>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a new gate for a run.
    pub fn create_gate(&self, run_id: RunId, request: GateRequest) -> (GateId, GateWaitHandle) {
        let gate = Gate {
            gate_id: GateId::new(),
            run_id,
            task_key: request.task_key,
            agent_name: request.agent_name,
            question: request.question,
            context: request.context,
            reason: request.reason,
            source: request.source,
            created_at: Utc::now(),
        };
        let gate_id = gate.gate_id;
        let (tx, rx) = oneshot::channel();

        self.table().entry(run_id).or_default().insert(
            gate_id,
            PendingGate {
                gate: gate.clone(),
                tx,
            },
        );
        debug!(%run_id, %gate_id, task_key = %gate.task_key, "gate created");

        (gate_id, GateWaitHandle { gate, rx })
    }

    /// Record a response and release the waiter.
    ///
    /// Returns `false` for unknown, already resolved, expired or cleaned-up
    /// gates; a duplicate resolution never reaches the waiter twice.
    pub fn resolve(&self, run_id: RunId, gate_id: GateId, response: GateResponse) -> bool {
        let pending = {
            let mut table = self.table();
            let Some(gates) = table.get_mut(&run_id) else {
                return false;
            };
            let pending = gates.remove(&gate_id);
            if gates.is_empty() {
                table.remove(&run_id);
            }
            pending
        };

        match pending {
            Some(pending) => {
                debug!(%run_id, %gate_id, action = ?response.action, "gate resolved");
                pending.tx.send(response).is_ok()
            }
            None => false,
        }
    }

    /// Block until the gate is resolved or the timeout elapses.
    ///
    /// A timeout expires the gate and is an error: an unanswered checkpoint
    /// must not let the run continue unattended. A gate released by
    /// `cleanup` yields `GateResponse::cancelled()`.
    pub async fn wait(&self, handle: GateWaitHandle, timeout: Duration) -> Result<GateResponse> {
        let GateWaitHandle { gate, rx } = handle;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Ok(GateResponse::cancelled()),
            Err(_) => {
                self.expire(gate.run_id, gate.gate_id);
                warn!(run_id = %gate.run_id, gate_id = %gate.gate_id, ?timeout, "gate timed out");
                Err(Error::GateTimeout {
                    agent_name: gate.agent_name,
                    timeout,
                })
            }
        }
    }

    fn expire(&self, run_id: RunId, gate_id: GateId) {
        let mut table = self.table();
        if let Some(gates) = table.get_mut(&run_id) {
            gates.remove(&gate_id);
            if gates.is_empty() {
                table.remove(&run_id);
            }
        }
    }

    /// Release every pending waiter of a run with a synthetic rejection.
    ///
    /// Returns the number of waiters released.
    pub fn cleanup(&self, run_id: RunId) -> usize {
        let gates = self.table().remove(&run_id).unwrap_or_default();
        let released = gates.len();
        for (_, pending) in gates {
            let _ = pending.tx.send(GateResponse::cancelled());
        }
        if released > 0 {
            debug!(%run_id, released, "released pending gates");
        }
        released
    }

    /// Pending gates of a run, oldest first.
    pub fn pending(&self, run_id: RunId) -> Vec<Gate> {
        let mut gates: Vec<Gate> = self
            .table()
            .get(&run_id)
            .map(|gates| gates.values().map(|p| p.gate.clone()).collect())
            .unwrap_or_default();
        gates.sort_by_key(|g| g.created_at);
        gates
    }

    /// Total number of pending gates across runs.
    pub fn pending_count(&self) -> usize {
        self.table().values().map(HashMap::len).sum()
    }
}
