//! Typed run notifications.
//!
//! Serialized as flat JSON objects: a `type` discriminator in
//! SCREAMING_SNAKE_CASE and camelCase fields, e.g.
//! `{"type":"AGENT_INTENT","agentName":"Writer","message":"..."}`.

use crate::gate::{GateId, GateSource};
use crate::orchestration::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Idle,
    ToolCall,
    LlmGenerating,
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activity::Idle => write!(f, "idle"),
            Activity::ToolCall => write!(f, "tool_call"),
            Activity::LlmGenerating => write!(f, "llm_generating"),
        }
    }
}

/// One notification in a run's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        prompt: String,
    },
    /// A task picks up the outputs of the tasks it depends on.
    TaskHandoff {
        receiving_agent: String,
        source_agents: Vec<String>,
        summary: String,
    },
    AgentIntent {
        agent_name: String,
        message: String,
    },
    AgentActivity {
        agent_name: String,
        activity: Activity,
        details: String,
    },
    TaskSummary {
        agent_name: String,
        summary: String,
        full_output: String,
    },
    GateRequested {
        gate_id: GateId,
        run_id: RunId,
        agent_name: String,
        question: String,
        context: String,
        reason: String,
        gate_source: GateSource,
    },
    /// Advisory: the worker asked for a checkpoint after its task.
    GateRecommended {
        agent_name: String,
        reason: String,
    },
    RunFinished {
        run_id: RunId,
    },
    Error {
        message: String,
    },
}

impl RunEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "RUN_STARTED",
            RunEvent::TaskHandoff { .. } => "TASK_HANDOFF",
            RunEvent::AgentIntent { .. } => "AGENT_INTENT",
            RunEvent::AgentActivity { .. } => "AGENT_ACTIVITY",
            RunEvent::TaskSummary { .. } => "TASK_SUMMARY",
            RunEvent::GateRequested { .. } => "GATE_REQUESTED",
            RunEvent::GateRecommended { .. } => "GATE_RECOMMENDED",
            RunEvent::RunFinished { .. } => "RUN_FINISHED",
            RunEvent::Error { .. } => "ERROR",
        }
    }

    /// Agent the event belongs to, for per-task events.
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            RunEvent::TaskHandoff {
                receiving_agent, ..
            } => Some(receiving_agent),
            RunEvent::AgentIntent { agent_name, .. }
            | RunEvent::AgentActivity { agent_name, .. }
            | RunEvent::TaskSummary { agent_name, .. }
            | RunEvent::GateRequested { agent_name, .. }
            | RunEvent::GateRecommended { agent_name, .. } => Some(agent_name),
            RunEvent::RunStarted { .. } | RunEvent::RunFinished { .. } | RunEvent::Error { .. } => {
                None
            }
        }
    }

    pub fn is_run_finished(&self) -> bool {
        matches!(self, RunEvent::RunFinished { .. })
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Per-run sequence number, starting at 0.
    pub seq: u64,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}
