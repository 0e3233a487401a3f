//! Gate policy for human-in-the-loop approval.
//!
//! Pure decision functions: no state, no I/O, identical answers for
//! identical inputs. The engine consults them after each task (and workers
//! consult the tool variant before risky tool calls).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Run-wide policy controlling how often gates are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatingMode {
    /// Approval after every task except the final one.
    Strict,
    /// Approval on the final deliverable or when the leader asks for it.
    #[default]
    Balanced,
    /// Like `Balanced`, for runs where recommendations are expected to be rare.
    Auto,
}

impl GatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatingMode::Strict => "STRICT",
            GatingMode::Balanced => "BALANCED",
            GatingMode::Auto => "AUTO",
        }
    }
}

impl std::fmt::Display for GatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("mode must be 'STRICT', 'BALANCED', or 'AUTO' (got {0:?})")]
pub struct InvalidGatingMode(pub String);

impl std::str::FromStr for GatingMode {
    type Err = InvalidGatingMode;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRICT" => Ok(GatingMode::Strict),
            "BALANCED" => Ok(GatingMode::Balanced),
            "AUTO" => Ok(GatingMode::Auto),
            _ => Err(InvalidGatingMode(s.to_string())),
        }
    }
}

/// What triggered a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateSource {
    #[default]
    TaskComplete,
    ToolCall,
}

/// Decide whether to pause for approval after a task completes.
///
/// `is_last_task` refers to the last task in plan order. Returns the
/// decision and a reason, which is empty when no gate is needed.
pub fn should_gate(
    mode: GatingMode,
    is_last_task: bool,
    leader_recommended: bool,
) -> (bool, &'static str) {
    match mode {
        // The run is already done after the final task, so STRICT skips it.
        GatingMode::Strict if is_last_task => (false, ""),
        GatingMode::Strict => (true, "STRICT mode requires approval after every task"),
        GatingMode::Balanced | GatingMode::Auto if is_last_task => {
            (true, "Final deliverable ready for review")
        }
        GatingMode::Balanced if leader_recommended => (true, "Leader requested approval"),
        GatingMode::Auto if leader_recommended => {
            (true, "Leader requested approval for critical decision")
        }
        GatingMode::Balanced | GatingMode::Auto => (false, ""),
    }
}

/// Decide whether to pause before a worker executes a tool.
///
/// File writes and terminal commands are gated in every mode.
pub fn should_gate_tool_call(
    _mode: GatingMode,
    tool_name: &str,
    _leader_recommended: bool,
) -> (bool, &'static str) {
    match tool_name {
        "file_writer" => (true, "File operation requires approval (create/modify/delete)"),
        "terminal" => (true, "Terminal command requires approval"),
        _ => (false, ""),
    }
}

/// Question shown to the human. The final-deliverable framing wins over
/// the "continue?" framing.
pub fn gate_question(agent_name: &str, is_last_task: bool) -> String {
    if is_last_task {
        "Final deliverable ready. Approve?".to_string()
    } else {
        format!("{} finished their task. Continue?", agent_name)
    }
}

/// Question shown before a gated tool call.
pub fn tool_gate_question(agent_name: &str, tool_name: &str) -> String {
    format!("{} wants to use {}. Allow?", agent_name, tool_name)
}
