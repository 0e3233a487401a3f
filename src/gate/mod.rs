//! Human-in-the-loop approval checkpoints.

pub mod policy;
pub mod registry;

pub use policy::{
    gate_question, should_gate, should_gate_tool_call, tool_gate_question, GateSource,
    GatingMode, InvalidGatingMode,
};
pub use registry::{
    Gate, GateAction, GateId, GateRegistry, GateRequest, GateResponse, GateWaitHandle,
};
