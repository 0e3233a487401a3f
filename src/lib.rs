//! Task-delegation execution engine.
//!
//! A run takes a user request, a plan of interdependent tasks and a gating
//! mode. Ready tasks execute concurrently through a `Worker`, optional human
//! gates suspend the run between tasks, and every step is reported on an
//! ordered per-run event stream.

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod gate;
pub mod log;
pub mod orchestration;

pub use error::{Error, PlanError, Result};
pub use events::{Activity, EventEnvelope, EventSubscription, RunEvent};
pub use gate::{GateAction, GateId, GatingMode};
pub use orchestration::{
    ExecutionEngine, ExecutionPlan, RunCoordinator, RunId, RunReport, RunSnapshot, RunStatus,
};
