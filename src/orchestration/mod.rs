//! Orchestration layer: plans, runs, the execution engine and the run
//! coordinator, plus the capability traits they drive.

pub mod capabilities;
pub mod coordinator;
pub mod engine;
pub mod plan;
pub mod run;

pub use capabilities::{
    EchoWorker, Planner, SectionSynthesizer, StaticPlanner, Synthesizer, Worker, WorkerOutput,
    WorkerRequest,
};
pub use coordinator::RunCoordinator;
pub use engine::{EngineConfig, ExecutionEngine, TaskScope, DEFAULT_GATE_TIMEOUT};
pub use plan::{
    compose_task_prompt, AgentProfile, Catalog, ExecutionPlan, PlanDocument, PlanEntry,
    PlannedTask, TaskTemplate,
};
pub use run::{RunContext, RunId, RunReport, RunSnapshot, RunStatus};
