//! Gate behavior during full runs.

use std::sync::Arc;
use std::time::Duration;

use crewrun::events::RunEvent;
use crewrun::gate::{GateResponse, GateSource, GatingMode};
use crewrun::orchestration::{EngineConfig, RunContext, RunStatus};

use crate::fixtures::{
    agent_of, chain_plan, count, engine, fan_in_plan, gate_reasons, output_of, plan,
    run_approving, run_with, ScriptedWorker,
};

const STRICT_REASON: &str = "STRICT mode requires approval after every task";

fn run(mode: GatingMode) -> Arc<RunContext> {
    Arc::new(RunContext::new("EV market", mode))
}

fn failure_message(status: &RunStatus) -> &str {
    match status {
        RunStatus::Failed { message } => message,
        other => panic!("expected failure, got {:?}", other),
    }
}

/// Test: STRICT pauses after every task except the final one
///
/// Given: a -> b -> c in STRICT mode
/// When: every gate is approved
/// Then: a and b are gated, c is not, and the run finishes
#[tokio::test]
async fn test_strict_gates_every_task_but_the_last() {
    let worker = Arc::new(ScriptedWorker::new());
    let (report, events) = run_approving(
        engine(worker, EngineConfig::default()),
        run(GatingMode::Strict),
        chain_plan(),
    )
    .await;

    assert!(report.is_finished());
    assert_eq!(
        gate_reasons(&events),
        vec![
            (agent_of("a"), STRICT_REASON.to_string()),
            (agent_of("b"), STRICT_REASON.to_string()),
        ]
    );
}

/// Test: BALANCED gates the final deliverable only
///
/// Given: a, b -> c in BALANCED mode with no recommendations
/// When: the run executes
/// Then: exactly one gate appears, for c, framed as the final deliverable
#[tokio::test]
async fn test_balanced_gates_final_deliverable_only() {
    let worker = Arc::new(ScriptedWorker::new());
    let (report, events) = run_approving(
        engine(worker, EngineConfig::default()),
        run(GatingMode::Balanced),
        fan_in_plan(),
    )
    .await;

    assert!(report.is_finished());
    let gates: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            RunEvent::GateRequested {
                agent_name,
                question,
                reason,
                gate_source,
                ..
            } => Some((agent_name.clone(), question.clone(), reason.clone(), *gate_source)),
            _ => None,
        })
        .collect();
    assert_eq!(
        gates,
        vec![(
            agent_of("c"),
            "Final deliverable ready. Approve?".to_string(),
            "Final deliverable ready for review".to_string(),
            GateSource::TaskComplete,
        )]
    );
}

/// Test: A worker recommendation adds a gate in AUTO mode
///
/// Given: a -> b -> c in AUTO mode where a recommends a checkpoint
/// When: the run executes
/// Then: a and c are gated, and the recommendation is announced first
#[tokio::test]
async fn test_recommendation_adds_gate_in_auto_mode() {
    let worker = Arc::new(ScriptedWorker::new().recommending("a", "budget decision"));
    let (report, events) = run_approving(
        engine(worker, EngineConfig::default()),
        run(GatingMode::Auto),
        chain_plan(),
    )
    .await;

    assert!(report.is_finished());
    assert_eq!(
        gate_reasons(&events),
        vec![
            (
                agent_of("a"),
                "Leader requested approval for critical decision".to_string()
            ),
            (agent_of("c"), "Final deliverable ready for review".to_string()),
        ]
    );

    let recommended = events
        .iter()
        .position(|e| e.event.kind() == "GATE_RECOMMENDED")
        .unwrap();
    let requested = events
        .iter()
        .position(|e| e.event.kind() == "GATE_REQUESTED")
        .unwrap();
    assert!(recommended < requested);
}

/// Test: A rejected gate fails the run and nothing else is dispatched
///
/// Given: a -> b -> c in STRICT mode
/// When: the gate after a is rejected
/// Then: the run fails once, b never starts, and RUN_FINISHED is the last event
#[tokio::test]
async fn test_rejection_fails_run_and_stops_dispatch() {
    let worker = Arc::new(ScriptedWorker::new());
    let (report, events) = run_with(
        engine(worker.clone(), EngineConfig::default()),
        run(GatingMode::Strict),
        chain_plan(),
        Vec::new(),
        |_| Some(GateResponse::reject("wrong direction")),
    )
    .await;

    assert_eq!(
        failure_message(&report.status),
        "Run rejected by user at Agent A's gate"
    );
    assert_eq!(worker.called_keys(), vec!["a"]);
    assert!(report.outputs.is_empty());
    assert_eq!(count(&events, "ERROR"), 1);
    assert_eq!(count(&events, "RUN_FINISHED"), 1);
    assert!(events.last().unwrap().event.is_run_finished());
    assert!(!events
        .iter()
        .any(|e| e.event.agent_name() == Some(agent_of("b").as_str())));
}

/// Test: An unanswered gate times out and fails the run
///
/// Given: a -> b -> c in STRICT mode with a 30 second gate timeout
/// When: nobody answers the first gate
/// Then: the run fails with a timeout error and b never starts
#[tokio::test(start_paused = true)]
async fn test_unanswered_gate_times_out() {
    let worker = Arc::new(ScriptedWorker::new());
    let config = EngineConfig {
        gate_timeout: Duration::from_secs(30),
        ..EngineConfig::default()
    };
    let run = run(GatingMode::Strict);
    let (report, events) = run_with(
        engine(worker.clone(), config),
        run.clone(),
        chain_plan(),
        Vec::new(),
        |_| None,
    )
    .await;

    assert_eq!(
        failure_message(&report.status),
        "Gate timed out for Agent A (30s)"
    );
    assert_eq!(worker.called_keys(), vec!["a"]);
    assert_eq!(count(&events, "ERROR"), 1);
    assert!(events.last().unwrap().event.is_run_finished());
    assert_eq!(run.gates.pending_count(), 0);
}

/// Test: Approval feedback travels forward, never backward
///
/// Given: a -> b in STRICT mode
/// When: a's gate is approved with a note
/// Then: b receives a's output with the note appended, while a's own summary event does not carry it
#[tokio::test]
async fn test_feedback_reaches_dependents() {
    let worker = Arc::new(ScriptedWorker::new());
    let plan = plan(&[("a", &[]), ("b", &["a"])]);
    let (report, events) = run_with(
        engine(worker.clone(), EngineConfig::default()),
        run(GatingMode::Strict),
        plan,
        Vec::new(),
        |_| Some(GateResponse::approve("focus on EU")),
    )
    .await;
    assert!(report.is_finished());

    let expected = format!("{}\n\n[Human feedback]: focus on EU", output_of("a"));
    let b = worker.call("b");
    assert_eq!(b.context["a"], expected);
    assert!(b.description.contains("[Human feedback]: focus on EU"));
    assert!(!worker.call("a").description.contains("Human feedback"));
    assert_eq!(report.outputs[0].text, expected);

    let a_summary = events
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::TaskSummary {
                agent_name,
                full_output,
                ..
            } if *agent_name == agent_of("a") => Some(full_output.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(a_summary, output_of("a"));
}

/// Test: Only the first answer to a gate counts
///
/// Given: a -> b in STRICT mode
/// When: a's gate is approved, then answered again with a rejection
/// Then: the second answer is refused and the run finishes normally
#[tokio::test]
async fn test_second_resolution_is_ignored() {
    let worker = Arc::new(ScriptedWorker::new());
    let run = run(GatingMode::Strict);
    let engine = engine(worker.clone(), EngineConfig::default());
    let plan = plan(&[("a", &[]), ("b", &["a"])]);

    let mut events = run.events.subscribe().unwrap();
    let handle = {
        let run = run.clone();
        tokio::spawn(async move { engine.execute(run, plan).await })
    };

    let mut answered = 0;
    while let Some(envelope) = events.recv().await {
        if let RunEvent::GateRequested { gate_id, .. } = envelope.event {
            assert!(run
                .gates
                .resolve(run.id, gate_id, GateResponse::approve("first")));
            assert!(!run
                .gates
                .resolve(run.id, gate_id, GateResponse::reject("second")));
            answered += 1;
        }
    }

    let report = handle.await.unwrap();
    assert_eq!(answered, 1);
    assert!(report.is_finished());
    assert!(report.outputs[0].text.ends_with("[Human feedback]: first"));
}

/// Test: Risky tool calls are gated inside the worker
///
/// Given: a worker that wants to use the file writer during task a
/// When: the tool gate is approved
/// Then: a tool-call gate precedes the final gate and the run finishes
#[tokio::test]
async fn test_tool_call_gate_approved() {
    let worker = Arc::new(ScriptedWorker::new().using_tool("a", "file_writer"));
    let plan = plan(&[("a", &[]), ("b", &["a"])]);
    let (report, events) = run_approving(
        engine(worker, EngineConfig::default()),
        run(GatingMode::Balanced),
        plan,
    )
    .await;

    assert!(report.is_finished());
    let tool_gate = events
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::GateRequested {
                agent_name,
                question,
                context,
                gate_source: GateSource::ToolCall,
                ..
            } => Some((agent_name.clone(), question.clone(), context.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        tool_gate,
        (
            agent_of("a"),
            "Agent A wants to use file_writer. Allow?".to_string(),
            "Tool: file_writer".to_string()
        )
    );
    assert_eq!(count(&events, "GATE_REQUESTED"), 2);
}

/// Test: Rejecting a tool call fails the run
#[tokio::test]
async fn test_tool_call_gate_rejected() {
    let worker = Arc::new(ScriptedWorker::new().using_tool("a", "terminal"));
    let plan = plan(&[("a", &[]), ("b", &["a"])]);
    let (report, events) = run_with(
        engine(worker.clone(), EngineConfig::default()),
        run(GatingMode::Balanced),
        plan,
        Vec::new(),
        |_| Some(GateResponse::reject("")),
    )
    .await;

    assert_eq!(
        failure_message(&report.status),
        "Run rejected by user at Agent A's gate"
    );
    assert_eq!(worker.called_keys(), vec!["a"]);
    assert_eq!(count(&events, "TASK_SUMMARY"), 0);
}

/// Test: Gate context is the one-line summary of the task output
#[tokio::test]
async fn test_gate_context_is_output_summary() {
    let worker = Arc::new(
        ScriptedWorker::new().with_output("a", "# Findings\nEV sales grew 30%. Details below."),
    );
    let (_, events) = run_approving(
        engine(worker, EngineConfig::default()),
        run(GatingMode::Strict),
        chain_plan(),
    )
    .await;

    let context = events
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::GateRequested { context, .. } => Some(context.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(context, "EV sales grew 30%.");
}
