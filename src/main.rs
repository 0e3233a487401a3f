use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crewrun::config::Config;
use crewrun::orchestration::{
    EchoWorker, ExecutionEngine, PlanDocument, RunCoordinator, SectionSynthesizer, StaticPlanner,
};
use crewrun::{
    Error, GateAction, GateId, GatingMode, Result, RunEvent, RunId, RunReport, RunSnapshot,
};

/// crewrun - run a team of worker agents over a task plan with human gates
#[derive(Parser, Debug)]
#[command(name = "crewrun")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CREWRUN_DEBUG=1 Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (stderr)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a plan file and print its execution layers
    Validate {
        /// Plan file (TOML: agents, tasks, plan)
        plan: PathBuf,
    },

    /// Execute a plan file with the built-in echo worker
    Run {
        /// Plan file (TOML: agents, tasks, plan)
        plan: PathBuf,

        /// The user request handed to every task
        #[arg(long, short = 'p')]
        prompt: String,

        /// Gating mode: STRICT, BALANCED or AUTO (defaults to the config file)
        #[arg(long, short = 'm')]
        mode: Option<GatingMode>,

        /// Approve every gate without asking
        #[arg(long, short = 'y')]
        yes: bool,

        /// Write a resumable snapshot here whenever the run waits at a gate
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Continue a run from a snapshot without re-running completed tasks
    Resume {
        /// Snapshot written by `run --snapshot`
        snapshot: PathBuf,

        /// Approve every gate without asking
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    crewrun::log::init_with_debug(cli.debug || config.debug);

    match cli.command {
        Command::Validate { plan } => run_validate(&plan),
        Command::Run {
            plan,
            prompt,
            mode,
            yes,
            snapshot,
        } => {
            let mode = mode.unwrap_or(config.default_mode);
            run_plan(&config, &plan, prompt, mode, yes, snapshot)
        }
        Command::Resume { snapshot, yes } => run_resume(&config, &snapshot, yes),
    }
}

fn run_validate(path: &Path) -> Result<()> {
    let doc = PlanDocument::load_from(path)?;
    let plan = doc.resolve()?;
    let graph = plan.graph()?;

    println!("Plan: {} task(s)", graph.len());
    for (i, layer) in graph.layers().iter().enumerate() {
        let keys: Vec<&str> = layer.iter().map(|k| k.as_str()).collect();
        println!("Layer {}: {}", i + 1, keys.join(", "));
    }
    Ok(())
}

fn run_plan(
    config: &Config,
    path: &Path,
    prompt: String,
    mode: GatingMode,
    yes: bool,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let doc = PlanDocument::load_from(path)?;
    info!(plan = %path.display(), %mode, "starting run");

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let coordinator = Arc::new(coordinator(
            config,
            StaticPlanner::new(doc.plan.clone()),
            doc.catalog.clone(),
        ));
        let run_id = coordinator.create_run(prompt, mode);
        follow(&coordinator, run_id, yes, snapshot.as_deref()).await
    })?;

    finish(&report)
}

fn run_resume(config: &Config, path: &Path, yes: bool) -> Result<()> {
    let snapshot = RunSnapshot::load_from(path)?;
    if snapshot.plan.is_none() {
        return Err(Error::Planning(format!(
            "snapshot {} was taken before planning finished",
            path.display()
        )));
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let coordinator = Arc::new(coordinator(
            config,
            StaticPlanner::default(),
            Default::default(),
        ));
        let run_id = coordinator.resume(snapshot);
        follow(&coordinator, run_id, yes, Some(path)).await
    })?;

    finish(&report)
}

fn coordinator(
    config: &Config,
    planner: StaticPlanner,
    catalog: crewrun::orchestration::Catalog,
) -> RunCoordinator {
    let engine = ExecutionEngine::new(
        Arc::new(EchoWorker),
        Arc::new(SectionSynthesizer),
        config.engine_config(),
    );
    RunCoordinator::new(engine, Arc::new(planner), catalog)
}

/// Execute a registered run, printing events as JSON lines and answering
/// gates from stdin (or approving them all with `yes`).
async fn follow(
    coordinator: &Arc<RunCoordinator>,
    run_id: RunId,
    yes: bool,
    snapshot: Option<&Path>,
) -> Result<RunReport> {
    let mut events = coordinator.subscribe(run_id)?;
    let handle = coordinator.spawn(run_id)?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stderr = tokio::io::stderr();

    while let Some(envelope) = events.recv().await {
        println!("{}", serde_json::to_string(&envelope)?);

        let RunEvent::GateRequested {
            gate_id,
            question,
            reason,
            ..
        } = &envelope.event
        else {
            continue;
        };

        if let Some(path) = snapshot {
            coordinator.snapshot(run_id)?.save_to(path)?;
            debug!(path = %path.display(), "snapshot written");
        }

        let (action, note) = if yes {
            (GateAction::Approve, String::new())
        } else {
            stderr
                .write_all(gate_prompt(run_id, *gate_id, question, reason).as_bytes())
                .await?;
            stderr.flush().await?;
            match stdin.next_line().await? {
                Some(line) => parse_answer(&line),
                None => (GateAction::Reject, "stdin closed".to_string()),
            }
        };

        // The gate may already be gone if the run was torn down meanwhile.
        if let Err(e) = coordinator.resolve_gate(run_id, *gate_id, action, note) {
            debug!("gate resolution skipped: {}", e);
        }
    }

    handle.await.map_err(|e| Error::TaskJoin(e.to_string()))
}

/// Question shown on stderr for a pending gate.
fn gate_prompt(run_id: RunId, gate_id: GateId, question: &str, reason: &str) -> String {
    format!(
        "[{}/{}] {} ({}) [y/N, optional note]: ",
        run_id.short(),
        gate_id.short(),
        question,
        reason
    )
}

/// `y [note]` approves, anything else rejects; the rest of the line is the note.
fn parse_answer(line: &str) -> (GateAction, String) {
    let line = line.trim();
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let action = match head.parse::<GateAction>() {
        Ok(GateAction::Approve) => GateAction::Approve,
        _ => GateAction::Reject,
    };
    (action, rest.trim().to_string())
}

fn finish(report: &RunReport) -> Result<()> {
    if let Some(output) = &report.final_output {
        eprintln!("\n{}", output);
    }
    println!("{}", serde_json::to_string(report)?);
    if !report.is_finished() {
        std::process::exit(1);
    }
    Ok(())
}
