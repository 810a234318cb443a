use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use planwright::config::Config;
use planwright::orchestration::{
    CommandExecutor, ExecutionState, Executor, Orchestrator, OrchestratorEvent, Plan, RunSummary,
};
use planwright::planning::TaskDecomposer;
use planwright::spec::SpecParser;
use planwright::{pwlog, pwlog_warn, Result};

/// Planwright - turn a spec document into verified, dependency-ordered batches of agent work
#[derive(Parser, Debug)]
#[command(name = "planwright")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    PLANWRIGHT_DEBUG=1     Enable debug logging (alternative to --debug)\n    PLANWRIGHT_LOG=trace   Log level (error, warn, info, debug, trace); trace records full prompts"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.planwright/planwright.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.planwright/planwright.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Checkpoint file (overrides the config)
    #[arg(long, global = true)]
    pub checkpoint: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Plan a spec and execute it batch by batch
    Run {
        /// Path to the spec document
        spec: PathBuf,

        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Continue from the last checkpoint
    Resume {
        #[arg(long)]
        json: bool,
    },

    /// Show the current layer, batch and task counts
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Accept a halted batch without its gate and move on
    Advance {
        /// Summary recorded on the batch's tasks
        #[arg(long, default_value = "force-advanced by operator")]
        summary: String,
    },

    /// Reset a halted batch's retries and continue
    Retry {
        #[arg(long)]
        json: bool,
    },

    /// Show features, tasks, layers and batches without executing anything
    Plan {
        /// Path to the spec document
        spec: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    planwright::log::init_with_debug(cli.debug);
    pwlog!("planwright starting: {:?}", cli.command);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let mut settings = config.orchestrator_settings();
    if let Some(path) = &cli.checkpoint {
        settings.checkpoint_path = Some(path.clone());
    }

    match cli.command {
        Command::Plan { spec } => run_plan(&spec, &config),
        Command::Status { json } => run_status(&settings.checkpoint_path, json),
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_async(command, config, settings))
        }
    }
}

async fn run_async(
    command: Command,
    config: Config,
    settings: planwright::orchestration::OrchestratorSettings,
) -> Result<()> {
    let gate = config.gate.build(config.executor.workdir.clone())?;

    let (mut orchestrator, json) = match command {
        Command::Run { spec, json } => {
            let decomposer = TaskDecomposer::new(config.keywords.clone());
            let orchestrator =
                Orchestrator::from_spec(&spec, &decomposer, executor(&config)?, gate, settings)
                    .await?;
            (orchestrator, json)
        }
        Command::Resume { json } => (
            Orchestrator::resume(executor(&config)?, gate, settings).await?,
            json,
        ),
        Command::Retry { json } => {
            let mut orchestrator = Orchestrator::resume(executor(&config)?, gate, settings).await?;
            orchestrator.retry_halted().await?;
            (orchestrator, json)
        }
        Command::Advance { summary } => {
            // Nothing is dispatched, so the agent binary need not be installed.
            let idle: Arc<dyn Executor> = Arc::new(CommandExecutor::with_binary(
                PathBuf::from(&config.executor.command),
                config.executor.args.clone(),
            ));
            let mut orchestrator = Orchestrator::resume(idle, gate, settings).await?;
            orchestrator.force_advance(&summary).await?;
            println!("Advanced past halted batch. Continue with: planwright resume");
            print_summary(&orchestrator.summary());
            return Ok(());
        }
        Command::Plan { .. } | Command::Status { .. } => return Ok(()),
    };

    let (tx, rx) = mpsc::channel(64);
    orchestrator = orchestrator.with_events(tx);
    let printer = tokio::spawn(print_events(rx, !json));

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pwlog_warn!("Interrupt received, cancelling in-flight batch");
            token.cancel();
        }
    });

    let result = orchestrator.run().await;
    drop(orchestrator);
    let _ = printer.await;

    let summary = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn executor(config: &Config) -> Result<Arc<dyn Executor>> {
    Ok(Arc::new(CommandExecutor::new(&config.executor)?))
}

async fn print_events(mut rx: mpsc::Receiver<OrchestratorEvent>, verbose: bool) {
    while let Some(event) = rx.recv().await {
        if !verbose {
            continue;
        }
        match event {
            OrchestratorEvent::BatchDispatched {
                batch_id,
                tasks,
                attempt,
            } => {
                let ids: Vec<&str> = tasks.iter().map(|t| t.as_str()).collect();
                println!("→ {} (attempt {}): {}", batch_id, attempt, ids.join(", "));
            }
            OrchestratorEvent::BatchVerified { batch_id } => println!("✓ {}", batch_id),
            OrchestratorEvent::BatchHalted {
                batch_id,
                reason,
                retry_count,
                exhausted,
            } => println!(
                "✗ {} halted after {} attempt(s){}: {}",
                batch_id,
                retry_count,
                if exhausted { ", retries exhausted" } else { "" },
                reason
            ),
            OrchestratorEvent::ContextOverBudget(warning) => println!("! {}", warning),
            OrchestratorEvent::LayerAdvanced { layer } => println!("── layer {}", layer),
            OrchestratorEvent::PhaseChanged { .. } => {}
        }
    }
}

fn run_plan(spec: &Path, config: &Config) -> Result<()> {
    let doc = SpecParser::new().parse_file(spec)?;
    let project = doc.project.clone().unwrap_or_else(|| "(unnamed)".to_string());
    let plan = Plan::from_document(doc, &TaskDecomposer::new(config.keywords.clone()))?;
    let batches = plan.preview_batches()?;

    println!("Project: {}", project);
    println!("Features: {}", plan.features.len());
    for feature in &plan.features {
        let deps: Vec<&str> = feature.dependencies.iter().map(|d| d.as_str()).collect();
        println!(
            "  {} ({}){}",
            feature.name,
            feature.id,
            if deps.is_empty() {
                String::new()
            } else {
                format!(" <- {}", deps.join(", "))
            }
        );
    }
    println!();
    println!("Tasks: {}", plan.tasks.len());
    for task in &plan.tasks {
        println!(
            "  {:<32} {:<9} {:<8} {:>3} min",
            task.id.as_str(),
            task.domain.as_str(),
            task.complexity.as_str(),
            task.estimated_minutes
        );
    }
    println!();
    for (index, layer) in batches.iter().enumerate() {
        println!("Layer {}:", index);
        for batch in layer {
            let ids: Vec<&str> = batch.tasks.iter().map(|t| t.as_str()).collect();
            println!(
                "  {} [{}, {}, {} min] {}",
                batch.id,
                batch.domain,
                batch.max_complexity,
                batch.total_estimated_minutes,
                ids.join(", ")
            );
        }
    }
    Ok(())
}

fn run_status(checkpoint: &Option<PathBuf>, json: bool) -> Result<()> {
    let Some(path) = checkpoint else {
        println!("No checkpoint configured.");
        return Ok(());
    };
    if !path.exists() {
        println!("No checkpoint at {}", path.display());
        return Ok(());
    }
    let state = ExecutionState::load_sync(path)?;

    if json {
        let value = serde_json::json!({
            "phase": state.phase.as_str(),
            "current_layer": state.current_layer,
            "layers": state.graph_layers.len(),
            "active_batch": state.active_batch.as_ref().map(|b| b.id.to_string()),
            "queued_batches": state.batch_queue.iter().map(|b| b.id.to_string()).collect::<Vec<_>>(),
            "halt": state.halt.as_ref().map(|h| serde_json::json!({
                "batch": h.batch.id.to_string(),
                "reason": h.reason,
                "retry_count": h.retry_count,
                "exhausted": h.exhausted,
            })),
            "failure": state.failure,
            "tasks": state.tasks.iter().map(|t| (t.id.to_string(), t.status.to_string())).collect::<std::collections::BTreeMap<_, _>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Checkpoint:  {}", path.display());
    if let Some(spec) = &state.spec_path {
        println!("Spec:        {}", spec.display());
    }
    println!("Phase:       {}", state.phase);
    println!(
        "Layer:       {} of {}",
        state.current_layer.min(state.graph_layers.len()),
        state.graph_layers.len()
    );
    if let Some(batch) = &state.active_batch {
        println!("Batch:       {} ({} tasks)", batch.id, batch.len());
    }
    if !state.batch_queue.is_empty() {
        let queued: Vec<String> = state.batch_queue.iter().map(|b| b.id.to_string()).collect();
        println!("Queued:      {}", queued.join(", "));
    }
    println!("Updated:     {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    for task in &state.tasks {
        let retries = state.retry_count(&task.id);
        println!(
            "  {:<32} {:<12}{}",
            task.id.as_str(),
            task.status.to_string(),
            if retries > 0 {
                format!(" retries={}", retries)
            } else {
                String::new()
            }
        );
    }
    if let Some(halt) = &state.halt {
        println!();
        println!(
            "Halted on {} after {} attempt(s): {}",
            halt.batch.id, halt.retry_count, halt.reason
        );
        if halt.exhausted {
            println!("Next steps:");
            println!("  1. Retry the batch:   planwright retry");
            println!("  2. Accept it as done: planwright advance");
        }
    }
    if let Some(failure) = &state.failure {
        println!();
        println!("Failed: {}", failure);
    }
    Ok(())
}

fn summary_json(summary: &RunSummary) -> serde_json::Value {
    serde_json::json!({
        "phase": summary.phase.as_str(),
        "current_layer": summary.current_layer,
        "layers": summary.layers,
        "completed": summary.completed,
        "failed": summary.failed,
        "total": summary.total,
        "halt": summary.halt.as_ref().map(|h| serde_json::json!({
            "batch": h.batch.id.to_string(),
            "reason": h.reason,
            "retry_count": h.retry_count,
            "exhausted": h.exhausted,
        })),
    })
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Phase:      {}", summary.phase);
    println!(
        "  Layer:      {} of {}",
        summary.current_layer.min(summary.layers),
        summary.layers
    );
    println!(
        "  Tasks:      {} completed, {} failed, {} total",
        summary.completed, summary.failed, summary.total
    );
    if let Some(halt) = &summary.halt {
        println!("  Halted on:  {} ({})", halt.batch.id, halt.reason);
        if halt.exhausted {
            println!();
            println!("Next steps:");
            println!("  1. Inspect:          planwright status");
            println!("  2. Retry the batch:  planwright retry");
            println!("  3. Accept as done:   planwright advance");
        }
    }
    println!();
}
