//! The orchestration state machine.
//!
//! `Orchestrator` sequences the pipeline: planning batches for the current
//! layer, dispatching one batch at a time to the executor, running the
//! verification gate, and advancing through layers. Every transition is
//! validated against the phase table and checkpointed. Execution-time
//! failures halt the loop and are retried with backoff; fatal errors move
//! it to `Failed`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::{ContextBudget, ContextManager, ContextOverBudgetWarning};
use crate::core::{DependencyGraph, Feature, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::planning::{Batch, BatchId, BatchOptimizer, TaskDecomposer};
use crate::prompt::{PromptBuilder, PromptPayload};
use crate::spec::{SpecDocument, SpecParser};
use crate::{pwlog, pwlog_error, pwlog_trace, pwlog_warn};

use super::executor::{Executor, ExecutorResult, DEFAULT_EXECUTOR_TIMEOUT_SECS};
use super::gate::{GateVerdict, VerificationGate, DEFAULT_GATE_TIMEOUT_SECS};
use super::retry::RetryPolicy;
use super::state::{ExecutionState, HaltInfo, OrchestratorPhase};

/// Events emitted as the loop makes progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    PhaseChanged {
        from: OrchestratorPhase,
        to: OrchestratorPhase,
    },
    BatchDispatched {
        batch_id: BatchId,
        tasks: Vec<TaskId>,
        attempt: u32,
    },
    BatchVerified {
        batch_id: BatchId,
    },
    BatchHalted {
        batch_id: BatchId,
        reason: String,
        retry_count: u32,
        exhausted: bool,
    },
    ContextOverBudget(ContextOverBudgetWarning),
    LayerAdvanced {
        layer: usize,
    },
}

/// Snapshot of progress returned by `step` and `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub phase: OrchestratorPhase,
    pub current_layer: usize,
    pub layers: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub halt: Option<HaltInfo>,
}

/// Loop tuning taken from config.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Where to checkpoint; `None` disables checkpointing.
    pub checkpoint_path: Option<PathBuf>,
    pub context: ContextBudget,
    pub retry: RetryPolicy,
    pub executor_timeout: Duration,
    pub gate_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            checkpoint_path: None,
            context: ContextBudget::default(),
            retry: RetryPolicy::default(),
            executor_timeout: Duration::from_secs(DEFAULT_EXECUTOR_TIMEOUT_SECS),
            gate_timeout: Duration::from_secs(DEFAULT_GATE_TIMEOUT_SECS),
        }
    }
}

/// Features, tasks and graph derived from a spec document.
#[derive(Debug)]
pub struct Plan {
    pub features: Vec<Feature>,
    pub tasks: Vec<Task>,
    pub graph: DependencyGraph,
}

impl Plan {
    /// Decompose a parsed spec and build the dependency graph.
    ///
    /// # Errors
    /// `UnknownDependency`, `UnknownTask` or `CyclicDependency`.
    pub fn from_document(doc: SpecDocument, decomposer: &TaskDecomposer) -> Result<Self> {
        let tasks = decomposer.decompose_all(&doc.features)?;
        let graph = DependencyGraph::build(&tasks)?;
        Ok(Self {
            features: doc.features,
            tasks,
            graph,
        })
    }

    /// Batches every layer would be packed into if nothing failed.
    pub fn preview_batches(&self) -> Result<Vec<Vec<Batch>>> {
        let optimizer = BatchOptimizer::new();
        self.graph
            .layers()
            .iter()
            .enumerate()
            .map(|(index, layer)| optimizer.optimize(index, layer, &self.tasks))
            .collect()
    }
}

/// Output of a dispatch, held until the gate has ruled on it.
struct Dispatched {
    prompt: PromptPayload,
    result: ExecutorResult,
}

pub struct Orchestrator {
    state: ExecutionState,
    graph: DependencyGraph,
    executor: Arc<dyn Executor>,
    gate: Arc<dyn VerificationGate>,
    optimizer: BatchOptimizer,
    context: ContextManager,
    prompts: PromptBuilder,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
    dispatched: Option<Dispatched>,
}

impl Orchestrator {
    /// Wrap an existing state; the graph is rebuilt from its tasks.
    pub fn new(
        state: ExecutionState,
        executor: Arc<dyn Executor>,
        gate: Arc<dyn VerificationGate>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let graph = DependencyGraph::build(&state.tasks)?;
        Ok(Self {
            state,
            graph,
            executor,
            gate,
            optimizer: BatchOptimizer::new(),
            context: ContextManager::new(settings.context),
            prompts: PromptBuilder::new(),
            settings,
            cancel: CancellationToken::new(),
            events: None,
            dispatched: None,
        })
    }

    /// Parse, decompose and graph a spec file into a fresh run.
    ///
    /// A fatal planning error is recorded as a `Failed` checkpoint before
    /// being returned.
    pub async fn from_spec(
        spec_path: &Path,
        decomposer: &TaskDecomposer,
        executor: Arc<dyn Executor>,
        gate: Arc<dyn VerificationGate>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        pwlog!("Orchestrator::from_spec path={}", spec_path.display());
        let planned = match tokio::fs::read_to_string(spec_path).await {
            Ok(text) => SpecParser::new()
                .parse(&text)
                .and_then(|doc| Plan::from_document(doc, decomposer)),
            Err(e) => Err(Error::Io(e)),
        };

        let plan = match planned {
            Ok(plan) => plan,
            Err(e) => {
                pwlog_error!("Planning failed: {}", e);
                let mut state = ExecutionState::new(
                    Some(spec_path.to_path_buf()),
                    Vec::new(),
                    Vec::new(),
                    &DependencyGraph::build(&[])?,
                );
                state.phase = OrchestratorPhase::Failed;
                state.failure = Some(e.to_string());
                if let Some(path) = &settings.checkpoint_path {
                    if let Err(save_err) = state.save(path).await {
                        pwlog_error!(
                            "Failed to write checkpoint after planning error: {}",
                            save_err
                        );
                    }
                }
                return Err(e);
            }
        };

        let state = ExecutionState::new(
            Some(spec_path.to_path_buf()),
            plan.features,
            plan.tasks,
            &plan.graph,
        );
        let orchestrator = Self::new(state, executor, gate, settings)?;
        orchestrator.checkpoint().await?;
        Ok(orchestrator)
    }

    /// Load a checkpoint; mid-batch progress is rewound.
    pub async fn resume(
        executor: Arc<dyn Executor>,
        gate: Arc<dyn VerificationGate>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let path = settings
            .checkpoint_path
            .clone()
            .ok_or_else(|| Error::Validation("no checkpoint path configured".to_string()))?;
        let state = ExecutionState::load(&path).await?;
        pwlog!(
            "Orchestrator::resume path={} phase={} layer={}",
            path.display(),
            state.phase,
            state.current_layer
        );
        Self::new(state, executor, gate, settings)
    }

    pub fn with_events(mut self, tx: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Token that cancels the in-flight dispatch when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn phase(&self) -> OrchestratorPhase {
        self.state.phase
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            phase: self.state.phase,
            current_layer: self.state.current_layer,
            layers: self.state.graph_layers.len(),
            completed: self.state.count_status(TaskStatus::Completed),
            failed: self.state.count_status(TaskStatus::Failed),
            total: self.state.tasks.len(),
            halt: self.state.halt.clone(),
        }
    }

    /// Whether `run` would stop here: terminal, or halted with no retries left.
    pub fn is_stopped(&self) -> bool {
        self.state.phase.is_terminal()
            || (self.state.phase == OrchestratorPhase::Halted
                && self.state.halt.as_ref().map_or(true, |h| h.exhausted))
    }

    /// Drive the loop until it finishes or needs manual intervention.
    pub async fn run(&mut self) -> Result<RunSummary> {
        while !self.is_stopped() {
            self.step().await?;
        }
        let summary = self.summary();
        pwlog!(
            "Orchestrator stopped: phase={} completed={}/{} failed={}",
            summary.phase,
            summary.completed,
            summary.total,
            summary.failed
        );
        Ok(summary)
    }

    /// Execute exactly one phase.
    pub async fn step(&mut self) -> Result<RunSummary> {
        let outcome = match self.state.phase {
            OrchestratorPhase::Init => self.initialize().await,
            OrchestratorPhase::Planning => self.plan_next().await,
            OrchestratorPhase::Dispatching => self.dispatch().await,
            OrchestratorPhase::AwaitingVerification => self.verify().await,
            OrchestratorPhase::Advancing => self.advance().await,
            OrchestratorPhase::Halted => self.resume_halted().await,
            OrchestratorPhase::Done | OrchestratorPhase::Failed => Ok(()),
        };
        match outcome {
            Ok(()) => Ok(self.summary()),
            Err(e) if e.is_fatal() => {
                self.fail(&e).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Reset an exhausted halt: retry counters cleared and the batch re-queued.
    pub async fn retry_halted(&mut self) -> Result<()> {
        let halt = self.take_halt()?;
        for id in &halt.batch.tasks {
            self.state.retry_counts.remove(id);
            let task = self.state.task_mut(id)?;
            task.mark_ready();
            task.completed_at = None;
        }
        pwlog!("Manual retry of batch {}", halt.batch.id);
        self.state.active_batch = None;
        self.state.batch_queue.insert(0, halt.batch);
        self.transition(OrchestratorPhase::Planning).await
    }

    /// Accept a halted batch as done without the gate.
    pub async fn force_advance(&mut self, summary: &str) -> Result<()> {
        let halt = self.take_halt()?;
        for id in &halt.batch.tasks {
            self.state.task_mut(id)?.complete(summary);
        }
        pwlog_warn!("Force-advanced past batch {}: {}", halt.batch.id, summary);
        self.state.active_batch = None;
        self.transition(OrchestratorPhase::Advancing).await
    }

    fn take_halt(&mut self) -> Result<HaltInfo> {
        if self.state.phase != OrchestratorPhase::Halted {
            return Err(Error::NotHalted(self.state.phase.to_string()));
        }
        self.dispatched = None;
        self.state
            .halt
            .take()
            .ok_or_else(|| Error::NotHalted(self.state.phase.to_string()))
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.refresh_readiness();
        pwlog!(
            "Plan: {} features, {} tasks, {} layers",
            self.state.features.len(),
            self.state.tasks.len(),
            self.state.graph_layers.len()
        );
        self.transition(OrchestratorPhase::Planning).await
    }

    async fn plan_next(&mut self) -> Result<()> {
        if self.state.batch_queue.is_empty() {
            let Some(layer) = self.state.graph_layers.get(self.state.current_layer) else {
                return self.transition(OrchestratorPhase::Done).await;
            };

            let mut open: Vec<TaskId> = Vec::new();
            let mut failed: Vec<TaskId> = Vec::new();
            for id in layer {
                let task = self
                    .state
                    .task(id)
                    .ok_or_else(|| Error::UnknownTask(id.clone()))?;
                match task.status {
                    TaskStatus::Completed | TaskStatus::Skipped => {}
                    TaskStatus::Failed => failed.push(id.clone()),
                    _ => open.push(id.clone()),
                }
            }
            if open.is_empty() {
                if !failed.is_empty() {
                    return Err(Error::Validation(format!(
                        "layer {} has failed tasks with no halted batch: {}",
                        self.state.current_layer,
                        failed
                            .iter()
                            .map(|id| id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
                return self.transition(OrchestratorPhase::Advancing).await;
            }

            self.state.batch_queue =
                self.optimizer
                    .optimize(self.state.current_layer, &open, &self.state.tasks)?;
            pwlog!(
                "Layer {}: {} open tasks in {} batches",
                self.state.current_layer,
                open.len(),
                self.state.batch_queue.len()
            );
        }

        let batch = self.state.batch_queue.remove(0);
        self.state.active_batch = Some(batch);
        self.transition(OrchestratorPhase::Dispatching).await
    }

    async fn dispatch(&mut self) -> Result<()> {
        let batch = self.active_batch()?;
        let attempt = self.attempts(&batch) + 1;
        for id in &batch.tasks {
            self.state.task_mut(id)?.start();
        }

        let (context, warning) = self.context.build(&batch, &self.state, &self.graph)?;
        if let Some(warning) = warning {
            self.emit(OrchestratorEvent::ContextOverBudget(warning)).await;
        }
        let members: Vec<&Task> = batch
            .tasks
            .iter()
            .map(|id| self.state.task(id).ok_or_else(|| Error::UnknownTask(id.clone())))
            .collect::<Result<_>>()?;
        let prompt = self.prompts.build(&batch, &members, &context)?;

        pwlog!(
            "Dispatching batch {} ({} tasks, {}, attempt {})",
            batch.id,
            batch.len(),
            batch.domain,
            attempt
        );
        pwlog_trace!("Prompt for {}:\n{}", batch.id, prompt.text);
        self.emit(OrchestratorEvent::BatchDispatched {
            batch_id: batch.id.clone(),
            tasks: batch.tasks.clone(),
            attempt,
        })
        .await;
        self.checkpoint().await?;

        let timeout = self.settings.executor_timeout;
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.executor.execute(&prompt)) => {
                result.unwrap_or(Err(Error::Timeout(timeout)))
            }
        };

        match outcome {
            Ok(result) if result.is_success() => {
                pwlog_trace!("Executor output for {}:\n{}", batch.id, result.output);
                self.dispatched = Some(Dispatched { prompt, result });
                self.transition(OrchestratorPhase::AwaitingVerification).await
            }
            Ok(result) => self.halt(&batch, result.summary).await,
            Err(Error::Cancelled) => self.cancel_batch(&batch).await,
            Err(e) => self.halt(&batch, e.to_string()).await,
        }
    }

    async fn verify(&mut self) -> Result<()> {
        let batch = self.active_batch()?;
        let Some(dispatched) = self.dispatched.take() else {
            return self
                .halt(&batch, "no executor result to verify".to_string())
                .await;
        };

        let timeout = self.settings.gate_timeout;
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            verdict = tokio::time::timeout(
                timeout,
                self.gate.verify(&dispatched.prompt.batch_id, &dispatched.result),
            ) => verdict.unwrap_or(Err(Error::Timeout(timeout))),
        };

        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(Error::Cancelled) => return self.cancel_batch(&batch).await,
            Err(e) => GateVerdict::fail(format!("gate error: {}", e)),
        };

        match verdict {
            GateVerdict::Pass => {
                for id in &batch.tasks {
                    self.state.task_mut(id)?.complete(&dispatched.result.summary);
                }
                pwlog!(
                    "Batch {} verified ({} artifacts)",
                    batch.id,
                    dispatched.result.artifacts.len()
                );
                self.state.active_batch = None;
                self.emit(OrchestratorEvent::BatchVerified {
                    batch_id: batch.id.clone(),
                })
                .await;
                self.transition(OrchestratorPhase::Advancing).await
            }
            GateVerdict::Fail { reason } => self.halt(&batch, reason).await,
        }
    }

    async fn advance(&mut self) -> Result<()> {
        self.state.refresh_readiness();
        if !self.state.batch_queue.is_empty() {
            return self.transition(OrchestratorPhase::Planning).await;
        }

        let layer_resolved = self
            .state
            .graph_layers
            .get(self.state.current_layer)
            .map_or(true, |layer| {
                layer
                    .iter()
                    .all(|id| self.state.task(id).is_some_and(|t| t.is_resolved()))
            });
        if layer_resolved {
            self.state.current_layer += 1;
            pwlog!("Advanced to layer {}", self.state.current_layer);
            self.emit(OrchestratorEvent::LayerAdvanced {
                layer: self.state.current_layer,
            })
            .await;
        }

        if self.state.current_layer >= self.state.graph_layers.len() {
            self.transition(OrchestratorPhase::Done).await
        } else {
            self.transition(OrchestratorPhase::Planning).await
        }
    }

    /// Wait out the backoff, then re-dispatch the halted batch.
    async fn resume_halted(&mut self) -> Result<()> {
        let Some(halt) = self.state.halt.clone() else {
            return Err(Error::Validation("halted without halt info".to_string()));
        };
        if halt.exhausted {
            return Ok(());
        }

        let delay = self.settings.retry.delay_for(halt.retry_count);
        pwlog!(
            "Retrying batch {} in {:?} (attempt {})",
            halt.batch.id,
            delay,
            halt.retry_count + 1
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {
                return self.cancel_batch(&halt.batch).await;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        self.state.halt = None;
        self.state.active_batch = Some(halt.batch);
        self.transition(OrchestratorPhase::Dispatching).await
    }

    /// Record an execution-time failure and halt on the batch.
    async fn halt(&mut self, batch: &Batch, reason: String) -> Result<()> {
        for id in &batch.tasks {
            *self.state.retry_counts.entry(id.clone()).or_insert(0) += 1;
        }
        let retry_count = self.attempts(batch);
        let exhausted = !self.settings.retry.should_retry(retry_count);
        for id in &batch.tasks {
            let task = self.state.task_mut(id)?;
            if exhausted {
                task.fail();
            } else {
                task.status = TaskStatus::Ready;
            }
        }
        pwlog_warn!(
            "Batch {} halted (attempt {}/{}{}): {}",
            batch.id,
            retry_count,
            self.settings.retry.max_attempts,
            if exhausted { ", exhausted" } else { "" },
            reason
        );
        self.record_halt(batch, reason, retry_count, exhausted).await
    }

    /// A cancelled batch fails outright; no automatic retry follows.
    async fn cancel_batch(&mut self, batch: &Batch) -> Result<()> {
        for id in &batch.tasks {
            self.state.task_mut(id)?.fail();
        }
        let retry_count = self.attempts(batch);
        pwlog_warn!("Batch {} cancelled", batch.id);
        self.record_halt(batch, Error::Cancelled.to_string(), retry_count, true)
            .await
    }

    async fn record_halt(
        &mut self,
        batch: &Batch,
        reason: String,
        retry_count: u32,
        exhausted: bool,
    ) -> Result<()> {
        self.dispatched = None;
        self.state.halt = Some(HaltInfo {
            batch: batch.clone(),
            reason: reason.clone(),
            retry_count,
            exhausted,
        });
        self.emit(OrchestratorEvent::BatchHalted {
            batch_id: batch.id.clone(),
            reason,
            retry_count,
            exhausted,
        })
        .await;
        if self.state.phase == OrchestratorPhase::Halted {
            // Cancelled during backoff; already halted.
            self.state.touch();
            return self.checkpoint().await;
        }
        self.transition(OrchestratorPhase::Halted).await
    }

    fn active_batch(&self) -> Result<Batch> {
        self.state
            .active_batch
            .clone()
            .ok_or_else(|| Error::Validation(format!("no active batch in {}", self.state.phase)))
    }

    /// Attempts made so far for a batch (highest count among its tasks).
    fn attempts(&self, batch: &Batch) -> u32 {
        batch
            .tasks
            .iter()
            .map(|id| self.state.retry_count(id))
            .max()
            .unwrap_or(0)
    }

    async fn transition(&mut self, to: OrchestratorPhase) -> Result<()> {
        let from = self.state.phase;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidPhaseTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.state.phase = to;
        self.state.touch();
        pwlog!("Phase {} -> {}", from, to);
        self.emit(OrchestratorEvent::PhaseChanged { from, to }).await;
        self.checkpoint().await
    }

    /// Record a fatal error. Reachable from any phase.
    async fn fail(&mut self, error: &Error) {
        pwlog_error!("Orchestration failed in {}: {}", self.state.phase, error);
        let from = self.state.phase;
        self.state.phase = OrchestratorPhase::Failed;
        self.state.failure = Some(error.to_string());
        self.state.touch();
        self.emit(OrchestratorEvent::PhaseChanged {
            from,
            to: OrchestratorPhase::Failed,
        })
        .await;
        if let Err(e) = self.checkpoint().await {
            pwlog_error!("Failed to write checkpoint after fatal error: {}", e);
        }
    }

    async fn checkpoint(&self) -> Result<()> {
        match &self.settings.checkpoint_path {
            Some(path) => self.state.save(path).await,
            None => Ok(()),
        }
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}
