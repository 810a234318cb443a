//! Durable execution state and checkpointing.
//!
//! `ExecutionState` is the only mutable state of a run. The orchestrator
//! writes it after every phase transition; writes go to a temp file that is
//! renamed over the checkpoint, so a crash mid-write leaves the previous
//! checkpoint intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{DependencyGraph, Feature, FeatureId, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::planning::Batch;
use crate::util::blocking;
use crate::{pwlog, pwlog_debug};

/// Checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Phase of the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorPhase {
    #[default]
    Init,
    Planning,
    Dispatching,
    AwaitingVerification,
    Advancing,
    Halted,
    Done,
    Failed,
}

impl OrchestratorPhase {
    /// Whether the loop has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestratorPhase::Done | OrchestratorPhase::Failed)
    }

    /// Whether `self -> to` is an allowed transition.
    pub fn can_transition_to(&self, to: OrchestratorPhase) -> bool {
        use OrchestratorPhase::*;
        matches!(
            (self, to),
            (Init, Planning)
                | (Init, Failed)
                | (Planning, Dispatching)
                | (Planning, Advancing)
                | (Planning, Done)
                | (Planning, Failed)
                | (Dispatching, AwaitingVerification)
                | (Dispatching, Halted)
                | (AwaitingVerification, Advancing)
                | (AwaitingVerification, Halted)
                | (Halted, Dispatching)
                | (Halted, Planning)
                | (Halted, Advancing)
                | (Advancing, Planning)
                | (Advancing, Done)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorPhase::Init => "init",
            OrchestratorPhase::Planning => "planning",
            OrchestratorPhase::Dispatching => "dispatching",
            OrchestratorPhase::AwaitingVerification => "awaiting_verification",
            OrchestratorPhase::Advancing => "advancing",
            OrchestratorPhase::Halted => "halted",
            OrchestratorPhase::Done => "done",
            OrchestratorPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrchestratorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why the loop is halted on a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltInfo {
    pub batch: Batch,
    pub reason: String,
    /// Attempts made so far for this batch.
    pub retry_count: u32,
    /// No automatic retries remain; manual intervention is required.
    pub exhausted: bool,
}

/// Serializable state of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub version: u32,
    #[serde(default)]
    pub spec_path: Option<PathBuf>,
    #[serde(default)]
    pub features: Vec<Feature>,
    pub tasks: Vec<Task>,
    pub graph_layers: Vec<Vec<TaskId>>,
    pub current_layer: usize,
    #[serde(default)]
    pub retry_counts: BTreeMap<TaskId, u32>,
    #[serde(default)]
    pub phase: OrchestratorPhase,
    /// Planned batches of the current layer not yet dispatched.
    #[serde(default)]
    pub batch_queue: Vec<Batch>,
    #[serde(default)]
    pub active_batch: Option<Batch>,
    #[serde(default)]
    pub halt: Option<HaltInfo>,
    /// Message of the fatal error that moved the run to `Failed`.
    #[serde(default)]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(
        spec_path: Option<PathBuf>,
        features: Vec<Feature>,
        tasks: Vec<Task>,
        graph: &DependencyGraph,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            spec_path,
            features,
            tasks,
            graph_layers: graph.layers().to_vec(),
            current_layer: 0,
            retry_counts: BTreeMap::new(),
            phase: OrchestratorPhase::Init,
            batch_queue: Vec::new(),
            active_batch: None,
            halt: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))
    }

    pub fn feature(&self, id: &FeatureId) -> Option<&Feature> {
        self.features.iter().find(|f| &f.id == id)
    }

    /// Ids of completed and skipped tasks.
    pub fn resolved_ids(&self) -> HashSet<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.is_resolved())
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn retry_count(&self, id: &TaskId) -> u32 {
        self.retry_counts.get(id).copied().unwrap_or(0)
    }

    /// Mark pending tasks whose dependencies are all resolved as ready.
    pub fn refresh_readiness(&mut self) {
        let resolved = self.resolved_ids();
        for task in &mut self.tasks {
            if task.status == TaskStatus::Pending
                && task.dependencies.iter().all(|dep| resolved.contains(dep))
            {
                task.mark_ready();
            }
        }
    }

    /// Undo any mid-batch progress so a resumed run re-dispatches cleanly.
    ///
    /// Returns true if anything was rewound.
    pub fn rewind_interrupted(&mut self) -> bool {
        let mut rewound = false;
        if matches!(
            self.phase,
            OrchestratorPhase::Dispatching | OrchestratorPhase::AwaitingVerification
        ) {
            self.phase = OrchestratorPhase::Planning;
            if let Some(batch) = self.active_batch.take() {
                self.batch_queue.insert(0, batch);
            }
            rewound = true;
        }
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Ready;
                task.started_at = None;
                rewound = true;
            }
        }
        rewound
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Write the checkpoint atomically (temp file + rename).
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                pwlog_debug!("Creating checkpoint directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        let contents = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, path)?;
        pwlog_debug!(
            "ExecutionState saved: {} phase={} layer={}",
            path.display(),
            self.phase,
            self.current_layer
        );
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let state = self.clone();
        let path = path.to_path_buf();
        blocking(move || state.save_sync(&path)).await
    }

    /// Read a checkpoint and rewind any interrupted batch.
    pub fn load_sync(path: &Path) -> Result<Self> {
        pwlog_debug!("ExecutionState::load_sync path={}", path.display());
        let contents = fs::read_to_string(path)?;
        let mut state: ExecutionState = serde_json::from_str(&contents)?;
        if state.version > CHECKPOINT_VERSION {
            return Err(Error::Validation(format!(
                "checkpoint version {} is newer than supported version {}",
                state.version, CHECKPOINT_VERSION
            )));
        }
        if state.rewind_interrupted() {
            pwlog!(
                "Checkpoint {} was mid-batch; rewound to {}",
                path.display(),
                state.phase
            );
        }
        Ok(state)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        blocking(move || Self::load_sync(&path)).await
    }
}
