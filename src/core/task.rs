//! Task data model.
//!
//! Tasks are the atomic, domain-scoped units of work derived from a feature.
//! They are created by the decomposer and only ever transitioned (never
//! deleted) by the orchestrator as execution proceeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::feature::FeatureId;

/// Stable identifier for a task, `<feature-id>-<domain>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Build the canonical id for a feature's task in a domain.
    pub fn for_feature(feature: &FeatureId, domain: Domain) -> Self {
        Self(format!("{}-{}", feature, domain))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work domain of a task. Batches never mix domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Database,
    Backend,
    Frontend,
    Infra,
    Test,
    Docs,
}

impl Domain {
    /// Domains the decomposer emits, in intra-feature chaining order.
    pub const DECOMPOSITION_ORDER: [Domain; 5] = [
        Domain::Database,
        Domain::Backend,
        Domain::Frontend,
        Domain::Test,
        Domain::Docs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Database => "database",
            Domain::Backend => "backend",
            Domain::Frontend => "frontend",
            Domain::Infra => "infra",
            Domain::Test => "test",
            Domain::Docs => "docs",
        }
    }

    /// Where in a typical repository work for this domain lands.
    pub fn file_scope_hint(&self) -> &'static str {
        match self {
            Domain::Database => "migrations, schema definitions and data-access models",
            Domain::Backend => "server-side modules, API handlers and services",
            Domain::Frontend => "UI components, pages and client-side state",
            Domain::Infra => "build, deployment and CI configuration",
            Domain::Test => "test suites and fixtures",
            Domain::Docs => "README, guides and API documentation",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Complexity tier, ordered from least to most complex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
    Critical,
}

impl Complexity {
    /// Bucket a keyword score into a tier.
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=2 => Complexity::Simple,
            3..=5 => Complexity::Medium,
            6..=8 => Complexity::Complex,
            _ => Complexity::Critical,
        }
    }

    /// Estimated duration in minutes for a task of this tier.
    pub fn estimated_minutes(&self) -> u32 {
        match self {
            Complexity::Simple => 60,
            Complexity::Medium => 90,
            Complexity::Complex | Complexity::Critical => 120,
        }
    }

    /// Maximum number of tasks in a batch whose most complex member is this tier.
    pub fn batch_capacity(&self) -> usize {
        match self {
            Complexity::Simple => 3,
            Complexity::Medium => 2,
            Complexity::Complex | Complexity::Critical => 1,
        }
    }

    /// Weight used to order batches by total complexity.
    pub fn weight(&self) -> u32 {
        match self {
            Complexity::Simple => 1,
            Complexity::Medium => 2,
            Complexity::Complex => 3,
            Complexity::Critical => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
            Complexity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies not yet satisfied.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a batch.
    Ready,
    /// Dispatched to the executor as part of a batch.
    InProgress,
    /// Verified by the gate.
    Completed,
    /// Retries exhausted or the dispatch was cancelled.
    Failed,
    /// Deliberately not executed.
    Skipped,
}

impl TaskStatus {
    /// Whether dependents may treat this task as satisfied.
    pub fn is_resolved(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// A single unit of work handed to the executor as part of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Owning feature (back-reference by id).
    pub feature_id: FeatureId,
    pub title: String,
    pub description: String,
    pub domain: Domain,
    pub complexity: Complexity,
    pub estimated_minutes: u32,
    /// Tasks that must complete before this one can start.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Completion summary reported by the executor.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task; the estimate follows the complexity tier.
    pub fn new(
        feature_id: &FeatureId,
        domain: Domain,
        complexity: Complexity,
        title: &str,
        description: &str,
    ) -> Self {
        Self {
            id: TaskId::for_feature(feature_id, domain),
            feature_id: feature_id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            domain,
            complexity,
            estimated_minutes: complexity.estimated_minutes(),
            dependencies: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            summary: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Transition to in-progress and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task verified-complete with the executor's summary.
    pub fn complete(&mut self, summary: &str) {
        self.status = TaskStatus::Completed;
        self.summary = Some(summary.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self) {
        self.status = TaskStatus::Skipped;
    }

    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }
}
