//! Token-bounded context assembly for a batch.
//!
//! The payload carries completion summaries of the batch's immediate
//! upstream tasks and spec excerpts of the features it belongs to. When the
//! estimate exceeds the budget the payload is compressed in stages; if
//! nothing is left to cut it is returned over budget alongside a warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write;

use crate::core::{DependencyGraph, Feature, FeatureId, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::ExecutionState;
use crate::planning::{Batch, BatchId};
use crate::{pwlog_debug, pwlog_warn};

pub const DEFAULT_TOKEN_BUDGET: usize = 4000;

/// Estimate tokens for a piece of text (one token per four characters).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Budget and compression limits, the `[context]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudget {
    pub budget_tokens: usize,
    /// Per-summary length after the first compression stage.
    pub summary_chars: usize,
    /// Spec excerpts are never cut below this length.
    pub min_excerpt_chars: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            budget_tokens: DEFAULT_TOKEN_BUDGET,
            summary_chars: 200,
            min_excerpt_chars: 80,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPayload {
    /// Completed upstream task -> short completion summary.
    pub included_dependencies: BTreeMap<TaskId, String>,
    pub included_spec_excerpts: Vec<String>,
    /// Upstream tasks reachable only transitively; counted, not expanded.
    pub transitive_dependency_count: usize,
    pub token_estimate: usize,
}

impl ContextPayload {
    fn estimate(&self) -> usize {
        estimate_tokens_of(&self.included_dependencies, &self.included_spec_excerpts)
    }
}

fn estimate_tokens_of(deps: &BTreeMap<TaskId, String>, excerpts: &[String]) -> usize {
    char_total(deps, excerpts).div_ceil(4)
}

fn char_total(deps: &BTreeMap<TaskId, String>, excerpts: &[String]) -> usize {
    let deps: usize = deps
        .iter()
        .map(|(id, summary)| id.as_str().chars().count() + summary.chars().count())
        .sum();
    deps + excerpts.iter().map(|e| e.chars().count()).sum::<usize>()
}

/// Emitted when compression could not bring a payload under budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOverBudgetWarning {
    pub batch_id: BatchId,
    pub token_estimate: usize,
    pub budget: usize,
}

impl std::fmt::Display for ContextOverBudgetWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "context for batch {} is {} tokens, over the {} token budget",
            self.batch_id, self.token_estimate, self.budget
        )
    }
}

/// Upstream summary awaiting inclusion.
struct Candidate {
    id: TaskId,
    summary: String,
    completed_at: Option<DateTime<Utc>>,
}

/// Builds the context payload for each batch.
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    budget: ContextBudget,
}

impl ContextManager {
    pub fn new(budget: ContextBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    /// Assemble the payload for `batch`.
    ///
    /// # Errors
    /// Returns `UnknownTask` if a batch member is missing from the state.
    pub fn build(
        &self,
        batch: &Batch,
        state: &ExecutionState,
        graph: &DependencyGraph,
    ) -> Result<(ContextPayload, Option<ContextOverBudgetWarning>)> {
        let members: HashSet<&TaskId> = batch.tasks.iter().collect();

        let mut immediate: BTreeSet<TaskId> = BTreeSet::new();
        let mut transitive: BTreeSet<TaskId> = BTreeSet::new();
        let mut owners: Vec<&FeatureId> = Vec::new();
        for id in &batch.tasks {
            let task = state.task(id).ok_or_else(|| Error::UnknownTask(id.clone()))?;
            if !owners.contains(&&task.feature_id) {
                owners.push(&task.feature_id);
            }
            immediate.extend(
                task.dependencies
                    .iter()
                    .filter(|dep| !members.contains(dep))
                    .cloned(),
            );
            transitive.extend(graph.transitive_dependencies(id));
        }
        let transitive_dependency_count = transitive
            .iter()
            .filter(|dep| !immediate.contains(*dep) && !members.contains(dep))
            .count();

        let mut candidates: Vec<Candidate> = immediate
            .iter()
            .filter_map(|dep| state.task(dep))
            .filter(|task| task.is_resolved())
            .map(|task| Candidate {
                id: task.id.clone(),
                summary: match (&task.summary, task.status) {
                    (Some(summary), _) => summary.clone(),
                    (None, TaskStatus::Skipped) => "skipped".to_string(),
                    (None, _) => "completed".to_string(),
                },
                completed_at: task.completed_at,
            })
            .collect();

        let excerpts: Vec<String> = owners
            .iter()
            .filter_map(|id| state.feature(id))
            .map(spec_excerpt)
            .collect();

        let mut payload = ContextPayload {
            included_dependencies: collect_summaries(&candidates),
            included_spec_excerpts: excerpts,
            transitive_dependency_count,
            token_estimate: 0,
        };
        payload.token_estimate = payload.estimate();

        let budget = self.budget.budget_tokens;
        if payload.token_estimate > budget {
            pwlog_debug!(
                "ContextManager: batch={} estimate={} budget={}, compressing",
                batch.id,
                payload.token_estimate,
                budget
            );
            self.compress(&mut payload, &mut candidates);
        }

        let warning = (payload.token_estimate > budget).then(|| ContextOverBudgetWarning {
            batch_id: batch.id.clone(),
            token_estimate: payload.token_estimate,
            budget,
        });
        if let Some(warning) = &warning {
            pwlog_warn!("ContextManager: {}", warning);
        }
        Ok((payload, warning))
    }

    fn compress(&self, payload: &mut ContextPayload, candidates: &mut Vec<Candidate>) {
        let budget = self.budget.budget_tokens;

        for candidate in candidates.iter_mut() {
            candidate.summary = truncate_chars(&candidate.summary, self.budget.summary_chars);
        }
        payload.included_dependencies = collect_summaries(candidates);
        payload.token_estimate = payload.estimate();
        if payload.token_estimate <= budget {
            return;
        }

        // Oldest-completed first; a missing timestamp counts as oldest.
        candidates.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut dropped = 0;
        while payload.token_estimate > budget && dropped < candidates.len() {
            payload.included_dependencies.remove(&candidates[dropped].id);
            dropped += 1;
            payload.token_estimate = payload.estimate();
        }
        if dropped > 0 {
            pwlog_debug!("ContextManager: dropped {} dependency summaries", dropped);
        }
        if payload.token_estimate <= budget || payload.included_spec_excerpts.is_empty() {
            return;
        }

        let budget_chars = budget.saturating_mul(4);
        let dep_chars = char_total(&payload.included_dependencies, &[]);
        let share = budget_chars.saturating_sub(dep_chars) / payload.included_spec_excerpts.len();
        let limit = share.max(self.budget.min_excerpt_chars);
        for excerpt in payload.included_spec_excerpts.iter_mut() {
            *excerpt = truncate_chars(excerpt, limit);
        }
        payload.token_estimate = payload.estimate();
    }
}

fn collect_summaries(candidates: &[Candidate]) -> BTreeMap<TaskId, String> {
    candidates
        .iter()
        .map(|c| (c.id.clone(), c.summary.clone()))
        .collect()
}

fn spec_excerpt(feature: &Feature) -> String {
    let mut out = format!("Feature: {} ({})\n", feature.name, feature.id);
    if let Some(priority) = feature.priority {
        let _ = writeln!(out, "Priority: {}", priority);
    }
    if !feature.description.is_empty() {
        let _ = writeln!(out, "Description: {}", feature.description);
    }
    if !feature.requirements.is_empty() {
        out.push_str("Requirements:\n");
        for req in &feature.requirements {
            let _ = writeln!(out, "- {}", req);
        }
    }
    if !feature.acceptance_criteria.is_empty() {
        out.push_str("Acceptance Criteria:\n");
        for criterion in &feature.acceptance_criteria {
            let _ = writeln!(out, "- {}", criterion);
        }
    }
    out.trim_end().to_string()
}

/// Cut `text` to at most `limit` characters, marking the cut with `...`.
fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    if limit <= 3 {
        return text.chars().take(limit).collect();
    }
    let mut out: String = text.chars().take(limit - 3).collect();
    out.push_str("...");
    out
}
