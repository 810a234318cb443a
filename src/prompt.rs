//! Instruction payload rendering.
//!
//! The rendered prompt has four sections (tasks, context, acceptance
//! criteria, stop condition) and ends with a machine-checkable marker the
//! executor must print once the batch is done.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::context::{estimate_tokens, ContextPayload};
use crate::core::Task;
use crate::error::{Error, Result};
use crate::planning::{Batch, BatchId};

const STOP_PREFIX: &str = "BATCH_COMPLETE:";
const ARTIFACT_PREFIX: &str = "ARTIFACT:";
const SUMMARY_PREFIX: &str = "SUMMARY:";

/// Rendered prompt for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub batch_id: BatchId,
    pub text: String,
    /// Exact line the executor prints when the batch is done.
    pub stop_marker: String,
    pub token_estimate: usize,
}

impl PromptPayload {
    /// Whether executor output contains the stop marker on a line of its own.
    pub fn is_complete(&self, output: &str) -> bool {
        output.lines().any(|line| line.trim() == self.stop_marker)
    }

    /// Paths reported with `ARTIFACT: <path>` lines.
    pub fn artifacts(&self, output: &str) -> Vec<String> {
        tagged_lines(output, ARTIFACT_PREFIX).collect()
    }

    /// Text of the last `SUMMARY: <text>` line, if any.
    pub fn summary(&self, output: &str) -> Option<String> {
        tagged_lines(output, SUMMARY_PREFIX).last()
    }
}

fn tagged_lines<'a>(output: &'a str, prefix: &'a str) -> impl Iterator<Item = String> + 'a {
    output
        .lines()
        .filter_map(move |line| line.trim().strip_prefix(prefix))
        .map(|rest| rest.trim().to_string())
        .filter(|rest| !rest.is_empty())
}

/// Stateless renderer from batch + context to a prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn stop_marker(batch_id: &BatchId) -> String {
        format!("{} {}", STOP_PREFIX, batch_id)
    }

    /// Render the prompt. `tasks` are the batch members in batch order.
    ///
    /// # Errors
    /// Returns `EmptyBatch` if the batch has no tasks.
    pub fn build(&self, batch: &Batch, tasks: &[&Task], context: &ContextPayload) -> Result<PromptPayload> {
        if batch.is_empty() || tasks.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let stop_marker = Self::stop_marker(&batch.id);
        let mut text = String::new();

        let _ = writeln!(
            text,
            "# Batch {} ({} domain, {} task{}, ~{} min)\n",
            batch.id,
            batch.domain,
            tasks.len(),
            if tasks.len() == 1 { "" } else { "s" },
            batch.total_estimated_minutes
        );

        text.push_str("## Tasks\n\n");
        for (n, task) in tasks.iter().enumerate() {
            let _ = writeln!(text, "{}. [{}] {} ({})", n + 1, task.id, task.title, task.complexity);
            if !task.description.is_empty() {
                let _ = writeln!(text, "   {}", task.description);
            }
            let _ = writeln!(text, "   Files: {}", task.domain.file_scope_hint());
        }
        text.push_str("\nOnly touch files in the scope listed for each task.\n");

        text.push_str("\n## Context\n\n");
        if context.included_dependencies.is_empty() {
            text.push_str("No completed upstream work.\n");
        } else {
            text.push_str("Completed upstream work:\n");
            for (id, summary) in &context.included_dependencies {
                let _ = writeln!(text, "- {}: {}", id, summary);
            }
        }
        if context.transitive_dependency_count > 0 {
            let _ = writeln!(
                text,
                "({} further upstream tasks are already complete.)",
                context.transitive_dependency_count
            );
        }
        for excerpt in &context.included_spec_excerpts {
            let _ = writeln!(text, "\n{}", excerpt);
        }

        text.push_str("\n## Acceptance Criteria\n\n");
        for task in tasks {
            for criterion in &task.acceptance_criteria {
                let _ = writeln!(text, "- [{}] {}", task.id, criterion);
            }
        }

        text.push_str("\n## Stop Condition\n\n");
        let _ = writeln!(
            text,
            "Work only on the tasks above. For every file you change print a line \
             `{} <path>`, then a single `{} <one-line summary>` line.",
            ARTIFACT_PREFIX, SUMMARY_PREFIX
        );
        let _ = writeln!(
            text,
            "When every task is done and its criteria hold, print exactly:\n\n{}",
            stop_marker
        );

        let token_estimate = estimate_tokens(&text);
        Ok(PromptPayload {
            batch_id: batch.id.clone(),
            text,
            stop_marker,
            token_estimate,
        })
    }
}
