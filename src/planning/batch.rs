//! Batch packing for a single dependency layer.
//!
//! A layer is partitioned by domain, each partition is sorted by complexity
//! and greedily packed under the capacity table and the per-batch time
//! ceiling. Batches are then ordered so the riskiest work goes first.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::{Complexity, Domain, Task, TaskId};
use crate::error::{Error, Result};
use crate::pwlog_debug;

/// Upper bound on a batch's total estimated minutes (four hours).
pub const MAX_BATCH_MINUTES: u32 = 240;

/// Identifier of a batch, `L<layer>-B<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(layer: usize, ordinal: usize) -> Self {
        Self(format!("L{}-B{}", layer, ordinal))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single-domain, capacity-bounded group of ready tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub domain: Domain,
    pub tasks: Vec<TaskId>,
    pub total_estimated_minutes: u32,
    /// Most complex member; determines capacity.
    pub max_complexity: Complexity,
    /// Sum of member complexity weights; used for dispatch order.
    pub complexity_weight: u32,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Check a batch against the packing rules.
///
/// # Errors
/// - `EmptyBatch` for a batch with no tasks
/// - `UnknownTask` if a member is not in `tasks`
/// - `InvalidBatch` for mixed domains, duplicate members, exceeded capacity,
///   exceeded time ceiling, or stale aggregate fields
pub fn validate_batch(batch: &Batch, tasks: &HashMap<&TaskId, &Task>) -> Result<()> {
    if batch.is_empty() {
        return Err(Error::EmptyBatch);
    }
    let invalid = |reason: String| Error::InvalidBatch {
        batch: batch.id.to_string(),
        reason,
    };

    let mut seen = HashSet::new();
    let mut minutes = 0;
    let mut max = Complexity::Simple;
    for id in &batch.tasks {
        let task = tasks.get(id).ok_or_else(|| Error::UnknownTask(id.clone()))?;
        if !seen.insert(id) {
            return Err(invalid(format!("task {} appears twice", id)));
        }
        if task.domain != batch.domain {
            return Err(invalid(format!(
                "task {} is {} in a {} batch",
                id, task.domain, batch.domain
            )));
        }
        minutes += task.estimated_minutes;
        max = max.max(task.complexity);
    }

    if batch.len() > max.batch_capacity() {
        return Err(invalid(format!(
            "{} tasks exceed {} capacity of {}",
            batch.len(),
            max,
            max.batch_capacity()
        )));
    }
    if minutes > MAX_BATCH_MINUTES {
        return Err(invalid(format!(
            "{} minutes exceed the {} minute ceiling",
            minutes, MAX_BATCH_MINUTES
        )));
    }
    if minutes != batch.total_estimated_minutes || max != batch.max_complexity {
        return Err(invalid("aggregate fields do not match members".to_string()));
    }
    Ok(())
}

/// Check that a layer's batches cover the layer exactly once.
pub fn validate_layer(layer: &[TaskId], batches: &[Batch]) -> Result<()> {
    let mut seen: HashSet<&TaskId> = HashSet::new();
    for batch in batches {
        for id in &batch.tasks {
            if !seen.insert(id) {
                return Err(Error::InvalidBatch {
                    batch: batch.id.to_string(),
                    reason: format!("task {} already batched in this layer", id),
                });
            }
        }
    }
    let expected: HashSet<&TaskId> = layer.iter().collect();
    if seen != expected {
        let missing: Vec<String> = expected
            .difference(&seen)
            .map(|id| id.to_string())
            .collect();
        return Err(Error::Validation(format!(
            "layer not covered by batches (missing: {})",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Packs one layer of ready tasks into batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptimizer;

impl BatchOptimizer {
    pub fn new() -> Self {
        Self
    }

    /// Pack `layer` into validated batches in dispatch order.
    ///
    /// # Errors
    /// - `EmptyBatch` if the layer is empty (an upstream bug)
    /// - `UnknownTask` if a layer id has no task record
    /// - `InvalidBatch` if a produced batch fails validation
    pub fn optimize(&self, layer_index: usize, layer: &[TaskId], tasks: &[Task]) -> Result<Vec<Batch>> {
        if layer.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let lookup: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

        let mut partitions: BTreeMap<Domain, Vec<&Task>> = BTreeMap::new();
        for id in layer {
            let task = *lookup.get(id).ok_or_else(|| Error::UnknownTask(id.clone()))?;
            partitions.entry(task.domain).or_default().push(task);
        }

        let mut batches: Vec<Batch> = Vec::new();
        for (domain, mut members) in partitions {
            members.sort_by(|a, b| a.complexity.cmp(&b.complexity).then_with(|| a.id.cmp(&b.id)));

            let mut current: Vec<&Task> = Vec::new();
            for task in members {
                // Sorted ascending, so the incoming task is the most complex member.
                let capacity = task.complexity.batch_capacity();
                let minutes: u32 = current.iter().map(|t| t.estimated_minutes).sum();
                if !current.is_empty()
                    && (current.len() + 1 > capacity
                        || minutes + task.estimated_minutes > MAX_BATCH_MINUTES)
                {
                    batches.push(seal(domain, std::mem::take(&mut current)));
                }
                current.push(task);
            }
            if !current.is_empty() {
                batches.push(seal(domain, current));
            }
        }

        batches.sort_by(|a, b| {
            b.max_complexity
                .cmp(&a.max_complexity)
                .then_with(|| b.complexity_weight.cmp(&a.complexity_weight))
                .then_with(|| a.domain.cmp(&b.domain))
                .then_with(|| a.tasks.first().cmp(&b.tasks.first()))
        });
        for (ordinal, batch) in batches.iter_mut().enumerate() {
            batch.id = BatchId::new(layer_index, ordinal + 1);
        }

        for batch in &batches {
            validate_batch(batch, &lookup)?;
        }
        validate_layer(layer, &batches)?;

        pwlog_debug!(
            "BatchOptimizer: layer={} tasks={} batches={}",
            layer_index,
            layer.len(),
            batches.len()
        );
        Ok(batches)
    }
}

/// Close a batch; its id is assigned once dispatch order is known.
fn seal(domain: Domain, members: Vec<&Task>) -> Batch {
    Batch {
        id: BatchId(String::new()),
        domain,
        total_estimated_minutes: members.iter().map(|t| t.estimated_minutes).sum(),
        max_complexity: members
            .iter()
            .map(|t| t.complexity)
            .max()
            .unwrap_or(Complexity::Simple),
        complexity_weight: members.iter().map(|t| t.complexity.weight()).sum(),
        tasks: members.into_iter().map(|t| t.id.clone()).collect(),
    }
}
