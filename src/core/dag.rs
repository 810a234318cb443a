//! Dependency graph over tasks.
//!
//! The graph holds task ids only; task records stay owned by the execution
//! state. Construction rejects unknown dependencies and cycles, so a
//! `DependencyGraph` value is always acyclic. Layers are computed once at
//! construction with Kahn's algorithm.

use crate::core::feature::{Feature, FeatureId};
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::pwlog_debug;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Add inter-feature edges to task dependency sets.
///
/// Every task of a dependent feature depends on every task of each feature it
/// declares a dependency on.
///
/// # Errors
/// Returns `UnknownDependency` if a feature depends on an id with no feature.
pub fn link_feature_dependencies(features: &[Feature], tasks: &mut [Task]) -> Result<()> {
    let mut by_feature: HashMap<&FeatureId, Vec<TaskId>> = HashMap::new();
    for feature in features {
        by_feature.entry(&feature.id).or_default();
    }
    for task in tasks.iter() {
        if let Some(ids) = by_feature.get_mut(&task.feature_id) {
            ids.push(task.id.clone());
        }
    }

    let mut upstream: HashMap<FeatureId, Vec<TaskId>> = HashMap::new();
    for feature in features {
        let mut ids = Vec::new();
        for dep in &feature.dependencies {
            let dep_tasks = by_feature
                .get(dep)
                .ok_or_else(|| Error::UnknownDependency {
                    feature: feature.id.to_string(),
                    reference: dep.to_string(),
                })?;
            ids.extend(dep_tasks.iter().cloned());
        }
        upstream.insert(feature.id.clone(), ids);
    }

    for task in tasks.iter_mut() {
        if let Some(ids) = upstream.get(&task.feature_id) {
            task.dependencies.extend(ids.iter().cloned());
        }
    }
    Ok(())
}

/// Node colour for the cycle-detecting depth-first traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Directed acyclic graph of task dependencies.
///
/// Edges point from a dependency to its dependent, so the outgoing
/// neighbours of a node are the tasks it unblocks.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    layers: Vec<Vec<TaskId>>,
}

impl DependencyGraph {
    /// Build the graph from each task's dependency set.
    ///
    /// # Errors
    /// - `Validation` if two tasks share an id
    /// - `UnknownTask` if a dependency names a task not in `tasks`
    /// - `CyclicDependency` carrying the offending cycle
    pub fn build(tasks: &[Task]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(Error::Validation(format!("Duplicate task id {}", task.id)));
            }
            let index = graph.add_node(task.id.clone());
            task_index.insert(task.id.clone(), index);
        }

        for task in tasks {
            let to = task_index[&task.id];
            for dep in &task.dependencies {
                let from = *task_index
                    .get(dep)
                    .ok_or_else(|| Error::UnknownTask(dep.clone()))?;
                graph.update_edge(from, to, ());
            }
        }

        let mut dag = Self {
            graph,
            task_index,
            layers: Vec::new(),
        };

        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::CyclicDependency { cycle });
        }
        dag.layers = dag.compute_layers();

        pwlog_debug!(
            "DependencyGraph::build tasks={} edges={} layers={}",
            dag.task_count(),
            dag.dependency_count(),
            dag.layers.len()
        );
        Ok(dag)
    }

    /// Sorted outgoing or incoming neighbours, for deterministic traversal.
    fn sorted_neighbors(&self, index: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(index, dir).collect();
        neighbors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        neighbors.dedup();
        neighbors
    }

    /// Three-colour depth-first search. Reaching a gray node closes a cycle;
    /// the returned path starts and ends at that node.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = vec![Mark::White; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::White {
                continue;
            }

            // (node, its sorted dependents, next dependent to visit)
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
                vec![(root, self.sorted_neighbors(root, Direction::Outgoing), 0)];
            marks[root.index()] = Mark::Gray;

            while let Some((node, neighbors, next)) = stack.last_mut() {
                if *next >= neighbors.len() {
                    marks[node.index()] = Mark::Black;
                    stack.pop();
                    continue;
                }
                let child = neighbors[*next];
                *next += 1;

                match marks[child.index()] {
                    Mark::White => {
                        marks[child.index()] = Mark::Gray;
                        let grandchildren = self.sorted_neighbors(child, Direction::Outgoing);
                        stack.push((child, grandchildren, 0));
                    }
                    Mark::Gray => {
                        let start = stack
                            .iter()
                            .position(|(n, _, _)| *n == child)
                            .unwrap_or(0);
                        let mut cycle: Vec<TaskId> = stack[start..]
                            .iter()
                            .map(|(n, _, _)| self.graph[*n].clone())
                            .collect();
                        cycle.push(self.graph[child].clone());
                        return Some(cycle);
                    }
                    Mark::Black => {}
                }
            }
        }
        None
    }

    /// Kahn's algorithm: repeatedly peel off every node with zero remaining
    /// in-degree. Each peel is one layer.
    fn compute_layers(&self) -> Vec<Vec<TaskId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.sorted_neighbors(n, Direction::Incoming).len()))
            .collect();

        let mut frontier: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n] == 0)
            .collect();
        let mut layers = Vec::new();

        while !frontier.is_empty() {
            let mut layer: Vec<TaskId> = frontier.iter().map(|n| self.graph[*n].clone()).collect();
            layer.sort();

            let mut next = Vec::new();
            for node in &frontier {
                for dependent in self.sorted_neighbors(*node, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            layers.push(layer);
            frontier = next;
        }
        layers
    }

    /// Parallel execution layers, in dependency order.
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&[TaskId]> {
        self.layers.get(index).map(|l| l.as_slice())
    }

    /// Index of the layer containing a task.
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(id))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Tasks the given task directly depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Outgoing)
    }

    fn neighbor_ids(&self, id: &TaskId, dir: Direction) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .sorted_neighbors(index, dir)
                .into_iter()
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable through dependency edges, excluding the task itself.
    pub fn transitive_dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependencies_of(id);
        while let Some(dep) = stack.pop() {
            if seen.insert(dep.clone()) {
                stack.extend(self.dependencies_of(&dep));
            }
        }
        seen
    }

    /// Unresolved tasks whose dependencies are all resolved.
    pub fn ready_tasks(&self, resolved: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let id = &self.graph[index];
                if resolved.contains(id) {
                    return None;
                }
                let satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| resolved.contains(&self.graph[dep]));
                satisfied.then(|| id.clone())
            })
            .collect();
        ready.sort();
        ready
    }

    /// Check if every task is in the resolved set.
    pub fn all_resolved(&self, resolved: &HashSet<TaskId>) -> bool {
        self.task_index.keys().all(|id| resolved.contains(id))
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("layers", &self.layers.len())
            .finish()
    }
}
