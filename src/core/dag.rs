//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module provides the TaskDAG structure that represents task dependencies
//! as a directed graph. Cycles may be present in the input; they are reported
//! as [`Cycle`] values from the ordering operations rather than rejected on
//! insertion, because the caller needs the offending cycle to repair the graph.
//!
//! All orderings are deterministic. Kahn's algorithm emits tasks in the order
//! they become ready (FIFO); tasks that become ready together are queued in
//! insertion order.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Type of dependency between tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyType {
    /// Declared by the task decomposition.
    DataDependency,
    /// Inserted to serialize writes to shared files.
    FileDependency {
        /// Files both tasks write.
        files: Vec<String>,
    },
}

impl Default for DependencyType {
    fn default() -> Self {
        Self::DataDependency
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::DataDependency => write!(f, "data"),
            DependencyType::FileDependency { files } => {
                write!(f, "files: {}", files.len())
            }
        }
    }
}

/// A dependency cycle, listed in dependency direction without repeating the
/// first task: `[a, b, c]` means a → b → c → a.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cycle(pub Vec<TaskId>);

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.0.iter().map(|id| id.as_str()).collect();
        match ids.first() {
            Some(first) => write!(f, "{} -> {}", ids.join(" -> "), first),
            None => write!(f, "<empty>"),
        }
    }
}

/// Longest duration-weighted path through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    pub path: Vec<TaskId>,
    pub total_duration: f64,
}

/// The task dependency graph.
///
/// Nodes are tasks, and an edge `from -> to` means `to` cannot start before
/// `from` completes.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, DependencyType>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the DAG.
    ///
    /// # Errors
    /// Returns a validation error if a task with the same id already exists.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::Validation(format!("Duplicate task id: {}", task.id)));
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Add a dependency between two tasks.
    ///
    /// The dependency indicates that `from` must complete before `to` can start.
    /// Adding an edge that already exists is a no-op. Cycles are accepted here
    /// and surface from [`TaskDAG::topological_order`].
    ///
    /// # Errors
    /// Returns [`Error::UnknownTask`] if either task is not in the DAG.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if self.graph.find_edge(from_index, to_index).is_none() {
            self.graph.add_edge(from_index, to_index, dep_type);
        }
        Ok(())
    }

    /// Add a serialization edge `from -> to` unless the two tasks are already
    /// ordered relative to each other.
    ///
    /// Returns `true` when the edge was added. An edge is never added when
    /// either task already reaches the other, so this cannot introduce a cycle.
    pub fn add_serialization_edge(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        files: Vec<String>,
    ) -> Result<bool> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if from_index == to_index || self.reaches(from, to) || self.reaches(to, from) {
            return Ok(false);
        }

        self.graph
            .add_edge(from_index, to_index, DependencyType::FileDependency { files });
        Ok(true)
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownTask { id: id.clone() })
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if a direct dependency exists between two tasks.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Check whether `to` is reachable from `from` along dependency edges.
    pub fn reaches(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// Successors of `index` in insertion order.
    fn dependents_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        dependents.sort();
        dependents
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    fn id_at(&self, index: NodeIndex) -> TaskId {
        self.graph[index].id.clone()
    }

    fn in_degrees(&self) -> Vec<usize> {
        self.graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect()
    }

    // ========== Ordering Operations ==========

    fn kahn_indices(&self) -> std::result::Result<Vec<NodeIndex>, Cycle> {
        let mut in_degree = self.in_degrees();
        let mut ready: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(index) = ready.pop_front() {
            order.push(index);
            for next in self.dependents_of(index) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            let emitted: HashSet<NodeIndex> = order.into_iter().collect();
            Err(self.extract_cycle(&emitted))
        }
    }

    /// Get task ids in topological order (Kahn's algorithm).
    ///
    /// Tasks are emitted in the order they become ready. The initial ready
    /// set, and tasks released by the same predecessor, keep insertion order.
    ///
    /// # Errors
    /// Returns the offending [`Cycle`] if the graph is not acyclic.
    pub fn topological_order(&self) -> std::result::Result<Vec<TaskId>, Cycle> {
        Ok(self
            .kahn_indices()?
            .into_iter()
            .map(|i| self.id_at(i))
            .collect())
    }

    /// Group tasks into levels that can execute in parallel.
    ///
    /// Level 0 holds every task without dependencies; level k+1 holds the
    /// tasks whose dependencies all lie in levels 0..=k. Tasks within a level
    /// are listed in insertion order.
    pub fn parallel_levels(&self) -> std::result::Result<Vec<Vec<TaskId>>, Cycle> {
        let mut in_degree = self.in_degrees();
        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .collect();
        let mut levels = Vec::new();
        let mut placed = HashSet::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &index in &current {
                placed.insert(index);
                for succ in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    in_degree[succ.index()] -= 1;
                    if in_degree[succ.index()] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort();
            levels.push(current.iter().map(|&i| self.id_at(i)).collect());
            current = next;
        }

        if placed.len() == self.graph.node_count() {
            Ok(levels)
        } else {
            Err(self.extract_cycle(&placed))
        }
    }

    /// Find one dependency cycle, if any.
    pub fn find_cycle(&self) -> Option<Cycle> {
        self.kahn_indices().err()
    }

    /// Walk unsatisfied dependencies backwards from the first task Kahn's
    /// algorithm could not emit until a task repeats.
    ///
    /// Every such task still has an unemitted predecessor, so the walk always
    /// closes a loop.
    fn extract_cycle(&self, emitted: &HashSet<NodeIndex>) -> Cycle {
        let Some(start) = self.graph.node_indices().find(|i| !emitted.contains(i)) else {
            return Cycle(Vec::new());
        };

        let mut path = vec![start];
        let mut position: HashMap<NodeIndex, usize> = HashMap::from([(start, 0)]);
        let mut current = start;

        loop {
            let pred = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|p| !emitted.contains(p))
                .min();
            let Some(pred) = pred else {
                // Unreachable for a stalled Kahn run; report what was walked.
                break;
            };
            if let Some(&pos) = position.get(&pred) {
                path.drain(..pos);
                break;
            }
            position.insert(pred, path.len());
            path.push(pred);
            current = pred;
        }

        // Walked against edge direction; flip and rotate to the earliest task.
        path.reverse();
        if let Some(min_pos) = (0..path.len()).min_by_key(|&pos| path[pos]) {
            path.rotate_left(min_pos);
        }
        Cycle(path.into_iter().map(|i| self.id_at(i)).collect())
    }

    // ========== Duration Analysis ==========

    /// Earliest finish time of every task, assuming unlimited parallelism.
    ///
    /// `earliest_finish[t] = duration[t] + max(earliest_finish[d] for d in deps(t))`.
    pub fn earliest_finish(&self) -> std::result::Result<BTreeMap<TaskId, f64>, Cycle> {
        let (finish, _) = self.finish_times()?;
        Ok(finish
            .into_iter()
            .map(|(i, f)| (self.id_at(i), f))
            .collect())
    }

    /// Per-node finish time plus the predecessor that determined it.
    ///
    /// Ties between predecessors go to the one with the larger task id.
    fn finish_times(
        &self,
    ) -> std::result::Result<(HashMap<NodeIndex, f64>, HashMap<NodeIndex, NodeIndex>), Cycle> {
        let order = self.kahn_indices()?;
        let mut finish: HashMap<NodeIndex, f64> = HashMap::new();
        let mut via: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        for index in order {
            let mut best: Option<(NodeIndex, f64)> = None;
            for dep in self.graph.neighbors_directed(index, Direction::Incoming) {
                let dep_finish = finish[&dep];
                best = match best {
                    None => Some((dep, dep_finish)),
                    Some((b, bf))
                        if dep_finish > bf
                            || (dep_finish == bf && self.graph[dep].id > self.graph[b].id) =>
                    {
                        Some((dep, dep_finish))
                    }
                    keep => keep,
                };
            }

            let start = best.map(|(_, f)| f).unwrap_or(0.0);
            finish.insert(index, start + self.graph[index].effective_duration());
            if let Some((dep, _)) = best {
                via.insert(index, dep);
            }
        }

        Ok((finish, via))
    }

    /// Compute the critical path.
    ///
    /// The path ends at the task with the largest earliest finish time and is
    /// reconstructed by following, at each step, the dependency that
    /// contributed the maximum. Ties at either step are broken toward the
    /// larger task id so reports are reproducible.
    pub fn critical_path(&self) -> std::result::Result<CriticalPath, Cycle> {
        let (finish, via) = self.finish_times()?;

        let mut end: Option<(NodeIndex, f64)> = None;
        for index in self.graph.node_indices() {
            let f = finish[&index];
            end = match end {
                None => Some((index, f)),
                Some((e, ef)) if f > ef || (f == ef && self.graph[index].id > self.graph[e].id) => {
                    Some((index, f))
                }
                keep => keep,
            };
        }

        let Some((end, total_duration)) = end else {
            return Ok(CriticalPath {
                path: Vec::new(),
                total_duration: 0.0,
            });
        };

        let mut path = vec![self.id_at(end)];
        let mut current = end;
        while let Some(&prev) = via.get(&current) {
            path.push(self.id_at(prev));
            current = prev;
        }
        path.reverse();

        Ok(CriticalPath {
            path,
            total_duration,
        })
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
