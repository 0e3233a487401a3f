//! Dependency graph for a delegation plan.
//!
//! `DependencyGraph` validates a task list as a DAG and tracks readiness as
//! tasks complete. Edges point from a dependency to its dependent, so the
//! incoming neighbours of a node are exactly the tasks it waits on.
//!
//! The graph is not internally synchronized: the engine wraps it in a single
//! lock so every `complete` call (the decrement-and-check of in-degrees) is
//! one atomic step and a task can never be dispatched twice.

use crate::core::task::{TaskKey, TaskNode, TaskOutput, TaskStatus};
use crate::error::{Error, PlanError, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// The validated task graph of one run plus its completion state.
pub struct DependencyGraph {
    /// Nodes in plan order; `NodeIndex::index()` is the plan position.
    graph: DiGraph<TaskNode, ()>,
    /// Index mapping from TaskKey to NodeIndex for fast lookups.
    index: HashMap<TaskKey, NodeIndex>,
    /// Recorded outputs, immutable once inserted.
    completed: HashMap<TaskKey, TaskOutput>,
    /// Count of dependencies not yet completed.
    in_degree: HashMap<TaskKey, usize>,
    /// Reverse edges, each list in plan order.
    dependents: HashMap<TaskKey, Vec<TaskKey>>,
    status: HashMap<TaskKey, TaskStatus>,
}

impl DependencyGraph {
    /// Validate a task list and build the graph.
    ///
    /// Fails closed: duplicate keys, self dependencies, unknown dependency
    /// keys and cycles are all rejected before anything can execute. A
    /// reported cycle lists keys in dependency direction with the first key
    /// repeated at the end (`a -> b -> a` means `a` depends on `b`, which
    /// depends on `a`).
    pub fn build(tasks: Vec<TaskNode>) -> std::result::Result<Self, PlanError> {
        if tasks.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for task in &tasks {
            if index.contains_key(&task.key) {
                return Err(PlanError::DuplicateTask(task.key.clone()));
            }
            if task.dependencies.contains(&task.key) {
                return Err(PlanError::SelfDependency(task.key.clone()));
            }
            index.insert(task.key.clone(), graph.add_node(task.clone()));
        }

        let mut in_degree = HashMap::new();
        let mut dependents: HashMap<TaskKey, Vec<TaskKey>> = HashMap::new();
        for task in &tasks {
            let to = index[&task.key];
            for dep in &task.dependencies {
                let from = *index.get(dep).ok_or_else(|| PlanError::UnknownDependency {
                    task: task.key.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(from, to, ());
            }
            in_degree.insert(task.key.clone(), task.dependencies.len());
            dependents.entry(task.key.clone()).or_default();
        }

        // Fill reverse edges in plan order so dispatch order is deterministic.
        for task in &tasks {
            for dep in &task.dependencies {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(task.key.clone());
                }
            }
        }

        let status = tasks
            .iter()
            .map(|t| (t.key.clone(), TaskStatus::Pending))
            .collect();

        let dag = Self {
            graph,
            index,
            completed: HashMap::new(),
            in_degree,
            dependents,
            status,
        };

        if is_cyclic_directed(&dag.graph) {
            let cycle = dag.find_cycle().unwrap_or_default();
            return Err(PlanError::CycleDetected(cycle));
        }

        Ok(dag)
    }

    /// Depth-first walk along dependency edges returning the first cycle found.
    fn find_cycle(&self) -> Option<Vec<TaskKey>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            dag: &DependencyGraph,
            node: NodeIndex,
            marks: &mut [Mark],
            stack: &mut Vec<NodeIndex>,
        ) -> Option<Vec<TaskKey>> {
            marks[node.index()] = Mark::OnStack;
            stack.push(node);
            for dep in dag.dependency_indices(node) {
                match marks[dep.index()] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|n| *n == dep)?;
                        let mut cycle: Vec<TaskKey> = stack[start..]
                            .iter()
                            .map(|n| dag.graph[*n].key.clone())
                            .collect();
                        cycle.push(dag.graph[dep].key.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(dag, dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[node.index()] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack = Vec::new();
        for node in self.graph.node_indices() {
            if marks[node.index()] == Mark::Unvisited {
                if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Direct dependencies of a node, in plan order.
    fn dependency_indices(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        deps.sort_by_key(|n| n.index());
        deps
    }

    // ========== Lookups ==========

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn node(&self, key: &TaskKey) -> Option<&TaskNode> {
        self.index.get(key).map(|&i| &self.graph[i])
    }

    /// All nodes in plan order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Zero-based position of a task in the original plan ordering.
    pub fn position(&self, key: &TaskKey) -> Option<usize> {
        self.index.get(key).map(|i| i.index())
    }

    /// Whether this task is the last one in plan order.
    pub fn is_last(&self, key: &TaskKey) -> bool {
        self.position(key) == Some(self.len().saturating_sub(1))
    }

    pub fn status(&self, key: &TaskKey) -> Option<&TaskStatus> {
        self.status.get(key)
    }

    pub fn output(&self, key: &TaskKey) -> Option<&TaskOutput> {
        self.completed.get(key)
    }

    /// Recorded outputs in plan order.
    pub fn outputs(&self) -> Vec<TaskOutput> {
        self.graph
            .node_weights()
            .filter_map(|n| self.completed.get(&n.key).cloned())
            .collect()
    }

    /// Number of direct dependencies of `key` that have not completed.
    pub fn in_degree(&self, key: &TaskKey) -> Option<usize> {
        self.in_degree.get(key).copied()
    }

    // ========== Scheduling Operations ==========

    /// Tasks with no unresolved dependency that have not been started yet,
    /// in plan order.
    pub fn ready_tasks(&self) -> Vec<TaskKey> {
        self.graph
            .node_weights()
            .filter(|n| self.in_degree.get(&n.key) == Some(&0))
            .filter(|n| {
                matches!(
                    self.status.get(&n.key),
                    Some(TaskStatus::Pending) | Some(TaskStatus::Ready)
                )
            })
            .map(|n| n.key.clone())
            .collect()
    }

    /// Record that a task has been dispatched to a worker.
    pub fn mark_started(&mut self, key: &TaskKey) -> Result<()> {
        self.transition(key, TaskStatus::Running, |s| {
            matches!(s, TaskStatus::Pending | TaskStatus::Ready)
        })
    }

    /// Record that a task's output is waiting on a gate decision.
    pub fn mark_awaiting_gate(&mut self, key: &TaskKey) -> Result<()> {
        self.transition(key, TaskStatus::AwaitingGate, |s| {
            matches!(s, TaskStatus::Running)
        })
    }

    /// Record a task failure. Completed tasks cannot fail afterwards.
    pub fn mark_failed(&mut self, key: &TaskKey, error: &str) -> Result<()> {
        self.transition(
            key,
            TaskStatus::Failed {
                error: error.to_string(),
            },
            |s| !s.is_terminal(),
        )
    }

    fn transition(
        &mut self,
        key: &TaskKey,
        next: TaskStatus,
        allowed: impl Fn(&TaskStatus) -> bool,
    ) -> Result<()> {
        let status = self
            .status
            .get_mut(key)
            .ok_or_else(|| Error::InvalidTaskTransition {
                task_key: key.clone(),
                reason: "task not found in graph".to_string(),
            })?;
        if !allowed(status) {
            return Err(Error::InvalidTaskTransition {
                task_key: key.clone(),
                reason: format!("cannot move from {} to {}", status, next),
            });
        }
        *status = next;
        Ok(())
    }

    /// Record a task's output and return the dependents that became ready.
    ///
    /// A dependent with several dependencies is returned only by the call
    /// that resolves its last one, whatever order the dependencies finish in.
    pub fn complete(&mut self, key: &TaskKey, output: TaskOutput) -> Result<Vec<TaskKey>> {
        self.transition(key, TaskStatus::Completed, |s| !s.is_terminal())?;
        self.completed.insert(key.clone(), output);

        let mut newly_ready = Vec::new();
        let dependents = self.dependents.get(key).cloned().unwrap_or_default();
        for dependent in dependents {
            if let Some(remaining) = self.in_degree.get_mut(&dependent) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    if let Some(status) = self.status.get_mut(&dependent) {
                        if *status == TaskStatus::Pending {
                            *status = TaskStatus::Ready;
                        }
                    }
                    newly_ready.push(dependent);
                }
            }
        }
        Ok(newly_ready)
    }

    /// Pre-record outputs from an earlier execution of the same plan.
    ///
    /// Seeded tasks count as completed and never run again.
    pub fn seed(&mut self, outputs: impl IntoIterator<Item = TaskOutput>) -> Result<()> {
        for output in outputs {
            let key = output.task_key.clone();
            if !self.contains(&key) {
                return Err(Error::InvalidTaskTransition {
                    task_key: key,
                    reason: "seeded output does not belong to this plan".to_string(),
                });
            }
            self.complete(&key, output)?;
        }
        Ok(())
    }

    /// Tasks nothing depends on, in plan order. Their outputs feed synthesis.
    pub fn terminal_tasks(&self) -> Vec<TaskKey> {
        self.graph
            .node_weights()
            .filter(|n| self.dependents.get(&n.key).map_or(true, Vec::is_empty))
            .map(|n| n.key.clone())
            .collect()
    }

    /// Recorded outputs of exactly this task's direct dependencies, in plan
    /// order.
    ///
    /// Transitive ancestors are not included: a task sees only what it
    /// explicitly depends on.
    pub fn context_for(&self, key: &TaskKey) -> Vec<TaskOutput> {
        let Some(&i) = self.index.get(key) else {
            return Vec::new();
        };
        self.dependency_indices(i)
            .into_iter()
            .filter_map(|n| self.completed.get(&self.graph[n].key).cloned())
            .collect()
    }

    /// Check if every task has a recorded output.
    pub fn all_complete(&self) -> bool {
        self.completed.len() == self.graph.node_count()
    }

    /// Count of tasks without a recorded output.
    pub fn pending_count(&self) -> usize {
        self.graph.node_count() - self.completed.len()
    }

    /// Group tasks into dependency levels: level 0 has no dependencies, level
    /// n depends only on tasks in earlier levels. Used for plan previews.
    pub fn layers(&self) -> Vec<Vec<TaskKey>> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.dependency_indices(n).len()))
            .collect();
        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| remaining.get(n) == Some(&0))
            .collect();

        let mut layers = Vec::new();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(count) = remaining.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            next.sort_by_key(|n| n.index());
            next.dedup();
            layers.push(current.iter().map(|n| self.graph[*n].key.clone()).collect());
            current = next;
        }
        layers
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .field("completed", &self.completed.len())
            .finish()
    }
}
