//! Task graph for dependency management.
//!
//! This module provides the TaskGraph structure that represents task
//! dependencies as a directed acyclic graph. Edges point from a dependency
//! to the task that waits on it.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};

/// A dependency edge dropped by [`TaskGraph::select`] because its source
/// stage does not run in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedDependency {
    /// Task that kept running.
    pub task: String,
    /// Dependency that was not selected.
    pub dependency: String,
}

/// The task dependency graph.
///
/// Nodes are tasks in insertion order; an edge `a -> b` means `b` depends
/// on `a`. The graph rejects duplicate names, unknown dependency ids and
/// edges that would close a cycle, so a constructed graph is always acyclic.
#[derive(Clone)]
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Index mapping from task name to TaskId.
    name_index: HashMap<String, TaskId>,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            name_index: HashMap::new(),
        }
    }

    /// Build a graph from tasks whose `dependencies` reference each other.
    ///
    /// # Errors
    /// Returns a structural error for duplicate names, dependencies on ids
    /// outside `tasks`, or cyclic dependencies.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new();
        let edges: Vec<(TaskId, Vec<TaskId>)> = tasks
            .iter()
            .map(|t| (t.id, t.dependencies.iter().copied().collect()))
            .collect();

        for mut task in tasks {
            // Dependencies are re-added as edges below
            task.dependencies.clear();
            graph.add_task(task)?;
        }

        for (task_id, deps) in edges {
            for dep in deps {
                if !graph.contains_task(&dep) {
                    let task = graph
                        .get_task(&task_id)
                        .map(|t| t.name.clone())
                        .unwrap_or_else(|| task_id.to_string());
                    return Err(Error::UnknownDependency {
                        task,
                        dependency: dep.to_string(),
                    });
                }
                graph.add_dependency(&dep, &task_id)?;
            }
        }

        Ok(graph)
    }

    /// Add a task to the graph.
    ///
    /// Re-adding a task with the same id returns the existing index.
    ///
    /// # Errors
    /// Returns `DuplicateTask` when a different task already uses the name.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if let Some(&index) = self.task_index.get(&task.id) {
            return Ok(index);
        }
        if self.name_index.contains_key(&task.name) {
            return Err(Error::DuplicateTask(task.name));
        }

        let id = task.id;
        let name = task.name.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        self.name_index.insert(name, id);
        Ok(index)
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// # Errors
    /// Returns an error if either task is missing or the edge would create
    /// a cycle. A rejected edge leaves the graph unchanged.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::TaskNotFound(from.to_string()))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::TaskNotFound(to.to_string()))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            let names = [from_index, to_index]
                .iter()
                .filter_map(|i| self.graph.node_weight(*i))
                .map(|t| t.name.clone())
                .collect();
            return Err(Error::CyclicDependency { tasks: names });
        }

        if let Some(task) = self.graph.node_weight_mut(to_index) {
            task.dependencies.insert(*from);
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// Look a task up by name.
    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.name_index.get(name).and_then(|id| self.get_task(id))
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if a dependency exists between two tasks.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    /// Every task reachable downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(index) = bfs.next(&self.graph) {
            if index == start {
                continue;
            }
            if let Some(task) = self.graph.node_weight(index) {
                out.push(task.id);
            }
        }
        out
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_indices()
            .filter_map(|i| self.graph.node_weight(i))
            .collect()
    }

    /// Owned copies of all tasks in insertion order.
    pub fn tasks(&self) -> Vec<Task> {
        self.all_tasks().into_iter().cloned().collect()
    }

    /// Task names in insertion order.
    pub fn stage_names(&self) -> Vec<String> {
        self.all_tasks().iter().map(|t| t.name.clone()).collect()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Subgraph containing only the tasks named in `required`.
    ///
    /// Edges from tasks outside the selection are dropped and reported, so
    /// a selected task never waits on a stage that will not run.
    pub fn select<S: AsRef<str>>(&self, required: &[S]) -> Result<(TaskGraph, Vec<PrunedDependency>)> {
        let wanted: HashSet<&str> = required.iter().map(|s| s.as_ref()).collect();
        let mut pruned = Vec::new();
        let mut selected = Vec::new();

        for task in self.all_tasks() {
            if !wanted.contains(task.name.as_str()) {
                continue;
            }
            let mut task = task.clone();
            let deps: Vec<TaskId> = task.dependencies.iter().copied().collect();
            for dep in deps {
                let Some(dep_task) = self.get_task(&dep) else {
                    continue;
                };
                if !wanted.contains(dep_task.name.as_str()) {
                    task.dependencies.remove(&dep);
                    pruned.push(PrunedDependency {
                        task: task.name.clone(),
                        dependency: dep_task.name.clone(),
                    });
                }
            }
            selected.push(task);
        }

        Ok((TaskGraph::from_tasks(selected)?, pruned))
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
