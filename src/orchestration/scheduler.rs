//! Batch scheduler for dependency-aware parallel execution.
//!
//! The Scheduler turns a set of tasks into an ordered list of batches by
//! iterative layering: each batch holds every remaining task whose
//! dependencies were all placed in earlier batches. Tasks inside a batch
//! are independent of each other and may run concurrently.

use crate::core::dag::TaskGraph;
use crate::core::task::{Priority, Task, TaskId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashSet;

/// A task placed in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// The scheduled task.
    pub id: TaskId,
    /// Task name, kept for display and routing.
    pub name: String,
    /// Priority at scheduling time.
    pub priority: Priority,
}

/// A set of mutually independent tasks, ordered by descending priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Position of this batch in the execution order.
    pub index: usize,
    /// Tasks in dispatch order.
    pub tasks: Vec<ScheduledTask>,
}

impl Batch {
    /// Task ids in dispatch order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    /// Task names in dispatch order.
    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// The full execution order produced by [`Scheduler::build_order`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOrder {
    batches: Vec<Batch>,
}

impl ExecutionOrder {
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total number of scheduled tasks.
    pub fn task_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Batch names, one inner list per batch.
    pub fn batch_names(&self) -> Vec<Vec<String>> {
        self.batches.iter().map(Batch::names).collect()
    }

    /// Task names flattened in execution order.
    pub fn flatten_names(&self) -> Vec<String> {
        self.batches.iter().flat_map(Batch::names).collect()
    }

    /// Index of the batch containing `id`.
    pub fn batch_of(&self, id: &TaskId) -> Option<usize> {
        self.batches
            .iter()
            .position(|b| b.tasks.iter().any(|t| &t.id == id))
    }
}

/// Computes execution orders. Stateless; it never retries and never
/// emits a partial order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler;

impl Scheduler {
    /// Layer `tasks` into batches.
    ///
    /// Within a batch, tasks are ordered by descending priority and then by
    /// their position in `tasks`.
    ///
    /// # Errors
    /// - `UnknownDependency` if a task depends on an id not in `tasks`
    /// - `CyclicDependency` if no further batch can be formed while tasks
    ///   remain; the error lists every task left unscheduled
    pub fn build_order(tasks: &[Task]) -> Result<ExecutionOrder> {
        let known: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        for task in tasks {
            if let Some(dep) = task.dependencies.iter().find(|d| !known.contains(d)) {
                return Err(Error::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.to_string(),
                });
            }
        }

        let mut scheduled: HashSet<TaskId> = HashSet::with_capacity(tasks.len());
        let mut remaining: Vec<&Task> = tasks.iter().collect();
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            let (mut ready, blocked): (Vec<&Task>, Vec<&Task>) = remaining
                .into_iter()
                .partition(|t| t.dependencies.iter().all(|d| scheduled.contains(d)));

            if ready.is_empty() {
                return Err(Error::CyclicDependency {
                    tasks: blocked.iter().map(|t| t.name.clone()).collect(),
                });
            }

            // sort_by_key is stable, so equal priorities keep insertion order
            ready.sort_by_key(|t| Reverse(t.priority));
            scheduled.extend(ready.iter().map(|t| t.id));
            batches.push(Batch {
                index: batches.len(),
                tasks: ready
                    .into_iter()
                    .map(|t| ScheduledTask {
                        id: t.id,
                        name: t.name.clone(),
                        priority: t.priority,
                    })
                    .collect(),
            });
            remaining = blocked;
        }

        Ok(ExecutionOrder { batches })
    }

    /// Layer every task of `graph` in insertion order.
    pub fn order_graph(graph: &TaskGraph) -> Result<ExecutionOrder> {
        Self::build_order(&graph.tasks())
    }
}
