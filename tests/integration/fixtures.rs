//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Stage units that succeed, fail a set number of times, hang or panic
//! - A recorder of the order stage units were invoked in
//! - Predefined task graphs

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use conductor::core::{Priority, Task, TaskGraph};
use conductor::orchestration::{FnStage, RunContextView, StageOutput};
use conductor::Error;

/// Names of the stage units invoked, in call order.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }
}

/// Stage that succeeds with its task name and the stages it saw upstream.
pub fn ok_stage(name: &str) -> FnStage {
    FnStage::new(name, |ctx: &RunContextView| {
        let upstream: Vec<&String> = ctx.outputs().keys().collect();
        Ok(StageOutput::new(json!({
            "task": ctx.task_name,
            "stage": ctx.stage,
            "upstream": upstream,
        })))
    })
}

/// Like [`ok_stage`], recording each call.
pub fn logged_stage(name: &str, log: &CallLog) -> FnStage {
    let log = log.clone();
    let stage = name.to_string();
    FnStage::new(name, move |ctx: &RunContextView| {
        log.push(&stage);
        Ok(StageOutput::new(json!({ "task": ctx.task_name })))
    })
}

/// Stage that fails its first `failures` calls with `message`, then
/// succeeds. Returns the stage and its call counter.
pub fn flaky_stage(name: &str, failures: u32, message: &str) -> (FnStage, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let message = message.to_string();
    let stage = FnStage::new(name, move |ctx: &RunContextView| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= failures {
            Err(Error::Stage(message.clone()))
        } else {
            Ok(StageOutput::new(json!({
                "task": ctx.task_name,
                "call": call,
                "retry": ctx.retry_info().cloned(),
            })))
        }
    });
    (stage, calls)
}

/// Stage that always fails with `message`.
pub fn failing_stage(name: &str, message: &str) -> (FnStage, Arc<AtomicU32>) {
    flaky_stage(name, u32::MAX, message)
}

/// Stage that reports a fixed quality score.
pub fn scored_stage(name: &str, score: f64) -> FnStage {
    FnStage::new(name, move |ctx: &RunContextView| {
        Ok(StageOutput::new(json!({ "task": ctx.task_name })).with_quality_score(score))
    })
}

/// Stage that sleeps for `delay` before succeeding.
pub fn slow_stage(name: &str, delay: Duration) -> FnStage {
    FnStage::from_async(name, move |ctx: RunContextView| async move {
        tokio::time::sleep(delay).await;
        Ok(StageOutput::new(json!({ "task": ctx.task_name })))
    })
}

/// Stage that panics on every call.
pub fn panicking_stage(name: &str) -> FnStage {
    FnStage::new(name, |_ctx: &RunContextView| -> conductor::Result<StageOutput> {
        panic!("stage exploded")
    })
}

/// Create a test task with the given name.
pub fn test_task(name: &str) -> Task {
    Task::new(name, &format!("Test task: {}", name))
}

/// Diamond: A -> {B, C} -> D with priorities A=high, B=low, C=high, D=high.
pub fn diamond_graph() -> TaskGraph {
    let a = test_task("A").with_priority(Priority::High);
    let b = test_task("B").with_priority(Priority::Low).depends_on(a.id);
    let c = test_task("C").with_priority(Priority::High).depends_on(a.id);
    let d = test_task("D")
        .with_priority(Priority::High)
        .depends_on(b.id)
        .depends_on(c.id);
    TaskGraph::from_tasks(vec![a, b, c, d]).unwrap()
}

/// Linear pipeline over `names`, each stage depending on the previous one.
pub fn pipeline_graph(names: &[&str]) -> TaskGraph {
    let mut tasks: Vec<Task> = Vec::new();
    for name in names {
        let mut task = test_task(name);
        if let Some(prev) = tasks.last() {
            task = task.depends_on(prev.id);
        }
        tasks.push(task);
    }
    TaskGraph::from_tasks(tasks).unwrap()
}

/// Independent tasks with no dependencies.
pub fn independent_graph(names: &[&str]) -> TaskGraph {
    TaskGraph::from_tasks(names.iter().map(|n| test_task(n)).collect()).unwrap()
}
