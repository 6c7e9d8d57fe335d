//! Stage units and the generic stage adapter.
//!
//! A [`StageUnit`] is one independently invocable unit of work. The engine
//! hands it a [`RunContextView`] (a read-only projection of the run) and
//! gets back a [`StageOutput`] or an error, which the supervisor turns into
//! a failed `TaskResult`.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::workflow::RunId;

/// Read-only view of a run handed to a stage unit.
#[derive(Debug, Clone)]
pub struct RunContextView {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub task_name: String,
    /// Stage unit being invoked.
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Run input text.
    pub input: Arc<str>,
    /// Task parameters, including the `retry` block on retried attempts.
    pub parameters: serde_json::Value,
    upstream: Arc<BTreeMap<String, serde_json::Value>>,
}

impl RunContextView {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        task_id: TaskId,
        task_name: &str,
        stage: &str,
        attempt: u32,
        input: Arc<str>,
        parameters: serde_json::Value,
        upstream: Arc<BTreeMap<String, serde_json::Value>>,
    ) -> Self {
        Self {
            run_id,
            task_id,
            task_name: task_name.to_string(),
            stage: stage.to_string(),
            attempt,
            input,
            parameters,
            upstream,
        }
    }

    /// Output of an upstream stage completed earlier in the run.
    pub fn output(&self, stage: &str) -> Option<&serde_json::Value> {
        self.upstream.get(stage)
    }

    /// Every upstream output completed so far.
    pub fn outputs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.upstream
    }

    /// The `retry` parameter block, present on retried attempts.
    pub fn retry_info(&self) -> Option<&serde_json::Value> {
        self.parameters.get("retry")
    }
}

/// What a stage unit produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub data: serde_json::Value,
    /// Score the stage reported for its own output, if any.
    pub quality_score: Option<f64>,
}

impl StageOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            quality_score: None,
        }
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }
}

/// One independently invocable unit of work. Must be safe to retry.
#[async_trait]
pub trait StageUnit: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &RunContextView) -> Result<StageOutput>;
}

/// Stage units by name.
#[derive(Clone, Default)]
pub struct StageRegistry {
    units: HashMap<String, Arc<dyn StageUnit>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `unit` under its own name, replacing any previous unit.
    pub fn register(&mut self, unit: Arc<dyn StageUnit>) {
        self.units.insert(unit.name().to_string(), unit);
    }

    pub fn with(mut self, unit: impl StageUnit + 'static) -> Self {
        self.register(Arc::new(unit));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StageUnit>> {
        self.units.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("units", &self.names())
            .finish()
    }
}

type StageFn = dyn Fn(RunContextView) -> BoxFuture<'static, Result<StageOutput>> + Send + Sync;

/// Closure-backed stage unit.
#[derive(Clone)]
pub struct FnStage {
    name: String,
    f: Arc<StageFn>,
}

impl FnStage {
    /// Stage backed by a synchronous closure.
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&RunContextView) -> Result<StageOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            f: Arc::new(move |ctx: RunContextView| futures::future::ready(f(&ctx)).boxed()),
        }
    }

    /// Stage backed by an async closure.
    pub fn from_async<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(RunContextView) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StageOutput>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            f: Arc::new(move |ctx: RunContextView| f(ctx).boxed()),
        }
    }
}

impl fmt::Debug for FnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl StageUnit for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &RunContextView) -> Result<StageOutput> {
        (self.f)(ctx.clone()).await
    }
}

// ========== Generic Adapter ==========

/// The opaque external service behind a stage.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Send `payload` and return the raw response text.
    async fn invoke(&self, payload: &serde_json::Value) -> Result<String>;
}

/// Returns the payload itself. Used for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoInvoker;

#[async_trait]
impl Invoker for EchoInvoker {
    async fn invoke(&self, payload: &serde_json::Value) -> Result<String> {
        Ok(serde_json::to_string(payload)?)
    }
}

/// Runs an external command with the JSON payload on stdin and returns
/// its stdout.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
}

impl CommandInvoker {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Split a shell-like command line on whitespace.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("empty command".to_string()))?;
        Ok(Self::new(program).with_args(parts))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Invoker for CommandInvoker {
    async fn invoke(&self, payload: &serde_json::Value) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let bytes = serde_json::to_vec(payload)?;
            // A command may exit without reading its input.
            if let Err(e) = stdin.write_all(&bytes).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.program,
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Stage(message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Required fields of a stage's parsed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSchema {
    pub required_fields: Vec<String>,
}

impl ResponseSchema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.required_fields.is_empty()
    }

    /// Check `value` is an object carrying every required field.
    pub fn validate(&self, value: &serde_json::Value) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let object = value
            .as_object()
            .ok_or_else(|| Error::Stage("response is not a JSON object".to_string()))?;
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|f| !object.contains_key(f.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Stage(format!(
                "response is missing fields: {}",
                missing.join(", ")
            )))
        }
    }
}

type HookFn = dyn Fn(&mut serde_json::Value, &RunContextView) -> Result<()> + Send + Sync;

/// Named post-processing step applied to a parsed response.
#[derive(Clone)]
pub struct StageHook {
    name: String,
    f: Arc<HookFn>,
}

impl StageHook {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&mut serde_json::Value, &RunContextView) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for StageHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHook").field("name", &self.name).finish()
    }
}

/// Generic stage unit: validate, build input, invoke, parse, then run the
/// named hooks before emitting the output.
#[derive(Clone)]
pub struct StageAdapter {
    name: String,
    invoker: Arc<dyn Invoker>,
    schema: ResponseSchema,
    requires: Vec<String>,
    hooks: Vec<StageHook>,
}

impl StageAdapter {
    pub fn new(name: &str, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            name: name.to_string(),
            invoker,
            schema: ResponseSchema::default(),
            requires: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Upstream stages whose output must be present before invoking.
    pub fn requires<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hook(mut self, hook: StageHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(StageHook::name).collect()
    }

    fn validate_inputs(&self, ctx: &RunContextView) -> Result<()> {
        match self.requires.iter().find(|s| ctx.output(s).is_none()) {
            Some(stage) => Err(Error::Stage(format!(
                "{} requires output of stage {}",
                self.name, stage
            ))),
            None => Ok(()),
        }
    }

    fn build_input(&self, ctx: &RunContextView) -> serde_json::Value {
        let upstream: serde_json::Map<String, serde_json::Value> = if self.requires.is_empty() {
            ctx.outputs()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            self.requires
                .iter()
                .filter_map(|s| ctx.output(s).map(|v| (s.clone(), v.clone())))
                .collect()
        };
        serde_json::json!({
            "run_id": ctx.run_id,
            "task": ctx.task_name,
            "stage": self.name,
            "attempt": ctx.attempt,
            "input": &*ctx.input,
            "parameters": ctx.parameters,
            "upstream": upstream,
        })
    }

    fn parse(&self, raw: &str) -> Result<serde_json::Value> {
        match serde_json::from_str(raw) {
            Ok(value) => Ok(value),
            Err(_) if self.schema.is_empty() => Ok(serde_json::Value::String(raw.to_string())),
            Err(e) => Err(Error::Stage(format!(
                "{} returned a response that is not JSON: {}",
                self.name, e
            ))),
        }
    }
}

impl fmt::Debug for StageAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageAdapter")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("requires", &self.requires)
            .field("hooks", &self.hook_names())
            .finish()
    }
}

#[async_trait]
impl StageUnit for StageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &RunContextView) -> Result<StageOutput> {
        self.validate_inputs(ctx)?;
        let payload = self.build_input(ctx);
        let raw = self.invoker.invoke(&payload).await?;
        let mut value = self.parse(&raw)?;
        self.schema.validate(&value)?;

        for hook in &self.hooks {
            (hook.f)(&mut value, ctx)
                .map_err(|e| Error::Stage(format!("hook {} failed: {}", hook.name, e)))?;
        }

        debug!(stage = %self.name, task = %ctx.task_name, attempt = ctx.attempt, "Stage output recorded");
        let quality_score = value.get("quality_score").and_then(|v| v.as_f64());
        Ok(StageOutput {
            data: value,
            quality_score,
        })
    }
}
