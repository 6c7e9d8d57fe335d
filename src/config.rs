use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::dag::TaskGraph;
use crate::core::task::{Priority, Task, DEFAULT_MAX_RETRIES};
use crate::orchestration::{
    CommandInvoker, EchoInvoker, EngineConfig, Invoker, QualityThresholds, ResponseSchema,
    StageAdapter, StageRegistry, DEFAULT_STAGE_TIMEOUT_SECS,
};
use crate::workflow::{AllStages, ClassifierRule, RuleClassifier, RunInput, StageClassifier};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Concurrent stage invocations per batch; 0 means unbounded.
    #[serde(default)]
    pub max_parallel: usize,
    pub record_dir: Option<String>,
    #[serde(default)]
    pub quality: QualityThresholds,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_stage_timeout_secs() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            max_parallel: 0,
            record_dir: None,
            quality: QualityThresholds::default(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Directory run records are written to.
    pub fn record_dir(&self) -> Result<PathBuf> {
        match &self.record_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("runs")),
        }
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_retries = config.max_retries,
            stage_timeout_secs = config.stage_timeout_secs,
            max_parallel = config.max_parallel,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!(dir = %parent.display(), "Creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage_timeout_secs == 0 {
            return Err(Error::Validation(
                "stage_timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.quality.validate()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            max_parallel: self.max_parallel,
            thresholds: self.quality.clone(),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// One task of a run definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefinition {
    pub name: String,
    pub description: String,
    pub priority: Priority,
    /// Names of tasks this one waits on.
    pub depends_on: Vec<String>,
    pub stage: Option<String>,
    pub fallback_stage: Option<String>,
    pub quality_category: Option<String>,
    /// Task-level threshold for its quality category.
    pub quality_threshold: Option<f64>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    /// External command backing this task's stage.
    pub command: Option<String>,
    pub parameters: Option<serde_json::Value>,
    /// Fields the stage's JSON response must carry.
    pub required_fields: Vec<String>,
    /// Upstream stages whose output the stage needs.
    pub requires: Vec<String>,
}

impl TaskDefinition {
    fn stage_name(&self) -> &str {
        self.stage.as_deref().unwrap_or(&self.name)
    }
}

/// A stage unit declared on its own, typically an alternate stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDefinition {
    pub name: String,
    pub command: Option<String>,
    pub required_fields: Vec<String>,
    pub requires: Vec<String>,
}

/// Regex rules choosing the required stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierDefinition {
    /// Stages required for every input.
    pub always: Vec<String>,
    pub rules: Vec<ClassifierRule>,
}

/// A run described in TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDefinition {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    pub classifier: Option<ClassifierDefinition>,
}

impl RunDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading run definition");
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let definition: Self = toml::from_str(contents)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("run defines no tasks".to_string()));
        }
        if let Some(task) = self.tasks.iter().find(|t| t.name.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "task with description {:?} has no name",
                task.description
            )));
        }
        if let Some(task) = self
            .tasks
            .iter()
            .find(|t| t.quality_threshold.is_some_and(|v| !(0.0..=1.0).contains(&v)))
        {
            return Err(Error::Validation(format!(
                "quality threshold of {} must be within [0, 1]",
                task.name
            )));
        }
        Ok(())
    }

    pub fn run_input(&self) -> RunInput {
        RunInput::new(self.input.clone())
    }

    /// Build the task graph, resolving `depends_on` names.
    ///
    /// # Errors
    /// Structural errors for duplicate names, unknown dependencies or cycles.
    pub fn build_graph(&self, config: &Config) -> Result<TaskGraph> {
        let tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|def| {
                let mut task = Task::new(&def.name, &def.description)
                    .with_priority(def.priority)
                    .with_max_retries(def.max_retries.unwrap_or(config.max_retries));
                if let Some(stage) = &def.stage {
                    task = task.with_stage(stage);
                }
                if let Some(stage) = &def.fallback_stage {
                    task = task.with_fallback_stage(stage);
                }
                if let Some(category) = &def.quality_category {
                    task = task.with_quality_category(category);
                }
                if let Some(threshold) = def.quality_threshold {
                    let category = task.quality_key().to_string();
                    task = task.with_quality_criterion(&category, threshold);
                }
                if let Some(secs) = def.timeout_secs {
                    task = task.with_timeout(Duration::from_secs(secs));
                }
                if let Some(parameters) = &def.parameters {
                    task = task.with_parameters(parameters.clone());
                }
                task
            })
            .collect();

        let mut linked = tasks.clone();
        for (def, task) in self.tasks.iter().zip(linked.iter_mut()) {
            for dep in &def.depends_on {
                let dep_id = tasks
                    .iter()
                    .find(|t| &t.name == dep)
                    .map(|t| t.id)
                    .ok_or_else(|| Error::UnknownDependency {
                        task: def.name.clone(),
                        dependency: dep.clone(),
                    })?;
                task.dependencies.insert(dep_id);
            }
        }

        TaskGraph::from_tasks(linked)
    }

    /// Stage unit for every stage the run references.
    ///
    /// Stages with a command invoke it unless `dry_run` is set; every other
    /// stage echoes its input.
    pub fn build_registry(&self, dry_run: bool) -> Result<StageRegistry> {
        let mut registry = StageRegistry::new();

        for def in &self.stages {
            registry.register(Arc::new(adapter(
                &def.name,
                def.command.as_deref(),
                &def.required_fields,
                &def.requires,
                dry_run,
            )?));
        }

        let mut seen: BTreeSet<String> = self.stages.iter().map(|s| s.name.clone()).collect();
        for def in &self.tasks {
            let stage = def.stage_name();
            if seen.insert(stage.to_string()) {
                registry.register(Arc::new(adapter(
                    stage,
                    def.command.as_deref(),
                    &def.required_fields,
                    &def.requires,
                    dry_run,
                )?));
            }
        }
        for def in &self.tasks {
            if let Some(fallback) = &def.fallback_stage {
                if seen.insert(fallback.clone()) {
                    registry.register(Arc::new(adapter(fallback, None, &[], &[], dry_run)?));
                }
            }
        }

        Ok(registry)
    }

    /// Classifier from the `[classifier]` section, or one requiring every
    /// stage when the section is absent.
    pub fn build_classifier(&self) -> Result<Arc<dyn StageClassifier>> {
        match &self.classifier {
            Some(def) => Ok(Arc::new(RuleClassifier::new(def.always.clone(), &def.rules)?)),
            None => Ok(Arc::new(AllStages)),
        }
    }
}

fn adapter(
    name: &str,
    command: Option<&str>,
    required_fields: &[String],
    requires: &[String],
    dry_run: bool,
) -> Result<StageAdapter> {
    let invoker: Arc<dyn Invoker> = match command {
        Some(line) if !dry_run => Arc::new(CommandInvoker::from_command_line(line)?),
        _ => Arc::new(EchoInvoker),
    };
    let mut adapter = StageAdapter::new(name, invoker).requires(requires.iter().cloned());
    if !dry_run {
        adapter = adapter.with_schema(ResponseSchema::new(required_fields.iter().cloned()));
    }
    Ok(adapter)
}
