//! Required-stage classification.
//!
//! A run's required stages are computed once, before scheduling, from a
//! lightweight classification of the run input. Classifiers only ever see
//! the declared stage names and return a typed [`StageSet`].

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Input handed to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInput {
    /// Free-form input specification.
    pub text: String,
}

impl RunInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Ordered, duplicate-free set of stage names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageSet(Vec<String>);

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage; returns false if it was already present.
    pub fn insert(&mut self, stage: impl Into<String>) -> bool {
        let stage = stage.into();
        if self.contains(&stage) {
            return false;
        }
        self.0.push(stage);
        true
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.0.iter().any(|s| s == stage)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    /// Keep only stages in `declared`, logging each one dropped.
    pub fn retain_declared(&mut self, declared: &[String]) -> Vec<String> {
        let mut dropped = Vec::new();
        self.0.retain(|stage| {
            let keep = declared.iter().any(|d| d == stage);
            if !keep {
                warn!(stage = %stage, "Classifier selected an undeclared stage, dropping it");
                dropped.push(stage.clone());
            }
            keep
        });
        dropped
    }
}

impl<S: Into<String>> FromIterator<S> for StageSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = StageSet::new();
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

/// Computes the required stage set for a run.
pub trait StageClassifier: Send + Sync {
    /// Classify `input` against the stages the pipeline declares.
    ///
    /// The returned set only contains declared stages.
    fn classify(&self, input: &RunInput, declared: &[String]) -> StageSet;

    /// Short name used in decision records.
    fn name(&self) -> &str;
}

/// Requires every declared stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllStages;

impl StageClassifier for AllStages {
    fn classify(&self, _input: &RunInput, declared: &[String]) -> StageSet {
        declared.iter().cloned().collect()
    }

    fn name(&self) -> &str {
        "all"
    }
}

/// Requires a fixed set of stages regardless of input.
#[derive(Debug, Clone, Default)]
pub struct StaticClassifier {
    stages: StageSet,
}

impl StaticClassifier {
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().collect(),
        }
    }
}

impl StageClassifier for StaticClassifier {
    fn classify(&self, _input: &RunInput, declared: &[String]) -> StageSet {
        let mut set = self.stages.clone();
        set.retain_declared(declared);
        set
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// One classification rule: when `pattern` matches, `stages` are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub pattern: String,
    pub stages: Vec<String>,
}

/// Regex-driven classifier.
///
/// Patterns match case-insensitively against the input text. Stages in
/// `always` are required for every input. The result lists stages in the
/// order they are declared.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    always: Vec<String>,
    rules: Vec<(Regex, Vec<String>)>,
}

impl RuleClassifier {
    /// Compile `rules`.
    ///
    /// # Errors
    /// Returns `Error::Regex` for an invalid pattern.
    pub fn new(always: Vec<String>, rules: &[ClassifierRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()?;
                Ok((regex, rule.stages.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { always, rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl StageClassifier for RuleClassifier {
    fn classify(&self, input: &RunInput, declared: &[String]) -> StageSet {
        let mut wanted: StageSet = self.always.iter().cloned().collect();
        for (regex, stages) in &self.rules {
            if regex.is_match(&input.text) {
                debug!(pattern = %regex.as_str(), stages = ?stages, "Classifier rule matched");
                for stage in stages {
                    wanted.insert(stage.clone());
                }
            }
        }
        wanted.retain_declared(declared);

        declared
            .iter()
            .filter(|d| wanted.contains(d))
            .cloned()
            .collect()
    }

    fn name(&self) -> &str {
        "rules"
    }
}
