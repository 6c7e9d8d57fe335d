//! Quality gate for stage output.
//!
//! A [`QualityScorer`] maps a stage's output to a score in `[0, 1]`; the
//! supervisor compares the score to the threshold configured for the
//! task's quality category.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Default minimum score an output must reach.
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;

/// Score substituted when the scorer fails.
pub const FALLBACK_SCORE: f64 = 0.5;

/// Scores stage output.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    /// Score `output` for `category`. The result must lie in `[0, 1]`.
    async fn score(&self, output: &serde_json::Value, category: &str) -> Result<f64>;
}

/// Scorer that returns the same score for every output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantScorer {
    score: f64,
}

impl ConstantScorer {
    pub fn new(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
        }
    }
}

impl Default for ConstantScorer {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl QualityScorer for ConstantScorer {
    async fn score(&self, _output: &serde_json::Value, _category: &str) -> Result<f64> {
        Ok(self.score)
    }
}

/// Per-category quality thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
}

fn default_threshold() -> f64 {
    DEFAULT_QUALITY_THRESHOLD
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_QUALITY_THRESHOLD,
            thresholds: BTreeMap::new(),
        }
    }
}

impl QualityThresholds {
    pub fn with_threshold(mut self, category: &str, threshold: f64) -> Self {
        self.thresholds.insert(category.to_string(), threshold);
        self
    }

    /// Threshold for `category`, falling back to the default.
    pub fn threshold_for(&self, category: &str) -> f64 {
        self.thresholds
            .get(category)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Check every threshold lies in `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        let out_of_range = std::iter::once(("default", self.default_threshold))
            .chain(self.thresholds.iter().map(|(k, v)| (k.as_str(), *v)))
            .find(|(_, v)| !(0.0..=1.0).contains(v));
        match out_of_range {
            Some((category, value)) => Err(Error::Validation(format!(
                "quality threshold for {} must be within [0, 1], got {}",
                category, value
            ))),
            None => Ok(()),
        }
    }
}

/// Verdict of the quality gate for one result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub category: String,
    pub score: f64,
    pub threshold: f64,
    pub approved: bool,
    /// Set when the scorer failed and the fallback score was used.
    pub scorer_error: Option<String>,
    pub reasoning: String,
}

impl QualityAssessment {
    /// Compare a score against a threshold.
    pub fn evaluate(category: &str, score: f64, threshold: f64) -> Self {
        let approved = score >= threshold;
        let reasoning = if approved {
            format!(
                "{} output scored {:.2}, meets threshold {:.2}",
                category, score, threshold
            )
        } else {
            format!(
                "{} output scored {:.2}, below threshold {:.2}",
                category, score, threshold
            )
        };
        Self {
            category: category.to_string(),
            score,
            threshold,
            approved,
            scorer_error: None,
            reasoning,
        }
    }

    /// Verdict when the scorer itself failed.
    ///
    /// The output is scored [`FALLBACK_SCORE`] and approved only when the
    /// threshold does not exceed it.
    pub fn scorer_failed(category: &str, threshold: f64, error: &str) -> Self {
        let approved = threshold <= FALLBACK_SCORE;
        Self {
            category: category.to_string(),
            score: FALLBACK_SCORE,
            threshold,
            approved,
            scorer_error: Some(error.to_string()),
            reasoning: format!(
                "Scorer failed for {} ({}); using fallback score {:.2} against threshold {:.2}, {}",
                category,
                error,
                FALLBACK_SCORE,
                threshold,
                if approved { "approved" } else { "rejected" }
            ),
        }
    }
}

/// Check a score is a finite number in `[0, 1]`.
pub fn check_score(score: f64) -> Result<f64> {
    if score.is_finite() && (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(Error::QualityScorer(format!(
            "score {} is outside [0, 1]",
            score
        )))
    }
}
