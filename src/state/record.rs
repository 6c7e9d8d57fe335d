//! Persisted run records.
//!
//! One JSON document per run, written once at run completion to
//! `<record_dir>/<run_id>.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};
use crate::orchestration::{DecisionRecord, Escalation};
use crate::workflow::{HistoryEntry, RunId, RunStatus};

/// Current record format version.
pub const RECORD_VERSION: u32 = 1;

/// Serializable summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub version: u32,
    pub run_id: RunId,
    pub status: RunStatus,
    pub input: String,
    pub required_stages: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// One entry per stage attempt, in execution order.
    pub history: Vec<HistoryEntry>,
    pub decisions: Vec<DecisionRecord>,
    pub escalations: Vec<Escalation>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Directory of run records.
#[derive(Debug, Clone)]
pub struct RunRecordStore {
    dir: PathBuf,
}

impl RunRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// Write `record`, replacing any previous record of the same run.
    pub async fn save(&self, record: &RunRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&record.run_id);
        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(record)?;
        fs::write(&temp_path, contents).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(path = %path.display(), "Run record saved");
        Ok(path)
    }

    /// Read the record of `run_id`.
    ///
    /// # Errors
    /// `Validation` if no record exists for the run.
    pub async fn load(&self, run_id: &RunId) -> Result<RunRecord> {
        let path = self.path_for(run_id);
        if !fs::try_exists(&path).await? {
            return Err(Error::Validation(format!("no record for run {}", run_id)));
        }
        let contents = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Ids of every stored run, sorted.
    pub async fn list(&self) -> Result<Vec<RunId>> {
        if !fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_by_key(|id| id.0);
        Ok(ids)
    }
}
