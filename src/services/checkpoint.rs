use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::FailureCategory;
use crate::models::{TaskId, TaskOutcome};
use crate::utils::fs::{read_json_if_exists, write_json_atomic_async};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint {path}: {message}")]
    Read { path: String, message: String },

    #[error("Checkpoint {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    #[error("Failed to write checkpoint {path}: {message}")]
    Write { path: String, message: String },
}

fn default_attempts() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task: TaskId,
    pub reason: String,
    #[serde(default)]
    pub category: FailureCategory,
    /// Number of runs in which this task has failed.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

/// On-disk layout of the checkpoint file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointFile {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Vec<TaskId>,
    #[serde(default)]
    pub failed: Vec<FailureRecord>,
}

impl CheckpointFile {
    pub fn read(path: &Path) -> Result<Option<Self>, CheckpointError> {
        read_json_if_exists(path).map_err(|err| {
            let path = path.display().to_string();
            if err.kind() == io::ErrorKind::InvalidData {
                CheckpointError::Corrupt {
                    path,
                    message: err.to_string(),
                }
            } else {
                CheckpointError::Read {
                    path,
                    message: err.to_string(),
                }
            }
        })
    }
}

/// Point-in-time copy of checkpoint state used for planning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSnapshot {
    pub completed: BTreeSet<TaskId>,
    pub failed: BTreeMap<TaskId, FailureRecord>,
}

impl CheckpointSnapshot {
    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.completed.contains(id)
    }

    pub fn failure(&self, id: &TaskId) -> Option<&FailureRecord> {
        self.failed.get(id)
    }

    fn from_file(file: CheckpointFile) -> Self {
        let completed: BTreeSet<TaskId> = file.completed.into_iter().collect();
        let mut failed = BTreeMap::new();
        for record in file.failed {
            if completed.contains(&record.task) {
                warn!(task = %record.task, "Task listed as both completed and failed, keeping completed");
                continue;
            }
            failed.insert(record.task.clone(), record);
        }
        Self { completed, failed }
    }

    /// Apply one outcome. A task is never left in both sets.
    pub fn apply(&mut self, id: &TaskId, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => {
                self.failed.remove(id);
                self.completed.insert(id.clone());
            }
            TaskOutcome::Failed { reason, category } => {
                self.completed.remove(id);
                let attempts = self.failed.get(id).map_or(0, |r| r.attempts) + 1;
                self.failed.insert(
                    id.clone(),
                    FailureRecord {
                        task: id.clone(),
                        reason: reason.clone(),
                        category: *category,
                        attempts,
                    },
                );
            }
        }
    }
}

/// Durable completed/failed record, rewritten atomically after every outcome.
/// Writers are serialized by an async mutex held until the file write, which
/// runs on the blocking pool, has finished.
pub struct Checkpoint {
    path: PathBuf,
    run_id: Uuid,
    state: Mutex<CheckpointSnapshot>,
}

impl Checkpoint {
    /// Continue from an existing checkpoint file, if any.
    pub fn load(path: impl Into<PathBuf>, run_id: Uuid) -> Result<Self, CheckpointError> {
        let path = path.into();
        let state = match CheckpointFile::read(&path)? {
            Some(file) => {
                let snapshot = CheckpointSnapshot::from_file(file);
                info!(
                    path = %path.display(),
                    completed = snapshot.completed.len(),
                    failed = snapshot.failed.len(),
                    "Resuming from checkpoint"
                );
                snapshot
            }
            None => CheckpointSnapshot::default(),
        };

        Ok(Self {
            path,
            run_id,
            state: Mutex::new(state),
        })
    }

    /// Start empty. An existing file is moved aside to `<name>.prev`.
    pub fn fresh(path: impl Into<PathBuf>, run_id: Uuid) -> Result<Self, CheckpointError> {
        let path = path.into();
        if path.exists() {
            let previous = previous_path(&path);
            fs::rename(&path, &previous).map_err(|err| CheckpointError::Write {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
            info!(previous = %previous.display(), "Previous checkpoint moved aside");
        }

        Ok(Self {
            path,
            run_id,
            state: Mutex::new(CheckpointSnapshot::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn snapshot(&self) -> CheckpointSnapshot {
        self.state.lock().await.clone()
    }

    /// Apply `outcome` and persist before returning.
    pub async fn record(&self, id: &TaskId, outcome: &TaskOutcome) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        state.apply(id, outcome);
        debug!(task = %id, completed = outcome.is_completed(), "Checkpoint updated");
        self.write(&state).await
    }

    pub async fn flush(&self) -> Result<(), CheckpointError> {
        let state = self.state.lock().await;
        self.write(&state).await
    }

    async fn write(&self, state: &CheckpointSnapshot) -> Result<(), CheckpointError> {
        let file = CheckpointFile {
            run_id: Some(self.run_id),
            updated_at: Some(Utc::now()),
            completed: state.completed.iter().cloned().collect(),
            failed: state.failed.values().cloned().collect(),
        };
        write_json_atomic_async(&self.path, &file)
            .await
            .map_err(|err| CheckpointError::Write {
                path: self.path.display().to_string(),
                message: err.to_string(),
            })
    }
}

pub fn previous_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".prev");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fs::write_json_atomic;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn id(unit: &str, day: u32) -> TaskId {
        TaskId::new(unit, NaiveDate::from_ymd_opt(2024, 12, day).unwrap())
    }

    fn failed(reason: &str) -> TaskOutcome {
        TaskOutcome::failed(reason, FailureCategory::RateLimit)
    }

    #[tokio::test]
    async fn test_record_persists_every_outcome() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".checkpoint.json");
        let checkpoint = Checkpoint::fresh(&path, Uuid::new_v4()).unwrap();

        checkpoint.record(&id("aave_v3_ethereum", 1), &TaskOutcome::Completed).await.unwrap();
        checkpoint.record(&id("aave_v3_ethereum", 2), &failed("429")).await.unwrap();

        let file = CheckpointFile::read(&path).unwrap().unwrap();
        assert_eq!(file.run_id, Some(checkpoint.run_id()));
        assert_eq!(file.completed, vec![id("aave_v3_ethereum", 1)]);
        assert_eq!(file.failed.len(), 1);
        assert_eq!(file.failed[0].category, FailureCategory::RateLimit);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"aave_v3_ethereum:2024-12-01\""));
    }

    #[tokio::test]
    async fn test_failure_then_success_moves_task() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::fresh(dir.path().join("cp.json"), Uuid::new_v4()).unwrap();
        let task = id("venus_bsc", 3);

        checkpoint.record(&task, &failed("timeout")).await.unwrap();
        checkpoint.record(&task, &failed("timeout again")).await.unwrap();
        let snapshot = checkpoint.snapshot().await;
        assert_eq!(snapshot.failure(&task).unwrap().attempts, 2);

        checkpoint.record(&task, &TaskOutcome::Completed).await.unwrap();
        let snapshot = checkpoint.snapshot().await;
        assert!(snapshot.is_completed(&task));
        assert!(snapshot.failure(&task).is_none());
    }

    #[tokio::test]
    async fn test_load_resumes_and_fresh_moves_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".checkpoint.json");

        let first = Checkpoint::fresh(&path, Uuid::new_v4()).unwrap();
        first.record(&id("u", 1), &TaskOutcome::Completed).await.unwrap();

        let resumed = Checkpoint::load(&path, Uuid::new_v4()).unwrap();
        assert!(resumed.snapshot().await.is_completed(&id("u", 1)));

        let restarted = Checkpoint::fresh(&path, Uuid::new_v4()).unwrap();
        assert!(restarted.snapshot().await.completed.is_empty());
        assert!(!path.exists());
        assert!(previous_path(&path).exists());
        assert_eq!(
            previous_path(&path).file_name().unwrap(),
            ".checkpoint.json.prev"
        );
    }

    #[tokio::test]
    async fn test_overlapping_file_keeps_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".checkpoint.json");
        let file = CheckpointFile {
            run_id: None,
            updated_at: None,
            completed: vec![id("u", 1)],
            failed: vec![FailureRecord {
                task: id("u", 1),
                reason: "stale".to_string(),
                category: FailureCategory::Other,
                attempts: 1,
            }],
        };
        write_json_atomic(&path, &file).unwrap();

        let checkpoint = Checkpoint::load(&path, Uuid::new_v4()).unwrap();
        let snapshot = checkpoint.snapshot().await;
        assert!(snapshot.is_completed(&id("u", 1)));
        assert!(snapshot.failed.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".checkpoint.json");
        fs::write(&path, b"{\"completed\": [\"broken\"]}").unwrap();

        assert!(matches!(
            Checkpoint::load(&path, Uuid::new_v4()),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_legacy_failure_entries_get_defaults() {
        let record: FailureRecord =
            serde_json::from_str(r#"{"task": "u:2024-12-01", "reason": "boom"}"#).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.category, FailureCategory::Other);
    }
}
