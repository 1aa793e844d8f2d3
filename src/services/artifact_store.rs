use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{BlockMapping, ProtocolFamily, Unit};
use crate::utils::fs::{read_json_if_exists, write_json_atomic_async};
use crate::utils::time::{parse_date, DATE_FORMAT};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to write artifact {path}: {message}")]
    Write { path: String, message: String },

    #[error("Failed to read artifact {path}: {message}")]
    Read { path: String, message: String },
}

/// One collected snapshot. Contains no wall-clock data, so collecting the
/// same task twice yields identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub unit: String,
    pub chain: String,
    pub protocol_family: ProtocolFamily,
    pub registry_address: String,
    pub date: NaiveDate,
    pub block: u64,
    pub block_timestamp: i64,
    pub ts_start_utc: i64,
    pub ts_end_utc: i64,
    pub data: Value,
}

impl Artifact {
    pub fn new(unit: &Unit, mapping: &BlockMapping, data: Value) -> Self {
        Self {
            unit: unit.name.clone(),
            chain: unit.chain.clone(),
            protocol_family: unit.protocol_family,
            registry_address: unit.registry_address.clone(),
            date: mapping.date,
            block: mapping.block,
            block_timestamp: mapping.timestamp,
            ts_start_utc: mapping.window.start_utc,
            ts_end_utc: mapping.window.end_utc,
            data,
        }
    }
}

/// Artifacts found for one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactInventory {
    pub dates: Vec<NaiveDate>,
    /// Files that are empty, not JSON, or not a JSON object.
    pub invalid: Vec<PathBuf>,
}

/// Artifacts live at `<root>/<unit>/<YYYY-MM-DD>.json`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, unit: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(unit)
            .join(format!("{}.json", date.format(DATE_FORMAT)))
    }

    /// Write atomically; an interrupted write leaves any previous file intact.
    pub async fn write(&self, artifact: &Artifact) -> Result<PathBuf, ArtifactError> {
        let path = self.path_for(&artifact.unit, artifact.date);
        write_json_atomic_async(&path, artifact)
            .await
            .map_err(|err| ArtifactError::Write {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        debug!(path = %path.display(), block = artifact.block, "Artifact written");
        Ok(path)
    }

    pub fn read(&self, unit: &str, date: NaiveDate) -> Result<Option<Artifact>, ArtifactError> {
        let path = self.path_for(unit, date);
        read_json_if_exists(&path).map_err(|err| ArtifactError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })
    }

    pub fn exists(&self, unit: &str, date: NaiveDate) -> bool {
        self.path_for(unit, date).is_file()
    }

    /// Unit directories present under the root, sorted.
    pub fn units(&self) -> Result<Vec<String>, ArtifactError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.read_error(&self.root, err)),
        };

        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| self.read_error(&self.root, err))?;
            if entry.path().is_dir() {
                units.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        units.sort();
        Ok(units)
    }

    /// Scan one unit's directory. Temporary files from interrupted writes
    /// are ignored.
    pub fn inventory(&self, unit: &str) -> Result<ArtifactInventory, ArtifactError> {
        let dir = self.root.join(unit);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ArtifactInventory::default())
            }
            Err(err) => return Err(self.read_error(&dir, err)),
        };

        let mut inventory = ArtifactInventory::default();
        for entry in entries {
            let entry = entry.map_err(|err| self.read_error(&dir, err))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(date) = parse_date(stem) else {
                continue;
            };

            let bytes = fs::read(&path).map_err(|err| self.read_error(&path, err))?;
            let is_object = serde_json::from_slice::<Value>(&bytes)
                .map(|value| value.is_object())
                .unwrap_or(false);
            if is_object {
                inventory.dates.push(date);
            } else {
                inventory.invalid.push(path);
            }
        }

        inventory.dates.sort();
        inventory.invalid.sort();
        Ok(inventory)
    }

    fn read_error(&self, path: &Path, err: io::Error) -> ArtifactError {
        ArtifactError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}
