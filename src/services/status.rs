use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{FailureCategory, HarvestError};
use crate::services::artifact_store::ArtifactStore;
use crate::services::block_resolver::load_block_cache;
use crate::services::checkpoint::CheckpointFile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub unit: String,
    pub chain: String,
    pub artifacts: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub chain: String,
    pub entries: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointStatus {
    pub run_id: Option<Uuid>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed: usize,
    pub failed: usize,
    /// Failed tasks that `--resume` will no longer retry.
    pub exhausted: usize,
    pub failures_by_category: BTreeMap<FailureCategory, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStatus {
    pub units: Vec<UnitStatus>,
    /// Artifact directories that match no configured unit.
    pub unknown_units: Vec<String>,
    pub invalid_artifacts: Vec<PathBuf>,
    pub checkpoint: Option<CheckpointStatus>,
    pub caches: Vec<CacheStatus>,
}

/// Read-only survey of the data directory.
pub fn collection_status(settings: &Settings) -> Result<CollectionStatus, HarvestError> {
    let store = ArtifactStore::new(settings.artifact_dir());

    let mut units = Vec::with_capacity(settings.units.len());
    let mut invalid_artifacts = Vec::new();
    for unit in &settings.units {
        let inventory = store.inventory(&unit.name)?;
        invalid_artifacts.extend(inventory.invalid);
        units.push(UnitStatus {
            unit: unit.name.clone(),
            chain: unit.chain.clone(),
            artifacts: inventory.dates.len(),
            first_date: inventory.dates.first().copied(),
            last_date: inventory.dates.last().copied(),
        });
    }

    let unknown_units = store
        .units()?
        .into_iter()
        .filter(|name| settings.unit(name).is_none())
        .collect();

    let checkpoint = CheckpointFile::read(&settings.checkpoint_path())?.map(|file| {
        let mut failures_by_category = BTreeMap::new();
        for record in &file.failed {
            *failures_by_category.entry(record.category).or_default() += 1;
        }
        CheckpointStatus {
            run_id: file.run_id,
            updated_at: file.updated_at,
            completed: file.completed.len(),
            failed: file.failed.len(),
            exhausted: file
                .failed
                .iter()
                .filter(|record| record.attempts >= settings.run.max_task_attempts)
                .count(),
            failures_by_category,
        }
    });

    let mut caches = Vec::with_capacity(settings.chains.len());
    for chain in settings.chains.keys() {
        let cache = load_block_cache(&settings.block_cache_path(chain))?;
        caches.push(CacheStatus {
            chain: chain.clone(),
            entries: cache.len(),
            first_date: cache.keys().next().copied(),
            last_date: cache.keys().next_back().copied(),
        });
    }

    Ok(CollectionStatus {
        units,
        unknown_units,
        invalid_artifacts,
        checkpoint,
        caches,
    })
}

fn span(first: Option<NaiveDate>, last: Option<NaiveDate>) -> String {
    match (first, last) {
        (Some(first), Some(last)) => format!("{} .. {}", first, last),
        _ => "-".to_string(),
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Units:")?;
        for unit in &self.units {
            writeln!(
                f,
                "  {:<32} {:<12} {:>6} artifacts  {}",
                unit.unit,
                unit.chain,
                unit.artifacts,
                span(unit.first_date, unit.last_date)
            )?;
        }
        if !self.unknown_units.is_empty() {
            writeln!(f, "Unconfigured artifact directories: {}", self.unknown_units.join(", "))?;
        }
        if !self.invalid_artifacts.is_empty() {
            writeln!(f, "Invalid artifacts ({}):", self.invalid_artifacts.len())?;
            for path in &self.invalid_artifacts {
                writeln!(f, "  {}", path.display())?;
            }
        }

        match &self.checkpoint {
            Some(checkpoint) => {
                writeln!(
                    f,
                    "Checkpoint: {} completed, {} failed ({} exhausted)",
                    checkpoint.completed, checkpoint.failed, checkpoint.exhausted
                )?;
                for (category, count) in &checkpoint.failures_by_category {
                    writeln!(f, "  {:<20} {}", category, count)?;
                }
            }
            None => writeln!(f, "Checkpoint: none")?,
        }

        writeln!(f, "Block caches:")?;
        for cache in &self.caches {
            writeln!(
                f,
                "  {:<12} {:>6} dates  {}",
                cache.chain,
                cache.entries,
                span(cache.first_date, cache.last_date)
            )?;
        }
        Ok(())
    }
}
