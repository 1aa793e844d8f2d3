use std::fmt;

use crate::adapters::CollectorError;
use crate::config::ConfigValidationError;
use crate::services::{ArtifactError, CheckpointError, PoolError, ProbeError, ResolverError};
use crate::utils::time::TimeError;

/// Coarse classification used to decide whether an error ends the process,
/// a single chain's progress, or only one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Task,
    Persistence,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Task => "task",
            ErrorKind::Persistence => "persistence",
        }
    }

    /// Configuration and persistence errors terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Configuration | ErrorKind::Persistence)
    }
}

#[derive(Debug)]
pub enum HarvestError {
    ConfigError(String),
    ValidationError(ConfigValidationError),
    DateError(TimeError),
    PoolError(PoolError),
    ResolverError(ResolverError),
    CheckpointError(CheckpointError),
    ArtifactError(ArtifactError),
    CollectorError(CollectorError),
    ProbeError(ProbeError),
    IoError(std::io::Error),
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::ConfigError(_)
            | HarvestError::ValidationError(_)
            | HarvestError::DateError(_) => ErrorKind::Configuration,
            HarvestError::PoolError(err) => {
                if err.is_persistence() {
                    ErrorKind::Persistence
                } else {
                    ErrorKind::Configuration
                }
            }
            HarvestError::ResolverError(err) => {
                if err.is_persistence() {
                    ErrorKind::Persistence
                } else {
                    ErrorKind::Resolution
                }
            }
            HarvestError::CheckpointError(_)
            | HarvestError::ArtifactError(_)
            | HarvestError::IoError(_) => ErrorKind::Persistence,
            HarvestError::CollectorError(_) => ErrorKind::Task,
            HarvestError::ProbeError(err) => match err {
                ProbeError::InvalidAddress { .. } => ErrorKind::Configuration,
                ProbeError::Pool(pool) if pool.is_persistence() => ErrorKind::Persistence,
                _ => ErrorKind::Resolution,
            },
        }
    }
}

impl fmt::Display for HarvestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarvestError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            HarvestError::ValidationError(err) => write!(f, "Invalid configuration: {}", err),
            HarvestError::DateError(err) => write!(f, "Invalid date input: {}", err),
            HarvestError::PoolError(err) => write!(f, "Connection pool error: {}", err),
            HarvestError::ResolverError(err) => write!(f, "Block resolution error: {}", err),
            HarvestError::CheckpointError(err) => write!(f, "Checkpoint error: {}", err),
            HarvestError::ArtifactError(err) => write!(f, "Artifact error: {}", err),
            HarvestError::CollectorError(err) => write!(f, "Collector error: {}", err),
            HarvestError::ProbeError(err) => write!(f, "Deployment probe error: {}", err),
            HarvestError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for HarvestError {}

impl From<config::ConfigError> for HarvestError {
    fn from(err: config::ConfigError) -> Self {
        HarvestError::ConfigError(err.to_string())
    }
}

impl From<ConfigValidationError> for HarvestError {
    fn from(err: ConfigValidationError) -> Self {
        HarvestError::ValidationError(err)
    }
}

impl From<TimeError> for HarvestError {
    fn from(err: TimeError) -> Self {
        HarvestError::DateError(err)
    }
}

impl From<PoolError> for HarvestError {
    fn from(err: PoolError) -> Self {
        HarvestError::PoolError(err)
    }
}

impl From<ResolverError> for HarvestError {
    fn from(err: ResolverError) -> Self {
        HarvestError::ResolverError(err)
    }
}

impl From<CheckpointError> for HarvestError {
    fn from(err: CheckpointError) -> Self {
        HarvestError::CheckpointError(err)
    }
}

impl From<ArtifactError> for HarvestError {
    fn from(err: ArtifactError) -> Self {
        HarvestError::ArtifactError(err)
    }
}

impl From<CollectorError> for HarvestError {
    fn from(err: CollectorError) -> Self {
        HarvestError::CollectorError(err)
    }
}

impl From<ProbeError> for HarvestError {
    fn from(err: ProbeError) -> Self {
        HarvestError::ProbeError(err)
    }
}

impl From<std::io::Error> for HarvestError {
    fn from(err: std::io::Error) -> Self {
        HarvestError::IoError(err)
    }
}
