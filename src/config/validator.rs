use std::collections::HashSet;

use alloy::primitives::Address;
use thiserror::Error;
use url::Url;

use crate::config::{ChainSettings, Settings};
use crate::utils::time::parse_timezone;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid range: {field} must be between {min} and {max}, got {value}")]
    InvalidRange {
        field: String,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("Invalid format: {field} - {message}")]
    InvalidFormat { field: String, message: String },
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("Unit {unit} references unknown chain {chain}")]
    UnknownChain { unit: String, chain: String },
    #[error("Duplicate unit name: {0}")]
    DuplicateUnit(String),
    #[error("Unit {unit} has invalid registry address {address}")]
    InvalidAddress { unit: String, address: String },
}

pub type ValidationResult<T> = Result<T, ConfigValidationError>;

const MAX_WORKERS: f64 = 256.0;
const MAX_CALLS_PER_SECOND: f64 = 10_000.0;
const MAX_LOG_CHUNK_SIZE: f64 = 1_000_000.0;

/// Static checks run once after loading, before any task is planned.
#[derive(Debug, Default)]
pub struct SettingsValidator;

impl SettingsValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, settings: &Settings) -> ValidationResult<()> {
        self.validate_run(settings)?;
        for (name, chain) in &settings.chains {
            self.validate_chain(name, chain)?;
        }
        self.validate_aliases(settings)?;
        self.validate_units(settings)?;
        Ok(())
    }

    fn validate_run(&self, settings: &Settings) -> ValidationResult<()> {
        let run = &settings.run;

        if parse_timezone(&run.timezone).is_err() {
            return Err(ConfigValidationError::UnknownTimezone(run.timezone.clone()));
        }
        if run.data_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("run.data_dir".to_string()));
        }

        self.validate_range(run.workers as f64, 1.0, MAX_WORKERS, "run.workers")?;
        self.validate_rate(run.calls_per_second, "run.calls_per_second")?;
        if let Some(rate) = run.public_calls_per_second {
            self.validate_rate(rate, "run.public_calls_per_second")?;
        }
        self.validate_range(
            run.rpc_timeout_seconds as f64,
            1.0,
            3600.0,
            "run.rpc_timeout_seconds",
        )?;
        self.validate_range(
            run.task_timeout_seconds as f64,
            1.0,
            86_400.0,
            "run.task_timeout_seconds",
        )?;
        self.validate_range(
            run.max_task_attempts as f64,
            1.0,
            100.0,
            "run.max_task_attempts",
        )?;
        self.validate_range(
            run.retry.jitter_factor,
            0.0,
            1.0,
            "run.retry.jitter_factor",
        )?;

        Ok(())
    }

    fn validate_chain(&self, name: &str, chain: &ChainSettings) -> ValidationResult<()> {
        if let Some(rate) = chain.calls_per_second {
            self.validate_rate(rate, &format!("chains.{}.calls_per_second", name))?;
        }
        self.validate_range(
            chain.log_chunk_size as f64,
            1.0,
            MAX_LOG_CHUNK_SIZE,
            &format!("chains.{}.log_chunk_size", name),
        )?;

        let mut labels = HashSet::new();
        for (i, credential) in chain.credentials.iter().enumerate() {
            let field = format!("chains.{}.credentials[{}]", name, i);
            if credential.label.trim().is_empty() {
                return Err(ConfigValidationError::MissingField(format!("{}.label", field)));
            }
            if !labels.insert(credential.label.as_str()) {
                return Err(ConfigValidationError::InvalidFormat {
                    field,
                    message: format!("duplicate credential label {}", credential.label),
                });
            }
            self.validate_url(&credential.url, &format!("{}.url", field))?;
        }

        for (i, endpoint) in chain.public_endpoints.iter().enumerate() {
            self.validate_url(endpoint, &format!("chains.{}.public_endpoints[{}]", name, i))?;
        }

        Ok(())
    }

    fn validate_aliases(&self, settings: &Settings) -> ValidationResult<()> {
        for (alias, target) in &settings.chain_aliases {
            if !settings.chains.contains_key(target) {
                return Err(ConfigValidationError::InvalidFormat {
                    field: format!("chain_aliases.{}", alias),
                    message: format!("alias target {} is not a configured chain", target),
                });
            }
        }
        Ok(())
    }

    fn validate_units(&self, settings: &Settings) -> ValidationResult<()> {
        let mut names = HashSet::new();

        for unit in &settings.units {
            if unit.name.trim().is_empty() {
                return Err(ConfigValidationError::MissingField("units[].name".to_string()));
            }
            // used as a directory name and inside "unit:date" task ids
            let safe = unit
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
            if !safe || unit.name.starts_with('.') {
                return Err(ConfigValidationError::InvalidFormat {
                    field: "units[].name".to_string(),
                    message: format!("unit name {} must match [A-Za-z0-9_.-]+", unit.name),
                });
            }
            if !names.insert(unit.name.as_str()) {
                return Err(ConfigValidationError::DuplicateUnit(unit.name.clone()));
            }
            if !settings.chains.contains_key(&settings.canonical_chain(&unit.chain)) {
                return Err(ConfigValidationError::UnknownChain {
                    unit: unit.name.clone(),
                    chain: unit.chain.clone(),
                });
            }
            if unit.registry_address.parse::<Address>().is_err() {
                return Err(ConfigValidationError::InvalidAddress {
                    unit: unit.name.clone(),
                    address: unit.registry_address.clone(),
                });
            }
        }

        Ok(())
    }

    fn validate_rate(&self, value: f64, field: &str) -> ValidationResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigValidationError::InvalidRange {
                field: field.to_string(),
                min: f64::MIN_POSITIVE,
                max: MAX_CALLS_PER_SECOND,
                value,
            });
        }
        self.validate_range(value, 0.0, MAX_CALLS_PER_SECOND, field)
    }

    fn validate_url(&self, url: &str, field: &str) -> ValidationResult<()> {
        match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            _ => Err(ConfigValidationError::InvalidUrl(format!("{}: {}", field, url))),
        }
    }

    fn validate_range(&self, value: f64, min: f64, max: f64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ConfigValidationError::InvalidRange {
                field: field.to_string(),
                min,
                max,
                value,
            });
        }
        Ok(())
    }
}
