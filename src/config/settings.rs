use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SettingsValidator;
use crate::error::HarvestError;
use crate::models::Unit;
use crate::utils::time::{parse_timezone, TimeError};

pub const DEFAULT_CONFIG_PATH: &str = "config/harvester.toml";
pub const ENV_PREFIX: &str = "CSU";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Keyed by canonical chain name.
    #[serde(default)]
    pub chains: BTreeMap<String, ChainSettings>,
    /// Alternative chain name -> canonical chain name.
    #[serde(default)]
    pub chain_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub data_dir: PathBuf,
    /// IANA name of the civil timezone that defines day boundaries.
    pub timezone: String,
    pub workers: usize,
    /// Default per-credential ceiling, kept well below provider limits.
    pub calls_per_second: f64,
    /// Public endpoints are unpaced unless this is set.
    pub public_calls_per_second: Option<f64>,
    pub rpc_timeout_seconds: u64,
    pub task_timeout_seconds: u64,
    /// Number of runs a task may fail in before `--resume` stops replanning it.
    pub max_task_attempts: u32,
    pub retry: RetrySettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            timezone: "America/New_York".to_string(),
            workers: 4,
            calls_per_second: 10.0,
            public_calls_per_second: None,
            rpc_timeout_seconds: 30,
            task_timeout_seconds: 300,
            max_task_attempts: 3,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    pub credentials: Vec<CredentialSettings>,
    pub public_endpoints: Vec<String>,
    /// Overrides `run.calls_per_second` for this chain's credentials.
    pub calls_per_second: Option<f64>,
    /// Maximum block span of one log query on this chain's providers.
    pub log_chunk_size: u64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            public_endpoints: Vec::new(),
            calls_per_second: None,
            log_chunk_size: 10,
        }
    }
}

/// One API key bound to a chain. The URL may contain a `{key}` placeholder
/// which is filled from `api_key` or from the environment variable named by
/// `api_key_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSettings {
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl CredentialSettings {
    /// The key for this credential, if one is configured and present.
    pub fn resolve_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }

    pub fn needs_key(&self) -> bool {
        self.url.contains("{key}")
    }
}

impl Settings {
    /// Layered load: serde defaults, then the TOML file, then environment
    /// overrides such as `CSU_RUN__WORKERS=8` (prefix joined by `_`, nested
    /// keys by `__`). An explicitly given path must exist; the default path
    /// is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, HarvestError> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        let settings = settings.normalized();
        SettingsValidator::new().validate(&settings)?;

        info!(
            chains = settings.chains.len(),
            units = settings.units.len(),
            data_dir = %settings.run.data_dir.display(),
            "Configuration loaded and validated"
        );
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, HarvestError> {
        let config = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?;
        let settings: Settings = config.try_deserialize()?;
        let settings = settings.normalized();
        SettingsValidator::new().validate(&settings)?;
        Ok(settings)
    }

    /// Lower-case chain names and rewrite every unit's chain to its canonical
    /// name so that caches and endpoint lookups agree.
    pub fn normalized(mut self) -> Self {
        self.chains = std::mem::take(&mut self.chains)
            .into_iter()
            .map(|(name, chain)| (name.to_lowercase(), chain))
            .collect();
        self.chain_aliases = std::mem::take(&mut self.chain_aliases)
            .into_iter()
            .map(|(alias, target)| (alias.to_lowercase(), target.to_lowercase()))
            .collect();

        let units = std::mem::take(&mut self.units);
        self.units = units
            .into_iter()
            .map(|mut unit| {
                unit.chain = self.canonical_chain(&unit.chain);
                unit
            })
            .collect();
        self
    }

    pub fn canonical_chain(&self, name: &str) -> String {
        let lower = name.to_lowercase();
        self.chain_aliases.get(&lower).cloned().unwrap_or(lower)
    }

    pub fn chain(&self, name: &str) -> Option<&ChainSettings> {
        self.chains.get(&self.canonical_chain(name))
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn timezone(&self) -> Result<Tz, TimeError> {
        parse_timezone(&self.run.timezone)
    }

    /// Calls-per-second ceiling for credentials of `chain`.
    pub fn calls_per_second_for(&self, chain: &str) -> f64 {
        self.chain(chain)
            .and_then(|c| c.calls_per_second)
            .unwrap_or(self.run.calls_per_second)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.run.rpc_timeout_seconds.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.run.task_timeout_seconds.max(1))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.run.data_dir.join("cache")
    }

    pub fn block_cache_path(&self, chain: &str) -> PathBuf {
        self.cache_dir().join(format!("{}_blocks.json", chain))
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.run.data_dir.join("artifacts")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.run.data_dir.join(".checkpoint.json")
    }

    pub fn blacklist_path(&self) -> PathBuf {
        self.run.data_dir.join(".key_blacklist.json")
    }
}
