use std::fmt;

use tracing::warn;
use url::Url;

use crate::config::{ChainSettings, ConfigValidationError};

/// An API endpoint bound to one chain with a fixed call budget. The URL may
/// embed a secret, so neither `Debug` nor `Display` print it.
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub chain: String,
    pub label: String,
    pub url: Url,
    pub calls_per_second: f64,
}

impl Credential {
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("unknown")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("chain", &self.chain)
            .field("label", &self.label)
            .field("host", &self.host())
            .field("calls_per_second", &self.calls_per_second)
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain, self.label)
    }
}

/// All endpoints known for one chain: keyed credentials in configuration
/// order plus best-effort public fallbacks.
#[derive(Debug, Clone)]
pub struct ChainEndpoint {
    pub chain: String,
    pub credentials: Vec<Credential>,
    pub public_endpoints: Vec<Url>,
    pub log_chunk_size: u64,
}

impl ChainEndpoint {
    /// Build from configuration. Credentials whose key cannot be resolved are
    /// dropped with a warning rather than failing the whole chain.
    /// `calls_per_second` is the already resolved per-credential ceiling.
    pub fn from_settings(
        chain: &str,
        settings: &ChainSettings,
        calls_per_second: f64,
    ) -> Result<Self, ConfigValidationError> {

        let mut credentials = Vec::with_capacity(settings.credentials.len());
        for credential in &settings.credentials {
            let raw = if credential.needs_key() {
                match credential.resolve_key() {
                    Some(key) => credential.url.replace("{key}", &key),
                    None => {
                        warn!(
                            chain = %chain,
                            label = %credential.label,
                            "API key not set, credential skipped"
                        );
                        continue;
                    }
                }
            } else {
                credential.url.clone()
            };

            let url = Url::parse(&raw).map_err(|_| {
                ConfigValidationError::InvalidUrl(format!(
                    "chains.{}.credentials.{}",
                    chain, credential.label
                ))
            })?;

            credentials.push(Credential {
                chain: chain.to_string(),
                label: credential.label.clone(),
                url,
                calls_per_second,
            });
        }

        let public_endpoints = settings
            .public_endpoints
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|_| {
                    ConfigValidationError::InvalidUrl(format!("chains.{}: {}", chain, raw))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            chain: chain.to_string(),
            credentials,
            public_endpoints,
            log_chunk_size: settings.log_chunk_size.max(1),
        })
    }

    pub fn has_endpoints(&self) -> bool {
        !self.credentials.is_empty() || !self.public_endpoints.is_empty()
    }
}
