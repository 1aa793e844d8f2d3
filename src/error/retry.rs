use std::fmt::Display;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::RetrySettings;

/// Configuration for exponential backoff retry logic
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
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

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
        }
    }
}

/// Why a task or call failed, derived from the error text reported by the
/// provider. Stored in the checkpoint so failures can be grouped later.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    RateLimit,
    Auth,
    Timeout,
    Connection,
    ArchiveUnavailable,
    Decode,
    NoEndpoint,
    Resolution,
    NotDeployed,
    #[default]
    Other,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::RateLimit => "rate_limit",
            FailureCategory::Auth => "auth",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Connection => "connection",
            FailureCategory::ArchiveUnavailable => "archive_unavailable",
            FailureCategory::Decode => "decode",
            FailureCategory::NoEndpoint => "no_endpoint",
            FailureCategory::Resolution => "resolution",
            FailureCategory::NotDeployed => "not_deployed",
            FailureCategory::Other => "other",
        }
    }

    /// Transient categories are worth another attempt within the same call.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureCategory::RateLimit | FailureCategory::Connection)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "429",
    "too many requests",
    "rate limit",
    "exceeded the rps",
    "compute units",
    "-32005",
    "503",
    "service unavailable",
];

const AUTH_PATTERNS: &[&str] = &["401", "unauthorized", "invalid api key", "must be authenticated"];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline"];

const CONNECTION_PATTERNS: &[&str] = &[
    "connection",
    "remote end closed",
    "remotedisconnected",
    "broken pipe",
    "502",
    "bad gateway",
    "dns",
];

const ARCHIVE_PATTERNS: &[&str] = &[
    "missing trie node",
    "archive",
    "pruned",
    "header not found",
    "state not available",
    "state histories haven't been fully indexed",
];

/// Classify a provider error message. Order matters: an auth failure that
/// mentions a connection is still an auth failure.
pub fn classify_failure(message: &str) -> FailureCategory {
    let lower = message.to_lowercase();
    let contains_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if contains_any(AUTH_PATTERNS) {
        FailureCategory::Auth
    } else if contains_any(RATE_LIMIT_PATTERNS) {
        FailureCategory::RateLimit
    } else if contains_any(ARCHIVE_PATTERNS) {
        FailureCategory::ArchiveUnavailable
    } else if contains_any(TIMEOUT_PATTERNS) {
        FailureCategory::Timeout
    } else if contains_any(CONNECTION_PATTERNS) {
        FailureCategory::Connection
    } else {
        FailureCategory::Other
    }
}

/// Calculate the delay for the next retry attempt with exponential backoff and jitter
fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponential_delay =
        config.base_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped_delay = exponential_delay.min(config.max_delay_ms as f64);

    let jitter_range = capped_delay * config.jitter_factor;
    let jitter = if jitter_range > 0.0 {
        rand::thread_rng().gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };
    let final_delay = (capped_delay + jitter).max(0.0) as u64;

    Duration::from_millis(final_delay)
}

/// Execute a future with exponential backoff retry logic.
///
/// `is_retryable` decides per error whether another attempt is made; the last
/// error is returned once attempts are exhausted.
pub async fn with_retry<F, Fut, T, E, R>(
    operation_name: &str,
    config: &RetryConfig,
    is_retryable: R,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "Operation failed with non-retryable error"
                    );
                    return Err(err);
                }

                if attempt + 1 >= max_attempts {
                    error!(
                        operation = operation_name,
                        attempts = max_attempts,
                        error = %err,
                        "Operation failed after all retry attempts"
                    );
                    return Err(err);
                }

                let delay = calculate_delay(attempt, config);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying after delay"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
