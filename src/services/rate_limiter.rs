use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 300;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateLimiterError {
    #[error("calls per second for {label} must be a positive finite number, got {value}")]
    InvalidRate { label: String, value: f64 },
}

#[derive(Debug, Default)]
struct BackoffState {
    consecutive: u32,
    until: Option<Instant>,
}

/// Paces calls through one credential to at most `R` per second by keeping
/// grants at least `1/R` apart. The last-grant timestamp is held across the
/// pacing sleep, so concurrent callers are granted strictly one at a time.
#[derive(Debug)]
pub struct RateLimiter {
    label: String,
    min_interval: Duration,
    last_grant: Mutex<Option<Instant>>,
    backoff: StdMutex<BackoffState>,
}

impl RateLimiter {
    pub fn new(label: impl Into<String>, calls_per_second: f64) -> Result<Self, RateLimiterError> {
        let label = label.into();
        if !calls_per_second.is_finite() || calls_per_second <= 0.0 {
            return Err(RateLimiterError::InvalidRate {
                label,
                value: calls_per_second,
            });
        }

        Ok(Self {
            label,
            min_interval: Duration::from_secs_f64(1.0 / calls_per_second),
            last_grant: Mutex::new(None),
            backoff: StdMutex::new(BackoffState::default()),
        })
    }

    /// No pacing; only rate-limit backoff applies. Used for public endpoints.
    pub fn unlimited(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            min_interval: Duration::ZERO,
            last_grant: Mutex::new(None),
            backoff: StdMutex::new(BackoffState::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until one more call may be issued, then claim it.
    pub async fn acquire(&self) {
        let mut last_grant = self.last_grant.lock().await;

        if let Some(remaining) = self.backoff_remaining() {
            debug!(
                limiter = %self.label,
                wait_ms = remaining.as_millis() as u64,
                "Waiting out rate-limit backoff"
            );
            sleep(remaining).await;
        }

        if let Some(previous) = *last_grant {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }

        *last_grant = Some(Instant::now());
    }

    /// Record a rate-limit rejection. The n-th consecutive report blocks the
    /// limiter for `5s * 2^(n-1)`, capped at five minutes.
    pub fn report_rate_limited(&self) -> Duration {
        let mut state = self.lock_backoff();
        state.consecutive = state.consecutive.saturating_add(1);

        let exponent = state.consecutive.saturating_sub(1).min(16);
        let delay = Duration::from_secs(
            BACKOFF_BASE_SECS
                .saturating_mul(1u64 << exponent)
                .min(BACKOFF_CAP_SECS),
        );
        state.until = Some(Instant::now() + delay);

        warn!(
            limiter = %self.label,
            consecutive = state.consecutive,
            backoff_secs = delay.as_secs(),
            "Rate limited, backing off"
        );
        delay
    }

    pub fn report_success(&self) {
        let mut state = self.lock_backoff();
        if state.consecutive > 0 {
            debug!(limiter = %self.label, "Rate-limit backoff cleared");
        }
        state.consecutive = 0;
        state.until = None;
    }

    pub fn backoff_remaining(&self) -> Option<Duration> {
        let state = self.lock_backoff();
        state
            .until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    fn lock_backoff(&self) -> std::sync::MutexGuard<'_, BackoffState> {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
