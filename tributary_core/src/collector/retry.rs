use crate::config::ApiConfig;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// Bounded exponential backoff for transient upstream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &ApiConfig) -> Self {
        Self {
            max_retries: cfg.retry,
            base: cfg.backoff_base,
            max: cfg.backoff_max,
        }
    }

    /// `base * 2^attempt`, capped at `max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(63);
        let exp = 1u128 << shift;
        let ms = self.base.as_millis().saturating_mul(exp);
        Duration::from_millis(ms.min(self.max.as_millis()) as u64)
    }

    /// Delay before the next attempt, honouring `Retry-After` (seconds) up to `max`.
    pub fn delay(&self, attempt: u32, headers: Option<&HeaderMap>) -> Duration {
        let backoff = self.backoff(attempt);
        let hinted = headers
            .and_then(|h| h.get(RETRY_AFTER))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        match hinted {
            Some(h) => h.max(backoff).min(self.max),
            None => backoff,
        }
    }

    /// 429 and 5xx are transient; every other non-success status is fatal.
    pub fn is_retryable(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ApiConfig::default())
    }
}
