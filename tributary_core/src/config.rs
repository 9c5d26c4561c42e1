use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Cap used when `PIPELINE_MAX_PARALLEL` is 0 (unlimited).
pub const UNLIMITED_PIPELINES: usize = 10_000;

/// HTTP collection defaults applied to every connection's client.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub retry: u32,
    pub timeout: Duration,
    pub requests_per_hour: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// In-flight requests per client.
    pub max_in_flight: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            retry: 3,
            timeout: Duration::from_secs(120),
            requests_per_hour: 18_000,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(60_000),
            max_in_flight: 10,
        }
    }
}

/// Engine-wide configuration, built once at startup and passed to constructors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub pipeline_max_parallel: usize,
    pub task_max_parallel: usize,
    pub lock_timeout: Duration,
    pub blueprint_poll_interval: Duration,
    pub pipeline_poll_interval: Duration,
    pub api: ApiConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".tributary/tributary.db"),
            pipeline_max_parallel: 10,
            task_max_parallel: 8,
            lock_timeout: Duration::from_millis(2_000),
            blueprint_poll_interval: Duration::from_millis(30_000),
            pipeline_poll_interval: Duration::from_millis(1_000),
            api: ApiConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{key} is not valid: {v}"))),
        _ => Ok(None),
    }
}

/// Parse `"120"`, `"120s"`, `"2m"` or `"1h"` into a duration.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, mul) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else {
        (s, 1)
    };
    let v = num
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::InvalidInput(format!("invalid duration: {s}")))?;
    Ok(if mul == 0 {
        Duration::from_millis(v)
    } else {
        Duration::from_secs(v.saturating_mul(mul))
    })
}

impl EngineConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let db_path = std::env::var("TRIBUTARY_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(d.db_path);

        let pipeline_max_parallel = match env_parse::<usize>("PIPELINE_MAX_PARALLEL")? {
            Some(0) => UNLIMITED_PIPELINES,
            Some(n) => n,
            None => d.pipeline_max_parallel,
        };
        let task_max_parallel = env_parse("TASK_MAX_PARALLEL")?.unwrap_or(d.task_max_parallel);
        let timeout = match std::env::var("API_TIMEOUT") {
            Ok(v) if !v.trim().is_empty() => parse_duration(&v)?,
            _ => d.api.timeout,
        };
        let ms = |key: &str, default: Duration| -> Result<Duration> {
            Ok(env_parse::<u64>(key)?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };

        let cfg = Self {
            db_path,
            pipeline_max_parallel,
            task_max_parallel,
            lock_timeout: ms("LOCK_TIMEOUT_MS", d.lock_timeout)?,
            blueprint_poll_interval: ms("BLUEPRINT_POLL_INTERVAL_MS", d.blueprint_poll_interval)?,
            pipeline_poll_interval: ms("PIPELINE_POLL_INTERVAL_MS", d.pipeline_poll_interval)?,
            api: ApiConfig {
                retry: env_parse("API_RETRY")?.unwrap_or(d.api.retry),
                timeout,
                requests_per_hour: env_parse("API_REQUESTS_PER_HOUR")?
                    .unwrap_or(d.api.requests_per_hour),
                backoff_base: ms("API_BACKOFF_BASE_MS", d.api.backoff_base)?,
                backoff_max: ms("API_BACKOFF_MAX_MS", d.api.backoff_max)?,
                max_in_flight: env_parse("API_MAX_IN_FLIGHT")?.unwrap_or(d.api.max_in_flight),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("db_path is empty".to_string()));
        }
        if self.pipeline_max_parallel == 0 {
            return Err(Error::InvalidInput(
                "pipeline_max_parallel must be > 0".to_string(),
            ));
        }
        if self.task_max_parallel == 0 {
            return Err(Error::InvalidInput("task_max_parallel must be > 0".to_string()));
        }
        if self.lock_timeout.is_zero() {
            return Err(Error::InvalidInput("lock_timeout must be > 0".to_string()));
        }
        if self.blueprint_poll_interval.is_zero() || self.pipeline_poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll intervals must be > 0".to_string()));
        }
        if self.api.timeout.is_zero() {
            return Err(Error::InvalidInput("api.timeout must be > 0".to_string()));
        }
        if self.api.requests_per_hour == 0 {
            return Err(Error::InvalidInput(
                "api.requests_per_hour must be > 0".to_string(),
            ));
        }
        if self.api.max_in_flight == 0 {
            return Err(Error::InvalidInput("api.max_in_flight must be > 0".to_string()));
        }
        if self.api.backoff_base > self.api.backoff_max {
            return Err(Error::InvalidInput(
                "api.backoff_base must be <= api.backoff_max".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("120s").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut cfg = EngineConfig::default();
        cfg.api.backoff_base = Duration::from_secs(120);
        assert!(cfg.validate().is_err());
    }
}
