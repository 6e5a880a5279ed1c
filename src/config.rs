//! Runtime configuration.
//!
//! [`DispatchConfig`] can be built in code, deserialized from YAML, or
//! overlaid from `NL2SQL_*` environment variables:
//!
//! - `NL2SQL_WORKERS`, `NL2SQL_QUEUE_CAPACITY`
//! - `NL2SQL_RPS` or `NL2SQL_RPM` (requests per second / minute; `0` disables limiting)
//! - `NL2SQL_BREAKER_FAILURE_THRESHOLD` (default 5), `NL2SQL_BREAKER_COOLDOWN_SECS` (default 30)
//! - `NL2SQL_REQUEST_TIMEOUT_MS`, `NL2SQL_ATTEMPT_TIMEOUT_MS`
//! - `NL2SQL_HEARTBEAT_MS`, `NL2SQL_CACHE_TTL_SECS`

use crate::pool::worker_pool::WorkerPoolConfig;
use crate::providers::router::RouterConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Serde helper: `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Serde helper: `Option<Duration>` as integer milliseconds.
pub mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// How the coordinator reacts when no rate-limit permit is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Wait for a permit until the request deadline.
    #[default]
    Wait,
    /// Reject immediately with `RateLimited`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Characters of SQL per `chunk` event.
    pub chunk_size: usize,
    /// Session deadline; falls back to the request timeout when unset.
    #[serde(with = "opt_duration_ms")]
    pub session_timeout: Option<Duration>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            chunk_size: 64,
            session_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub workers: WorkerPoolConfig,
    pub breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub admission: AdmissionMode,
    pub router: RouterConfig,
    pub streaming: StreamingConfig,
    pub cache: CacheConfig,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: WorkerPoolConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            admission: AdmissionMode::default(),
            router: RouterConfig::default(),
            streaming: StreamingConfig::default(),
            cache: CacheConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with whatever `NL2SQL_*` variables are set.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay `NL2SQL_*` variables on top of this config. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("NL2SQL_WORKERS") {
            self.workers.workers = n;
        }
        if let Some(n) = env_parse::<usize>("NL2SQL_QUEUE_CAPACITY") {
            self.workers.queue_capacity = n;
        }

        let rps = env_parse::<f64>("NL2SQL_RPS")
            .or_else(|| env_parse::<f64>("NL2SQL_RPM").map(|rpm| rpm / 60.0));
        if let Some(cfg) = rps.and_then(RateLimiterConfig::from_rps) {
            self.rate_limiter = cfg;
        }

        if let Some(n) = env_parse::<u32>("NL2SQL_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.max_failures = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("NL2SQL_BREAKER_COOLDOWN_SECS") {
            self.breaker.reset_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_parse::<u64>("NL2SQL_REQUEST_TIMEOUT_MS").filter(|ms| *ms > 0) {
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("NL2SQL_ATTEMPT_TIMEOUT_MS").filter(|ms| *ms > 0) {
            self.router.attempt_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("NL2SQL_HEARTBEAT_MS").filter(|ms| *ms > 0) {
            self.streaming.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("NL2SQL_CACHE_TTL_SECS") {
            if secs == 0 {
                self.cache.enabled = false;
            } else {
                self.cache.ttl = Duration::from_secs(secs);
            }
        }
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid dispatch config: {}", e),
                ErrorContext::new().with_source("config"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new().with_field_path(field).with_source("config"),
            ))
        };
        if self.workers.workers == 0 {
            return invalid("workers.workers", "worker count must be at least 1");
        }
        if self.workers.queue_capacity == 0 {
            return invalid("workers.queue_capacity", "queue capacity must be at least 1");
        }
        if !self.rate_limiter.rate.is_finite() || self.rate_limiter.rate < 0.0 {
            return invalid("rate_limiter.rate", "rate must be a finite, non-negative number");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout", "request timeout must be positive");
        }
        if self.streaming.heartbeat_interval.is_zero() {
            return invalid("streaming.heartbeat_interval", "heartbeat interval must be positive");
        }
        if self.streaming.chunk_size == 0 {
            return invalid("streaming.chunk_size", "chunk size must be at least 1");
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return invalid("cache.capacity", "cache capacity must be at least 1 when enabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = DispatchConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.workers.workers >= 2);
        assert_eq!(cfg.breaker.max_failures, 5);
    }

    #[test]
    fn test_yaml_partial_overrides() {
        let cfg = DispatchConfig::from_yaml_str(
            r#"
workers:
  workers: 3
  queue_capacity: 12
  queue_full: reject
breaker:
  max_failures: 2
  reset_timeout: 1500
rate_limiter:
  rate: 0
admission: reject
streaming:
  heartbeat_interval: 250
request_timeout: 5000
"#,
        )
        .unwrap();
        assert_eq!(cfg.workers.workers, 3);
        assert_eq!(
            cfg.workers.queue_full,
            crate::pool::worker_pool::QueueFullPolicy::Reject
        );
        assert_eq!(cfg.breaker.reset_timeout, Duration::from_millis(1500));
        assert!(cfg.rate_limiter.is_unlimited());
        assert_eq!(cfg.admission, AdmissionMode::Reject);
        assert_eq!(cfg.streaming.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(cfg.streaming.chunk_size, 64);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn test_yaml_rejects_zero_workers() {
        let err = DispatchConfig::from_yaml_str("workers:\n  workers: 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("workers.workers"));
    }

    #[test]
    fn test_yaml_syntax_error_is_configuration_error() {
        let err = DispatchConfig::from_yaml_str("workers: [").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_env_overrides() {
        // Variable names are unique to this test so parallel tests do not interfere.
        std::env::set_var("NL2SQL_WORKERS", "7");
        std::env::set_var("NL2SQL_RPM", "120");
        std::env::set_var("NL2SQL_BREAKER_COOLDOWN_SECS", "0");
        std::env::set_var("NL2SQL_HEARTBEAT_MS", "not-a-number");
        let cfg = DispatchConfig::from_env();
        std::env::remove_var("NL2SQL_WORKERS");
        std::env::remove_var("NL2SQL_RPM");
        std::env::remove_var("NL2SQL_BREAKER_COOLDOWN_SECS");
        std::env::remove_var("NL2SQL_HEARTBEAT_MS");

        assert_eq!(cfg.workers.workers, 7);
        assert!((cfg.rate_limiter.rate - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.breaker.reset_timeout, Duration::from_secs(1));
        assert_eq!(cfg.streaming.heartbeat_interval, Duration::from_secs(15));
    }
}
