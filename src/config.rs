//! Engine configuration.
//!
//! Every component receives its config section explicitly through its
//! constructor; there is no global state. All sections deserialize from YAML
//! with per-field defaults, so a config file only needs to name what it
//! overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub redis: RedisConfig,
    pub fair_queue: FairQueueConfig,
    pub backpressure: BackpressureConfig,
    pub congestion: CongestionConfig,
    pub worker_pool: WorkerPoolConfig,
}

impl EngineConfig {
    /// Parses a YAML config document.
    pub fn from_yaml(content: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations no component could run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.worker_pool.worker_count == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_pool.worker_count must be > 0".to_string(),
            ));
        }
        if self.backpressure.ready_queue_max_size == 0 {
            return Err(EngineError::InvalidConfig(
                "backpressure.ready_queue_max_size must be > 0".to_string(),
            ));
        }
        if self.backpressure.global_rps == 0 {
            return Err(EngineError::InvalidConfig(
                "backpressure.global_rps must be > 0".to_string(),
            ));
        }
        if self.backpressure.rate_limit_window_sec == 0 {
            return Err(EngineError::InvalidConfig(
                "backpressure.rate_limit_window_sec must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis.url = url.into();
        self
    }

    /// Sets the Redis key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.redis.key_prefix = prefix.into();
        self
    }

    /// Sets the number of workers.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_pool.worker_count = count;
        self
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. "redis://localhost:6379".
    pub url: String,
    /// Prefix for every key the engine writes.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "bulk-action:".to_string(),
        }
    }
}

/// Fair-queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FairQueueConfig {
    /// Shortest-job-first boost coefficient in the fairness score.
    pub alpha: f64,
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self { alpha: 10_000.0 }
    }
}

/// Admission control and ready/non-ready buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Global admissions allowed per rate-limit window.
    pub global_rps: u64,
    /// Hard cap on the ready buffer length.
    pub ready_queue_max_size: u64,
    /// Width of one rate-limit window in seconds.
    pub rate_limit_window_sec: u64,
    /// TTL on rate-limit counter keys; must outlive the window.
    pub rate_limit_key_ttl_sec: u64,
    /// Dispatcher cycle period.
    pub dispatch_interval_ms: u64,
    /// Max non-ready entries promoted per dispatcher cycle.
    pub dispatch_batch_size: u64,
    /// Base delay for retry backoff.
    pub default_backoff_ms: u64,
    /// Ceiling on any computed backoff.
    pub max_backoff_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            global_rps: 100,
            ready_queue_max_size: 1000,
            rate_limit_window_sec: 1,
            rate_limit_key_ttl_sec: 10,
            dispatch_interval_ms: 100,
            dispatch_batch_size: 100,
            default_backoff_ms: 1000,
            max_backoff_ms: 120_000,
        }
    }
}

impl BackpressureConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

/// Adaptive backoff settings for rate-limited jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// When false, every non-ready insert uses a fixed `base_backoff_ms`.
    pub enabled: bool,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// TTL on the per-group congestion stats hash, refreshed on every
    /// backoff computation, so idle groups do not accumulate stale stats.
    pub stats_retention_ms: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_backoff_ms: 1000,
            max_backoff_ms: 120_000,
            stats_retention_ms: 60_000,
        }
    }
}

/// Worker pool and fetcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// Fetcher cycle period.
    pub fetch_interval_ms: u64,
    /// Max fair-queue dequeues per fetcher cycle.
    pub fetch_batch_size: u64,
    /// Blocking-pop timeout for idle workers, in seconds.
    pub worker_timeout_sec: u64,
    /// Hard deadline for one processor invocation.
    pub job_timeout_ms: u64,
    /// Retries before a job is dead-lettered.
    pub max_retry_count: u32,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace_period_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            fetch_interval_ms: 200,
            fetch_batch_size: 50,
            worker_timeout_sec: 5,
            job_timeout_ms: 30_000,
            max_retry_count: 3,
            shutdown_grace_period_ms: 10_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.redis.key_prefix, "bulk-action:");
        assert!((config.fair_queue.alpha - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(config.backpressure.global_rps, 100);
        assert_eq!(config.backpressure.ready_queue_max_size, 1000);
        assert_eq!(config.backpressure.rate_limit_window_sec, 1);
        assert_eq!(config.backpressure.dispatch_batch_size, 100);
        assert_eq!(config.backpressure.max_backoff_ms, 120_000);
        assert!(config.congestion.enabled);
        assert_eq!(config.congestion.base_backoff_ms, 1000);
        assert_eq!(config.worker_pool.worker_count, 10);
        assert_eq!(config.worker_pool.fetch_batch_size, 50);
        assert_eq!(config.worker_pool.max_retry_count, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
redis:
  key_prefix: "tenant-a:"
worker_pool:
  worker_count: 4
"#;
        let config = EngineConfig::from_yaml(yaml).expect("should parse");

        assert_eq!(config.redis.key_prefix, "tenant-a:");
        assert_eq!(config.worker_pool.worker_count, 4);
        // Untouched sections keep their defaults.
        assert_eq!(config.backpressure.global_rps, 100);
        assert_eq!(config.worker_pool.job_timeout_ms, 30_000);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let yaml = "worker_pool:\n  worker_count: 0\n";

        assert!(matches!(
            EngineConfig::from_yaml(yaml),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.backpressure.ready_queue_max_size = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_helpers() {
        let config = EngineConfig::default()
            .with_redis_url("redis://cache:6380")
            .with_key_prefix("x:")
            .with_worker_count(2);

        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.redis.key_prefix, "x:");
        assert_eq!(config.worker_pool.worker_count, 2);
    }

    #[test]
    fn test_duration_accessors() {
        let config = EngineConfig::default();

        assert_eq!(
            config.backpressure.dispatch_interval(),
            Duration::from_millis(100)
        );
        assert_eq!(
            config.worker_pool.fetch_interval(),
            Duration::from_millis(200)
        );
        assert_eq!(config.worker_pool.job_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.worker_pool.shutdown_grace_period(),
            Duration::from_secs(10)
        );
    }
}
