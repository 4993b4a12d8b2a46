//! Delay buffer for jobs that cannot enter the ready queue yet.
//!
//! A sorted set scored by due timestamp (epoch ms). A job becomes eligible
//! for promotion once `now >= score`; the dispatcher moves due entries into
//! the ready buffer in batches.

use std::fmt;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::config::BackpressureConfig;
use crate::error::EngineError;
use crate::keys::KeyBuilder;

/// Why a job was routed to the non-ready queue, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonReadyReason {
    RateLimited,
    ApiThrottled,
    TransientError,
}

impl fmt::Display for NonReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NonReadyReason::RateLimited => "RATE_LIMITED",
            NonReadyReason::ApiThrottled => "API_THROTTLED",
            NonReadyReason::TransientError => "TRANSIENT_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct NonReadyQueue {
    redis: ConnectionManager,
    keys: KeyBuilder,
    default_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl NonReadyQueue {
    pub fn new(redis: ConnectionManager, keys: KeyBuilder, config: &BackpressureConfig) -> Self {
        Self {
            redis,
            keys,
            default_backoff_ms: config.default_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }

    /// Parks a job until `now + backoff_ms`, clamping to the configured max.
    pub async fn push(
        &self,
        job_id: &str,
        backoff_ms: u64,
        reason: NonReadyReason,
    ) -> Result<(), EngineError> {
        let clamped = backoff_ms.min(self.max_backoff_ms);
        let execute_at = chrono::Utc::now().timestamp_millis() + clamped as i64;

        let mut conn = self.redis.clone();
        let _: () = conn
            .zadd(self.keys.non_ready_queue(), job_id, execute_at)
            .await?;

        debug!(
            job_id = %job_id,
            reason = %reason,
            backoff_ms = clamped,
            "Job parked in non-ready queue"
        );

        Ok(())
    }

    /// Parks a job with `default_backoff_ms * 2^retry_count`, clamped.
    pub async fn push_with_exponential_backoff(
        &self,
        job_id: &str,
        retry_count: u32,
        reason: NonReadyReason,
    ) -> Result<(), EngineError> {
        let backoff = self
            .default_backoff_ms
            .saturating_mul(1u64 << retry_count.min(32))
            .min(self.max_backoff_ms);

        self.push(job_id, backoff, reason).await
    }

    /// Due entries (score <= now) without removing them.
    pub async fn peek_ready(&self, limit: u64) -> Result<Vec<String>, EngineError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.redis.clone();

        let jobs: Vec<String> = conn
            .zrangebyscore_limit(self.keys.non_ready_queue(), "-inf", now, 0, limit as isize)
            .await?;

        Ok(jobs)
    }

    /// Removes and returns up to `limit` due entries.
    ///
    /// Single-caller convenience; the dispatcher's promotion path uses the
    /// atomic move-to-ready script instead.
    pub async fn pop_ready(&self, limit: u64) -> Result<Vec<String>, EngineError> {
        let jobs = self.peek_ready(limit).await?;

        if !jobs.is_empty() {
            let mut conn = self.redis.clone();
            let _: () = conn.zrem(self.keys.non_ready_queue(), &jobs).await?;
        }

        Ok(jobs)
    }

    pub async fn remove(&self, job_id: &str) -> Result<(), EngineError> {
        let mut conn = self.redis.clone();
        let _: () = conn.zrem(self.keys.non_ready_queue(), job_id).await?;
        Ok(())
    }

    pub async fn size(&self) -> Result<u64, EngineError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.zcard(self.keys.non_ready_queue()).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_values() {
        let default_ms: u64 = 1000;
        let max_ms: u64 = 120_000;
        let backoff =
            |retries: u32| default_ms.saturating_mul(1u64 << retries.min(32)).min(max_ms);

        assert_eq!(backoff(0), 1000);
        assert_eq!(backoff(1), 2000);
        assert_eq!(backoff(3), 8000);
        // Clamped at the ceiling from 2^7 onward.
        assert_eq!(backoff(7), 120_000);
        assert_eq!(backoff(30), 120_000);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(NonReadyReason::RateLimited.to_string(), "RATE_LIMITED");
        assert_eq!(NonReadyReason::ApiThrottled.to_string(), "API_THROTTLED");
        assert_eq!(NonReadyReason::TransientError.to_string(), "TRANSIENT_ERROR");
    }
}
