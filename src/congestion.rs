//! Congestion control: adaptive backoff for rate-limited jobs.
//!
//! Backoff grows with the group's non-ready backlog relative to its current
//! fair-share speed; the resulting delay is classified into a severity level
//! used in progress reports. When the subsystem is disabled or its script
//! fails, admission degrades to a fixed base backoff instead of failing.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::{BackpressureConfig, CongestionConfig};
use crate::error::EngineError;
use crate::keys::KeyBuilder;
use crate::scripts::Scripts;

/// Severity classification of a computed backoff relative to the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionLevel {
    None,
    Low,
    Moderate,
    High,
    Critical,
}

impl CongestionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::None => "NONE",
            CongestionLevel::Low => "LOW",
            CongestionLevel::Moderate => "MODERATE",
            CongestionLevel::High => "HIGH",
            CongestionLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CongestionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(CongestionLevel::None),
            "LOW" => Ok(CongestionLevel::Low),
            "MODERATE" => Ok(CongestionLevel::Moderate),
            "HIGH" => Ok(CongestionLevel::High),
            "CRITICAL" => Ok(CongestionLevel::Critical),
            other => Err(format!("unknown congestion level: {other}")),
        }
    }
}

/// Inputs to one backoff computation.
#[derive(Debug, Clone, Copy)]
pub struct BackoffParams {
    pub non_ready_count: u64,
    pub rate_limit_speed: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// A computed backoff with its classification.
#[derive(Debug, Clone, Copy)]
pub struct BackoffResult {
    pub backoff_ms: u64,
    pub non_ready_count: u64,
    pub rate_limit_speed: u64,
    pub congestion_level: CongestionLevel,
}

impl BackoffResult {
    /// Degraded-mode result: fixed delay, no counter data.
    pub fn fixed(backoff_ms: u64) -> Self {
        Self {
            backoff_ms,
            non_ready_count: 0,
            rate_limit_speed: 0,
            congestion_level: CongestionLevel::None,
        }
    }
}

/// Pure backoff math, mirrored by the congestion-backoff Lua script.
pub struct BackoffCalculator;

impl BackoffCalculator {
    /// `backoff = min(base + floor(count / speed) * 1000, max)`.
    pub fn calculate(params: BackoffParams) -> BackoffResult {
        let safe_speed = params.rate_limit_speed.max(1);
        let backoff_ms =
            (params.base_backoff_ms + params.non_ready_count / safe_speed * 1000)
                .min(params.max_backoff_ms);

        BackoffResult {
            backoff_ms,
            non_ready_count: params.non_ready_count,
            rate_limit_speed: safe_speed,
            congestion_level: Self::classify(backoff_ms, params.base_backoff_ms),
        }
    }

    /// Severity by the ratio of computed backoff to base backoff.
    pub fn classify(backoff_ms: u64, base_backoff_ms: u64) -> CongestionLevel {
        if base_backoff_ms == 0 {
            return CongestionLevel::None;
        }

        let ratio = backoff_ms as f64 / base_backoff_ms as f64;

        if ratio <= 1.0 {
            CongestionLevel::None
        } else if ratio < 3.0 {
            CongestionLevel::Low
        } else if ratio < 10.0 {
            CongestionLevel::Moderate
        } else if ratio < 30.0 {
            CongestionLevel::High
        } else {
            CongestionLevel::Critical
        }
    }

    /// Rough drain time for a backlog at the given speed.
    pub fn estimate_completion_time_ms(non_ready_count: u64, rate_limit_speed: u64) -> u64 {
        let safe_speed = rate_limit_speed.max(1);
        non_ready_count.div_ceil(safe_speed) * 1000
    }
}

/// Congestion view of a single group.
#[derive(Debug, Clone)]
pub struct GroupCongestionState {
    pub group_id: String,
    pub non_ready_count: u64,
    pub rate_limit_speed: u64,
    pub last_backoff_ms: u64,
    pub congestion_level: CongestionLevel,
}

/// System-wide congestion rollup across active groups.
#[derive(Debug, Clone)]
pub struct SystemCongestionSummary {
    pub total_non_ready_count: u64,
    pub active_group_count: u64,
    pub groups: Vec<GroupCongestionState>,
}

pub struct CongestionControl {
    redis: ConnectionManager,
    keys: KeyBuilder,
    scripts: Arc<Scripts>,
    config: CongestionConfig,
    global_rps: u64,
}

impl CongestionControl {
    pub fn new(
        redis: ConnectionManager,
        keys: KeyBuilder,
        scripts: Arc<Scripts>,
        config: CongestionConfig,
        backpressure: &BackpressureConfig,
    ) -> Self {
        Self {
            redis,
            keys,
            scripts,
            config,
            global_rps: backpressure.global_rps,
        }
    }

    /// Parks a job in the non-ready queue with adaptive backoff.
    ///
    /// Bumps the group's non-ready counter, computes the backoff from backlog
    /// and fair-share speed, and schedules the job at `now + backoff`. Falls
    /// back to a fixed base backoff when disabled or when the script errors;
    /// the admission path never fails here.
    pub async fn add_to_non_ready(
        &self,
        job_id: &str,
        group_id: &str,
    ) -> Result<BackoffResult, EngineError> {
        if !self.config.enabled {
            return self.fixed_backoff(job_id, group_id).await;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut conn = self.redis.clone();

        let reply: Result<Vec<i64>, redis::RedisError> = self
            .scripts
            .congestion_backoff
            .key(self.keys.non_ready_queue())
            .key(self.keys.congestion_stats(group_id))
            .key(self.keys.congestion_non_ready_count(group_id))
            .key(self.keys.active_groups())
            .arg(job_id)
            .arg(self.global_rps)
            .arg(self.config.base_backoff_ms)
            .arg(self.config.max_backoff_ms)
            .arg(now_ms)
            .arg(self.config.stats_retention_ms)
            .invoke_async(&mut conn)
            .await;

        match reply {
            Ok(values) => {
                let result = BackoffCalculator::calculate(BackoffParams {
                    non_ready_count: values.get(1).copied().unwrap_or(0).max(0) as u64,
                    rate_limit_speed: values.get(2).copied().unwrap_or(1).max(1) as u64,
                    base_backoff_ms: self.config.base_backoff_ms,
                    max_backoff_ms: self.config.max_backoff_ms,
                });

                debug!(
                    job_id = %job_id,
                    group_id = %group_id,
                    backoff_ms = result.backoff_ms,
                    level = %result.congestion_level,
                    non_ready_count = result.non_ready_count,
                    "Job parked in non-ready queue"
                );

                Ok(result)
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    error = %e,
                    "Congestion backoff failed, falling back to fixed backoff"
                );
                self.fixed_backoff(job_id, group_id).await
            }
        }
    }

    /// Decrements a group's non-ready counter after a promotion batch,
    /// floored at zero. Returns the remaining count; script errors degrade to
    /// zero since this only feeds observability.
    pub async fn release_from_non_ready(&self, group_id: &str, count: u64) -> u64 {
        let mut conn = self.redis.clone();

        let reply: Result<i64, redis::RedisError> = self
            .scripts
            .congestion_release
            .key(self.keys.congestion_non_ready_count(group_id))
            .key(self.keys.congestion_stats(group_id))
            .arg(count)
            .invoke_async(&mut conn)
            .await;

        match reply {
            Ok(remaining) => remaining.max(0) as u64,
            Err(e) => {
                error!(group_id = %group_id, error = %e, "Congestion release failed");
                0
            }
        }
    }

    /// Current congestion view of one group.
    pub async fn get_congestion_state(
        &self,
        group_id: &str,
    ) -> Result<GroupCongestionState, EngineError> {
        let mut conn = self.redis.clone();

        let count: Option<u64> = conn
            .get(self.keys.congestion_non_ready_count(group_id))
            .await?;
        let stats: HashMap<String, String> =
            conn.hgetall(self.keys.congestion_stats(group_id)).await?;
        let active_group_count: u64 = conn.scard(self.keys.active_groups()).await?;

        let rate_limit_speed = (self.global_rps / active_group_count.max(1)).max(1);
        let last_backoff_ms = stats
            .get("lastBackoffMs")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(GroupCongestionState {
            group_id: group_id.to_string(),
            non_ready_count: count.unwrap_or(0),
            rate_limit_speed,
            last_backoff_ms,
            congestion_level: BackoffCalculator::classify(
                last_backoff_ms,
                self.config.base_backoff_ms,
            ),
        })
    }

    /// Congestion rollup across every active group.
    pub async fn get_system_congestion_summary(
        &self,
    ) -> Result<SystemCongestionSummary, EngineError> {
        let mut conn = self.redis.clone();
        let group_ids: Vec<String> = conn.smembers(self.keys.active_groups()).await?;

        let mut groups = Vec::with_capacity(group_ids.len());
        for group_id in &group_ids {
            groups.push(self.get_congestion_state(group_id).await?);
        }

        let total_non_ready_count = groups.iter().map(|g| g.non_ready_count).sum();

        Ok(SystemCongestionSummary {
            total_non_ready_count,
            active_group_count: group_ids.len() as u64,
            groups,
        })
    }

    /// Clears a group's congestion counters, called when it completes.
    pub async fn reset_group_stats(&self, group_id: &str) -> Result<(), EngineError> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .del(&[
                self.keys.congestion_non_ready_count(group_id),
                self.keys.congestion_stats(group_id),
            ])
            .await?;
        Ok(())
    }

    /// Degraded path: fixed base backoff, non-ready counter untouched.
    /// Congestion stats go stale while this path is active.
    async fn fixed_backoff(
        &self,
        job_id: &str,
        group_id: &str,
    ) -> Result<BackoffResult, EngineError> {
        let backoff_ms = self.config.base_backoff_ms;
        let execute_at = chrono::Utc::now().timestamp_millis() + backoff_ms as i64;

        let mut conn = self.redis.clone();
        let _: () = conn
            .zadd(self.keys.non_ready_queue(), job_id, execute_at)
            .await?;

        debug!(
            job_id = %job_id,
            group_id = %group_id,
            backoff_ms,
            "Job parked with fixed backoff"
        );

        Ok(BackoffResult::fixed(backoff_ms))
    }
}
