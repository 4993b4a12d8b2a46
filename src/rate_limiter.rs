//! Fixed-window rate limiting with fair-share division.
//!
//! One global counter and one counter per group, keyed by
//! `floor(now / window)` so a new window starts from zero and old counters
//! expire via TTL. The per-group limit is the global budget divided by the
//! number of active groups; groups self-register on first check and are
//! deactivated when they complete, redistributing their share.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::debug;

use crate::config::BackpressureConfig;
use crate::error::EngineError;
use crate::keys::KeyBuilder;
use crate::scripts::Scripts;

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub global_count: u64,
    pub global_limit: u64,
    pub group_count: u64,
    pub per_group_limit: u64,
}

/// Read-only view of the current window, for observability.
#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    pub global_count: u64,
    pub global_limit: u64,
    pub group_count: u64,
    pub per_group_limit: u64,
    pub active_group_count: u64,
}

pub struct RateLimiter {
    redis: ConnectionManager,
    keys: KeyBuilder,
    scripts: Arc<Scripts>,
    global_rps: u64,
    window_sec: u64,
    key_ttl_sec: u64,
}

impl RateLimiter {
    pub fn new(
        redis: ConnectionManager,
        keys: KeyBuilder,
        scripts: Arc<Scripts>,
        config: &BackpressureConfig,
    ) -> Self {
        Self {
            redis,
            keys,
            scripts,
            global_rps: config.global_rps,
            window_sec: config.rate_limit_window_sec,
            key_ttl_sec: config.rate_limit_key_ttl_sec,
        }
    }

    /// Atomically counts one admission against the current window.
    ///
    /// Registers the group as active, increments both counters, and rolls the
    /// increments back when either the global or the fair-share limit would be
    /// exceeded, so a rejected call never consumes budget.
    pub async fn check_rate_limit(&self, group_id: &str) -> Result<RateLimitResult, EngineError> {
        let window = self.current_window();
        let mut conn = self.redis.clone();

        let reply: Vec<i64> = self
            .scripts
            .rate_limit_check
            .key(self.keys.rate_limit_group(group_id, window))
            .key(self.keys.rate_limit_global(window))
            .key(self.keys.active_groups())
            .arg(self.global_rps)
            .arg(group_id)
            .arg(self.key_ttl_sec)
            .invoke_async(&mut conn)
            .await?;

        let result = RateLimitResult {
            allowed: reply.first().copied().unwrap_or(0) == 1,
            global_count: reply.get(1).copied().unwrap_or(0).max(0) as u64,
            global_limit: reply.get(2).copied().unwrap_or(0).max(0) as u64,
            group_count: reply.get(3).copied().unwrap_or(0).max(0) as u64,
            per_group_limit: reply.get(4).copied().unwrap_or(0).max(0) as u64,
        };

        if !result.allowed {
            debug!(
                group_id = %group_id,
                global = format!("{}/{}", result.global_count, result.global_limit),
                group = format!("{}/{}", result.group_count, result.per_group_limit),
                "Rate limited"
            );
        }

        Ok(result)
    }

    /// Current window counters without consuming budget.
    pub async fn get_status(&self, group_id: &str) -> Result<RateLimitStatus, EngineError> {
        let window = self.current_window();
        let mut conn = self.redis.clone();

        let global_count: Option<u64> = conn.get(self.keys.rate_limit_global(window)).await?;
        let group_count: Option<u64> = conn
            .get(self.keys.rate_limit_group(group_id, window))
            .await?;
        let active_group_count: u64 = conn.scard(self.keys.active_groups()).await?;

        let per_group_limit = (self.global_rps / active_group_count.max(1)).max(1);

        Ok(RateLimitStatus {
            global_count: global_count.unwrap_or(0),
            global_limit: self.global_rps,
            group_count: group_count.unwrap_or(0),
            per_group_limit,
            active_group_count,
        })
    }

    /// Removes a group from fair-share division, typically on completion.
    /// Remaining groups pick up its budget on their next check.
    pub async fn deactivate_group(&self, group_id: &str) -> Result<(), EngineError> {
        let mut conn = self.redis.clone();
        let _: () = conn.srem(self.keys.active_groups(), group_id).await?;
        debug!(group_id = %group_id, "Deactivated group");
        Ok(())
    }

    fn current_window(&self) -> i64 {
        let now_ms = chrono::Utc::now().timestamp_millis();
        now_ms / (self.window_sec as i64 * 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fair_share_division() {
        // Mirrors the Lua: max(1, floor(global / max(1, active))).
        let per_group = |global: u64, active: u64| (global / active.max(1)).max(1);

        assert_eq!(per_group(10, 0), 10);
        assert_eq!(per_group(10, 1), 10);
        assert_eq!(per_group(10, 2), 5);
        assert_eq!(per_group(10, 3), 3);
        // More groups than budget: each still gets a floor of 1.
        assert_eq!(per_group(10, 40), 1);
    }

    #[test]
    fn test_result_reports_rollback_counts() {
        // A rejected reply carries the rolled-back counters, so the reported
        // global count never exceeds the limit.
        let reply: Vec<i64> = vec![0, 10, 10, 10, 10];

        let result = RateLimitResult {
            allowed: reply[0] == 1,
            global_count: reply[1] as u64,
            global_limit: reply[2] as u64,
            group_count: reply[3] as u64,
            per_group_limit: reply[4] as u64,
        };

        assert!(!result.allowed);
        assert!(result.global_count <= result.global_limit);
    }
}
