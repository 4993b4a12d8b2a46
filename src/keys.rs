//! Redis key construction.
//!
//! Every key the engine touches is built here, under a single configurable
//! prefix, so tenants sharing one Redis instance never collide. Key shapes are
//! also embedded in the Lua scripts (see `scripts.rs`); changing a shape means
//! changing both places.

use crate::job::PriorityLevel;

/// Builds namespaced Redis keys for all engine data structures.
///
/// Pure and deterministic: distinct logical names never map to the same key.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Raw prefix, passed to Lua scripts that derive keys themselves.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // ── Fair queue ──

    /// Sorted set of group ids for one priority tier.
    pub fn fair_queue(&self, level: PriorityLevel) -> String {
        format!("{}fair-queue:{}", self.prefix, level.as_str())
    }

    /// FIFO list of pending job ids for a group.
    pub fn group_jobs(&self, group_id: &str) -> String {
        format!("{}group:{}:jobs", self.prefix, group_id)
    }

    /// Hash of group metadata (totalJobs, doneJobs, status, ...).
    pub fn group_meta(&self, group_id: &str) -> String {
        format!("{}group:{}:meta", self.prefix, group_id)
    }

    /// Hash holding one job record.
    pub fn job(&self, job_id: &str) -> String {
        format!("{}job:{}", self.prefix, job_id)
    }

    // ── Backpressure ──

    /// Bounded list feeding the workers.
    pub fn ready_queue(&self) -> String {
        format!("{}ready-queue", self.prefix)
    }

    /// Sorted set of delayed job ids, scored by due timestamp.
    pub fn non_ready_queue(&self) -> String {
        format!("{}non-ready-queue", self.prefix)
    }

    /// Per-group rate-limit counter for a fixed time window. The `group:`
    /// segment keeps a tenant literally named "global" off the global key.
    pub fn rate_limit_group(&self, group_id: &str, window: i64) -> String {
        format!("{}rate-limit:group:{}:{}", self.prefix, group_id, window)
    }

    /// Global rate-limit counter for a fixed time window.
    pub fn rate_limit_global(&self, window: i64) -> String {
        format!("{}rate-limit:global:{}", self.prefix, window)
    }

    /// Set of groups participating in fair-share division.
    pub fn active_groups(&self) -> String {
        format!("{}active-groups", self.prefix)
    }

    /// List of jobs that exhausted their retries.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}dead-letter-queue", self.prefix)
    }

    // ── Congestion ──

    /// Counter of jobs a group currently has parked in the non-ready queue.
    pub fn congestion_non_ready_count(&self, group_id: &str) -> String {
        format!("{}congestion:{}:non-ready-count", self.prefix, group_id)
    }

    /// Hash of last-computed congestion stats for a group.
    pub fn congestion_stats(&self, group_id: &str) -> String {
        format!("{}congestion:{}:stats", self.prefix, group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        let keys = KeyBuilder::new("bulk-action:");

        assert_eq!(keys.ready_queue(), "bulk-action:ready-queue");
        assert_eq!(keys.non_ready_queue(), "bulk-action:non-ready-queue");
        assert_eq!(keys.job("j1"), "bulk-action:job:j1");
        assert_eq!(keys.group_jobs("g1"), "bulk-action:group:g1:jobs");
        assert_eq!(keys.group_meta("g1"), "bulk-action:group:g1:meta");
        assert_eq!(keys.dead_letter_queue(), "bulk-action:dead-letter-queue");
    }

    #[test]
    fn test_fair_queue_keys_per_tier() {
        let keys = KeyBuilder::new("p:");

        assert_eq!(keys.fair_queue(PriorityLevel::High), "p:fair-queue:high");
        assert_eq!(
            keys.fair_queue(PriorityLevel::Normal),
            "p:fair-queue:normal"
        );
        assert_eq!(keys.fair_queue(PriorityLevel::Low), "p:fair-queue:low");
    }

    #[test]
    fn test_rate_limit_keys_include_window() {
        let keys = KeyBuilder::new("p:");

        assert_eq!(keys.rate_limit_global(17), "p:rate-limit:global:17");
        assert_eq!(keys.rate_limit_group("g1", 17), "p:rate-limit:group:g1:17");
        // Distinct windows never collide.
        assert_ne!(keys.rate_limit_global(17), keys.rate_limit_global(18));
    }

    #[test]
    fn test_group_named_global_does_not_shadow_global_counter() {
        let keys = KeyBuilder::new("p:");

        assert_ne!(keys.rate_limit_group("global", 5), keys.rate_limit_global(5));
    }

    #[test]
    fn test_distinct_logical_names_never_collide() {
        let keys = KeyBuilder::new("p:");

        let all = [
            keys.fair_queue(PriorityLevel::High),
            keys.group_jobs("a"),
            keys.group_meta("a"),
            keys.job("a"),
            keys.ready_queue(),
            keys.non_ready_queue(),
            keys.rate_limit_group("a", 1),
            keys.rate_limit_global(1),
            keys.active_groups(),
            keys.dead_letter_queue(),
            keys.congestion_non_ready_count("a"),
            keys.congestion_stats("a"),
        ];

        for (i, key) in all.iter().enumerate() {
            for other in all.iter().skip(i + 1) {
                assert_ne!(key, other);
            }
        }
    }
}
