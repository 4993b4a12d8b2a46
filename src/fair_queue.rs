//! Per-group fair queue over priority-tier sorted sets.
//!
//! Each priority tier is a sorted set of group ids scored by the fairness
//! formula; each group owns a FIFO list of pending job ids plus a metadata
//! hash. Enqueue, dequeue and ack are single Lua scripts (`scripts.rs`) so
//! they never interleave with concurrent callers.
//!
//! Score convention: dequeue takes the *maximum* score member of a tier.
//! `score = -now_ms + base_priority + alpha * (-1 + total / max(1, total - done))`
//! Higher base priority and a higher completion ratio raise the score; the
//! `-now_ms` term means the group re-scored longest ago wins its tier, which
//! yields round-robin interleaving between otherwise equal groups.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::FairQueueConfig;
use crate::error::EngineError;
use crate::job::{Job, PriorityLevel};
use crate::keys::KeyBuilder;
use crate::scripts::Scripts;

/// Options for a single enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub group_id: String,
    pub job_id: String,
    pub processor_type: String,
    pub payload: serde_json::Value,
    pub base_priority: i64,
    pub priority_level: PriorityLevel,
}

impl EnqueueOptions {
    pub fn new(
        group_id: impl Into<String>,
        job_id: impl Into<String>,
        processor_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            job_id: job_id.into(),
            processor_type: processor_type.into(),
            payload,
            base_priority: 0,
            priority_level: PriorityLevel::Normal,
        }
    }

    pub fn with_base_priority(mut self, base_priority: i64) -> Self {
        self.base_priority = base_priority;
        self
    }

    pub fn with_priority_level(mut self, level: PriorityLevel) -> Self {
        self.priority_level = level;
        self
    }
}

/// Per-tier group counts.
#[derive(Debug, Clone, Default)]
pub struct FairQueueStats {
    pub high_priority_groups: u64,
    pub normal_priority_groups: u64,
    pub low_priority_groups: u64,
}

impl FairQueueStats {
    pub fn total_groups(&self) -> u64 {
        self.high_priority_groups + self.normal_priority_groups + self.low_priority_groups
    }
}

/// Reference copy of the Lua fairness formula.
///
/// The authoritative calculation happens inside `enqueue`/`dequeue` scripts;
/// this struct exists so the formula is unit-testable. Changing the formula
/// means changing the scripts first and mirroring here.
#[derive(Debug, Clone, Copy)]
pub struct PriorityCalculator {
    alpha: f64,
}

impl PriorityCalculator {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    pub fn calculate(&self, now_ms: i64, base_priority: i64, total_jobs: u64, done_jobs: u64) -> f64 {
        let remaining = total_jobs.saturating_sub(done_jobs).max(1) as f64;
        let sjf_boost = self.alpha * (-1.0 + total_jobs as f64 / remaining);

        -(now_ms as f64) + base_priority as f64 + sjf_boost
    }
}

/// Fair scheduler facade over the tier sorted sets and group job lists.
pub struct FairQueue {
    redis: ConnectionManager,
    keys: KeyBuilder,
    scripts: Arc<Scripts>,
    alpha: f64,
}

impl FairQueue {
    pub fn new(
        redis: ConnectionManager,
        keys: KeyBuilder,
        scripts: Arc<Scripts>,
        config: &FairQueueConfig,
    ) -> Self {
        Self {
            redis,
            keys,
            scripts,
            alpha: config.alpha,
        }
    }

    /// Atomically registers a job: writes the PENDING record, appends it to
    /// the group's FIFO list, bumps totalJobs and re-scores the group in its
    /// tier. Returns the group's new totalJobs.
    pub async fn enqueue(&self, options: &EnqueueOptions) -> Result<u64, EngineError> {
        let payload = serde_json::to_string(&options.payload)?;
        let mut conn = self.redis.clone();

        let total: u64 = self
            .scripts
            .enqueue
            .key(self.keys.fair_queue(options.priority_level))
            .key(self.keys.group_jobs(&options.group_id))
            .key(self.keys.group_meta(&options.group_id))
            .key(self.keys.job(&options.job_id))
            .arg(&options.group_id)
            .arg(&options.job_id)
            .arg(payload)
            .arg(options.base_priority)
            .arg(options.priority_level.as_str())
            .arg(self.alpha)
            .arg(&options.processor_type)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!(job_id = %options.job_id, error = %e, "Failed to enqueue job");
                EngineError::Redis(e)
            })?;

        debug!(
            job_id = %options.job_id,
            group_id = %options.group_id,
            level = %options.priority_level,
            total_jobs = total,
            "Enqueued job"
        );

        Ok(total)
    }

    /// Atomically pops the next job, scanning High -> Normal -> Low and
    /// taking the maximum-score group within a tier. Returns `None` when all
    /// tiers are empty.
    pub async fn dequeue(&self) -> Result<Option<Job>, EngineError> {
        let mut conn = self.redis.clone();

        let raw: Option<Vec<String>> = self
            .scripts
            .dequeue
            .key(self.keys.fair_queue(PriorityLevel::High))
            .key(self.keys.fair_queue(PriorityLevel::Normal))
            .key(self.keys.fair_queue(PriorityLevel::Low))
            .arg(self.alpha)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to dequeue");
                EngineError::Redis(e)
            })?;

        match raw {
            Some(fields) => Ok(Job::from_flat_pairs(&fields)),
            None => Ok(None),
        }
    }

    /// Atomically marks a job COMPLETED and bumps the group's doneJobs.
    /// Returns true exactly when this ack completed the group (doneJobs
    /// reached totalJobs, group flipped to AGGREGATING).
    pub async fn ack(&self, job_id: &str, group_id: &str) -> Result<bool, EngineError> {
        let mut conn = self.redis.clone();

        let completed: i64 = self
            .scripts
            .ack
            .key(self.keys.job(job_id))
            .key(self.keys.group_meta(group_id))
            .invoke_async(&mut conn)
            .await?;

        let group_completed = completed == 1;

        if group_completed {
            info!(group_id = %group_id, "Group completed all jobs");
        }

        Ok(group_completed)
    }

    /// Number of jobs still waiting in a group's FIFO list.
    pub async fn group_pending_count(&self, group_id: &str) -> Result<u64, EngineError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.llen(self.keys.group_jobs(group_id)).await?;
        Ok(len)
    }

    /// Group counts per priority tier.
    pub async fn queue_stats(&self) -> Result<FairQueueStats, EngineError> {
        let mut conn = self.redis.clone();

        let high: u64 = conn.zcard(self.keys.fair_queue(PriorityLevel::High)).await?;
        let normal: u64 = conn
            .zcard(self.keys.fair_queue(PriorityLevel::Normal))
            .await?;
        let low: u64 = conn.zcard(self.keys.fair_queue(PriorityLevel::Low)).await?;

        Ok(FairQueueStats {
            high_priority_groups: high,
            normal_priority_groups: normal,
            low_priority_groups: low,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHA: f64 = 10_000.0;

    #[test]
    fn test_no_boost_before_any_completion() {
        let calc = PriorityCalculator::new(ALPHA);

        // total / remaining == 1 when nothing is done, so the boost term is 0.
        let score = calc.calculate(1_000, 0, 5, 0);
        assert!((score - (-1_000.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_base_priority_raises_score() {
        let calc = PriorityCalculator::new(ALPHA);

        let plain = calc.calculate(1_000, 0, 5, 0);
        let boosted = calc.calculate(1_000, 500, 5, 0);

        assert!(boosted > plain);
        assert!((boosted - plain - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_completion_ratio_boost_is_monotone() {
        let calc = PriorityCalculator::new(ALPHA);

        // Same group size, increasing doneJobs: score must strictly rise
        // (shortest-job-first bias toward nearly finished groups).
        let s0 = calc.calculate(1_000, 0, 10, 0);
        let s5 = calc.calculate(1_000, 0, 10, 5);
        let s9 = calc.calculate(1_000, 0, 10, 9);

        assert!(s5 > s0);
        assert!(s9 > s5);
        // 9/10 done: total/remaining = 10 -> boost alpha * 9.
        assert!((s9 - (-1_000.0 + ALPHA * 9.0)).abs() < 1e-9);
    }

    #[test]
    fn test_older_rescore_wins_between_equal_groups() {
        let calc = PriorityCalculator::new(ALPHA);

        // Two identical groups; the one whose score was computed earlier has
        // the higher score under max-first dequeue, giving round-robin.
        let older = calc.calculate(1_000, 0, 3, 0);
        let newer = calc.calculate(2_000, 0, 3, 0);

        assert!(older > newer);
    }

    #[test]
    fn test_remaining_floors_at_one() {
        let calc = PriorityCalculator::new(ALPHA);

        // done == total would divide by zero without the floor.
        let score = calc.calculate(0, 0, 4, 4);
        assert!((score - ALPHA * 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_enqueue_options_builder() {
        let options = EnqueueOptions::new("g1", "j1", "email", serde_json::json!({"n": 1}))
            .with_base_priority(10)
            .with_priority_level(PriorityLevel::High);

        assert_eq!(options.group_id, "g1");
        assert_eq!(options.base_priority, 10);
        assert_eq!(options.priority_level, PriorityLevel::High);
    }

    #[test]
    fn test_fair_queue_stats_total() {
        let stats = FairQueueStats {
            high_priority_groups: 1,
            normal_priority_groups: 2,
            low_priority_groups: 3,
        };

        assert_eq!(stats.total_groups(), 6);
    }
}
