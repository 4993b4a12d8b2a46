//! The engine facade: wires every component to one Redis instance and
//! exposes the submission and inspection API.

use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;
use uuid::Uuid;

use crate::backpressure::{Backpressure, NonReadyQueue, ReadyQueue};
use crate::config::EngineConfig;
use crate::congestion::CongestionControl;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::fetcher::Fetcher;
use crate::fair_queue::{EnqueueOptions, FairQueue, FairQueueStats};
use crate::job::{
    CongestionSnapshot, DeadLetterEntry, GroupMeta, GroupProgress, Job, PriorityLevel,
};
use crate::keys::KeyBuilder;
use crate::processor::ProcessorRegistry;
use crate::rate_limiter::RateLimiter;
use crate::scripts::Scripts;
use crate::worker::{PoolStatus, WorkerPool};

/// Depths of every queueing structure, for dashboards and the CLI.
#[derive(Debug, Clone)]
pub struct QueueDepths {
    pub fair_queue: FairQueueStats,
    pub ready: u64,
    pub non_ready: u64,
    pub dead_letter: u64,
}

/// One bulk submission: a group of jobs sharing a processor and priority.
#[derive(Debug, Clone)]
pub struct BulkSubmission {
    pub group_id: String,
    pub processor_type: String,
    pub payloads: Vec<serde_json::Value>,
    pub base_priority: i64,
    pub priority_level: PriorityLevel,
}

impl BulkSubmission {
    pub fn new(
        group_id: impl Into<String>,
        processor_type: impl Into<String>,
        payloads: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            processor_type: processor_type.into(),
            payloads,
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

/// Bulk job distribution engine over a single Redis instance.
///
/// Construction wires the fair queue, admission control, congestion control
/// and the worker pool to one connection manager; `start` brings up the
/// moving parts, `shutdown` drains them in order.
pub struct Engine {
    redis: ConnectionManager,
    keys: KeyBuilder,
    fair_queue: Arc<FairQueue>,
    congestion: Arc<CongestionControl>,
    non_ready_queue: NonReadyQueue,
    ready_queue: ReadyQueue,
    pool: WorkerPool,
}

impl Engine {
    /// Connects to Redis and wires all components.
    ///
    /// The registry maps processor types to handlers; jobs whose type has no
    /// handler are retried and eventually dead-lettered.
    pub async fn connect(
        config: EngineConfig,
        processors: ProcessorRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let client = redis::Client::open(config.redis.url.as_str())
            .map_err(|e| EngineError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| EngineError::ConnectionFailed(e.to_string()))?;

        info!(url = %config.redis.url, prefix = %config.redis.key_prefix, "Connected to Redis");

        let keys = KeyBuilder::new(&config.redis.key_prefix);
        let scripts = Arc::new(Scripts::new());
        let processors = Arc::new(processors);

        let fair_queue = Arc::new(FairQueue::new(
            redis.clone(),
            keys.clone(),
            Arc::clone(&scripts),
            &config.fair_queue,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            redis.clone(),
            keys.clone(),
            Arc::clone(&scripts),
            &config.backpressure,
        ));

        let congestion = Arc::new(CongestionControl::new(
            redis.clone(),
            keys.clone(),
            Arc::clone(&scripts),
            config.congestion.clone(),
            &config.backpressure,
        ));

        let ready_queue = ReadyQueue::new(
            redis.clone(),
            keys.clone(),
            Arc::clone(&scripts),
            config.backpressure.ready_queue_max_size,
        );

        let non_ready_queue = NonReadyQueue::new(redis.clone(), keys.clone(), &config.backpressure);

        let backpressure = Arc::new(Backpressure::new(
            Arc::clone(&rate_limiter),
            ready_queue.clone(),
            non_ready_queue.clone(),
            Arc::clone(&congestion),
        ));

        let dispatcher = Dispatcher::new(
            redis.clone(),
            keys.clone(),
            Arc::clone(&scripts),
            ready_queue.clone(),
            &config.backpressure,
        );

        let fetcher = Fetcher::new(
            Arc::clone(&fair_queue),
            Arc::clone(&backpressure),
            ready_queue.clone(),
            &config.worker_pool,
        );

        let pool = WorkerPool::new(
            client,
            redis.clone(),
            keys.clone(),
            Arc::clone(&scripts),
            Arc::clone(&fair_queue),
            Arc::clone(&backpressure),
            Arc::clone(&congestion),
            Arc::clone(&rate_limiter),
            processors,
            fetcher,
            dispatcher,
            config.worker_pool.clone(),
            config.backpressure.ready_queue_max_size,
        );

        Ok(Self {
            redis,
            keys,
            fair_queue,
            congestion,
            non_ready_queue,
            ready_queue,
            pool,
        })
    }

    /// Starts the fetcher, dispatcher and workers.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.pool.start().await
    }

    /// Drains and stops the moving parts.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.pool.shutdown().await
    }

    /// Submits a single job into its group's fair queue.
    ///
    /// Returns the group's total job count after the insert.
    pub async fn submit_job(&self, options: &EnqueueOptions) -> Result<u64, EngineError> {
        self.fair_queue.enqueue(options).await
    }

    /// Submits a batch of payloads as one group. Returns the generated job
    /// ids in payload order.
    pub async fn submit_bulk(
        &self,
        submission: &BulkSubmission,
    ) -> Result<Vec<String>, EngineError> {
        let mut job_ids = Vec::with_capacity(submission.payloads.len());

        for payload in &submission.payloads {
            let job_id = Uuid::new_v4().to_string();
            let options = EnqueueOptions::new(
                &submission.group_id,
                &job_id,
                &submission.processor_type,
                payload.clone(),
            )
            .with_base_priority(submission.base_priority)
            .with_priority_level(submission.priority_level);

            self.fair_queue.enqueue(&options).await?;
            job_ids.push(job_id);
        }

        info!(
            group_id = %submission.group_id,
            job_count = job_ids.len(),
            processor_type = %submission.processor_type,
            "Bulk submission enqueued"
        );

        Ok(job_ids)
    }

    /// Loads one job record.
    pub async fn get_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.job(job_id)).await?;

        Job::from_hash(&fields).ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    /// Builds a progress report for one group, including its congestion
    /// state and how many of its jobs still sit in the fair queue.
    pub async fn get_group_progress(&self, group_id: &str) -> Result<GroupProgress, EngineError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.group_meta(group_id)).await?;

        let meta = GroupMeta::from_hash(&fields)
            .ok_or_else(|| EngineError::GroupNotFound(group_id.to_string()))?;

        let pending = self.fair_queue.group_pending_count(group_id).await?;
        let congestion = self.congestion.get_congestion_state(group_id).await?;

        Ok(GroupProgress {
            group_id: meta.group_id,
            total_jobs: meta.total_jobs,
            done_jobs: meta.done_jobs,
            pending_in_queue: pending,
            progress_percent: GroupProgress::percent(meta.done_jobs, meta.total_jobs),
            status: meta.status.as_str().to_string(),
            congestion: CongestionSnapshot {
                level: congestion.congestion_level.as_str().to_string(),
                non_ready_count: congestion.non_ready_count,
                last_backoff_ms: congestion.last_backoff_ms,
            },
        })
    }

    /// Current depth of every queueing structure.
    pub async fn queue_depths(&self) -> Result<QueueDepths, EngineError> {
        let mut conn = self.redis.clone();

        let fair_queue = self.fair_queue.queue_stats().await?;
        let ready = self.ready_queue.size().await?;
        let non_ready = self.non_ready_queue.size().await?;
        let dead_letter: u64 = conn.llen(self.keys.dead_letter_queue()).await?;

        Ok(QueueDepths {
            fair_queue,
            ready,
            non_ready,
            dead_letter,
        })
    }

    /// Reads up to `limit` dead-letter entries, oldest first. Entries that
    /// fail to deserialize are skipped.
    pub async fn peek_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, EngineError> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn
            .lrange(self.keys.dead_letter_queue(), 0, limit as isize - 1)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_submission_builder() {
        let submission = BulkSubmission::new(
            "grp-1",
            "echo",
            vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})],
        )
        .with_base_priority(500)
        .with_priority_level(PriorityLevel::High);

        assert_eq!(submission.group_id, "grp-1");
        assert_eq!(submission.payloads.len(), 2);
        assert_eq!(submission.base_priority, 500);
        assert_eq!(submission.priority_level, PriorityLevel::High);
    }
}
