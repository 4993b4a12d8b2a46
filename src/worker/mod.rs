//! Worker pool: fetcher + dispatcher + N workers over a shared lifecycle.
//!
//! The pool owns the full consumption side of the engine. Each worker gets
//! its own redis connection because `BLPOP` parks the connection it runs on;
//! sharing the multiplexed manager would stall every other command behind
//! the block. Shutdown is ordered to drain rather than drop work: the
//! fetcher stops feeding first, workers finish their in-flight job under a
//! grace period, and the dispatcher stops last so delayed jobs keep moving
//! to the ready buffer until the end.

mod worker;

pub use worker::{Worker, WorkerSnapshot, WorkerState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use crate::backpressure::{Backpressure, ReadyQueue};
use crate::config::WorkerPoolConfig;
use crate::congestion::CongestionControl;
use crate::dispatcher::{Dispatcher, DispatcherStats};
use crate::error::EngineError;
use crate::fair_queue::FairQueue;
use crate::fetcher::{Fetcher, FetcherStats};
use crate::job::{DeadLetterEntry, Job, JobStatus};
use crate::keys::KeyBuilder;
use crate::processor::{JobProcessor, ProcessorFailure, ProcessorRegistry};
use crate::rate_limiter::RateLimiter;
use crate::scripts::Scripts;

/// What every worker needs to take a job from ready to its terminal state.
pub(crate) struct JobLifecycle {
    redis: ConnectionManager,
    keys: KeyBuilder,
    fair_queue: Arc<FairQueue>,
    backpressure: Arc<Backpressure>,
    congestion: Arc<CongestionControl>,
    rate_limiter: Arc<RateLimiter>,
    processors: Arc<ProcessorRegistry>,
    max_retry_count: u32,
}

impl JobLifecycle {
    pub(crate) async fn load_job(&self, job_id: &str) -> Result<Option<Job>, EngineError> {
        let mut conn = self.redis.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(self.keys.job(job_id)).await?;
        Ok(Job::from_hash(&fields))
    }

    pub(crate) fn processor_for(&self, kind: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(kind).cloned()
    }

    /// Acks a completed job. Worker loops must survive redis hiccups, so
    /// errors are logged here rather than propagated.
    pub(crate) async fn handle_complete(&self, job: &Job) {
        match self.fair_queue.ack(&job.id, &job.group_id).await {
            Ok(group_completed) => {
                if group_completed {
                    self.finalize_group(&job.group_id).await;
                }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to ack completed job");
            }
        }
    }

    /// Retryable failure: bump the retry counter and re-admit through the
    /// non-ready queue, or dead-letter once the budget is spent.
    pub(crate) async fn handle_failed(&self, job: &Job, failure: &ProcessorFailure) {
        if job.retry_count >= self.max_retry_count {
            self.dead_letter(job, &failure.to_string()).await;
            return;
        }

        let mut conn = self.redis.clone();
        let job_key = self.keys.job(&job.id);

        let new_retry_count: i64 = match conn.hincr(&job_key, "retryCount", 1i64).await {
            Ok(count) => count,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to bump retry count");
                return;
            }
        };

        if let Err(e) = conn
            .hset::<_, _, _, ()>(&job_key, "status", JobStatus::Pending.as_str())
            .await
        {
            error!(job_id = %job.id, error = %e, "Failed to reset job status for retry");
        }

        let result = self
            .backpressure
            .requeue(&job.id, &job.group_id, new_retry_count.max(0) as u32)
            .await;

        match result {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    retry_count = new_retry_count,
                    max_retries = self.max_retry_count,
                    "Job scheduled for retry"
                );
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to requeue job for retry");
            }
        }
    }

    /// Records an exhausted or permanently failed job and still acks it so
    /// group progress can complete. Dead-lettered jobs count as done.
    pub(crate) async fn dead_letter(&self, job: &Job, error_message: &str) {
        let entry = DeadLetterEntry {
            job: job.clone(),
            error: error_message.to_string(),
            failed_at: chrono::Utc::now().timestamp_millis(),
            retry_count: job.retry_count,
        };

        let mut conn = self.redis.clone();

        match serde_json::to_string(&entry) {
            Ok(serialized) => {
                if let Err(e) = conn
                    .rpush::<_, _, ()>(self.keys.dead_letter_queue(), serialized)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Failed to push dead letter entry");
                }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to serialize dead letter entry");
            }
        }

        if let Err(e) = conn
            .hset::<_, _, _, ()>(self.keys.job(&job.id), "status", JobStatus::Failed.as_str())
            .await
        {
            error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
        }

        warn!(
            job_id = %job.id,
            group_id = %job.group_id,
            retry_count = job.retry_count,
            error = %error_message,
            "Job dead-lettered"
        );

        match self.fair_queue.ack(&job.id, &job.group_id).await {
            Ok(group_completed) => {
                if group_completed {
                    self.finalize_group(&job.group_id).await;
                }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to ack dead-lettered job");
            }
        }
    }

    /// Post-completion cleanup once every job in a group is done.
    async fn finalize_group(&self, group_id: &str) {
        info!(group_id = %group_id, "Group completed");

        if let Err(e) = self.congestion.reset_group_stats(group_id).await {
            warn!(group_id = %group_id, error = %e, "Failed to reset congestion stats");
        }

        if let Err(e) = self.rate_limiter.deactivate_group(group_id).await {
            warn!(group_id = %group_id, error = %e, "Failed to deactivate group");
        }
    }
}

/// Point-in-time view of the whole consumption side.
#[derive(Debug)]
pub struct PoolStatus {
    pub worker_count: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub fetcher_running: bool,
    pub dispatcher_running: bool,
    pub fetcher_stats: FetcherStats,
    pub dispatcher_stats: DispatcherStats,
    pub workers: Vec<WorkerSnapshot>,
    pub is_shutting_down: bool,
}

pub struct WorkerPool {
    client: redis::Client,
    keys: KeyBuilder,
    scripts: Arc<Scripts>,
    config: WorkerPoolConfig,
    ready_queue_max_size: u64,
    lifecycle: Arc<JobLifecycle>,
    fetcher: Fetcher,
    dispatcher: Dispatcher,
    workers: Vec<Worker>,
    is_running: bool,
    is_shutting_down: Arc<AtomicBool>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: redis::Client,
        redis: ConnectionManager,
        keys: KeyBuilder,
        scripts: Arc<Scripts>,
        fair_queue: Arc<FairQueue>,
        backpressure: Arc<Backpressure>,
        congestion: Arc<CongestionControl>,
        rate_limiter: Arc<RateLimiter>,
        processors: Arc<ProcessorRegistry>,
        fetcher: Fetcher,
        dispatcher: Dispatcher,
        config: WorkerPoolConfig,
        ready_queue_max_size: u64,
    ) -> Self {
        let lifecycle = Arc::new(JobLifecycle {
            redis,
            keys: keys.clone(),
            fair_queue,
            backpressure,
            congestion,
            rate_limiter,
            processors,
            max_retry_count: config.max_retry_count,
        });

        Self {
            client,
            keys,
            scripts,
            config,
            ready_queue_max_size,
            lifecycle,
            fetcher,
            dispatcher,
            workers: Vec::new(),
            is_running: false,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the dispatcher, fetcher and all workers.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.is_running {
            return Err(EngineError::AlreadyRunning);
        }

        info!(
            worker_count = self.config.worker_count,
            processors = ?self.lifecycle.processors.kinds(),
            "Starting worker pool"
        );

        // All connections are opened before anything is spawned, so a
        // failure here cannot leave a half-started pool that shutdown()
        // would then refuse to stop.
        let connections =
            worker_connections(&self.client, self.config.worker_count).await?;

        self.dispatcher.start();
        self.fetcher.start();

        for (id, conn) in connections.into_iter().enumerate() {
            let ready_queue = ReadyQueue::new(
                conn,
                self.keys.clone(),
                Arc::clone(&self.scripts),
                self.ready_queue_max_size,
            );

            let mut worker = Worker::new(
                id,
                ready_queue,
                Arc::clone(&self.lifecycle),
                self.config.worker_timeout_sec,
                self.config.job_timeout(),
            );
            worker.start();
            self.workers.push(worker);
        }

        self.is_running = true;
        info!("Worker pool started");
        Ok(())
    }

    /// Graceful shutdown: stop intake, drain workers under the grace
    /// period, then stop the dispatcher.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        if !self.is_running {
            return Err(EngineError::NotRunning);
        }
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down worker pool");

        self.fetcher.stop().await;
        debug!("Fetcher stopped");

        for worker in &self.workers {
            worker.signal_stop();
        }

        let handles: Vec<_> = self
            .workers
            .iter_mut()
            .filter_map(|w| w.take_handle())
            .collect();

        let grace = self.config.shutdown_grace_period();
        let drained = tokio::time::timeout(grace, futures::future::join_all(handles)).await;

        match drained {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task panicked");
                    }
                }
                debug!("All workers drained");
            }
            Err(_) => {
                // Abandoned, not killed: the tasks keep running detached
                // and their in-flight jobs will be retried by timeout.
                let stragglers: Vec<usize> = self
                    .workers
                    .iter()
                    .filter(|w| w.state() != WorkerState::Stopped)
                    .map(|w| w.snapshot().id)
                    .collect();
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    stragglers = ?stragglers,
                    "Shutdown grace period exceeded, abandoning workers"
                );
            }
        }

        self.dispatcher.stop().await;
        debug!("Dispatcher stopped");

        self.is_running = false;
        info!("Worker pool shut down");
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        let workers: Vec<WorkerSnapshot> = self.workers.iter().map(|w| w.snapshot()).collect();

        let active = workers
            .iter()
            .filter(|w| w.state == WorkerState::Running && w.current_job.is_some())
            .count();
        let idle = workers
            .iter()
            .filter(|w| w.state == WorkerState::Running && w.current_job.is_none())
            .count();

        PoolStatus {
            worker_count: self.config.worker_count,
            active_workers: active,
            idle_workers: idle,
            fetcher_running: self.fetcher.is_running(),
            dispatcher_running: self.dispatcher.is_running(),
            fetcher_stats: self.fetcher.stats(),
            dispatcher_stats: self.dispatcher.stats(),
            workers,
            is_shutting_down: self.is_shutting_down.load(Ordering::SeqCst),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }
}

/// Opens one dedicated connection per worker. `BLPOP` parks the connection
/// it runs on, so workers never share the multiplexed manager.
async fn worker_connections(
    client: &redis::Client,
    count: usize,
) -> Result<Vec<ConnectionManager>, EngineError> {
    let mut connections = Vec::with_capacity(count);

    for _ in 0..count {
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| EngineError::ConnectionFailed(e.to_string()))?;
        connections.push(conn);
    }

    Ok(connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_batch_fails_before_any_worker_exists() {
        // Nothing listens on port 1, so the connect attempt is refused and
        // the caller gets the error before it has spawned a single task.
        let client = redis::Client::open("redis://127.0.0.1:1/").expect("url should parse");

        let result = worker_connections(&client, 3).await;

        assert!(matches!(result, Err(EngineError::ConnectionFailed(_))));
    }
}
