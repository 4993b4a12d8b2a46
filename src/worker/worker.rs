//! A single worker: blocking-pop, dispatch, timeout, completion signalling.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backpressure::ReadyQueue;
use crate::processor::ProcessorFailure;

use super::JobLifecycle;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Running => 1,
            WorkerState::Stopping => 2,
            WorkerState::Stopped => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of one worker, for pool status reports.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub state: WorkerState,
    pub current_job: Option<String>,
}

/// State shared between the worker handle and its loop task.
struct WorkerShared {
    id: usize,
    state: AtomicU8,
    current_job: Mutex<Option<String>>,
}

impl WorkerShared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn set_current_job(&self, job_id: Option<String>) {
        // Lock only guards this Option; a poisoned lock means a panicked
        // status reader, safe to shrug off.
        if let Ok(mut guard) = self.current_job.lock() {
            *guard = job_id;
        }
    }

    fn current_job(&self) -> Option<String> {
        self.current_job.lock().ok().and_then(|g| g.clone())
    }
}

/// One worker loop: Idle -> Running -> Stopping -> Stopped.
pub struct Worker {
    shared: Arc<WorkerShared>,
    ready_queue: ReadyQueue,
    lifecycle: Arc<JobLifecycle>,
    pop_timeout_sec: u64,
    job_timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(super) fn new(
        id: usize,
        ready_queue: ReadyQueue,
        lifecycle: Arc<JobLifecycle>,
        pop_timeout_sec: u64,
        job_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                id,
                state: AtomicU8::new(WorkerState::Idle.as_u8()),
                current_job: Mutex::new(None),
            }),
            ready_queue,
            lifecycle,
            pop_timeout_sec,
            job_timeout,
            handle: None,
        }
    }

    /// Spawns the worker loop. No-op unless the worker is Idle.
    pub fn start(&mut self) {
        if self.shared.state() != WorkerState::Idle {
            return;
        }

        self.shared.set_state(WorkerState::Running);

        let shared = Arc::clone(&self.shared);
        let ready_queue = self.ready_queue.clone();
        let lifecycle = Arc::clone(&self.lifecycle);
        let pop_timeout_sec = self.pop_timeout_sec;
        let job_timeout = self.job_timeout;

        self.handle = Some(tokio::spawn(async move {
            Self::run(shared, ready_queue, lifecycle, pop_timeout_sec, job_timeout).await;
        }));

        debug!(worker_id = self.shared.id, "Worker started");
    }

    /// Asks the loop to stop after its in-flight job, if any.
    pub fn signal_stop(&self) {
        if self.shared.state() == WorkerState::Running {
            self.shared.set_state(WorkerState::Stopping);
        }
    }

    /// Takes the loop task handle so the pool can await it under a deadline.
    pub(super) fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.shared.id,
            state: self.shared.state(),
            current_job: self.shared.current_job(),
        }
    }

    async fn run(
        shared: Arc<WorkerShared>,
        ready_queue: ReadyQueue,
        lifecycle: Arc<JobLifecycle>,
        pop_timeout_sec: u64,
        job_timeout: Duration,
    ) {
        info!(worker_id = shared.id, "Worker loop running");

        while shared.state() == WorkerState::Running {
            // The blocking pop is the suspension point: a timed-out pop
            // returns None and loops back to the stop-signal check above.
            match ready_queue.blocking_pop(pop_timeout_sec).await {
                Ok(Some(job_id)) => {
                    Self::process(&shared, &lifecycle, &job_id, job_timeout).await;
                }
                Ok(None) => {
                    debug!(worker_id = shared.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = shared.id, error = %e, "Failed to pop from ready queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        shared.set_state(WorkerState::Stopped);
        info!(worker_id = shared.id, "Worker loop stopped");
    }

    async fn process(
        shared: &WorkerShared,
        lifecycle: &JobLifecycle,
        job_id: &str,
        job_timeout: Duration,
    ) {
        let job = match lifecycle.load_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(worker_id = shared.id, job_id = %job_id, "Job record missing, skipping");
                return;
            }
            Err(e) => {
                error!(worker_id = shared.id, job_id = %job_id, error = %e, "Failed to load job");
                return;
            }
        };

        shared.set_current_job(Some(job.id.clone()));
        let started = std::time::Instant::now();

        let Some(processor) = lifecycle.processor_for(&job.processor_type) else {
            // An unknown type is a retryable error: the processor may simply
            // not be registered on this replica yet.
            let failure = ProcessorFailure::retryable(format!(
                "No processor registered for job type: {}",
                job.processor_type
            ));
            lifecycle.handle_failed(&job, &failure).await;
            shared.set_current_job(None);
            return;
        };

        // The timeout races the processor; tokio cancels the losing branch,
        // so no timer is left pending either way.
        let outcome = tokio::time::timeout(job_timeout, processor.process(&job)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(_output)) => {
                debug!(
                    worker_id = shared.id,
                    job_id = %job.id,
                    duration_ms,
                    "Job completed"
                );
                lifecycle.handle_complete(&job).await;
            }
            Ok(Err(failure)) if failure.retryable => {
                warn!(
                    worker_id = shared.id,
                    job_id = %job.id,
                    error = %failure,
                    duration_ms,
                    "Job failed, retryable"
                );
                lifecycle.handle_failed(&job, &failure).await;
            }
            Ok(Err(failure)) => {
                error!(
                    worker_id = shared.id,
                    job_id = %job.id,
                    error = %failure,
                    "Job failed permanently"
                );
                lifecycle.dead_letter(&job, &failure.to_string()).await;
            }
            Err(_elapsed) => {
                let failure = ProcessorFailure::retryable(format!(
                    "Job {} timed out after {}ms",
                    job.id,
                    job_timeout.as_millis()
                ));
                warn!(worker_id = shared.id, job_id = %job.id, error = %failure, "Job timed out");
                lifecycle.handle_failed(&job, &failure).await;
            }
        }

        shared.set_current_job(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            WorkerState::Idle,
            WorkerState::Running,
            WorkerState::Stopping,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_shared_state_transitions() {
        let shared = WorkerShared {
            id: 0,
            state: AtomicU8::new(WorkerState::Idle.as_u8()),
            current_job: Mutex::new(None),
        };

        assert_eq!(shared.state(), WorkerState::Idle);

        shared.set_state(WorkerState::Running);
        assert_eq!(shared.state(), WorkerState::Running);

        shared.set_current_job(Some("j1".to_string()));
        assert_eq!(shared.current_job().as_deref(), Some("j1"));

        shared.set_current_job(None);
        assert!(shared.current_job().is_none());

        shared.set_state(WorkerState::Stopped);
        assert_eq!(shared.state(), WorkerState::Stopped);
    }
}
