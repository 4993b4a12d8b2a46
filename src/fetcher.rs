//! Fetcher: pulls from the fair queue and runs admission control.
//!
//! Runs on a fixed period. Each cycle dequeues up to a batch of jobs,
//! stopping early when the ready buffer lacks capacity, when the fair queue
//! is empty, or when admission rejects a job outright (back off until the
//! next cycle). Cycle errors are logged and the loop keeps going.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backpressure::{Backpressure, Destination, ReadyQueue};
use crate::config::WorkerPoolConfig;
use crate::error::EngineError;
use crate::fair_queue::FairQueue;

/// Snapshot of cumulative fetcher counters.
#[derive(Debug, Clone, Default)]
pub struct FetcherStats {
    pub total_fetched: u64,
    pub total_admitted_ready: u64,
    pub total_admitted_non_ready: u64,
    pub total_rejected: u64,
    pub total_empty_polls: u64,
}

#[derive(Default)]
struct SharedStats {
    total_fetched: AtomicU64,
    total_admitted_ready: AtomicU64,
    total_admitted_non_ready: AtomicU64,
    total_rejected: AtomicU64,
    total_empty_polls: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> FetcherStats {
        FetcherStats {
            total_fetched: self.total_fetched.load(Ordering::SeqCst),
            total_admitted_ready: self.total_admitted_ready.load(Ordering::SeqCst),
            total_admitted_non_ready: self.total_admitted_non_ready.load(Ordering::SeqCst),
            total_rejected: self.total_rejected.load(Ordering::SeqCst),
            total_empty_polls: self.total_empty_polls.load(Ordering::SeqCst),
        }
    }
}

struct FetcherCore {
    fair_queue: Arc<FairQueue>,
    backpressure: Arc<Backpressure>,
    ready_queue: ReadyQueue,
    batch_size: u64,
    stats: SharedStats,
}

impl FetcherCore {
    /// One fetch cycle. Returns the number of jobs accepted this cycle.
    async fn fetch_cycle(&self) -> Result<u64, EngineError> {
        let mut fetched = 0;

        while fetched < self.batch_size {
            if !self.ready_queue.has_capacity().await? {
                debug!("Ready queue full, pausing fetch cycle");
                break;
            }

            let Some(job) = self.fair_queue.dequeue().await? else {
                self.stats.total_empty_polls.fetch_add(1, Ordering::SeqCst);
                break;
            };

            let outcome = self.backpressure.admit(&job).await?;
            self.stats.total_fetched.fetch_add(1, Ordering::SeqCst);

            match outcome.destination {
                Destination::Ready => {
                    self.stats.total_admitted_ready.fetch_add(1, Ordering::SeqCst);
                }
                Destination::NonReady => {
                    self.stats
                        .total_admitted_non_ready
                        .fetch_add(1, Ordering::SeqCst);
                }
                Destination::Rejected => {
                    self.stats.total_rejected.fetch_add(1, Ordering::SeqCst);
                }
            }

            if !outcome.accepted {
                // The job left the fair queue when we dequeued it; park it
                // in the non-ready buffer so it is not lost, then back off
                // until the next cycle.
                self.backpressure
                    .requeue(&job.id, &job.group_id, 0)
                    .await?;
                break;
            }

            fetched += 1;
        }

        if fetched > 0 {
            debug!(fetched, "Fetched jobs from fair queue");
        }

        Ok(fetched)
    }
}

/// Periodic fair-queue -> admission loop.
pub struct Fetcher {
    core: Arc<FetcherCore>,
    interval_ms: u64,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
}

impl Fetcher {
    pub fn new(
        fair_queue: Arc<FairQueue>,
        backpressure: Arc<Backpressure>,
        ready_queue: ReadyQueue,
        config: &WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            core: Arc::new(FetcherCore {
                fair_queue,
                backpressure,
                ready_queue,
                batch_size: config.fetch_batch_size,
                stats: SharedStats::default(),
            }),
            interval_ms: config.fetch_interval_ms,
            shutdown_tx,
            handle: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the fetch loop. No-op when already running.
    pub fn start(&mut self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let core = Arc::clone(&self.core);
        let running = Arc::clone(&self.is_running);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = std::time::Duration::from_millis(self.interval_ms);

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = core.fetch_cycle().await {
                            error!(error = %e, "Fetch cycle failed");
                        }
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
        }));

        info!(
            interval_ms = self.interval_ms,
            batch_size = self.core.batch_size,
            "Fetcher started"
        );
    }

    /// Signals the loop to stop and waits for the current cycle to finish.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Fetcher task panicked");
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Fetcher stopped");
    }

    /// Runs one cycle outside the periodic loop, for drains and tests.
    pub async fn fetch_once(&self) -> Result<u64, EngineError> {
        self.core.fetch_cycle().await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> FetcherStats {
        self.core.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = SharedStats::default();

        stats.total_fetched.fetch_add(10, Ordering::SeqCst);
        stats.total_admitted_ready.fetch_add(7, Ordering::SeqCst);
        stats.total_admitted_non_ready.fetch_add(2, Ordering::SeqCst);
        stats.total_rejected.fetch_add(1, Ordering::SeqCst);
        stats.total_empty_polls.fetch_add(4, Ordering::SeqCst);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_fetched, 10);
        assert_eq!(snapshot.total_admitted_ready, 7);
        assert_eq!(snapshot.total_admitted_non_ready, 2);
        assert_eq!(snapshot.total_rejected, 1);
        assert_eq!(snapshot.total_empty_polls, 4);
    }
}
