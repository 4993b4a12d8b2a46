//! Dispatcher: promotes expired non-ready jobs into the ready buffer.
//!
//! Runs on a fixed period. Each cycle skips when the ready buffer has no
//! capacity, otherwise atomically moves a batch of due entries (score <= now)
//! via the move-to-ready script, which also decrements each owning group's
//! non-ready counter. Cycle errors are logged and the loop keeps going.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backpressure::ReadyQueue;
use crate::config::BackpressureConfig;
use crate::error::EngineError;
use crate::keys::KeyBuilder;
use crate::scripts::Scripts;

/// Snapshot of cumulative dispatcher counters.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    /// Jobs promoted to the ready buffer.
    pub total_moved: u64,
    /// Cycles run.
    pub cycles: u64,
    /// Cycles skipped because the ready buffer was full.
    pub skipped_cycles: u64,
}

#[derive(Default)]
struct SharedStats {
    total_moved: AtomicU64,
    cycles: AtomicU64,
    skipped_cycles: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            total_moved: self.total_moved.load(Ordering::SeqCst),
            cycles: self.cycles.load(Ordering::SeqCst),
            skipped_cycles: self.skipped_cycles.load(Ordering::SeqCst),
        }
    }
}

/// Shared innards so the loop task and callers see the same state.
struct DispatcherCore {
    redis: ConnectionManager,
    keys: KeyBuilder,
    scripts: Arc<Scripts>,
    ready_queue: ReadyQueue,
    batch_size: u64,
    stats: SharedStats,
}

impl DispatcherCore {
    /// One promotion cycle. Returns the number of jobs moved.
    async fn dispatch(&self) -> Result<u64, EngineError> {
        self.stats.cycles.fetch_add(1, Ordering::SeqCst);

        let remaining = self.ready_queue.capacity_remaining().await?;

        if remaining == 0 {
            self.stats.skipped_cycles.fetch_add(1, Ordering::SeqCst);
            debug!("Ready queue full, skipping dispatch");
            return Ok(0);
        }

        let limit = self.batch_size.min(remaining);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut conn = self.redis.clone();

        let moved: u64 = self
            .scripts
            .move_to_ready
            .key(self.keys.non_ready_queue())
            .key(self.keys.ready_queue())
            .arg(now_ms)
            .arg(limit)
            .arg(self.keys.prefix())
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            self.stats.total_moved.fetch_add(moved, Ordering::SeqCst);
            debug!(moved, "Dispatched jobs from non-ready to ready queue");
        }

        Ok(moved)
    }
}

/// Periodic non-ready -> ready promotion loop.
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
    interval_ms: u64,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        redis: ConnectionManager,
        keys: KeyBuilder,
        scripts: Arc<Scripts>,
        ready_queue: ReadyQueue,
        config: &BackpressureConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            core: Arc::new(DispatcherCore {
                redis,
                keys,
                scripts,
                ready_queue,
                batch_size: config.dispatch_batch_size,
                stats: SharedStats::default(),
            }),
            interval_ms: config.dispatch_interval_ms,
            shutdown_tx,
            handle: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the promotion loop. No-op when already running.
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
                        if let Err(e) = core.dispatch().await {
                            error!(error = %e, "Dispatch cycle failed");
                        }
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
        }));

        info!(interval_ms = self.interval_ms, "Dispatcher started");
    }

    /// Signals the loop to stop and waits for the current cycle to finish.
    pub async fn stop(&mut self) {
        // Send error just means the loop already exited.
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher task panicked");
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Dispatcher stopped");
    }

    /// Runs one cycle outside the periodic loop, for drains and tests.
    pub async fn dispatch_once(&self) -> Result<u64, EngineError> {
        self.core.dispatch().await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DispatcherStats {
        self.core.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = SharedStats::default();

        stats.cycles.fetch_add(3, Ordering::SeqCst);
        stats.total_moved.fetch_add(25, Ordering::SeqCst);
        stats.skipped_cycles.fetch_add(1, Ordering::SeqCst);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 3);
        assert_eq!(snapshot.total_moved, 25);
        assert_eq!(snapshot.skipped_cycles, 1);
    }

    #[test]
    fn test_batch_respects_capacity() {
        // The effective limit is whichever is smaller: configured batch size
        // or free slots in the ready buffer.
        let limit = |batch: u64, remaining: u64| batch.min(remaining);

        assert_eq!(limit(100, 1000), 100);
        assert_eq!(limit(100, 7), 7);
        assert_eq!(limit(100, 0), 0);
    }
}
