//! fairbatch: fair, rate-limited bulk job distribution over Redis.
//!
//! Bulk submissions from many tenant groups are scheduled with weighted fair
//! queueing (a shortest-job-first boost favours groups close to completion),
//! admitted through a global and per-group rate limiter, delayed adaptively
//! under congestion, and executed by an in-process worker pool with retry
//! and dead-lettering.
//!
//! ```text
//! submit ──> fair queue ──> fetcher ──> admission ──┬──> ready queue ──> workers
//!            (per-group      (poll)    (rate limit) │      (bounded)
//!             tiers)                                └──> non-ready queue
//!                                                          (delayed)
//!                                          dispatcher <────────┘
//!                                        (promote due jobs)
//! ```
//!
//! All multi-key state transitions run as Lua scripts on a single Redis
//! instance, so concurrent engine processes never observe partial updates.

pub mod backpressure;
pub mod cli;
pub mod config;
pub mod congestion;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fair_queue;
pub mod fetcher;
pub mod job;
pub mod keys;
pub mod processor;
pub mod rate_limiter;
pub mod scripts;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{BulkSubmission, Engine, QueueDepths};
pub use error::EngineError;
pub use fair_queue::EnqueueOptions;
pub use job::{Job, JobStatus, PriorityLevel};
pub use processor::{JobProcessor, ProcessorFailure, ProcessorOutput, ProcessorRegistry};
