//! Admission control: routes dequeued jobs to ready, non-ready or rejection.
//!
//! `admit` is the single gate between the fair queue and the workers. It
//! checks ready-buffer capacity, runs the rate limiter, and on denial hands
//! the job to congestion control for adaptive delay. Capacity is re-checked
//! at push time because another admitter may fill the buffer in between.

mod non_ready_queue;
mod ready_queue;

pub use non_ready_queue::{NonReadyQueue, NonReadyReason};
pub use ready_queue::ReadyQueue;

use std::fmt;
use std::sync::Arc;

use crate::congestion::{BackoffResult, CongestionControl};
use crate::error::EngineError;
use crate::job::Job;
use crate::rate_limiter::{RateLimitResult, RateLimiter};

/// Where an admitted job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Ready,
    NonReady,
    Rejected,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Destination::Ready => "ready",
            Destination::NonReady => "non-ready",
            Destination::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Tri-state admission outcome with a human-readable reason.
#[derive(Debug, Clone)]
pub struct AdmitOutcome {
    pub accepted: bool,
    pub destination: Destination,
    pub reason: Option<String>,
}

impl AdmitOutcome {
    pub fn ready() -> Self {
        Self {
            accepted: true,
            destination: Destination::Ready,
            reason: None,
        }
    }

    pub fn non_ready(rate_limit: &RateLimitResult, backoff: &BackoffResult) -> Self {
        Self {
            accepted: true,
            destination: Destination::NonReady,
            reason: Some(format!(
                "Rate limited (global: {}/{}, group: {}/{}, congestion: {})",
                rate_limit.global_count,
                rate_limit.global_limit,
                rate_limit.group_count,
                rate_limit.per_group_limit,
                backoff.congestion_level,
            )),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            destination: Destination::Rejected,
            reason: Some(reason.into()),
        }
    }
}

pub struct Backpressure {
    rate_limiter: Arc<RateLimiter>,
    ready_queue: ReadyQueue,
    non_ready_queue: NonReadyQueue,
    congestion: Arc<CongestionControl>,
}

impl Backpressure {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        ready_queue: ReadyQueue,
        non_ready_queue: NonReadyQueue,
        congestion: Arc<CongestionControl>,
    ) -> Self {
        Self {
            rate_limiter,
            ready_queue,
            non_ready_queue,
            congestion,
        }
    }

    /// Admits one dequeued job.
    ///
    /// Rejected only when the ready buffer is full; a rate-limited job is
    /// still accepted, just delayed through the non-ready queue.
    pub async fn admit(&self, job: &Job) -> Result<AdmitOutcome, EngineError> {
        if !self.ready_queue.has_capacity().await? {
            return Ok(AdmitOutcome::rejected("Ready queue at capacity"));
        }

        let rate_limit = self.rate_limiter.check_rate_limit(&job.group_id).await?;

        if rate_limit.allowed {
            // The push re-checks capacity atomically: another admitter may
            // have filled the buffer since the check above.
            if !self.ready_queue.push(&job.id).await? {
                return Ok(AdmitOutcome::rejected("Ready queue became full"));
            }

            return Ok(AdmitOutcome::ready());
        }

        let backoff = self.congestion.add_to_non_ready(&job.id, &job.group_id).await?;

        Ok(AdmitOutcome::non_ready(&rate_limit, &backoff))
    }

    /// Re-admits a failed-but-retryable job through the non-ready queue with
    /// exponential backoff on its retry count.
    pub async fn requeue(
        &self,
        job_id: &str,
        _group_id: &str,
        retry_count: u32,
    ) -> Result<(), EngineError> {
        self.non_ready_queue
            .push_with_exponential_backoff(job_id, retry_count, NonReadyReason::TransientError)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::BackoffResult;

    #[test]
    fn test_outcome_constructors() {
        let ready = AdmitOutcome::ready();
        assert!(ready.accepted);
        assert_eq!(ready.destination, Destination::Ready);
        assert!(ready.reason.is_none());

        let rejected = AdmitOutcome::rejected("Ready queue at capacity");
        assert!(!rejected.accepted);
        assert_eq!(rejected.destination, Destination::Rejected);
        assert!(rejected.reason.as_deref().unwrap().contains("capacity"));
    }

    #[test]
    fn test_non_ready_outcome_reason() {
        let rate_limit = RateLimitResult {
            allowed: false,
            global_count: 10,
            global_limit: 10,
            group_count: 5,
            per_group_limit: 5,
        };
        let backoff = BackoffResult::fixed(1000);

        let outcome = AdmitOutcome::non_ready(&rate_limit, &backoff);

        assert!(outcome.accepted);
        assert_eq!(outcome.destination, Destination::NonReady);
        let reason = outcome.reason.unwrap();
        assert!(reason.contains("10/10"));
        assert!(reason.contains("5/5"));
        assert!(reason.contains("NONE"));
    }

    #[test]
    fn test_destination_display() {
        assert_eq!(Destination::Ready.to_string(), "ready");
        assert_eq!(Destination::NonReady.to_string(), "non-ready");
        assert_eq!(Destination::Rejected.to_string(), "rejected");
    }
}
