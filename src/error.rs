//! Error types for engine operations.
//!
//! A single error enum covers queueing, admission and worker-pool failures:
//! everything here ultimately talks to the same Redis instance, and callers
//! handle store errors the same way regardless of which component raised them.

use thiserror::Error;

/// Errors that can occur across the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Failed to establish the Redis connection.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis command or script invocation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload or dead-letter serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job record was expected in the store but is missing or incomplete.
    #[error("Job {0} not found")]
    JobNotFound(String),

    /// No metadata exists for the given group.
    #[error("Group {0} not found")]
    GroupNotFound(String),

    /// The worker pool was started twice.
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// A lifecycle operation was invoked on a stopped pool.
    #[error("Worker pool is not running")]
    NotRunning,

    /// Configuration rejected before any component was built.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = EngineError::JobNotFound("job-42".to_string());
        assert!(err.to_string().contains("job-42"));

        let err = EngineError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = EngineError::InvalidConfig("worker_count must be > 0".to_string());
        assert!(err.to_string().contains("worker_count"));
    }
}
