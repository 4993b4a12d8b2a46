//! Job processor interface and registry.
//!
//! Processors are the pluggable execution side of the engine: each one handles
//! a single `processor_type` string and is registered into the worker pool at
//! startup. Dispatch is a plain map lookup, never reflection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::Job;

/// Failure detail returned by a processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorFailure {
    pub message: String,
    pub code: Option<String>,
    /// Whether the engine may retry this job.
    pub retryable: bool,
}

impl ProcessorFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ProcessorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Successful processor output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorOutput {
    /// Optional result data, surfaced through job status queries.
    pub data: Option<serde_json::Value>,
}

impl ProcessorOutput {
    pub fn empty() -> Self {
        Self { data: None }
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        Self { data: Some(data) }
    }
}

/// A handler for one job type.
///
/// Implementations must be idempotent: delivery is at-least-once and a job may
/// be re-executed after a timeout or crash.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Processor type string this handler serves.
    fn kind(&self) -> &str;

    async fn process(&self, job: &Job) -> Result<ProcessorOutput, ProcessorFailure>;
}

/// Maps processor type strings to handlers.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor, replacing any previous handler for its type.
    pub fn register(&mut self, processor: Arc<dyn JobProcessor>) {
        self.processors
            .insert(processor.kind().to_string(), processor);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn JobProcessor>> {
        self.processors.get(kind)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Registered processor types, for startup logging.
    pub fn kinds(&self) -> Vec<&str> {
        self.processors.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProcessor;

    #[async_trait]
    impl JobProcessor for EchoProcessor {
        fn kind(&self) -> &str {
            "echo"
        }

        async fn process(&self, job: &Job) -> Result<ProcessorOutput, ProcessorFailure> {
            Ok(ProcessorOutput::with_data(serde_json::json!({
                "echoed": job.payload,
            })))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobProcessor for AlwaysFails {
        fn kind(&self) -> &str {
            "broken"
        }

        async fn process(&self, _job: &Job) -> Result<ProcessorOutput, ProcessorFailure> {
            Err(ProcessorFailure::retryable("downstream unavailable"))
        }
    }

    fn test_job() -> Job {
        Job {
            id: "j1".to_string(),
            group_id: "g1".to_string(),
            processor_type: "echo".to_string(),
            payload: r#"{"n":1}"#.to_string(),
            status: Default::default(),
            retry_count: 0,
            created_at: 0,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(EchoProcessor));
        registry.register(Arc::new(AlwaysFails));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("broken").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_registry_replaces_duplicate_kind() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(EchoProcessor));
        registry.register(Arc::new(EchoProcessor));

        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_processor_dispatch() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(EchoProcessor));

        let job = test_job();
        let processor = registry.get(&job.processor_type).expect("registered");
        let output = processor.process(&job).await.expect("should succeed");

        assert!(output.data.is_some());
    }

    #[tokio::test]
    async fn test_retryable_failure() {
        let processor = AlwaysFails;
        let err = processor.process(&test_job()).await.unwrap_err();

        assert!(err.retryable);
        assert!(err.to_string().contains("downstream"));
    }

    #[test]
    fn test_failure_display_with_code() {
        let failure = ProcessorFailure::permanent("bad address").with_code("E_ADDR");

        assert!(!failure.retryable);
        assert_eq!(failure.to_string(), "bad address (E_ADDR)");
    }
}
