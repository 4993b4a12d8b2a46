//! Job and group data model.
//!
//! Jobs live in Redis as hashes with string fields; the structs here parse the
//! flat field maps returned by `HGETALL` and the Lua scripts. Field names are
//! part of the wire format shared with `scripts.rs`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Priority tier of a job group. Tiers are scanned strictly in
/// High -> Normal -> Low order on dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    High,
    #[default]
    Normal,
    Low,
}

impl PriorityLevel {
    /// Wire representation used in Redis keys and script arguments.
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityLevel::High => "high",
            PriorityLevel::Normal => "normal",
            PriorityLevel::Low => "low",
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(PriorityLevel::High),
            "normal" => Ok(PriorityLevel::Normal),
            "low" => Ok(PriorityLevel::Low),
            other => Err(format!("unknown priority level: {other}")),
        }
    }
}

/// Lifecycle status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Lifecycle status of a job group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    #[default]
    Created,
    Dispatched,
    Running,
    Aggregating,
    Completed,
    Failed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Created => "CREATED",
            GroupStatus::Dispatched => "DISPATCHED",
            GroupStatus::Running => "RUNNING",
            GroupStatus::Aggregating => "AGGREGATING",
            GroupStatus::Completed => "COMPLETED",
            GroupStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(GroupStatus::Created),
            "DISPATCHED" => Ok(GroupStatus::Dispatched),
            "RUNNING" => Ok(GroupStatus::Running),
            "AGGREGATING" => Ok(GroupStatus::Aggregating),
            "COMPLETED" => Ok(GroupStatus::Completed),
            "FAILED" => Ok(GroupStatus::Failed),
            other => Err(format!("unknown group status: {other}")),
        }
    }
}

/// One unit of work, stored as a Redis hash at `job:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub group_id: String,
    /// Processor lookup key; empty means no processor will match.
    pub processor_type: String,
    /// Opaque JSON payload, kept as a raw string.
    pub payload: String,
    pub status: JobStatus,
    pub retry_count: u32,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl Job {
    /// Parses a job from the field map of an `HGETALL` reply.
    ///
    /// Returns `None` when the hash is missing or has no `id` field (deleted
    /// or never-written record). Other fields fall back to defaults so a
    /// partially written record does not poison the worker loop.
    pub fn from_hash(fields: &HashMap<String, String>) -> Option<Self> {
        let id = fields.get("id")?.clone();

        Some(Self {
            id,
            group_id: fields.get("groupId").cloned().unwrap_or_default(),
            processor_type: fields.get("processorType").cloned().unwrap_or_default(),
            payload: fields
                .get("payload")
                .cloned()
                .unwrap_or_else(|| "{}".to_string()),
            status: fields
                .get("status")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            retry_count: fields
                .get("retryCount")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            created_at: fields
                .get("createdAt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }

    /// Parses a job from the flat `[field, value, ...]` array a Lua `HGETALL`
    /// reply arrives as.
    pub fn from_flat_pairs(raw: &[String]) -> Option<Self> {
        let mut fields = HashMap::with_capacity(raw.len() / 2);

        for pair in raw.chunks_exact(2) {
            fields.insert(pair[0].clone(), pair[1].clone());
        }

        Self::from_hash(&fields)
    }
}

/// Group metadata, stored as a Redis hash at `group:{id}:meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMeta {
    pub group_id: String,
    pub base_priority: i64,
    pub priority_level: PriorityLevel,
    pub total_jobs: u64,
    pub done_jobs: u64,
    pub status: GroupStatus,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl GroupMeta {
    pub fn from_hash(fields: &HashMap<String, String>) -> Option<Self> {
        let group_id = fields.get("groupId")?.clone();

        Some(Self {
            group_id,
            base_priority: fields
                .get("basePriority")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            priority_level: fields
                .get("priorityLevel")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            total_jobs: fields
                .get("totalJobs")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            done_jobs: fields
                .get("doneJobs")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            status: fields
                .get("status")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            created_at: fields
                .get("createdAt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Congestion snapshot embedded in a group progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionSnapshot {
    pub level: String,
    pub non_ready_count: u64,
    pub last_backoff_ms: u64,
}

/// Progress report for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupProgress {
    pub group_id: String,
    pub total_jobs: u64,
    pub done_jobs: u64,
    /// Jobs still sitting in the group's fair-queue list.
    pub pending_in_queue: u64,
    pub progress_percent: u64,
    pub status: String,
    pub congestion: CongestionSnapshot,
}

impl GroupProgress {
    pub fn percent(done: u64, total: u64) -> u64 {
        if total == 0 {
            0
        } else {
            done * 100 / total
        }
    }
}

/// Entry appended to the dead-letter list when a job is given up on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub error: String,
    /// Epoch milliseconds.
    pub failed_at: i64,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_fields() -> HashMap<String, String> {
        [
            ("id", "j1"),
            ("groupId", "g1"),
            ("processorType", "email"),
            ("payload", r#"{"to":"a@b.c"}"#),
            ("status", "PENDING"),
            ("retryCount", "2"),
            ("createdAt", "1700000000000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_job_from_hash() {
        let job = Job::from_hash(&job_fields()).expect("should parse");

        assert_eq!(job.id, "j1");
        assert_eq!(job.group_id, "g1");
        assert_eq!(job.processor_type, "email");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.created_at, 1_700_000_000_000);
    }

    #[test]
    fn test_job_from_hash_requires_id() {
        let mut fields = job_fields();
        fields.remove("id");

        assert!(Job::from_hash(&fields).is_none());
        assert!(Job::from_hash(&HashMap::new()).is_none());
    }

    #[test]
    fn test_job_from_hash_defaults_for_missing_fields() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "j1".to_string());

        let job = Job::from_hash(&fields).expect("should parse");

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.payload, "{}");
    }

    #[test]
    fn test_job_from_flat_pairs() {
        let raw: Vec<String> = [
            "id",
            "j2",
            "groupId",
            "g2",
            "status",
            "PROCESSING",
            "retryCount",
            "0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let job = Job::from_flat_pairs(&raw).expect("should parse");

        assert_eq!(job.id, "j2");
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn test_priority_level_roundtrip() {
        for level in [
            PriorityLevel::High,
            PriorityLevel::Normal,
            PriorityLevel::Low,
        ] {
            assert_eq!(level.as_str().parse::<PriorityLevel>(), Ok(level));
        }

        assert!("urgent".parse::<PriorityLevel>().is_err());
    }

    #[test]
    fn test_group_status_roundtrip() {
        for status in [
            GroupStatus::Created,
            GroupStatus::Dispatched,
            GroupStatus::Running,
            GroupStatus::Aggregating,
            GroupStatus::Completed,
            GroupStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<GroupStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(GroupProgress::percent(0, 0), 0);
        assert_eq!(GroupProgress::percent(1, 3), 33);
        assert_eq!(GroupProgress::percent(3, 3), 100);
    }

    #[test]
    fn test_dead_letter_entry_roundtrip() {
        let entry = DeadLetterEntry {
            job: Job::from_hash(&job_fields()).expect("should parse"),
            error: "boom".to_string(),
            failed_at: 1_700_000_001_000,
            retry_count: 3,
        };

        let serialized = serde_json::to_string(&entry).expect("entry should serialize");
        let parsed: DeadLetterEntry =
            serde_json::from_str(&serialized).expect("should parse back");

        assert_eq!(parsed.job.id, "j1");
        assert_eq!(parsed.error, "boom");
        assert_eq!(parsed.retry_count, 3);
    }
}
