use crate::db::MediaType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Unknown job kind: {0}")]
    UnknownKind(String),
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Job {id} cannot be retried: {reason}")]
    NotRetryable { id: String, reason: String },
    #[error("{0}")]
    Handler(String),
}

/// Unique identifier for a queued job
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

/// Work queues. Stored in the `queue` column.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    MetadataExtract,
    VideoProbe,
    Thumbnail,
    ProxyGenerate,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::MetadataExtract,
        JobKind::VideoProbe,
        JobKind::Thumbnail,
        JobKind::ProxyGenerate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::MetadataExtract => "metadata-extract",
            JobKind::VideoProbe => "video-probe",
            JobKind::Thumbnail => "thumbnail",
            JobKind::ProxyGenerate => "proxy-generate",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| JobError::UnknownKind(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataExtractJob {
    pub hash: String,
    pub media_type: MediaType,
    pub archive_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProbeJob {
    pub hash: String,
    pub archive_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailJob {
    pub hash: String,
    pub media_type: MediaType,
    pub archive_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyGenerateJob {
    pub hash: String,
    pub archive_path: String,
}

/// Structured payload per job kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum JobPayload {
    MetadataExtract(MetadataExtractJob),
    VideoProbe(VideoProbeJob),
    Thumbnail(ThumbnailJob),
    ProxyGenerate(ProxyGenerateJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::MetadataExtract(_) => JobKind::MetadataExtract,
            JobPayload::VideoProbe(_) => JobKind::VideoProbe,
            JobPayload::Thumbnail(_) => JobKind::Thumbnail,
            JobPayload::ProxyGenerate(_) => JobKind::ProxyGenerate,
        }
    }

    pub fn media_hash(&self) -> &str {
        match self {
            JobPayload::MetadataExtract(job) => &job.hash,
            JobPayload::VideoProbe(job) => &job.hash,
            JobPayload::Thumbnail(job) => &job.hash,
            JobPayload::ProxyGenerate(job) => &job.hash,
        }
    }

    pub fn archive_path(&self) -> &str {
        match self {
            JobPayload::MetadataExtract(job) => &job.archive_path,
            JobPayload::VideoProbe(job) => &job.archive_path,
            JobPayload::Thumbnail(job) => &job.archive_path,
            JobPayload::ProxyGenerate(job) => &job.archive_path,
        }
    }

    /// Parse a stored payload and check it against its queue column
    pub fn decode(queue: &str, raw: &str) -> Result<Self, JobError> {
        let kind: JobKind = queue.parse()?;
        let payload: JobPayload = serde_json::from_str(raw)?;
        if payload.kind() != kind {
            return Err(JobError::UnknownKind(format!(
                "payload kind {} stored in queue {}",
                payload.kind(),
                kind
            )));
        }
        Ok(payload)
    }
}

/// Larger runs first. Ties break by enqueue order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn as_i64(&self) -> i64 {
        match self {
            JobPriority::Low => 3,
            JobPriority::Normal => 5,
            JobPriority::High => 7,
            JobPriority::Critical => 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row from the `jobs` table
#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    /// Insertion order, the FIFO tiebreak
    pub seq: i64,
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: i64,
    pub depends_on: Option<JobId>,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// Job counts by status
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

/// Worker lifecycle notifications, emitted in database order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        id: JobId,
        kind: JobKind,
        attempt: i64,
    },
    Finished {
        id: JobId,
        kind: JobKind,
        /// `Pending` when a retry was scheduled
        status: JobStatus,
        error: Option<String>,
    },
    /// Marked failed without running because `dependency` failed
    DependencyFailed { id: JobId, dependency: JobId },
}
