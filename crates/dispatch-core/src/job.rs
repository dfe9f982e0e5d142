//! The authoritative [`Job`] record and the types that flow through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DispatchError;

/// The kind of work a job performs. Closed set — an unknown kind on the
/// wire is a `DispatchError::UnknownKind`, not a new variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Email,
    DataProcessing,
    ReportGeneration,
    ImageProcessing,
    Webhook,
}

impl JobKind {
    /// The lowercase, underscore-separated wire form used on the broker
    /// and in the store's `kind` column.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            JobKind::Email => "email",
            JobKind::DataProcessing => "data_processing",
            JobKind::ReportGeneration => "report_generation",
            JobKind::ImageProcessing => "image_processing",
            JobKind::Webhook => "webhook",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "email" => Some(JobKind::Email),
            "data_processing" => Some(JobKind::DataProcessing),
            "report_generation" => Some(JobKind::ReportGeneration),
            "image_processing" => Some(JobKind::ImageProcessing),
            "webhook" => Some(JobKind::Webhook),
            _ => None,
        }
    }
}

/// Status is monotonic except via the explicit `Retry` operation, which
/// resets a `Failed` job back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Reachable only as a table default; `Store::insert` always writes
    /// `Queued` directly.
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Lowercase wire form for the `status` column; durable backends
    /// persist the enum as text rather than invent a native DB enum type
    /// this core doesn't own migrations for.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "retrying" => Some(JobStatus::Retrying),
            _ => None,
        }
    }
}

/// Priority is advisory only — recorded but not scheduled on. There is
/// no guarantee that a higher-priority job is executed before a lower-
/// priority one already ahead of it in the queue.
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;

/// The authoritative record of a submitted job, as held by the [`crate::store::JobStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub payload: Value,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted by `Dispatcher::submit`. Everything else on [`Job`] is
/// derived at insert time.
#[derive(Debug, Clone, Deserialize)]
pub struct JobCreate {
    pub kind: JobKind,
    pub payload: Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl JobCreate {
    /// Validate the priority range. The store trusts its caller; this is
    /// the one place a malformed `Submit` request is rejected before it
    /// ever reaches durable storage.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(DispatchError::Validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// A partial update to a [`Job`], applied atomically by the store. Only
/// `status` drives timestamp bookkeeping (`started_at`/`completed_at`);
/// every other field is a plain overwrite when present.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<i32>,
    pub result: Option<Value>,
    pub error: Option<Option<String>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }
}

/// Filter passed to `Store::list`. `limit` is capped at 100 by the
/// dispatcher before it reaches the store.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub skip: i64,
    pub limit: i64,
}

pub const MAX_LIST_LIMIT: i64 = 100;

impl JobFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            kind: None,
            skip: 0,
            limit: MAX_LIST_LIMIT,
        }
    }

    pub fn capped_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

/// Ephemeral broker payload. The store is authoritative — if a message
/// disagrees with the store record, the store wins and the message is
/// discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: Value,
    pub priority: i32,
    pub attempts: i32,
}

/// A message that has exhausted retries, enqueued on the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: Value,
    pub priority: i32,
    pub attempts: i32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn from_message(msg: QueueMessage, error: String, failed_at: DateTime<Utc>) -> Self {
        Self {
            id: msg.id,
            kind: msg.kind,
            payload: msg.payload,
            priority: msg.priority,
            attempts: msg.attempts,
            error,
            failed_at,
        }
    }
}
