//! Durable, transactional record of every job's authoritative state.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::job::{Job, JobFilter, JobPatch, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job record with `status = Queued`, `attempts = 0`.
    async fn insert(&self, job: Job) -> Result<Job, DispatchError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, DispatchError>;

    /// List jobs matching `filter`, newest first.
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DispatchError>;

    /// Apply `patch` atomically. Implementations recompute `updated_at`,
    /// set `completed_at` on entry to a terminal status, and set
    /// `started_at` on first entry to `Processing`.
    /// Never decreases `attempts`.
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, DispatchError>;

    /// Count of jobs per status, across the whole table.
    async fn count_by_status(&self) -> Result<HashMap<JobStatus, i64>, DispatchError>;
}
