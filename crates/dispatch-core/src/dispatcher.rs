//! Entry points called by the external HTTP layer: `Submit`, `Retry`,
//! `Stats`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::error::DispatchError;
use crate::job::{Job, JobCreate, JobFilter, JobPatch, JobStatus, QueueMessage};
use crate::store::JobStore;

/// Aggregate statistics returned by `Stats`.
#[derive(Debug, Clone)]
pub struct Stats {
    pub total: i64,
    pub pending: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retrying: i64,
    pub queue_depth: u64,
    /// `completed / (completed + failed)`, or `0.0` when that denominator
    /// is zero. A fraction in `[0, 1]`; percentage formatting is left to
    /// the HTTP layer (see DESIGN.md).
    pub success_rate: f64,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn BrokerClient>,
    config: Config,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn BrokerClient>, config: Config) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Construct the job, write it to the store, then push it to the
    /// broker. Ordering matters: the store write precedes the broker push
    /// so a worker can never see a message without a matching record.
    pub async fn submit(&self, req: JobCreate) -> Result<Job, DispatchError> {
        req.validate()?;

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            kind: req.kind,
            status: JobStatus::Queued,
            payload: req.payload,
            priority: req.priority,
            attempts: 0,
            max_attempts: self.config.max_retries,
            result: None,
            error: None,
            scheduled_at: req.scheduled_at,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        let job = self
            .store
            .insert(job)
            .await
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

        let message = QueueMessage {
            id: job.id,
            kind: job.kind,
            payload: job.payload.clone(),
            priority: job.priority,
            attempts: job.attempts,
        };

        match self.broker.push(&self.config.job_queue_name, &message).await {
            Ok(_) => {
                info!(job_id = %job.id, kind = ?job.kind, "job submitted");
                Ok(job)
            }
            Err(e) => {
                // Store write already committed; the broker push failed.
                // Mark the job Failed rather than leave a Queued record
                // with no corresponding message.
                error!(job_id = %job.id, error = %e, "enqueue failed after store write");
                let _ = self
                    .store
                    .update(
                        job.id,
                        JobPatch::status(JobStatus::Failed).with_error("enqueue failed"),
                    )
                    .await;
                Err(DispatchError::BrokerUnavailable(e.to_string()))
            }
        }
    }

    /// Reset a `Failed` job back to `Queued` and re-push it, incrementing
    /// `attempts`.
    pub async fn retry(&self, id: Uuid) -> Result<Job, DispatchError> {
        let job = self
            .store
            .get(id)
            .await
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?
            .ok_or(DispatchError::NotFound)?;

        if job.status != JobStatus::Failed || job.attempts >= job.max_attempts {
            return Err(DispatchError::NotRetriable);
        }

        let next_attempts = job.attempts + 1;
        let updated = self
            .store
            .update(
                id,
                JobPatch::status(JobStatus::Queued)
                    .with_attempts(next_attempts)
                    .clear_error(),
            )
            .await
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

        let message = QueueMessage {
            id: updated.id,
            kind: updated.kind,
            payload: updated.payload.clone(),
            priority: updated.priority,
            attempts: updated.attempts,
        };

        self.broker
            .push(&self.config.job_queue_name, &message)
            .await
            .map_err(|e| {
                warn!(job_id = %id, error = %e, "retry enqueue failed");
                DispatchError::BrokerUnavailable(e.to_string())
            })?;

        info!(job_id = %id, attempts = next_attempts, "job retried");
        Ok(updated)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, DispatchError> {
        self.store
            .get(id)
            .await
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DispatchError> {
        self.store
            .list(filter)
            .await
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))
    }

    pub async fn stats(&self) -> Result<Stats, DispatchError> {
        let counts = self
            .store
            .count_by_status()
            .await
            .map_err(|e| DispatchError::StoreUnavailable(e.to_string()))?;

        let pending = *counts.get(&JobStatus::Pending).unwrap_or(&0);
        let queued = *counts.get(&JobStatus::Queued).unwrap_or(&0);
        let processing = *counts.get(&JobStatus::Processing).unwrap_or(&0);
        let completed = *counts.get(&JobStatus::Completed).unwrap_or(&0);
        let failed = *counts.get(&JobStatus::Failed).unwrap_or(&0);
        let retrying = *counts.get(&JobStatus::Retrying).unwrap_or(&0);
        let total = counts.values().sum();

        let finished = completed + failed;
        let success_rate = if finished > 0 {
            completed as f64 / finished as f64
        } else {
            0.0
        };

        let queue_depth = self
            .broker
            .length(&self.config.job_queue_name)
            .await
            .map_err(|e| DispatchError::BrokerUnavailable(e.to_string()))?;

        Ok(Stats {
            total,
            pending,
            queued,
            processing,
            completed,
            failed,
            retrying,
            queue_depth,
            success_rate,
        })
    }
}
