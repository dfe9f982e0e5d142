//! PostgreSQL implementation of the dispatch engine's [`JobStore`].
//!
//! A thin wrapper over a `sqlx::PgPool`, raw `sqlx::query` (not
//! `query_as!`, since this crate owns no migrations to check a query
//! against at compile time) with `Row::get` column access, and a
//! transaction around read-then-write updates. Dequeue here is
//! pull-by-id (`Update(id, patch)`), not a claim-based `FOR UPDATE SKIP
//! LOCKED` pop — the broker, not the store, is where jobs are actually
//! dequeued.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     kind TEXT NOT NULL,
//!     status TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     priority INTEGER NOT NULL,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL,
//!     result JSONB,
//!     error TEXT,
//!     scheduled_at TIMESTAMPTZ,
//!     started_at TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX idx_jobs_status ON jobs (status);
//! CREATE INDEX idx_jobs_kind ON jobs (kind);
//! CREATE INDEX idx_jobs_priority ON jobs (priority);
//! CREATE INDEX idx_jobs_created_at ON jobs (created_at);
//! ```
//!
//! Schema migrations and pool construction are out of scope for this
//! crate — the caller is expected to run the DDL above (or an
//! equivalent migration) and hand this crate an already-connected
//! `PgPool`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::error::DispatchError;
use dispatch_core::job::{Job, JobFilter, JobKind, JobPatch, JobStatus};
use dispatch_core::store::JobStore;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PgStoreError {
    #[error("postgres error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row held unrecognized job kind: {0}")]
    UnknownKind(String),

    #[error("row held unrecognized job status: {0}")]
    UnknownStatus(String),
}

impl From<PgStoreError> for DispatchError {
    fn from(err: PgStoreError) -> Self {
        match err {
            PgStoreError::Sqlx(sqlx::Error::RowNotFound) => DispatchError::NotFound,
            PgStoreError::UnknownKind(kind) => DispatchError::UnknownKind(kind),
            other => DispatchError::StoreUnavailable(other.to_string()),
        }
    }
}

/// A [`JobStore`] backed by a single PostgreSQL `jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, PgStoreError> {
    let kind_str: String = row.get("kind");
    let kind = JobKind::from_wire_str(&kind_str).ok_or(PgStoreError::UnknownKind(kind_str))?;

    let status_str: String = row.get("status");
    let status =
        JobStatus::from_wire_str(&status_str).ok_or(PgStoreError::UnknownStatus(status_str))?;

    Ok(Job {
        id: row.get("id"),
        kind,
        status,
        payload: row.get("payload"),
        priority: row.get("priority"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        result: row.get("result"),
        error: row.get("error"),
        scheduled_at: row.get("scheduled_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    /// Writes a new record with `status = Queued`, `attempts = 0`.
    /// Callers construct the `Job` themselves (the `Dispatcher` does) —
    /// this store trusts what it's handed and simply persists it.
    async fn insert(&self, job: Job) -> Result<Job, DispatchError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, status, payload, priority, attempts, max_attempts,
                result, error, scheduled_at, started_at, completed_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.kind.as_wire_str())
        .bind(job.status.as_wire_str())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(PgStoreError::from)?;

        Ok(row_to_job(&row).map_err(PgStoreError::from)?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, DispatchError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(PgStoreError::from)?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row_to_job(&row).map_err(PgStoreError::from)?)),
        }
    }

    /// Filters by optional `status`/`kind`, ordered newest-first, with
    /// `skip`/`limit` pagination (`limit` is already capped at 100 by
    /// [`JobFilter::capped_limit`] before it reaches this query).
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DispatchError> {
        let status_str = filter.status.map(|s| s.as_wire_str());
        let kind_str = filter.kind.map(|k| k.as_wire_str());

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR kind = $2)
            ORDER BY created_at DESC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(status_str)
        .bind(kind_str)
        .bind(filter.skip.max(0))
        .bind(filter.capped_limit())
        .fetch_all(&self.pool)
        .await
        .map_err(PgStoreError::from)?;

        rows.iter()
            .map(|row| row_to_job(row).map_err(DispatchError::from))
            .collect()
    }

    /// Applies `patch` inside a transaction so the read-modify-write is
    /// atomic with respect to concurrent updates to the same row.
    /// `started_at` is set only the first time status enters `Processing`;
    /// `completed_at` only the first time it enters a terminal status —
    /// both read from the row locked by this transaction, not from a
    /// stale in-memory copy.
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, DispatchError> {
        let mut tx = self.pool.begin().await.map_err(PgStoreError::from)?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(PgStoreError::from)?
            .ok_or(DispatchError::NotFound)?;

        let current = row_to_job(&row).map_err(PgStoreError::from)?;
        let now = Utc::now();

        let next_status = patch.status.unwrap_or(current.status);
        let started_at: Option<DateTime<Utc>> = if next_status == JobStatus::Processing
            && current.started_at.is_none()
        {
            Some(now)
        } else {
            current.started_at
        };
        let completed_at: Option<DateTime<Utc>> =
            if next_status.is_terminal() && current.completed_at.is_none() {
                Some(now)
            } else {
                current.completed_at
            };
        let next_attempts = patch.attempts.unwrap_or(current.attempts);
        let next_result = patch.result.or(current.result);
        let next_error = patch.error.unwrap_or(current.error);

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, attempts = $2, result = $3, error = $4,
                started_at = $5, completed_at = $6, updated_at = $7
            WHERE id = $8
            RETURNING *
            "#,
        )
        .bind(next_status.as_wire_str())
        .bind(next_attempts)
        .bind(&next_result)
        .bind(&next_error)
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(PgStoreError::from)?;

        tx.commit().await.map_err(PgStoreError::from)?;

        Ok(row_to_job(&row).map_err(PgStoreError::from)?)
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, i64>, DispatchError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(PgStoreError::from)?;

        let mut counts = HashMap::new();
        for row in rows {
            let status_str: String = row.get("status");
            let count: i64 = row.get("count");
            if let Some(status) = JobStatus::from_wire_str(&status_str) {
                counts.insert(status, count);
            } else {
                tracing::warn!(status = %status_str, "ignoring unrecognized status in count_by_status");
            }
        }
        Ok(counts)
    }
}

/// Ad hoc query helpers outside the [`JobStore`] trait surface — not
/// part of the core operation list, but the kind of maintenance query a
/// real deployment runs next to the engine.
impl PgJobStore {
    /// Delete terminal jobs older than `older_than`. The core itself
    /// never destroys job records on its own — this is the out-of-scope
    /// garbage-collection subsystem's entry point, provided here because
    /// it is a one-line query against this store's own schema.
    pub async fn prune_terminal_before(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, DispatchError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(PgStoreError::from)?;

        Ok(result.rows_affected())
    }
}
