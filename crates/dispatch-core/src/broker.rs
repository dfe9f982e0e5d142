//! Thin semantic layer over a shared key/value + list broker.
//!
//! `dispatch-core` depends only on this trait; `dispatch-broker-redis`
//! and `dispatch-testing` provide concrete implementations.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::job::{DlqEntry, QueueMessage};

/// A lease key is namespaced `lock:{name}`; the dispatch engine always
/// calls with `name = "job:{id}"`, producing the `lock:job:{id}` wire
/// form.
pub fn lease_name_for_job(job_id: uuid::Uuid) -> String {
    format!("job:{job_id}")
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Right-append `message` to `queue`. Returns the queue length after
    /// the push.
    async fn push(&self, queue: &str, message: &QueueMessage) -> Result<u64, DispatchError>;

    /// Push a DLQ entry. Kept distinct from `push` because its payload
    /// shape differs (it carries `error` and `failed_at`).
    async fn push_dlq(&self, queue: &str, entry: &DlqEntry) -> Result<u64, DispatchError>;

    /// Blocking left-pop with a timeout. Returns `None` if the queue was
    /// empty for the whole timeout window.
    async fn blocking_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>, DispatchError>;

    /// Current queue length.
    async fn length(&self, queue: &str) -> Result<u64, DispatchError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), DispatchError>;
    async fn get(&self, key: &str) -> Result<Option<String>, DispatchError>;
    async fn delete(&self, key: &str) -> Result<(), DispatchError>;
    async fn exists(&self, key: &str) -> Result<bool, DispatchError>;

    /// Atomic set-if-absent with TTL. When `blocking_timeout` is `Some`,
    /// polls at a fixed small interval (spec: 100ms) until acquired or the
    /// deadline passes; `None` (or `Duration::ZERO`) is a single
    /// non-blocking attempt.
    async fn acquire_lease(
        &self,
        name: &str,
        ttl: Duration,
        blocking_timeout: Option<Duration>,
    ) -> Result<bool, DispatchError>;

    /// Unconditional delete. A hardened implementation would release only
    /// if a per-acquisition token matches; this core does not carry that
    /// token.
    async fn release_lease(&self, name: &str) -> Result<(), DispatchError>;
}
