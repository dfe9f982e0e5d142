//! In-memory fakes for [`dispatch_core::broker::BrokerClient`] and
//! [`dispatch_core::store::JobStore`], for tests that want the real
//! state machine in `dispatch-core` without a Redis or Postgres
//! instance nearby.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dispatch_core::broker::BrokerClient;
use dispatch_core::error::DispatchError;
use dispatch_core::job::{DlqEntry, Job, JobFilter, JobPatch, JobStatus, QueueMessage};
use dispatch_core::store::JobStore;
use uuid::Uuid;

/// How often a blocking call re-checks its condition. Real brokers block
/// natively; this fake polls, which is close enough for test timing.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A [`BrokerClient`] backed entirely by in-process maps — no network,
/// no persistence across process restarts. Queue ordering, blocking-pop
/// timeout behavior, and lease TTL semantics mirror
/// `dispatch-broker-redis` closely enough that the same worker code
/// exercises the same branches against either.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, VecDeque<QueueMessage>>,
    dlqs: DashMap<String, VecDeque<DlqEntry>>,
    kv: DashMap<String, (String, Option<Instant>)>,
    leases: DashMap<String, Instant>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only inspection helper; not part of [`BrokerClient`].
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Test-only inspection helper; not part of [`BrokerClient`].
    pub async fn dlq_len(&self, queue: &str) -> usize {
        self.dlqs.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    fn try_acquire_once(&self, name: &str, ttl: Duration) -> bool {
        let key = format!("lock:{name}");
        let now = Instant::now();
        let mut acquired = false;
        self.leases
            .entry(key)
            .and_modify(|expiry| {
                if *expiry <= now {
                    *expiry = now + ttl;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                now + ttl
            });
        acquired
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn push(&self, queue: &str, message: &QueueMessage) -> Result<u64, DispatchError> {
        let mut entry = self.queues.entry(queue.to_string()).or_default();
        entry.push_back(message.clone());
        Ok(entry.len() as u64)
    }

    async fn push_dlq(&self, queue: &str, entry: &DlqEntry) -> Result<u64, DispatchError> {
        let mut q = self.dlqs.entry(queue.to_string()).or_default();
        q.push_back(entry.clone());
        Ok(q.len() as u64)
    }

    async fn blocking_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>, DispatchError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(mut q) = self.queues.get_mut(queue) {
                if let Some(message) = q.pop_front() {
                    return Ok(Some(message));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn length(&self, queue: &str) -> Result<u64, DispatchError> {
        Ok(self.queue_len(queue).await as u64)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), DispatchError> {
        let expiry = ttl.map(|d| Instant::now() + d);
        self.kv.insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DispatchError> {
        let Some(entry) = self.kv.get(key) else {
            return Ok(None);
        };
        let (value, expiry) = entry.clone();
        drop(entry);
        if expiry.map(|e| Instant::now() >= e).unwrap_or(false) {
            self.kv.remove(key);
            return Ok(None);
        }
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> Result<(), DispatchError> {
        self.kv.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, DispatchError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        ttl: Duration,
        blocking_timeout: Option<Duration>,
    ) -> Result<bool, DispatchError> {
        match blocking_timeout {
            None => Ok(self.try_acquire_once(name, ttl)),
            Some(timeout) if timeout.is_zero() => Ok(self.try_acquire_once(name, ttl)),
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if self.try_acquire_once(name, ttl) {
                        return Ok(true);
                    }
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
                }
            }
        }
    }

    async fn release_lease(&self, name: &str) -> Result<(), DispatchError> {
        self.leases.remove(&format!("lock:{name}"));
        Ok(())
    }
}

/// A [`JobStore`] backed by a single concurrent map, keyed by job id.
/// Implements the same once-only timestamp bookkeeping a real
/// transactional store must: `started_at` is set once, on first entry
/// to `Processing`; `completed_at` is set once, on first entry to a
/// terminal status.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, DispatchError> {
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, DispatchError> {
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DispatchError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|job| filter.status.map_or(true, |s| job.status == s))
            .filter(|job| filter.kind.map_or(true, |k| job.kind == k))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let skip = filter.skip.max(0) as usize;
        let limit = filter.capped_limit() as usize;
        Ok(jobs.into_iter().skip(skip).take(limit).collect())
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, DispatchError> {
        let mut entry = self.jobs.get_mut(&id).ok_or(DispatchError::NotFound)?;
        let job = entry.value_mut();

        if let Some(status) = patch.status {
            if status == JobStatus::Processing && job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
            if status.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
            job.status = status;
        }
        if let Some(attempts) = patch.attempts {
            job.attempts = attempts;
        }
        if let Some(result) = patch.result {
            job.result = Some(result);
        }
        if let Some(error) = patch.error {
            job.error = error;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, i64>, DispatchError> {
        let mut counts = HashMap::new();
        for entry in self.jobs.iter() {
            *counts.entry(entry.value().status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::job::{JobKind, MAX_LIST_LIMIT};
    use serde_json::json;

    fn sample_job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            kind: JobKind::Email,
            status,
            payload: json!({}),
            priority: 5,
            attempts: 0,
            max_attempts: 3,
            result: None,
            error: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn blocking_pop_returns_none_after_timeout_on_empty_queue() {
        let broker = InMemoryBroker::new();
        let result = broker
            .blocking_pop("jobs:queue", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn push_then_blocking_pop_returns_the_message() {
        let broker = InMemoryBroker::new();
        let message = QueueMessage {
            id: Uuid::new_v4(),
            kind: JobKind::Webhook,
            payload: json!({"url": "https://example.com"}),
            priority: 5,
            attempts: 0,
        };
        broker.push("jobs:queue", &message).await.unwrap();
        let popped = broker
            .blocking_pop("jobs:queue", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("message present");
        assert_eq!(popped.id, message.id);
        assert_eq!(broker.queue_len("jobs:queue").await, 0);
    }

    #[tokio::test]
    async fn lease_acquisition_is_exclusive_until_released() {
        let broker = InMemoryBroker::new();
        assert!(broker
            .acquire_lease("job:1", Duration::from_secs(60), None)
            .await
            .unwrap());
        assert!(!broker
            .acquire_lease("job:1", Duration::from_secs(60), None)
            .await
            .unwrap());

        broker.release_lease("job:1").await.unwrap();
        assert!(broker
            .acquire_lease("job:1", Duration::from_secs(60), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lease_expires_after_its_ttl() {
        let broker = InMemoryBroker::new();
        assert!(broker
            .acquire_lease("job:1", Duration::from_millis(10), None)
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(broker
            .acquire_lease("job:1", Duration::from_secs(60), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn store_update_sets_started_at_once_on_first_processing_entry() {
        let store = InMemoryJobStore::new();
        let job = store.insert(sample_job(JobStatus::Queued)).await.unwrap();

        let first = store
            .update(job.id, JobPatch::status(JobStatus::Processing))
            .await
            .unwrap();
        let started = first.started_at.expect("set on first entry");

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store
            .update(job.id, JobPatch::status(JobStatus::Processing))
            .await
            .unwrap();
        assert_eq!(second.started_at, Some(started));
    }

    #[tokio::test]
    async fn store_update_sets_completed_at_once_on_first_terminal_entry() {
        let store = InMemoryJobStore::new();
        let job = store.insert(sample_job(JobStatus::Processing)).await.unwrap();

        let completed = store
            .update(job.id, JobPatch::status(JobStatus::Completed))
            .await
            .unwrap();
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_caps_limit() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.insert(sample_job(JobStatus::Queued)).await.unwrap();
        }
        store.insert(sample_job(JobStatus::Failed)).await.unwrap();

        let mut filter = JobFilter::new();
        filter.status = Some(JobStatus::Queued);
        let queued = store.list(filter).await.unwrap();
        assert_eq!(queued.len(), 3);

        let mut filter = JobFilter::new();
        filter.limit = 10_000;
        let all = store.list(filter).await.unwrap();
        assert!(all.len() as i64 <= MAX_LIST_LIMIT);
    }

    #[tokio::test]
    async fn count_by_status_tallies_every_job() {
        let store = InMemoryJobStore::new();
        store.insert(sample_job(JobStatus::Queued)).await.unwrap();
        store.insert(sample_job(JobStatus::Failed)).await.unwrap();
        store.insert(sample_job(JobStatus::Failed)).await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Queued), Some(&1));
        assert_eq!(counts.get(&JobStatus::Failed), Some(&2));
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_not_found() {
        let store = InMemoryJobStore::new();
        let result = store
            .update(Uuid::new_v4(), JobPatch::status(JobStatus::Completed))
            .await;
        assert!(matches!(result, Err(DispatchError::NotFound)));
    }
}
