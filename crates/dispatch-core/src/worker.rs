//! Worker pool and per-job state machine — the heart of the dispatch
//! engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{lease_name_for_job, BrokerClient};
use crate::config::Config;
use crate::error::DispatchError;
use crate::job::{DlqEntry, JobPatch, JobStatus, QueueMessage};
use crate::registry::HandlerRegistry;
use crate::store::JobStore;

/// How often a worker re-checks its in-flight capacity or retries after a
/// transient broker error.
const CAPACITY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TRANSIENT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tracks how many job executions are currently in flight for one
/// worker, so the run loop can throttle against its `concurrency` budget.
#[derive(Clone)]
struct InflightTracker {
    count: Arc<AtomicUsize>,
    capacity: usize,
}

impl InflightTracker {
    fn new(capacity: usize) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            capacity: capacity.max(1),
        }
    }

    fn at_capacity(&self) -> bool {
        self.count.load(Ordering::Acquire) >= self.capacity
    }

    /// RAII guard: incrementing on acquire, decrementing on drop, so a
    /// panicking handler still frees its slot.
    fn acquire(&self) -> InflightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            count: self.count.clone(),
        }
    }
}

struct InflightGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pool of long-lived workers sharing one broker client and one store.
pub struct WorkerPool {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: Arc<Config>,
    worker_count: usize,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: Config,
        worker_count: usize,
    ) -> Self {
        Self {
            broker,
            store,
            registry,
            config: Arc::new(config),
            worker_count: worker_count.max(1),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Spawn `worker_count` concurrent workers. Per-worker concurrency is
    /// `floor(total / N)`, minimum 1.
    pub fn start(&mut self) {
        let per_worker_concurrency =
            (self.config.worker_concurrency / self.worker_count).max(1);

        info!(
            worker_count = self.worker_count,
            per_worker_concurrency, "starting worker pool"
        );

        for worker_id in 0..self.worker_count {
            let worker = Worker {
                worker_id,
                broker: self.broker.clone(),
                store: self.store.clone(),
                registry: self.registry.clone(),
                config: self.config.clone(),
                cancel: self.cancel.clone(),
                inflight: InflightTracker::new(per_worker_concurrency),
            };
            self.handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Signal all workers to quiesce and await their completion. Cancels
    /// any in-progress backoff sleep promptly; in-flight handler
    /// executions are allowed to run to completion.
    pub async fn stop(mut self) {
        info!("stopping worker pool");
        self.cancel.cancel();
        join_all(self.handles.drain(..)).await;
        info!("worker pool stopped");
    }
}

struct Worker {
    worker_id: usize,
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: Arc<Config>,
    cancel: CancellationToken,
    inflight: InflightTracker,
}

impl Worker {
    /// While not stopping, respect the in-flight capacity, blocking-pop
    /// the queue, and launch `process` as a detached task per message.
    async fn run(self) {
        let worker_id = self.worker_id;
        info!(worker_id, "worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if self.inflight.at_capacity() {
                tokio::select! {
                    _ = tokio::time::sleep(CAPACITY_POLL_INTERVAL) => {}
                    _ = self.cancel.cancelled() => break,
                }
                continue;
            }

            let poll_timeout = Duration::from_secs(self.config.worker_poll_interval_secs);
            let popped = tokio::select! {
                result = self.broker.blocking_pop(&self.config.job_queue_name, poll_timeout) => result,
                _ = self.cancel.cancelled() => break,
            };

            let message = match popped {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    // Never exit on transient broker errors — only Stop
                    // ends the loop.
                    warn!(worker_id, error = %e, "broker error in run loop");
                    tokio::select! {
                        _ = tokio::time::sleep(TRANSIENT_ERROR_BACKOFF) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            let guard = self.inflight.acquire();
            let broker = self.broker.clone();
            let store = self.store.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            let cancel = self.cancel.clone();

            tokio::spawn(async move {
                let _guard = guard;
                process(message, broker, store, registry, config, cancel).await;
            });
        }

        info!(worker_id, "worker stopped");
    }
}

/// The per-job state machine, step by step. Every durability guarantee
/// this engine makes ultimately rests on this function.
async fn process(
    message: QueueMessage,
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: Arc<Config>,
    cancel: CancellationToken,
) {
    let job_id = message.id;
    let lease_name = lease_name_for_job(job_id);
    let lease_ttl = Duration::from_secs(config.lease_ttl_secs);

    // Step 1: lease. Non-blocking — if another worker already holds it,
    // drop the message silently.
    let acquired = match broker.acquire_lease(&lease_name, lease_ttl, None).await {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!(%job_id, error = %e, "lease acquisition errored; dropping message");
            return;
        }
    };
    if !acquired {
        info!(%job_id, "lease contended; dropping duplicate delivery");
        return;
    }

    // Everything past this point must release the lease on every exit
    // path, even if store updates themselves fail.
    process_with_lease(message, &broker, &store, &registry, &config, &cancel).await;

    if let Err(e) = broker.release_lease(&lease_name).await {
        warn!(%job_id, error = %e, "failed to release lease; it will expire on its own TTL");
    }
}

async fn process_with_lease(
    message: QueueMessage,
    broker: &Arc<dyn BrokerClient>,
    store: &Arc<dyn JobStore>,
    registry: &HandlerRegistry,
    config: &Arc<Config>,
    cancel: &CancellationToken,
) {
    let job_id = message.id;

    // Step 2: mark processing. The store sets `started_at` only if it
    // was previously null.
    if let Err(e) = store
        .update(job_id, JobPatch::status(JobStatus::Processing))
        .await
    {
        error!(%job_id, error = %e, "failed to mark job processing; leaving for lease expiry");
        return;
    }

    // Step 3: lookup handler.
    let handler = registry.lookup(message.kind);

    // Step 4: execute. A missing handler is a `DispatchError::UnknownKind`,
    // lifted into `anyhow::Error` so it flows through the same
    // retry/backoff/DLQ ladder as any other handler failure.
    let outcome = match handler {
        Some(handler) => handler.handle(message.payload.clone()).await,
        None => Err(DispatchError::UnknownKind(message.kind.as_wire_str().to_string()).into()),
    };

    match outcome {
        // Step 5: success.
        Ok(result) => {
            if let Err(e) = store
                .update(
                    job_id,
                    JobPatch::status(JobStatus::Completed).with_result(result),
                )
                .await
            {
                error!(%job_id, error = %e, "failed to record completion");
            } else {
                info!(%job_id, "job completed");
            }
        }
        // Step 6: failure — retry with backoff, or exhaust to the DLQ.
        Err(err) => {
            handle_failure(message, err, broker, store, config, cancel).await;
        }
    }
}

async fn handle_failure(
    message: QueueMessage,
    err: anyhow::Error,
    broker: &Arc<dyn BrokerClient>,
    store: &Arc<dyn JobStore>,
    config: &Arc<Config>,
    cancel: &CancellationToken,
) {
    let job_id = message.id;
    let error_text = err.to_string();
    let next_attempts = message.attempts + 1;

    if next_attempts <= config.max_retries {
        if let Err(e) = store
            .update(
                job_id,
                JobPatch::status(JobStatus::Retrying)
                    .with_attempts(next_attempts)
                    .with_error(error_text.clone()),
            )
            .await
        {
            error!(%job_id, error = %e, "failed to record retrying state");
        }

        let delay = Duration::from_secs(config.backoff_delay_secs(next_attempts));
        info!(%job_id, next_attempts, delay_secs = delay.as_secs(), "scheduling retry");

        // The backoff sleep must be interruptible by Stop: on
        // cancellation the job is left in `Retrying` with the incremented
        // `attempts`, not re-pushed to the broker.
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                warn!(%job_id, "shutdown during backoff; leaving job Retrying, not re-enqueued");
                return;
            }
        }

        let retry_message = QueueMessage {
            id: message.id,
            kind: message.kind,
            payload: message.payload,
            priority: message.priority,
            attempts: next_attempts,
        };

        if let Err(e) = broker.push(&config.job_queue_name, &retry_message).await {
            error!(%job_id, error = %e, "failed to re-enqueue after backoff; store says Retrying with no message");
        }
    } else {
        // `next_attempts` exceeds max_retries here, but no retry was ever
        // enqueued for it — the attempts counter only advances on an
        // actual retry push, so the terminal record keeps
        // `message.attempts`, matching the DLQ entry below.
        if let Err(e) = store
            .update(
                job_id,
                JobPatch::status(JobStatus::Failed)
                    .with_attempts(message.attempts)
                    .with_error(error_text.clone()),
            )
            .await
        {
            error!(%job_id, error = %e, "failed to record terminal failure");
        }

        let entry = DlqEntry::from_message(message, error_text, Utc::now());
        if let Err(e) = broker.push_dlq(&config.job_dlq_name, &entry).await {
            error!(%job_id, error = %e, "failed to push DLQ entry");
        } else {
            info!(%job_id, "job failed permanently; pushed to DLQ");
        }
    }
}
