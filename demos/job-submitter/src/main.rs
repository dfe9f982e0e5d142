//! Wires the dispatch engine's in-memory fakes together and drives
//! `Submit`, `Get`, `List`, `Stats`, and the explicit `Retry` API end to
//! end — standing in for the HTTP layer that is out of scope for this
//! crate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dispatch_core::{
    Config, Dispatcher, HandlerRegistry, JobCreate, JobKind, JobPatch, JobStatus, JobStore,
    WorkerPool,
};
use dispatch_testing::{InMemoryBroker, InMemoryJobStore};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let store = Arc::new(InMemoryJobStore::new());
    let broker = Arc::new(InMemoryBroker::new());

    let mut config = Config::default();
    // A small retry budget keeps the webhook job's automatic exhaustion
    // quick. Note that once a job exhausts its automatic retries its
    // store `attempts` equals `max_attempts`, so it is no longer
    // retriable through the explicit API below (which refuses unless
    // `attempts < max_attempts`) — that path is demonstrated separately,
    // on a job Failed for some other reason.
    config.max_retries = 1;
    config.retry_delay_secs = 0;

    // A Webhook handler that always fails, so the demo exercises the
    // worker's automatic retry/backoff ladder to exhaustion and the
    // resulting DLQ push.
    let registry = HandlerRegistry::builder()
        .register(JobKind::Email, |payload: serde_json::Value| async move {
            println!("sending email to {}", payload["to"]);
            Ok(json!({"status": "sent"}))
        })
        .register(JobKind::Webhook, |_payload: serde_json::Value| async move {
            anyhow::bail!("webhook endpoint timed out")
        })
        .build();

    let dispatcher = Dispatcher::new(
        store.clone() as Arc<dyn dispatch_core::JobStore>,
        broker.clone() as Arc<dyn dispatch_core::BrokerClient>,
        config.clone(),
    );

    let mut pool = WorkerPool::new(
        broker.clone() as Arc<dyn dispatch_core::BrokerClient>,
        store.clone() as Arc<dyn dispatch_core::JobStore>,
        registry,
        config,
        2,
    );
    pool.start();

    let email_job = dispatcher
        .submit(JobCreate {
            kind: JobKind::Email,
            payload: json!({"to": "ada@example.com", "subject": "welcome"}),
            priority: 5,
            scheduled_at: None,
        })
        .await?;
    println!("submitted email job {}", email_job.id);

    let webhook_job = dispatcher
        .submit(JobCreate {
            kind: JobKind::Webhook,
            payload: json!({"url": "https://example.com/hooks/order-created"}),
            priority: 3,
            scheduled_at: None,
        })
        .await?;
    println!("submitted webhook job {}", webhook_job.id);

    let email_final = wait_for_terminal(&dispatcher, email_job.id).await?;
    println!(
        "email job finished: status={:?} result={:?}",
        email_final.status, email_final.result
    );

    let webhook_failed = wait_for_status(&dispatcher, webhook_job.id, JobStatus::Failed).await?;
    println!(
        "webhook job exhausted its retries: status={:?} attempts={} error={:?}",
        webhook_failed.status, webhook_failed.attempts, webhook_failed.error
    );
    println!(
        "a second Retry({}) would be refused: attempts({}) == max_attempts({})",
        webhook_job.id, webhook_failed.attempts, webhook_failed.max_attempts
    );

    // The explicit Retry entry point only makes sense for a job that
    // Failed with attempts still below max_attempts — unlike the webhook
    // job above, which exhausted its automatic budget. An
    // email job that failed for some other reason (e.g. its enqueue
    // push failing after the store write) is a job this shape applies
    // to; simulate that here directly against the store.
    let retriable_job = dispatcher
        .submit(JobCreate {
            kind: JobKind::Email,
            payload: json!({"to": "ops@example.com", "subject": "retry demo"}),
            priority: 5,
            scheduled_at: None,
        })
        .await?;
    store
        .update(
            retriable_job.id,
            JobPatch::status(JobStatus::Failed).with_error("simulated upstream outage"),
        )
        .await?;
    println!(
        "forced job {} into Failed (attempts={}, max_attempts={}) to demonstrate Retry",
        retriable_job.id, retriable_job.attempts, retriable_job.max_attempts
    );

    let retried = dispatcher.retry(retriable_job.id).await?;
    println!(
        "called Retry explicitly: status={:?} attempts={}",
        retried.status, retried.attempts
    );

    let retriable_final = wait_for_terminal(&dispatcher, retriable_job.id).await?;
    println!(
        "retried job finished: status={:?} result={:?}",
        retriable_final.status, retriable_final.result
    );

    let stats = dispatcher.stats().await?;
    println!(
        "stats: total={} completed={} failed={} queue_depth={} success_rate={:.2}",
        stats.total, stats.completed, stats.failed, stats.queue_depth, stats.success_rate
    );

    let all_jobs = dispatcher
        .list(dispatch_core::JobFilter::new())
        .await?;
    println!("store holds {} job records", all_jobs.len());

    pool.stop().await;
    Ok(())
}

async fn wait_for_terminal(
    dispatcher: &Dispatcher,
    id: uuid::Uuid,
) -> Result<dispatch_core::Job> {
    loop {
        let job = dispatcher.get(id).await?.expect("job exists");
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_status(
    dispatcher: &Dispatcher,
    id: uuid::Uuid,
    status: JobStatus,
) -> Result<dispatch_core::Job> {
    loop {
        let job = dispatcher.get(id).await?.expect("job exists");
        if job.status == status {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
