//! Drives an always-failing handler through the worker pool's
//! retry/backoff ladder to exhaustion and the resulting DLQ push (spec
//! §4.5 step 6, scenario 3), then a second job that fails twice before
//! succeeding (scenario 2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dispatch_core::{Config, Dispatcher, HandlerRegistry, JobCreate, JobKind};
use dispatch_testing::{InMemoryBroker, InMemoryJobStore};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let store = Arc::new(InMemoryJobStore::new());
    let broker = Arc::new(InMemoryBroker::new());

    let mut config = Config::default();
    config.max_retries = 3;
    config.retry_delay_secs = 1; // real backoff math (1, 2, 4s), scaled down for the demo

    let eventual_success_calls = Arc::new(AtomicUsize::new(0));
    let eventual_success_calls_for_handler = eventual_success_calls.clone();

    let registry = HandlerRegistry::builder()
        .register(JobKind::DataProcessing, |_payload: serde_json::Value| async move {
            anyhow::bail!("downstream dataset unavailable")
        })
        .register(JobKind::ImageProcessing, move |payload: serde_json::Value| {
            let calls = eventual_success_calls_for_handler.clone();
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    anyhow::bail!("thumbnail renderer crashed");
                }
                Ok(json!({"thumbnail_url": format!("https://cdn.example.com/{}", payload["source"])}))
            }
        })
        .build();

    let dispatcher = Dispatcher::new(
        store.clone() as Arc<dyn dispatch_core::JobStore>,
        broker.clone() as Arc<dyn dispatch_core::BrokerClient>,
        config.clone(),
    );

    let mut pool = dispatch_core::WorkerPool::new(
        broker.clone() as Arc<dyn dispatch_core::BrokerClient>,
        store.clone() as Arc<dyn dispatch_core::JobStore>,
        registry,
        config,
        1,
    );
    pool.start();

    let doomed = dispatcher
        .submit(JobCreate {
            kind: JobKind::DataProcessing,
            payload: json!({"dataset": "quarterly-report"}),
            priority: 5,
            scheduled_at: None,
        })
        .await?;
    println!(
        "submitted job {} with a handler that always fails (max_attempts={})",
        doomed.id, doomed.max_attempts
    );

    let recovers = dispatcher
        .submit(JobCreate {
            kind: JobKind::ImageProcessing,
            payload: json!({"source": "product-42.png"}),
            priority: 5,
            scheduled_at: None,
        })
        .await?;
    println!(
        "submitted job {} that fails twice then succeeds",
        recovers.id
    );

    let doomed_final = wait_for_terminal(&dispatcher, doomed.id).await?;
    println!(
        "always-failing job settled at status={:?} attempts={} error={:?}",
        doomed_final.status, doomed_final.attempts, doomed_final.error
    );
    println!(
        "dead-letter queue now holds {} message(s)",
        broker.dlq_len(&Config::default().job_dlq_name).await
    );

    let recovers_final = wait_for_terminal(&dispatcher, recovers.id).await?;
    println!(
        "eventually-succeeding job settled at status={:?} attempts={} result={:?}",
        recovers_final.status, recovers_final.attempts, recovers_final.result
    );

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
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
