//! Redis-backed [`BrokerClient`]: `RPUSH`/`BLPOP` for the job and DLQ
//! queues, `SET key value EX seconds NX` for distributed leases and the
//! plain key/value surface.
//!
//! Grounded in `common_redis::RedisClient` (PostHog's `rust/common/redis`
//! crate): one cloned [`MultiplexedConnection`] per call (the connection
//! type is cheap to clone and safe to share across tasks), thiserror
//! error enum with `#[from]` conversions, `redis::cmd("SET")` built up
//! with `.arg(...)` for the NX/EX combination ordinary `AsyncCommands`
//! methods can't express.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

use dispatch_core::broker::BrokerClient;
use dispatch_core::error::DispatchError;
use dispatch_core::job::{DlqEntry, QueueMessage};

#[derive(Error, Debug)]
pub enum RedisBrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<RedisBrokerError> for DispatchError {
    fn from(err: RedisBrokerError) -> Self {
        DispatchError::BrokerUnavailable(err.to_string())
    }
}

/// A [`BrokerClient`] over a single Redis deployment. Queues are plain
/// Redis lists; the DLQ is a separate list under its own key; leases and
/// the generic key/value surface share the same keyspace as the queues,
/// under disjoint name prefixes so there's no collision.
#[derive(Clone)]
pub struct RedisBroker {
    connection: MultiplexedConnection,
}

impl RedisBroker {
    pub async fn new(addr: &str) -> Result<Self, RedisBrokerError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl BrokerClient for RedisBroker {
    async fn push(&self, queue: &str, message: &QueueMessage) -> Result<u64, DispatchError> {
        let payload = serde_json::to_string(message).map_err(RedisBrokerError::from)?;
        let mut conn = self.conn();
        let len: u64 = conn
            .rpush(queue, payload)
            .await
            .map_err(RedisBrokerError::from)?;
        Ok(len)
    }

    async fn push_dlq(&self, queue: &str, entry: &DlqEntry) -> Result<u64, DispatchError> {
        let payload = serde_json::to_string(entry).map_err(RedisBrokerError::from)?;
        let mut conn = self.conn();
        let len: u64 = conn
            .rpush(queue, payload)
            .await
            .map_err(RedisBrokerError::from)?;
        Ok(len)
    }

    async fn blocking_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>, DispatchError> {
        let mut conn = self.conn();
        // BLPOP takes an integer seconds timeout; 0 blocks forever, which
        // the engine never wants, so round up any sub-second remainder.
        let timeout_secs = timeout.as_secs().max(if timeout.subsec_nanos() > 0 { 1 } else { 0 });
        let result: Option<(String, String)> = conn
            .blpop(queue, timeout_secs as f64)
            .await
            .map_err(RedisBrokerError::from)?;

        match result {
            None => Ok(None),
            Some((_key, payload)) => {
                let message: QueueMessage =
                    serde_json::from_str(&payload).map_err(RedisBrokerError::from)?;
                Ok(Some(message))
            }
        }
    }

    async fn length(&self, queue: &str) -> Result<u64, DispatchError> {
        let mut conn = self.conn();
        let len: u64 = conn.llen(queue).await.map_err(RedisBrokerError::from)?;
        Ok(len)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), DispatchError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(RedisBrokerError::from)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(RedisBrokerError::from)?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DispatchError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await.map_err(RedisBrokerError::from)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), DispatchError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await.map_err(RedisBrokerError::from)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, DispatchError> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await.map_err(RedisBrokerError::from)?;
        Ok(exists)
    }

    async fn acquire_lease(
        &self,
        name: &str,
        ttl: Duration,
        blocking_timeout: Option<Duration>,
    ) -> Result<bool, DispatchError> {
        let key = format!("lock:{name}");
        let ttl_secs = ttl.as_secs().max(1);

        let try_once = |mut conn: MultiplexedConnection, key: String, ttl_secs: u64| async move {
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg("1")
                .arg("EX")
                .arg(ttl_secs)
                .arg("NX")
                .query_async(&mut conn)
                .await
                .map_err(RedisBrokerError::from)?;
            Ok::<bool, RedisBrokerError>(result.is_some())
        };

        match blocking_timeout {
            None => Ok(try_once(self.conn(), key, ttl_secs).await?),
            Some(timeout) if timeout.is_zero() => Ok(try_once(self.conn(), key, ttl_secs).await?),
            Some(timeout) => {
                const POLL_INTERVAL: Duration = Duration::from_millis(100);
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    if try_once(self.conn(), key.clone(), ttl_secs).await? {
                        return Ok(true);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(false);
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
                }
            }
        }
    }

    async fn release_lease(&self, name: &str) -> Result<(), DispatchError> {
        let key = format!("lock:{name}");
        let mut conn = self.conn();
        if let Err(e) = conn.del::<_, ()>(&key).await {
            warn!(%name, error = %e, "failed to release lease key");
            return Err(RedisBrokerError::from(e).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::job::JobKind;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn queue_message_round_trips_through_json() {
        let message = QueueMessage {
            id: Uuid::new_v4(),
            kind: JobKind::Email,
            payload: json!({"to": "a@example.com"}),
            priority: 5,
            attempts: 0,
        };
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: QueueMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn redis_error_maps_to_broker_unavailable() {
        let bad_addr = redis::Client::open("not-a-valid-url::::").unwrap_err();
        let err: DispatchError = RedisBrokerError::from(bad_addr).into();
        assert!(matches!(err, DispatchError::BrokerUnavailable(_)));
    }
}

/// Integration tests against a real Redis instance. Ignored by default —
/// run with `cargo test -p dispatch-broker-redis -- --ignored` against a
/// `REDIS_URL`, the same convention `common_redis` documents for its own
/// container-backed tests.
#[cfg(test)]
mod integration_tests {
    use super::*;
    use dispatch_core::job::JobKind;
    use serde_json::json;
    use uuid::Uuid;

    async fn test_broker() -> RedisBroker {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisBroker::new(&url).await.expect("redis reachable")
    }

    #[tokio::test]
    #[ignore]
    async fn push_and_pop_round_trip() {
        let broker = test_broker().await;
        let queue = format!("test:queue:{}", Uuid::new_v4());
        let message = QueueMessage {
            id: Uuid::new_v4(),
            kind: JobKind::Email,
            payload: json!({"to": "a@example.com"}),
            priority: 5,
            attempts: 0,
        };
        broker.push(&queue, &message).await.unwrap();
        let popped = broker
            .blocking_pop(&queue, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("message present");
        assert_eq!(popped.id, message.id);
    }

    #[tokio::test]
    #[ignore]
    async fn lease_is_exclusive_until_released() {
        let broker = test_broker().await;
        let name = format!("test-lease-{}", Uuid::new_v4());
        assert!(broker
            .acquire_lease(&name, Duration::from_secs(30), None)
            .await
            .unwrap());
        assert!(!broker
            .acquire_lease(&name, Duration::from_secs(30), None)
            .await
            .unwrap());
        broker.release_lease(&name).await.unwrap();
        assert!(broker
            .acquire_lease(&name, Duration::from_secs(30), None)
            .await
            .unwrap());
    }
}
