//! Static mapping from job kind to an executable handler.
//!
//! A registry keyed by the closed [`crate::job::JobKind`] enum, rather
//! than a string-keyed lookup, so an unregistered kind is a compile-time
//! impossibility for any kind the engine knows about and a clean
//! `DispatchError::UnknownKind` for any it doesn't.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::job::JobKind;

/// A handler executes the business logic for one job kind. The engine
/// treats it as opaque — its body is out of scope for this crate.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> anyhow::Result<Value>;
}

/// Blanket impl so a plain async closure can be registered directly,
/// without a bespoke struct per handler.
#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        (self)(payload).await
    }
}

/// Built at process startup via [`HandlerRegistryBuilder`] and immutable
/// thereafter.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<JobKind, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// `None` means no handler is registered for `kind`; the worker turns
    /// this into an `UnknownKind` failure, not a crash.
    pub fn lookup(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}
