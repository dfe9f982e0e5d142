//! Core engine for a distributed, asynchronous job dispatch system:
//! queue protocol, durable job records, handler dispatch, and the
//! worker-pool state machine that ties them together.
//!
//! This crate defines the contracts ([`broker::BrokerClient`],
//! [`store::JobStore`]) and the logic that runs against them
//! ([`dispatcher::Dispatcher`], [`worker::WorkerPool`]). Concrete
//! backends live in sibling crates — `dispatch-broker-redis` and
//! `dispatch-store-postgres` — so that this crate, and anything
//! testing against it, never needs a running Redis or Postgres.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod registry;
pub mod store;
pub mod worker;

pub use broker::BrokerClient;
pub use config::Config;
pub use dispatcher::{Dispatcher, Stats};
pub use error::{Categorizable, DispatchError, ErrorCategory};
pub use job::{
    DlqEntry, Job, JobCreate, JobFilter, JobKind, JobPatch, JobStatus, QueueMessage,
};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, JobHandler};
pub use store::JobStore;
pub use worker::WorkerPool;
