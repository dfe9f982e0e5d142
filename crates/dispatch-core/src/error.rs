//! Error taxonomy shared by every component of the dispatch engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Broker I/O failed after the client's bounded internal retries.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Store I/O failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unknown job id.
    #[error("job not found")]
    NotFound,

    /// Job not in `Failed` state, or retries already exhausted.
    #[error("job not retriable: not failed or max retries exceeded")]
    NotRetriable,

    /// No handler registered for a dequeued message's kind.
    #[error("no handler for job kind: {0}")]
    UnknownKind(String),

    /// A handler raised while executing a job.
    #[error("handler failed: {0}")]
    HandlerFailure(#[from] anyhow::Error),

    /// Could not acquire the per-job lease (non-blocking path). Not
    /// surfaced to callers — the worker drops the message silently — but
    /// modeled as a variant so internal plumbing can match on it.
    #[error("lease contended")]
    LeaseContended,

    /// A `Submit` request failed validation before reaching the store.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Coarse category used by callers (e.g. the external HTTP layer) to map
/// a `DispatchError` onto a transport-level status, without the core
/// knowing anything about HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller's fault — 4xx territory.
    Client,
    /// Our fault or a dependency's fault — 5xx territory.
    Server,
}

pub trait Categorizable {
    fn category(&self) -> ErrorCategory;
}

impl Categorizable for DispatchError {
    fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::NotFound
            | DispatchError::NotRetriable
            | DispatchError::Validation(_) => ErrorCategory::Client,
            DispatchError::BrokerUnavailable(_)
            | DispatchError::StoreUnavailable(_)
            | DispatchError::UnknownKind(_)
            | DispatchError::HandlerFailure(_)
            | DispatchError::LeaseContended => ErrorCategory::Server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_categorized_correctly() {
        assert_eq!(DispatchError::NotFound.category(), ErrorCategory::Client);
        assert_eq!(
            DispatchError::NotRetriable.category(),
            ErrorCategory::Client
        );
        assert_eq!(
            DispatchError::Validation("bad".into()).category(),
            ErrorCategory::Client
        );
    }

    #[test]
    fn server_errors_are_categorized_correctly() {
        assert_eq!(
            DispatchError::BrokerUnavailable("down".into()).category(),
            ErrorCategory::Server
        );
        assert_eq!(
            DispatchError::LeaseContended.category(),
            ErrorCategory::Server
        );
    }
}
