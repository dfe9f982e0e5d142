//! Configuration values consumed by the dispatch engine.
//!
//! Loading these from the environment or a file is deliberately out of
//! scope — that belongs to the external HTTP/CLI bootstrap layer. This
//! module only fixes the shape and the defaults.

/// Primary job queue name.
pub const DEFAULT_JOB_QUEUE_NAME: &str = "jobs:queue";
/// Dead-letter queue name.
pub const DEFAULT_JOB_DLQ_NAME: &str = "jobs:dlq";
/// Reserved; not used by this core.
pub const DEFAULT_JOB_PROCESSING_NAME: &str = "jobs:processing";

#[derive(Debug, Clone)]
pub struct Config {
    pub job_queue_name: String,
    pub job_dlq_name: String,
    /// Reserved; not read anywhere in the dispatch engine.
    pub job_processing_name: String,
    /// Cap on automatic retries.
    pub max_retries: i32,
    /// Base, in seconds, for exponential backoff (`RETRY_DELAY · 2^(n-1)`).
    pub retry_delay_secs: u64,
    /// Total in-flight budget across the whole pool.
    pub worker_concurrency: usize,
    /// Blocking-pop timeout, in seconds.
    pub worker_poll_interval_secs: u64,
    /// Intended TTL for cached results; not enforced by this core.
    pub job_result_ttl_secs: u64,
    /// Per-job lease expiry, in seconds.
    pub lease_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job_queue_name: DEFAULT_JOB_QUEUE_NAME.to_string(),
            job_dlq_name: DEFAULT_JOB_DLQ_NAME.to_string(),
            job_processing_name: DEFAULT_JOB_PROCESSING_NAME.to_string(),
            max_retries: 3,
            retry_delay_secs: 5,
            worker_concurrency: 20,
            worker_poll_interval_secs: 1,
            job_result_ttl_secs: 3600,
            lease_ttl_secs: 300,
        }
    }
}

impl Config {
    /// Backoff delay for the `n`-th retry (1-indexed):
    /// `RETRY_DELAY · 2^(n-1)` seconds.
    pub fn backoff_delay_secs(&self, attempt_number: i32) -> u64 {
        self.retry_delay_secs * 2u64.pow((attempt_number - 1).max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.job_queue_name, "jobs:queue");
        assert_eq!(config.job_dlq_name, "jobs:dlq");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_secs, 5);
        assert_eq!(config.lease_ttl_secs, 300);
    }

    #[test]
    fn backoff_follows_retry_delay_times_two_to_the_n_minus_one() {
        let config = Config::default();
        assert_eq!(config.backoff_delay_secs(1), 5);
        assert_eq!(config.backoff_delay_secs(2), 10);
        assert_eq!(config.backoff_delay_secs(3), 20);
    }
}
