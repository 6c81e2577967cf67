//! Queue configuration.

use std::path::PathBuf;

/// Exponential backoff parameters shared by the default queueing policy and
/// any per-request override.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub multiplier: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            multiplier: 2,
            max_ms: 10_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before the `attempt`'th retry (`attempt` is 1 for the first retry).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.initial_ms
            .saturating_mul(self.multiplier.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_ms)
    }
}

/// Configuration recognized by the queue constructor, per the external
/// interface contract.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory holding one file per queue entry plus a `.version` sibling.
    pub storage_path: PathBuf,

    /// Upper bound on concurrently in-flight non-barrier requests.
    pub max_concurrent_non_barrier: usize,

    /// Backoff applied when a request's own policy doesn't override it.
    pub default_backoff: BackoffConfig,

    /// Cap on retry attempts when a request's own policy doesn't override it;
    /// `None` means unbounded.
    pub default_max_attempts: Option<u32>,
}

impl QueueConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./outbox-queue"),
            max_concurrent_non_barrier: 1,
            default_backoff: BackoffConfig::default(),
            default_max_attempts: Some(5),
        }
    }
}
