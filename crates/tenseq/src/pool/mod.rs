//! Fixed-size worker pool with one store connection per worker.
//!
//! ## Structure
//!
//! - [`manager`] - [`WorkerPool`]: startup, task intake and shutdown.
//! - [`worker`] - the per-worker receive / transact / signal loop.
//!
//! Workers share a single bounded intake queue. A worker stuck waiting on a
//! tenant lock only holds the task it is running, so queued work for other
//! tenants keeps flowing to the remaining workers.

pub mod manager;
pub mod worker;

use core::time::Duration;

pub use manager::{Intake, StoreTx, WorkerPool};

/// How a worker treats transient failures (see [`Error::is_transient`]).
///
/// The allocation protocol itself never retries. With the default policy a
/// failed task is reported once and never re-run.
///
/// [`Error::is_transient`]: crate::Error::is_transient
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total number of transactions a task may be run in. At least 1.
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Number of workers, and therefore of store connections.
    pub num_workers: usize,
    /// Capacity of the shared intake queue. Submitting blocks while it is
    /// full.
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl PoolConfig {
    /// `num_workers` workers and a queue ten tasks deep per worker.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            queue_capacity: num_workers.saturating_mul(10),
            retry: RetryPolicy::default(),
        }
    }
}
