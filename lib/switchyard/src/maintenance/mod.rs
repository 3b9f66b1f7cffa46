//! Connection pool maintenance.
//!
//! Every pooled client registers a periodic cleanup task that evicts stale idle connections. All of those tasks run on
//! a single [`PoolMaintenanceScheduler`], a small pool of background threads whose size can be changed at runtime.
//! [`SharedScheduler`] owns the lazily-created scheduler instance and hands the same one to every client.

use std::io;

use snafu::Snafu;

mod scheduler;
pub use self::scheduler::{CleanupTaskHandle, PoolMaintenanceScheduler};

mod shared;
pub use self::shared::{SharedScheduler, DEFAULT_CORE_SIZE, POOL_CLEANER_CORE_SIZE_KEY};

mod worker;

/// A scheduler error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum SchedulerError {
    /// The requested core size was zero.
    #[snafu(display("Invalid core size {}: at least one worker is required.", core_size))]
    InvalidCoreSize {
        /// Requested core size.
        core_size: usize,
    },

    /// A worker thread could not be spawned.
    #[snafu(display("Failed to spawn pool maintenance worker."))]
    SpawnWorker {
        /// Error source.
        source: io::Error,
    },
}
