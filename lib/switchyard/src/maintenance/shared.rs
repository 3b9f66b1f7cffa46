use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::ensure;
use switchyard_config::{ConfigurationError, GenericConfiguration};
use tracing::info;

use super::{InvalidCoreSize, PoolMaintenanceScheduler, SchedulerError};

/// Configuration key holding the number of pool maintenance workers.
pub const POOL_CLEANER_CORE_SIZE_KEY: &str = "pool_cleaner_core_size";

/// Number of pool maintenance workers when none is configured.
pub const DEFAULT_CORE_SIZE: usize = 2;

#[derive(Debug)]
struct State {
    core_size: usize,
    scheduler: Option<PoolMaintenanceScheduler>,
}

/// Owner of the single pool maintenance scheduler shared by all clients.
///
/// The scheduler is created on the first call to [`acquire`][Self::acquire], and every later call returns the same
/// instance, no matter how many threads race on the first call. Resizes requested before the scheduler exists are
/// remembered and applied when it is created.
///
/// A `SharedScheduler` is meant to be created once, by whatever assembles the application, and handed to every
/// [`ClientFactory`][crate::ClientFactory]. Clones refer to the same scheduler.
#[derive(Clone, Debug)]
pub struct SharedScheduler {
    state: Arc<Mutex<State>>,
}

impl SharedScheduler {
    /// Creates a new `SharedScheduler` that will start `core_size` workers.
    ///
    /// A `core_size` of zero is replaced with [`DEFAULT_CORE_SIZE`].
    pub fn new(core_size: usize) -> Self {
        let core_size = if core_size == 0 { DEFAULT_CORE_SIZE } else { core_size };
        Self {
            state: Arc::new(Mutex::new(State {
                core_size,
                scheduler: None,
            })),
        }
    }

    /// Creates a new `SharedScheduler` sized from the `pool_cleaner_core_size` configuration key.
    ///
    /// # Errors
    ///
    /// If the key is set to zero or to something other than a non-negative integer, an error will be returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let core_size = config
            .try_get_typed::<usize>(POOL_CLEANER_CORE_SIZE_KEY)?
            .unwrap_or(DEFAULT_CORE_SIZE);
        if core_size == 0 {
            return Err(ConfigurationError::invalid_value(
                POOL_CLEANER_CORE_SIZE_KEY,
                "at least one worker is required",
            ));
        }

        Ok(Self::new(core_size))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the shared scheduler, creating it if necessary.
    ///
    /// # Errors
    ///
    /// If the scheduler has to be created and its workers cannot be spawned, an error will be returned. The next call
    /// tries again.
    pub fn acquire(&self) -> Result<PoolMaintenanceScheduler, SchedulerError> {
        let mut state = self.lock();
        if let Some(scheduler) = &state.scheduler {
            return Ok(scheduler.clone());
        }

        let scheduler = PoolMaintenanceScheduler::new(state.core_size)?;
        info!(core_size = state.core_size, "Started pool maintenance scheduler.");

        state.scheduler = Some(scheduler.clone());
        Ok(scheduler)
    }

    /// Returns the shared scheduler if it has already been created.
    pub fn get(&self) -> Option<PoolMaintenanceScheduler> {
        self.lock().scheduler.clone()
    }

    /// Changes the number of pool maintenance workers.
    ///
    /// # Errors
    ///
    /// If `core_size` is zero, or the running scheduler fails to spawn the extra workers, an error will be returned and
    /// the previous size is kept.
    pub fn resize(&self, core_size: usize) -> Result<(), SchedulerError> {
        ensure!(core_size > 0, InvalidCoreSize { core_size });

        let mut state = self.lock();
        if let Some(scheduler) = &state.scheduler {
            scheduler.resize(core_size)?;
        }
        state.core_size = core_size;

        Ok(())
    }

    /// Returns the number of workers the scheduler runs, or will run once created.
    pub fn core_size(&self) -> usize {
        self.lock().core_size
    }
}

impl Default for SharedScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CORE_SIZE)
    }
}
