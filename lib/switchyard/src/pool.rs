//! Idle connection pooling.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use metrics::counter;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{
    config::ClientConfiguration,
    endpoint::Endpoint,
    maintenance::{CleanupTaskHandle, PoolMaintenanceScheduler},
};

/// A connection that can be kept in a [`ConnectionPool`].
pub trait PooledConnection: Send + 'static {
    /// Returns `true` if the connection can still be used for another request.
    fn is_reusable(&self) -> bool {
        true
    }
}

impl PooledConnection for TcpStream {
    fn is_reusable(&self) -> bool {
        // An idle connection should have nothing to read. Readable data, or EOF, means the peer has closed it or sent
        // something unexpected.
        let mut scratch = [0u8; 1];
        matches!(self.try_read(&mut scratch), Err(e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }
}

struct IdleConnection<C> {
    connection: C,
    idle_since: Instant,
}

/// A pool of idle connections, keyed by endpoint.
///
/// Connections are handed out most-recently-used first. Each endpoint holds at most `max_idle_per_endpoint` idle
/// connections; connections returned beyond that are closed. Connections idle for longer than the idle timeout are
/// never handed out, and are closed by [`evict_stale`][Self::evict_stale].
pub struct ConnectionPool<C> {
    name: String,
    max_idle_per_endpoint: usize,
    idle_timeout: Duration,
    idle: Mutex<HashMap<Endpoint, VecDeque<IdleConnection<C>>>>,
}

impl<C: PooledConnection> ConnectionPool<C> {
    /// Creates a new, empty `ConnectionPool`.
    pub fn new<N: Into<String>>(name: N, max_idle_per_endpoint: usize, idle_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            max_idle_per_endpoint,
            idle_timeout,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a new, empty `ConnectionPool` sized from the given client configuration.
    pub fn from_configuration(config: &ClientConfiguration) -> Self {
        Self::new(
            config.client_name.clone(),
            config.max_connections_per_endpoint,
            config.idle_connection_timeout(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Endpoint, VecDeque<IdleConnection<C>>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes an idle connection to `endpoint` out of the pool.
    ///
    /// Stale and unusable connections found along the way are closed.
    pub fn checkout(&self, endpoint: &Endpoint) -> Option<C> {
        let now = Instant::now();
        let mut idle = self.lock();
        let queue = idle.get_mut(endpoint)?;

        while let Some(entry) = queue.pop_back() {
            if now.duration_since(entry.idle_since) < self.idle_timeout && entry.connection.is_reusable() {
                return Some(entry.connection);
            }
        }

        None
    }

    /// Returns a connection to the pool.
    ///
    /// Returns `false` if the connection was closed instead, either because it is no longer usable or because the pool
    /// for `endpoint` is full.
    pub fn checkin(&self, endpoint: Endpoint, connection: C) -> bool {
        if !connection.is_reusable() {
            return false;
        }

        let mut idle = self.lock();
        let queue = idle.entry(endpoint).or_default();
        if queue.len() >= self.max_idle_per_endpoint {
            return false;
        }

        queue.push_back(IdleConnection {
            connection,
            idle_since: Instant::now(),
        });
        true
    }

    /// Closes every idle connection that has exceeded the idle timeout or is no longer usable.
    ///
    /// Returns the number of connections closed.
    pub fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let mut idle = self.lock();

        let mut evicted = 0;
        for queue in idle.values_mut() {
            let before = queue.len();
            queue.retain(|entry| {
                now.duration_since(entry.idle_since) < self.idle_timeout && entry.connection.is_reusable()
            });
            evicted += before - queue.len();
        }
        idle.retain(|_, queue| !queue.is_empty());
        drop(idle);

        if evicted > 0 {
            debug!(pool = %self.name, evicted, "Evicted stale idle connections.");
            counter!("switchyard_pool_connections_evicted_total", "client" => self.name.clone())
                .increment(evicted as u64);
        }

        evicted
    }

    /// Returns the number of idle connections across all endpoints.
    pub fn idle_count(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    /// Registers a periodic [`evict_stale`][Self::evict_stale] pass with the maintenance scheduler.
    ///
    /// The task holds only a weak reference to the pool. It is cancelled when the returned registration is dropped.
    pub fn register_cleanup(
        self: &Arc<Self>, scheduler: &PoolMaintenanceScheduler, period: Duration,
    ) -> CleanupRegistration {
        let pool = Arc::downgrade(self);
        let handle = scheduler.schedule(format!("{}-idle-eviction", self.name), period, move || {
            if let Some(pool) = pool.upgrade() {
                pool.evict_stale();
            }
            Ok(())
        });

        CleanupRegistration {
            handle,
            _scheduler: scheduler.clone(),
        }
    }
}

/// A connection pool's periodic cleanup task.
///
/// Dropping the registration cancels the task. It also keeps the scheduler running for as long as the pool exists.
#[derive(Debug)]
pub struct CleanupRegistration {
    handle: CleanupTaskHandle,
    _scheduler: PoolMaintenanceScheduler,
}

impl CleanupRegistration {
    /// Returns the name of the cleanup task.
    pub fn task_name(&self) -> &str {
        self.handle.name()
    }

    /// Returns `true` if the cleanup task is no longer scheduled.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl Drop for CleanupRegistration {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
