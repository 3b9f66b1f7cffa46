use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt, io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use metrics::gauge;
use snafu::{ensure, ResultExt as _};
use switchyard_config::GenericError;
use tracing::{debug, error, info};

use super::{worker, InvalidCoreSize, SchedulerError, SpawnWorker};

const MINIMUM_PERIOD: Duration = Duration::from_millis(1);

// Roughly one hundred years.
const MAXIMUM_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub(super) type CleanupFn = Box<dyn Fn() -> Result<(), GenericError> + Send + Sync>;

type SpawnFn = fn(String, Arc<Shared>) -> io::Result<()>;

pub(super) struct TaskEntry {
    pub(super) name: String,
    pub(super) period: Duration,
    pub(super) run: CleanupFn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct Scheduled {
    pub(super) deadline: Instant,
    seq: u64,
    pub(super) task_id: u64,
}

pub(super) struct State {
    pub(super) queue: BinaryHeap<Reverse<Scheduled>>,
    pub(super) tasks: HashMap<u64, Arc<TaskEntry>>,
    pub(super) core_size: usize,
    pub(super) live_workers: usize,
    pub(super) shutdown: bool,
    next_task_id: u64,
    next_worker_id: u64,
    next_seq: u64,
}

impl State {
    fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            tasks: HashMap::new(),
            core_size: 0,
            live_workers: 0,
            shutdown: false,
            next_task_id: 0,
            next_worker_id: 0,
            next_seq: 0,
        }
    }

    pub(super) fn enqueue(&mut self, task_id: u64, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Scheduled { deadline, seq, task_id }));
    }

    pub(super) fn report_workers(&self) {
        gauge!("switchyard_pool_cleaner_workers").set(self.live_workers as f64);
    }
}

/// Returns the instant one `period` from now, saturating instead of overflowing.
pub(super) fn deadline_after(period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(period.min(MAXIMUM_PERIOD))
        .or_else(|| now.checked_add(MINIMUM_PERIOD))
        .unwrap_or(now)
}

/// State shared between the scheduler handle and its worker threads.
pub(super) struct Shared {
    state: Mutex<State>,
    pub(super) wakeup: Condvar,
}

impl Shared {
    pub(super) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    shared: Arc<Shared>,
    spawn: SpawnFn,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        state.tasks.clear();
        state.queue.clear();
        drop(state);
        self.shared.wakeup.notify_all();
    }
}

/// A periodic task scheduler for connection pool cleanup.
///
/// Tasks run on a pool of background threads. The number of threads (the core size) can be changed at any time with
/// [`resize`][Self::resize]. Growing the pool spawns the missing threads before returning, while surplus threads retire
/// on their own once they are idle, so the pool never drops to zero threads and no scheduled task is lost.
///
/// Tasks use fixed-delay scheduling: the next run of a task is one period after its previous run finished, so a single
/// task never runs concurrently with itself. A task that fails or panics is logged and kept on its schedule.
///
/// Worker threads are detached and never block process exit. Once every clone of the scheduler has been dropped, the
/// workers finish their current task and exit.
#[derive(Clone)]
pub struct PoolMaintenanceScheduler {
    inner: Arc<Inner>,
}

impl PoolMaintenanceScheduler {
    /// Creates a new `PoolMaintenanceScheduler` and starts `core_size` worker threads.
    ///
    /// # Errors
    ///
    /// If `core_size` is zero, or a worker thread cannot be spawned, an error will be returned.
    pub fn new(core_size: usize) -> Result<Self, SchedulerError> {
        Self::with_spawner(core_size, worker::spawn)
    }

    fn with_spawner(core_size: usize, spawn: SpawnFn) -> Result<Self, SchedulerError> {
        ensure!(core_size > 0, InvalidCoreSize { core_size });

        let scheduler = Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    state: Mutex::new(State::new()),
                    wakeup: Condvar::new(),
                }),
                spawn,
            }),
        };

        let mut state = scheduler.inner.shared.lock();
        state.core_size = core_size;
        scheduler.spawn_workers(&mut state).context(SpawnWorker)?;
        drop(state);

        Ok(scheduler)
    }

    fn spawn_workers(&self, state: &mut State) -> io::Result<()> {
        while state.live_workers < state.core_size {
            let name = format!("switchyard-pool-cleaner-{:02}", state.next_worker_id);
            (self.inner.spawn)(name, Arc::clone(&self.inner.shared))?;

            state.next_worker_id += 1;
            state.live_workers += 1;
            state.report_workers();
        }

        Ok(())
    }

    /// Changes the number of worker threads.
    ///
    /// Missing workers are spawned before this method returns. Surplus workers retire once they finish their current
    /// task, so [`live_workers`][Self::live_workers] converges to the new core size shortly afterwards.
    ///
    /// # Errors
    ///
    /// If `core_size` is zero, or a worker thread cannot be spawned, an error will be returned and the previous core
    /// size is kept.
    pub fn resize(&self, core_size: usize) -> Result<(), SchedulerError> {
        ensure!(core_size > 0, InvalidCoreSize { core_size });

        let mut state = self.inner.shared.lock();
        let previous = state.core_size;
        if previous == core_size {
            return Ok(());
        }

        state.core_size = core_size;
        let result = self.spawn_workers(&mut state);
        if result.is_err() {
            // Any worker spawned before the failure is now surplus and retires.
            state.core_size = previous;
        }
        drop(state);
        self.inner.shared.wakeup.notify_all();

        match result {
            Ok(()) => {
                info!(previous, core_size, "Resized pool maintenance scheduler.");
                Ok(())
            }
            Err(e) => {
                error!(
                    error = %e,
                    previous,
                    requested = core_size,
                    "Failed to resize pool maintenance scheduler. Keeping previous core size."
                );
                Err(e).context(SpawnWorker)
            }
        }
    }

    /// Schedules `task` to run every `period`, starting one period from now.
    ///
    /// Periods shorter than one millisecond are rounded up to one millisecond, and periods too long to represent as a
    /// deadline are capped at roughly one hundred years.
    pub fn schedule<N, F>(&self, name: N, period: Duration, task: F) -> CleanupTaskHandle
    where
        N: Into<String>,
        F: Fn() -> Result<(), GenericError> + Send + Sync + 'static,
    {
        let name = name.into();
        let period = period.clamp(MINIMUM_PERIOD, MAXIMUM_PERIOD);

        let mut state = self.inner.shared.lock();
        let id = state.next_task_id;
        state.next_task_id += 1;
        state.tasks.insert(
            id,
            Arc::new(TaskEntry {
                name: name.clone(),
                period,
                run: Box::new(task),
            }),
        );
        state.enqueue(id, deadline_after(period));
        drop(state);
        self.inner.shared.wakeup.notify_one();

        debug!(task = %name, period_ms = period.as_millis() as u64, "Scheduled cleanup task.");

        CleanupTaskHandle {
            id,
            name,
            shared: Arc::downgrade(&self.inner.shared),
        }
    }

    /// Returns the configured number of worker threads.
    pub fn core_size(&self) -> usize {
        self.inner.shared.lock().core_size
    }

    /// Returns the number of worker threads currently running.
    pub fn live_workers(&self) -> usize {
        self.inner.shared.lock().live_workers
    }

    /// Returns the number of tasks currently scheduled.
    pub fn scheduled_tasks(&self) -> usize {
        self.inner.shared.lock().tasks.len()
    }

    /// Returns `true` if both handles refer to the same scheduler.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PoolMaintenanceScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.shared.lock();
        f.debug_struct("PoolMaintenanceScheduler")
            .field("core_size", &state.core_size)
            .field("live_workers", &state.live_workers)
            .field("scheduled_tasks", &state.tasks.len())
            .finish()
    }
}

/// A handle to a scheduled cleanup task.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct CleanupTaskHandle {
    id: u64,
    name: String,
    shared: Weak<Shared>,
}

impl CleanupTaskHandle {
    /// Returns the name of the task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancels the task.
    ///
    /// A run already in progress is allowed to finish, but the task is not run again. Returns `true` if the task was
    /// still scheduled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        let mut state = shared.lock();
        let removed = state.tasks.remove(&self.id).is_some();
        if removed {
            state.queue.retain(|Reverse(scheduled)| scheduled.task_id != self.id);
        }
        drop(state);

        if removed {
            shared.wakeup.notify_all();
            debug!(task = %self.name, "Cancelled cleanup task.");
        }
        removed
    }

    /// Returns `true` if the task is no longer scheduled.
    pub fn is_cancelled(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => !shared.lock().tasks.contains_key(&self.id),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};

    use proptest::prelude::*;

    use super::*;

    fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl Fn() -> Result<(), GenericError> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, SeqCst);
            Ok(())
        }
    }

    #[test]
    fn zero_core_size_is_rejected() {
        assert!(matches!(
            PoolMaintenanceScheduler::new(0),
            Err(SchedulerError::InvalidCoreSize { core_size: 0 })
        ));

        let scheduler = PoolMaintenanceScheduler::new(2).unwrap();
        assert!(matches!(
            scheduler.resize(0),
            Err(SchedulerError::InvalidCoreSize { core_size: 0 })
        ));
        assert_eq!(scheduler.core_size(), 2);
        assert_eq!(scheduler.live_workers(), 2);
    }

    #[test]
    fn runs_tasks_periodically() {
        let scheduler = PoolMaintenanceScheduler::new(1).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule("periodic", Duration::from_millis(5), counting_task(&runs));

        assert_eq!(handle.name(), "periodic");
        assert_eq!(scheduler.scheduled_tasks(), 1);
        assert!(wait_until(Duration::from_secs(5), || runs.load(SeqCst) >= 3));
    }

    #[test]
    fn failing_tasks_stay_scheduled_and_isolated() {
        let scheduler = PoolMaintenanceScheduler::new(2).unwrap();
        let failing_runs = Arc::new(AtomicUsize::new(0));
        let panicking_runs = Arc::new(AtomicUsize::new(0));
        let healthy_runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&failing_runs);
        let _failing = scheduler.schedule("failing", Duration::from_millis(5), move || {
            counter.fetch_add(1, SeqCst);
            Err(anyhow::anyhow!("pool is on fire"))
        });
        let counter = Arc::clone(&panicking_runs);
        let _panicking = scheduler.schedule("panicking", Duration::from_millis(5), move || {
            counter.fetch_add(1, SeqCst);
            panic!("cleanup exploded");
        });
        let _healthy = scheduler.schedule("healthy", Duration::from_millis(5), counting_task(&healthy_runs));

        assert!(wait_until(Duration::from_secs(5), || {
            failing_runs.load(SeqCst) >= 3 && panicking_runs.load(SeqCst) >= 3 && healthy_runs.load(SeqCst) >= 3
        }));
        assert_eq!(scheduler.scheduled_tasks(), 3);
        assert_eq!(scheduler.live_workers(), 2);
    }

    #[test]
    fn cancelled_task_stops_running() {
        let scheduler = PoolMaintenanceScheduler::new(1).unwrap();
        let cancelled_runs = Arc::new(AtomicUsize::new(0));
        let other_runs = Arc::new(AtomicUsize::new(0));

        let cancelled = scheduler.schedule("cancelled", Duration::from_millis(2), counting_task(&cancelled_runs));
        let other = scheduler.schedule("other", Duration::from_millis(2), counting_task(&other_runs));
        assert!(wait_until(Duration::from_secs(5), || cancelled_runs.load(SeqCst) >= 1));

        assert!(cancelled.cancel());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.cancel());
        assert!(!other.is_cancelled());

        // Let any in-flight run finish before taking the snapshot.
        std::thread::sleep(Duration::from_millis(20));
        let snapshot = cancelled_runs.load(SeqCst);
        let other_snapshot = other_runs.load(SeqCst);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(cancelled_runs.load(SeqCst), snapshot);
        assert!(other_runs.load(SeqCst) > other_snapshot);
        assert_eq!(scheduler.scheduled_tasks(), 1);
    }

    #[test]
    fn cancel_drops_queued_runs() {
        let scheduler = PoolMaintenanceScheduler::new(1).unwrap();
        let handles = (0..8)
            .map(|i| scheduler.schedule(format!("idle-{i}"), Duration::from_secs(3600), || Ok(())))
            .collect::<Vec<_>>();
        assert_eq!(scheduler.inner.shared.lock().queue.len(), 8);

        for handle in &handles[..6] {
            assert!(handle.cancel());
        }

        let state = scheduler.inner.shared.lock();
        assert_eq!(state.queue.len(), 2);
        assert_eq!(state.tasks.len(), 2);
    }

    #[test]
    fn unbounded_period_does_not_overflow() {
        let scheduler = PoolMaintenanceScheduler::new(1).unwrap();
        let never_runs = Arc::new(AtomicUsize::new(0));
        let short_runs = Arc::new(AtomicUsize::new(0));

        let forever = scheduler.schedule("forever", Duration::MAX, counting_task(&never_runs));
        let _short = scheduler.schedule("short", Duration::from_millis(2), counting_task(&short_runs));

        assert!(wait_until(Duration::from_secs(5), || short_runs.load(SeqCst) >= 3));
        assert_eq!(never_runs.load(SeqCst), 0);
        assert_eq!(scheduler.scheduled_tasks(), 2);
        assert_eq!(scheduler.live_workers(), 1);
        assert!(!forever.is_cancelled());

        assert!(deadline_after(Duration::MAX) > Instant::now());
    }

    #[test]
    fn handle_outlives_scheduler() {
        let scheduler = PoolMaintenanceScheduler::new(1).unwrap();
        let handle = scheduler.schedule("orphan", Duration::from_secs(60), || Ok(()));
        drop(scheduler);

        assert!(handle.is_cancelled());
        assert!(!handle.cancel());
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let scheduler = PoolMaintenanceScheduler::new(2).unwrap();

        scheduler.resize(5).unwrap();
        assert_eq!(scheduler.core_size(), 5);
        assert_eq!(scheduler.live_workers(), 5);

        scheduler.resize(1).unwrap();
        assert_eq!(scheduler.core_size(), 1);
        assert!(wait_until(Duration::from_secs(5), || scheduler.live_workers() == 1));
    }

    #[test]
    fn spawn_failure_keeps_previous_size() {
        static SPAWNED: AtomicUsize = AtomicUsize::new(0);

        fn limited_spawn(name: String, shared: Arc<Shared>) -> io::Result<()> {
            if SPAWNED.fetch_add(1, SeqCst) >= 2 {
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "thread limit reached"));
            }
            worker::spawn(name, shared)
        }

        let scheduler = PoolMaintenanceScheduler::with_spawner(2, limited_spawn).unwrap();
        assert!(matches!(scheduler.resize(5), Err(SchedulerError::SpawnWorker { .. })));
        assert_eq!(scheduler.core_size(), 2);
        assert_eq!(scheduler.live_workers(), 2);

        let runs = Arc::new(AtomicUsize::new(0));
        let _handle = scheduler.schedule("after-failure", Duration::from_millis(2), counting_task(&runs));
        assert!(wait_until(Duration::from_secs(5), || runs.load(SeqCst) >= 1));
    }

    #[test]
    fn resizing_never_runs_a_task_twice_at_once() {
        let scheduler = PoolMaintenanceScheduler::new(2).unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let (task_running, task_overlapped, task_runs) =
            (Arc::clone(&running), Arc::clone(&overlapped), Arc::clone(&runs));
        let _handle = scheduler.schedule("exclusive", Duration::from_millis(1), move || {
            if task_running.swap(true, SeqCst) {
                task_overlapped.store(true, SeqCst);
            }
            std::thread::sleep(Duration::from_millis(1));
            task_running.store(false, SeqCst);
            task_runs.fetch_add(1, SeqCst);
            Ok(())
        });

        for core_size in [6, 1, 4, 2, 8, 1, 3] {
            scheduler.resize(core_size).unwrap();
            assert!(scheduler.live_workers() >= 1);
            std::thread::sleep(Duration::from_millis(5));
        }

        let before = runs.load(SeqCst);
        assert!(wait_until(Duration::from_secs(5), || runs.load(SeqCst) > before));
        assert!(!overlapped.load(SeqCst));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn live_workers_converge_to_last_size(sizes in proptest::collection::vec(1usize..6, 1..6)) {
            let scheduler = PoolMaintenanceScheduler::new(2).unwrap();
            let runs = Arc::new(AtomicUsize::new(0));
            let _handle = scheduler.schedule("survivor", Duration::from_millis(1), counting_task(&runs));

            for size in &sizes {
                scheduler.resize(*size).unwrap();
                prop_assert!(scheduler.live_workers() >= 1);
            }

            let last = *sizes.last().unwrap();
            prop_assert_eq!(scheduler.core_size(), last);
            prop_assert!(wait_until(Duration::from_secs(5), || scheduler.live_workers() == last));
            prop_assert_eq!(scheduler.scheduled_tasks(), 1);

            let before = runs.load(SeqCst);
            prop_assert!(wait_until(Duration::from_secs(5), || runs.load(SeqCst) > before));
        }
    }
}
