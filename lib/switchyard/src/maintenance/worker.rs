use std::{
    any::Any,
    cmp::Reverse,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, PoisonError},
    thread,
    time::Instant,
};

use metrics::counter;
use tracing::{debug, error};

use super::scheduler::{deadline_after, Shared, TaskEntry};

/// Spawns a detached worker thread with the given name.
pub(super) fn spawn(name: String, shared: Arc<Shared>) -> io::Result<()> {
    thread::Builder::new().name(name).spawn(move || run(shared))?;
    Ok(())
}

fn run(shared: Arc<Shared>) {
    let worker = thread::current().name().unwrap_or("pool-cleaner").to_string();
    debug!(worker = %worker, "Pool maintenance worker started.");

    let mut state = shared.lock();
    loop {
        if state.shutdown || state.live_workers > state.core_size {
            state.live_workers -= 1;
            state.report_workers();
            debug!(worker = %worker, "Pool maintenance worker stopped.");
            return;
        }

        let next = match state.queue.peek() {
            Some(Reverse(next)) => *next,
            None => {
                state = shared.wakeup.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
        };

        let now = Instant::now();
        if next.deadline > now {
            state = match shared.wakeup.wait_timeout(state, next.deadline - now) {
                Ok((state, _)) => state,
                Err(e) => e.into_inner().0,
            };
            continue;
        }

        state.queue.pop();
        let Some(task) = state.tasks.get(&next.task_id).cloned() else {
            // Cancelled.
            continue;
        };
        drop(state);

        run_task(&worker, &task);

        state = shared.lock();
        if state.tasks.contains_key(&next.task_id) {
            state.enqueue(next.task_id, deadline_after(task.period));
            shared.wakeup.notify_one();
        }
    }
}

fn run_task(worker: &str, task: &TaskEntry) {
    counter!("switchyard_pool_cleaner_task_runs_total", "task" => task.name.clone()).increment(1);

    let failed = match panic::catch_unwind(AssertUnwindSafe(|| (task.run)())) {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(worker, task = %task.name, error = %e, "Cleanup task failed. Task remains scheduled.");
            true
        }
        Err(payload) => {
            error!(
                worker,
                task = %task.name,
                panic = panic_message(payload.as_ref()),
                "Cleanup task panicked. Task remains scheduled."
            );
            true
        }
    };

    if failed {
        counter!("switchyard_pool_cleaner_task_failures_total", "task" => task.name.clone()).increment(1);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
