//! Timed task queue driven by the node tick
//!
//! Tasks are ordered by (due time, insertion serial) and run on whichever
//! thread calls `run`. A panicking task is reported and does not poison the
//! queue.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::error;

type Task = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId {
    time: Instant,
    serial: u64,
}

struct Queue {
    tasks: BTreeMap<TaskId, Task>,
    next_serial: u64,
}

pub struct Scheduler {
    queue: Mutex<Queue>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self { queue: Mutex::new(Queue { tasks: BTreeMap::new(), next_serial: 0 }) }
    }

    /// Schedules `task` to run at the next `run` call.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.schedule_at(Instant::now(), task)
    }

    pub fn schedule_in(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.schedule_at(Instant::now() + delay, task)
    }

    pub fn schedule_at(&self, time: Instant, task: impl FnOnce() + Send + 'static) -> TaskId {
        let mut queue = self.queue.lock();
        let id = TaskId { time, serial: queue.next_serial };
        queue.next_serial += 1;
        queue.tasks.insert(id, Box::new(task));
        id
    }

    /// Removes a pending task. Returns false if it already ran or was
    /// cancelled before.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.queue.lock().tasks.remove(&id).is_some()
    }

    /// Runs every task whose due time has passed.
    pub fn run(&self) {
        while self.run_one() {}
    }

    /// Runs at most one due task; returns whether one ran.
    pub fn run_one(&self) -> bool {
        let task = {
            let mut queue = self.queue.lock();
            match queue.tasks.first_key_value() {
                Some((id, _)) if id.time <= Instant::now() => {
                    let id = *id;
                    queue.tasks.remove(&id)
                }
                _ => None,
            }
        };

        match task {
            Some(task) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".into());
                    error!("Scheduled task panicked: {}", reason);
                }
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().tasks.len()
    }
}
