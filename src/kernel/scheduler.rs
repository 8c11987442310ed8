//! Deferred work: one-shot and repeating timers, the backpressure flush tick,
//! batch windows, and the local task set tracked module futures run on.
//!
//! Nothing fires on its own. The embedder calls [`Scheduler::run_due`]
//! (directly or through `Kernel::run_pending` / `Kernel::drive`) and every
//! task whose deadline has passed runs in `(deadline, id)` order.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::rc::Rc;

use tokio::task::{JoinHandle, LocalSet};

use crate::kernel::clock::Clock;

/// Upper bound on tasks run by a single [`Scheduler::run_due`] call, so a
/// zero-delay task that keeps rescheduling itself cannot wedge the tick.
pub const MAX_TASKS_PER_TICK: usize = 10_000;

/// Handle for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

enum Task {
    Once(Box<dyn FnOnce()>),
    Repeating { every_ms: u64, run: Rc<dyn Fn()> },
}

/// Single-threaded timer wheel driven by an injected [`Clock`].
pub struct Scheduler {
    clock: Rc<dyn Clock>,
    next_id: Cell<u64>,
    queue: RefCell<BTreeMap<(u64, u64), Task>>,
    due_by_id: RefCell<HashMap<u64, u64>>,
    local: LocalSet,
}

impl Scheduler {
    /// Create an empty scheduler reading time from `clock`.
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            next_id: Cell::new(1),
            queue: RefCell::new(BTreeMap::new()),
            due_by_id: RefCell::new(HashMap::new()),
            local: LocalSet::new(),
        }
    }

    /// The clock this scheduler measures deadlines against.
    pub fn clock(&self) -> Rc<dyn Clock> {
        Rc::clone(&self.clock)
    }

    /// Run `task` once, `delay_ms` from now.
    pub fn schedule(&self, delay_ms: u64, task: impl FnOnce() + 'static) -> TaskId {
        let due = self.clock.now_ms().saturating_add(delay_ms);
        self.insert(due, None, Task::Once(Box::new(task)))
    }

    /// Run `task` every `every_ms` (minimum 1 ms) until cancelled.
    pub fn schedule_repeating(&self, every_ms: u64, task: impl Fn() + 'static) -> TaskId {
        let every_ms = every_ms.max(1);
        let due = self.clock.now_ms().saturating_add(every_ms);
        self.insert(
            due,
            None,
            Task::Repeating {
                every_ms,
                run: Rc::new(task),
            },
        )
    }

    /// Cancel a pending task. Returns `false` if it already ran or was
    /// cancelled before.
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(due) = self.due_by_id.borrow_mut().remove(&id.0) else {
            return false;
        };
        self.queue.borrow_mut().remove(&(due, id.0)).is_some()
    }

    /// Whether `id` is still waiting to run.
    pub fn is_pending(&self, id: TaskId) -> bool {
        self.due_by_id.borrow().contains_key(&id.0)
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Earliest deadline among waiting tasks.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.borrow().keys().next().map(|(due, _)| *due)
    }

    /// Run every task whose deadline is at or before the current time.
    ///
    /// Tasks scheduled by running tasks with a zero delay run in the same
    /// call. Repeating tasks are rescheduled before they run so they can
    /// cancel themselves. Returns the number of tasks run.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now_ms();
        let mut ran: usize = 0;
        while ran < MAX_TASKS_PER_TICK {
            let next = {
                let mut queue = self.queue.borrow_mut();
                let key = match queue.keys().next() {
                    Some(key) if key.0 <= now => *key,
                    _ => break,
                };
                self.due_by_id.borrow_mut().remove(&key.1);
                queue.remove(&key).map(|task| (key.1, task))
            };
            let Some((id, task)) = next else {
                break;
            };
            match task {
                Task::Once(run) => run(),
                Task::Repeating { every_ms, run } => {
                    let due = now.saturating_add(every_ms);
                    self.insert(
                        due,
                        Some(id),
                        Task::Repeating {
                            every_ms,
                            run: Rc::clone(&run),
                        },
                    );
                    run();
                }
            }
            ran = ran.saturating_add(1);
        }
        ran
    }

    /// Spawn a `!Send` future on the scheduler's local task set. It makes
    /// progress only while [`Scheduler::run_until`] is being awaited.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.local.spawn_local(future)
    }

    /// Drive `future` to completion while letting spawned local tasks run.
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.local.run_until(future).await
    }

    fn insert(&self, due: u64, reuse: Option<u64>, task: Task) -> TaskId {
        let id = reuse.unwrap_or_else(|| {
            let id = self.next_id.get();
            self.next_id.set(id.saturating_add(1));
            id
        });
        self.queue.borrow_mut().insert((due, id), task);
        self.due_by_id.borrow_mut().insert(id, due);
        TaskId(id)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}
