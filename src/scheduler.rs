//! # Timer Scheduling
//!
//! Key rotation, store cleanup, burn deadlines and cache sweeps all run on
//! timers. Components take an `Arc<dyn Scheduler>` instead of spawning
//! tasks themselves, so production code runs on tokio and tests run on a
//! deterministic fake.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SCHEDULER                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   Component ──schedule_after(30s, f)──► TaskId                         │
//! │             ──schedule_every(30m, f)──► TaskId                         │
//! │             ──cancel(TaskId)──────────► bool                           │
//! │                                                                         │
//! │   TokioScheduler:   tokio::spawn + sleep / interval, abort on cancel   │
//! │   ManualScheduler:  advance(d) fires every task due within d           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callbacks must only capture `Weak` references to component state. A
//! timer that fires after its owner is gone upgrades to `None` and returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::time::{Clock, ManualClock};

/// Identifier of a scheduled task
pub type TaskId = u64;

/// Callback run once after a delay
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;

/// Callback run on every period
pub type RepeatingTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Timer capability used by every component that owns a deadline
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`
    fn schedule_after(&self, delay: Duration, task: OnceTask) -> TaskId;

    /// Run `task` every `period`, first run one period from now
    ///
    /// Periods shorter than a millisecond run every millisecond.
    fn schedule_every(&self, period: Duration, task: RepeatingTask) -> TaskId;

    /// Cancel a pending task. Returns false if it already ran or was unknown.
    fn cancel(&self, id: TaskId) -> bool;
}

// ============================================================================
// TOKIO SCHEDULER
// ============================================================================

const SHORTEST_PERIOD: Duration = Duration::from_millis(1);

/// Repeating timers never wait longer than about a century between runs
const LONGEST_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Scheduler that runs timers as tokio tasks
pub struct TokioScheduler {
    handle: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
}

impl TokioScheduler {
    /// Create a scheduler on the current tokio runtime
    ///
    /// Fails with `SchedulerUnavailable` when called outside a runtime.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::SchedulerUnavailable(e.to_string()))?;
        Ok(Self::with_handle(handle))
    }

    /// Create a scheduler that spawns onto `handle`
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers that have not fired or been cancelled
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    fn forget(tasks: &Weak<Mutex<HashMap<TaskId, JoinHandle<()>>>>, id: TaskId) {
        if let Some(tasks) = tasks.upgrade() {
            tasks.lock().remove(&id);
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: OnceTask) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::downgrade(&self.tasks);

        // Hold the map while spawning so the task cannot finish before its
        // handle is recorded.
        let mut guard = self.tasks.lock();
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            Self::forget(&tasks, id);
            task();
        });
        guard.insert(id, handle);
        id
    }

    fn schedule_every(&self, period: Duration, task: RepeatingTask) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let period = period.clamp(SHORTEST_PERIOD, LONGEST_PERIOD);

        let mut guard = self.tasks.lock();
        let handle = self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
            }
        });
        guard.insert(id, handle);
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        match self.tasks.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

// ============================================================================
// MANUAL SCHEDULER
// ============================================================================

enum ManualTaskKind {
    Once(OnceTask),
    Every { period: i64, task: RepeatingTask },
}

struct ManualTask {
    due: i64,
    kind: ManualTaskKind,
}

/// Deterministic scheduler driven by [`ManualScheduler::advance`]
///
/// Time only moves when `advance` is called. Tasks fire in deadline order
/// and the shared [`ManualClock`] reads each task's deadline while it runs.
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskId, ManualTask>>,
}

impl ManualScheduler {
    /// Create a scheduler with its own clock starting at zero
    pub fn new() -> Self {
        Self::with_clock(Arc::new(ManualClock::new(0)))
    }

    /// Create a scheduler that drives `clock`
    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// The clock this scheduler advances
    pub fn clock(&self) -> Arc<ManualClock> {
        self.clock.clone()
    }

    /// Number of pending tasks
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Move time forward by `by`, running every task that comes due
    pub fn advance(&self, by: Duration) {
        let target = self.clock.now_millis().saturating_add(millis_of(by));

        loop {
            let next = {
                let mut tasks = self.tasks.lock();
                let due = tasks
                    .iter()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(id, t)| (t.due, **id))
                    .map(|(id, _)| *id);
                due.and_then(|id| tasks.remove(&id).map(|t| (id, t)))
            };

            let Some((id, task)) = next else { break };
            if task.due > self.clock.now_millis() {
                self.clock.set(task.due);
            }

            match task.kind {
                ManualTaskKind::Once(f) => f(),
                ManualTaskKind::Every { period, task } => {
                    // Re-arm before running so the callback can cancel itself.
                    // A task already at the end of time is not re-armed.
                    let now = self.clock.now_millis();
                    let due = task_due_after(now, period);
                    if due > now {
                        self.tasks.lock().insert(
                            id,
                            ManualTask {
                                due,
                                kind: ManualTaskKind::Every {
                                    period,
                                    task: task.clone(),
                                },
                            },
                        );
                    }
                    task();
                }
            }
        }

        self.clock.set(target);
    }

    fn insert(&self, delay: Duration, kind: ManualTaskKind) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = self.clock.now_millis().saturating_add(millis_of(delay));
        self.tasks.lock().insert(id, ManualTask { due, kind });
        id
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn task_due_after(now: i64, period: i64) -> i64 {
    now.saturating_add(period.max(1))
}

/// Whole milliseconds in `duration`, saturating at `i64::MAX`
fn millis_of(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: OnceTask) -> TaskId {
        self.insert(delay, ManualTaskKind::Once(task))
    }

    fn schedule_every(&self, period: Duration, task: RepeatingTask) -> TaskId {
        let period_ms = millis_of(period).max(1);
        self.insert(
            Duration::from_millis(period_ms as u64),
            ManualTaskKind::Every {
                period: period_ms,
                task,
            },
        )
    }

    fn cancel(&self, id: TaskId) -> bool {
        self.tasks.lock().remove(&id).is_some()
    }
}

// ============================================================================
// TESTS
// ============================================================================
