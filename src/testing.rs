//! Deterministic clock and executor for driving a game loop on a fake timeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::Clock;
use crate::executor::{Executor, ScheduledTask, Task};

/// A clock that only moves when told to. Nanosecond resolution, reads in ms.
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_millis * 1_000_000),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }

    fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now_nanos() / 1_000_000
    }
}

struct ManualEntry {
    period: u64,
    deadline: u64,
    task: Arc<Mutex<Task>>,
    cancelled: Arc<AtomicBool>,
}

/// Runs scheduled tasks on the calling thread as its [`ManualClock`] advances.
pub struct ManualExecutor {
    clock: Arc<ManualClock>,
    entries: Mutex<Vec<ManualEntry>>,
    scheduled: Mutex<Vec<Duration>>,
}

impl ManualExecutor {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
        }
    }

    /// Moves the clock forward by `by`, running every task that falls due on
    /// the way in deadline order. The clock reads each deadline while its task
    /// runs. Returns how many task runs happened.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.clock.now_nanos() + by.as_nanos() as u64;
        let mut runs = 0;

        while let Some((deadline, task, cancelled)) = self.next_due(target) {
            self.clock.set_nanos(deadline.max(self.clock.now_nanos()));
            if cancelled.load(Ordering::Acquire) {
                continue;
            }
            let mut task = task.lock().unwrap_or_else(PoisonError::into_inner);
            (*task)();
            runs += 1;
        }

        self.clock.set_nanos(target.max(self.clock.now_nanos()));
        runs
    }

    /// Runs whatever is due right now without moving the clock.
    pub fn run_due(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Number of schedules that have not been cancelled.
    pub fn active(&self) -> usize {
        self.lock_entries()
            .iter()
            .filter(|entry| !entry.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Periods of every schedule ever created, oldest first.
    pub fn scheduled_periods(&self) -> Vec<Duration> {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<ManualEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(clippy::type_complexity)]
    fn next_due(&self, target: u64) -> Option<(u64, Arc<Mutex<Task>>, Arc<AtomicBool>)> {
        let mut entries = self.lock_entries();
        entries.retain(|entry| !entry.cancelled.load(Ordering::Acquire));

        let entry = entries
            .iter_mut()
            .filter(|entry| entry.deadline <= target)
            .min_by_key(|entry| entry.deadline)?;

        let deadline = entry.deadline;
        entry.deadline += entry.period;
        Some((deadline, Arc::clone(&entry.task), Arc::clone(&entry.cancelled)))
    }
}

impl Executor for ManualExecutor {
    fn schedule_at_fixed_rate(&self, period: Duration, task: Task) -> Box<dyn ScheduledTask> {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(period);

        let cancelled = Arc::new(AtomicBool::new(false));
        self.lock_entries().push(ManualEntry {
            period: (period.as_nanos() as u64).max(1),
            deadline: self.clock.now_nanos(),
            task: Arc::new(Mutex::new(task)),
            cancelled: Arc::clone(&cancelled),
        });

        Box::new(ManualHandle { cancelled })
    }
}

struct ManualHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask for ManualHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
