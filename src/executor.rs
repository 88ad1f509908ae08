use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Work run on every period of a schedule.
pub type Task = Box<dyn FnMut() + Send + 'static>;

/// Runs tasks periodically on a background context.
pub trait Executor: Send + Sync {
    /// Schedules `task` to run now and then once every `period` until cancelled.
    fn schedule_at_fixed_rate(&self, period: Duration, task: Task) -> Box<dyn ScheduledTask>;
}

/// Handle onto one periodic schedule.
pub trait ScheduledTask: Send + Sync {
    /// Stops future runs. Never waits for a run that is already in progress.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

// 剩余等待时间小于此值时改用自旋睡眠，保证精度
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

const MIN_PERIOD: Duration = Duration::from_nanos(1);

const WORKER_NAME: &str = "game-loop";

enum Command {
    Schedule {
        id: u64,
        period: Duration,
        task: Task,
        cancelled: Arc<AtomicBool>,
    },
    Cancel(u64),
    Shutdown,
}

struct Entry {
    id: u64,
    period: Duration,
    deadline: Instant,
    task: Task,
    cancelled: Arc<AtomicBool>,
}

/// Single worker thread that runs every schedule serially.
pub struct ThreadExecutor {
    command_sender: Option<Sender<Command>>,
    worker: Option<thread::JoinHandle<()>>,
    next_id: AtomicU64,
}

impl ThreadExecutor {
    pub fn new() -> anyhow::Result<Self> {
        let (command_sender, command_receiver) = unbounded();

        // 创建工作线程
        let worker = thread::Builder::new()
            .name(String::from(WORKER_NAME))
            .spawn(move || Self::run_worker(command_receiver))
            .context("failed to spawn the game loop worker thread")?;

        Ok(Self {
            command_sender: Some(command_sender),
            worker: Some(worker),
            next_id: AtomicU64::new(0),
        })
    }

    fn run_worker(command_receiver: Receiver<Command>) {
        let sleeper = spin_sleep::SpinSleeper::default();
        let mut entries: Vec<Entry> = Vec::new();

        loop {
            // 先处理所有命令，保证取消总是在到期的帧之前生效
            loop {
                match command_receiver.try_recv() {
                    Ok(command) => {
                        if !Self::apply(command, &mut entries) {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            entries.retain(|entry| !entry.cancelled.load(Ordering::Acquire));

            let Some(deadline) = entries.iter().map(|entry| entry.deadline).min() else {
                match command_receiver.recv() {
                    Ok(command) => {
                        if !Self::apply(command, &mut entries) {
                            return;
                        }
                        continue;
                    }
                    Err(_) => return,
                }
            };

            let wait = deadline.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                if wait > SPIN_THRESHOLD {
                    match command_receiver.recv_timeout(wait - SPIN_THRESHOLD) {
                        Ok(command) => {
                            if !Self::apply(command, &mut entries) {
                                return;
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                sleeper.sleep(deadline.saturating_duration_since(Instant::now()));
                continue;
            }

            let now = Instant::now();
            for entry in entries.iter_mut().filter(|entry| entry.deadline <= now) {
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                (entry.task)();

                // 超时后不追帧，尽快执行下一帧
                entry.deadline += entry.period;
                let after = Instant::now();
                if entry.deadline < after {
                    log::trace!("schedule {} overran its period", entry.id);
                    entry.deadline = after;
                }
            }
        }
    }

    /// Returns false once the worker should exit.
    fn apply(command: Command, entries: &mut Vec<Entry>) -> bool {
        match command {
            Command::Schedule {
                id,
                period,
                task,
                cancelled,
            } => entries.push(Entry {
                id,
                period,
                deadline: Instant::now(),
                task,
                cancelled,
            }),
            Command::Cancel(id) => entries.retain(|entry| entry.id != id),
            Command::Shutdown => return false,
        }
        true
    }
}

impl Executor for ThreadExecutor {
    fn schedule_at_fixed_rate(&self, period: Duration, task: Task) -> Box<dyn ScheduledTask> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));

        let handle = ThreadTaskHandle {
            id,
            cancelled: Arc::clone(&cancelled),
            command_sender: self.command_sender.clone(),
        };

        let command = Command::Schedule {
            id,
            period: period.max(MIN_PERIOD),
            task,
            cancelled,
        };
        let sent = self
            .command_sender
            .as_ref()
            .is_some_and(|sender| sender.send(command).is_ok());
        if !sent {
            log::error!("game loop worker is gone, schedule {id} will never run");
        }

        Box::new(handle)
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        // 任务句柄仍持有发送端，所以显式通知工作线程退出
        if let Some(sender) = self.command_sender.take() {
            let _ = sender.send(Command::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                log::error!("game loop worker panicked");
            }
        }
    }
}

struct ThreadTaskHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    command_sender: Option<Sender<Command>>,
}

impl ScheduledTask for ThreadTaskHandle {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sender) = &self.command_sender {
            // the worker may already be gone, the flag alone is enough then
            let _ = sender.send(Command::Cancel(self.id));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_executor_runs_and_cancels() -> anyhow::Result<()> {
        let executor = ThreadExecutor::new()?;
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let handle = executor.schedule_at_fixed_rate(
            Duration::from_millis(5),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let started = Instant::now();
        while runs.load(Ordering::SeqCst) < 3 {
            assert!(started.elapsed() < Duration::from_secs(5), "task never ran");
            thread::sleep(Duration::from_millis(1));
        }

        handle.cancel();
        assert!(handle.is_cancelled());
        // 等待可能正在执行的一帧结束
        thread::sleep(Duration::from_millis(50));
        let after_cancel = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
        Ok(())
    }

    #[test]
    fn test_runs_are_serial_on_one_thread() -> anyhow::Result<()> {
        let executor = ThreadExecutor::new()?;
        let threads = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let threads = Arc::clone(&threads);
            handles.push(executor.schedule_at_fixed_rate(
                Duration::from_millis(2),
                Box::new(move || {
                    let current = thread::current();
                    let name = current.name().map(String::from);
                    threads.lock().unwrap().push((current.id(), name));
                }),
            ));
        }

        thread::sleep(Duration::from_millis(30));
        handles.iter().for_each(|handle| handle.cancel());

        let threads = threads.lock().unwrap();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|(id, _)| *id == threads[0].0));
        assert_ne!(threads[0].0, thread::current().id());
        assert_eq!(threads[0].1.as_deref(), Some(WORKER_NAME));
        Ok(())
    }

    #[test]
    fn test_drop_stops_worker() -> anyhow::Result<()> {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let executor = ThreadExecutor::new()?;
            let counter = Arc::clone(&runs);
            let _handle = executor.schedule_at_fixed_rate(
                Duration::from_millis(1),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            thread::sleep(Duration::from_millis(10));
        }
        let after_drop = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), after_drop);
        Ok(())
    }
}
