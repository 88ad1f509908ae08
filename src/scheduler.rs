//! Start/stop/retarget lifecycle of the periodic tick.
//!
//! The scheduler is either stopped (no handle) or running (exactly one
//! handle). Every schedule it creates is stamped with a generation number and
//! a tick only runs while its generation is still current, so once a retarget
//! or stop returns, no tick of an older schedule can start.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, FrameClock};
use crate::executor::{Executor, ScheduledTask};
use crate::game_config::{effective_fps, frame_period};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoopError {
    #[error("game already running")]
    AlreadyRunning,
}

/// Work done once per tick, given the delta in milliseconds.
pub type TickFn = dyn FnMut(u64) -> anyhow::Result<()> + Send;

struct Control {
    target_fps: i32,
    handle: Option<Box<dyn ScheduledTask>>,
}

/// Drives one periodic tick callback through an [`Executor`].
pub struct FrameScheduler {
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    frame_clock: FrameClock,
    tick: Arc<Mutex<Box<TickFn>>>,
    generation: Arc<AtomicU64>,
    failed_ticks: Arc<AtomicU64>,
    control: Mutex<Control>,
}

impl FrameScheduler {
    pub fn new(
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
        target_fps: i32,
        tick: impl FnMut(u64) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            executor,
            clock,
            frame_clock: FrameClock::new(),
            tick: Arc::new(Mutex::new(Box::new(tick))),
            generation: Arc::new(AtomicU64::new(0)),
            failed_ticks: Arc::new(AtomicU64::new(0)),
            control: Mutex::new(Control {
                target_fps,
                handle: None,
            }),
        }
    }

    /// Begins ticking at the current target rate, first tick immediately.
    pub fn start(&self) -> Result<(), LoopError> {
        let mut control = self.lock_control();
        if control.handle.is_some() {
            return Err(LoopError::AlreadyRunning);
        }

        // 记录开始时间，避免第一帧的delta过大
        self.frame_clock.reset(self.clock.now());

        let fps = effective_fps(control.target_fps);
        control.handle = Some(self.schedule(fps));
        log::info!("game loop started at {fps} fps");
        Ok(())
    }

    /// Stores the raw rate and, if running, swaps in a schedule at the new rate.
    pub fn set_target_fps(&self, target_fps: i32) {
        let mut control = self.lock_control();
        control.target_fps = target_fps;

        if let Some(old) = control.handle.take() {
            old.cancel();
            let fps = effective_fps(target_fps);
            control.handle = Some(self.schedule(fps));
            log::debug!("game loop retargeted to {fps} fps");
        }
    }

    /// Cancels the active schedule. Returns false if it was not running.
    ///
    /// A tick that is already executing finishes, no further tick starts.
    pub fn stop(&self) -> bool {
        let mut control = self.lock_control();
        let Some(handle) = control.handle.take() else {
            return false;
        };

        self.generation.fetch_add(1, Ordering::AcqRel);
        handle.cancel();
        log::info!("game loop stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.lock_control().handle.is_some()
    }

    /// The raw rate as last set, possibly non-positive.
    pub fn target_fps(&self) -> i32 {
        self.lock_control().target_fps
    }

    /// The rate a schedule created now would run at.
    pub fn effective_fps(&self) -> u32 {
        effective_fps(self.target_fps())
    }

    pub fn period(&self) -> Duration {
        frame_period(self.effective_fps())
    }

    pub fn frame_clock(&self) -> FrameClock {
        self.frame_clock.clone()
    }

    /// Ticks whose callback returned an error or panicked.
    pub fn failed_ticks(&self) -> u64 {
        self.failed_ticks.load(Ordering::Acquire)
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, fps: u32) -> Box<dyn ScheduledTask> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let current = Arc::clone(&self.generation);
        let clock = Arc::clone(&self.clock);
        let frame_clock = self.frame_clock.clone();
        let tick = Arc::clone(&self.tick);
        let failed_ticks = Arc::clone(&self.failed_ticks);

        self.executor.schedule_at_fixed_rate(
            frame_period(fps),
            Box::new(move || {
                if current.load(Ordering::Acquire) != generation {
                    return;
                }
                run_tick(clock.as_ref(), &frame_clock, &tick, &failed_ticks);
            }),
        )
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_tick(
    clock: &dyn Clock,
    frame_clock: &FrameClock,
    tick: &Mutex<Box<TickFn>>,
    failed_ticks: &AtomicU64,
) {
    let delta = frame_clock.begin_frame(clock.now());
    log::trace!("tick at {} (delta {delta} ms)", frame_clock.now());

    let mut tick = tick.lock().unwrap_or_else(PoisonError::into_inner);

    // 单帧出错只记录日志，不影响之后的帧
    match panic::catch_unwind(AssertUnwindSafe(|| (*tick)(delta))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            failed_ticks.fetch_add(1, Ordering::AcqRel);
            log::error!("tick failed: {err:#}");
        }
        Err(payload) => {
            failed_ticks.fetch_add(1, Ordering::AcqRel);
            log::error!("tick panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Task;
    use crate::testing::{ManualClock, ManualExecutor};

    struct Harness {
        clock: Arc<ManualClock>,
        executor: Arc<ManualExecutor>,
        deltas: Arc<Mutex<Vec<(u64, u64)>>>,
        scheduler: FrameScheduler,
    }

    fn harness(target_fps: i32) -> Harness {
        let clock = Arc::new(ManualClock::new(10_000));
        let executor = Arc::new(ManualExecutor::new(Arc::clone(&clock)));
        let deltas = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&deltas);
        let tick_clock = Arc::clone(&clock);
        let scheduler = FrameScheduler::new(
            executor.clone(),
            clock.clone(),
            target_fps,
            move |delta| {
                recorded.lock().unwrap().push((tick_clock.now(), delta));
                Ok(())
            },
        );

        Harness {
            clock,
            executor,
            deltas,
            scheduler,
        }
    }

    fn tick_times(harness: &Harness) -> Vec<u64> {
        harness.deltas.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    #[test]
    fn test_start_ticks_at_target_period() {
        let harness = harness(10);
        harness.scheduler.start().unwrap();
        assert!(harness.scheduler.is_running());

        harness.executor.advance(Duration::from_millis(300));
        assert_eq!(tick_times(&harness), vec![10_000, 10_100, 10_200, 10_300]);
        assert_eq!(
            harness.executor.scheduled_periods(),
            vec![Duration::from_nanos(100_000_000)]
        );
    }

    #[test]
    fn test_double_start_is_an_error() {
        let harness = harness(10);
        harness.scheduler.start().unwrap();
        assert_eq!(harness.scheduler.start(), Err(LoopError::AlreadyRunning));

        // 第一个调度不受影响
        assert_eq!(harness.executor.active(), 1);
        harness.executor.advance(Duration::from_millis(200));
        assert_eq!(tick_times(&harness), vec![10_000, 10_100, 10_200]);
    }

    #[test]
    fn test_first_delta_is_measured_from_start() {
        let harness = harness(10);
        harness.clock.advance(Duration::from_millis(5_000));
        harness.scheduler.start().unwrap();
        harness.executor.advance(Duration::from_millis(200));

        let deltas: Vec<u64> = harness.deltas.lock().unwrap().iter().map(|(_, d)| *d).collect();
        assert_eq!(deltas, vec![0, 100, 100]);
    }

    #[test]
    fn test_retarget_replaces_the_schedule() {
        let harness = harness(10);
        harness.scheduler.start().unwrap();
        harness.executor.advance(Duration::from_millis(150));
        assert_eq!(tick_times(&harness), vec![10_000, 10_100]);

        harness.scheduler.set_target_fps(4);
        assert_eq!(harness.executor.active(), 1);
        assert_eq!(harness.scheduler.target_fps(), 4);

        // 新调度立即执行一帧，之后每250ms一帧；旧的200ms帧不再出现
        harness.executor.advance(Duration::from_millis(600));
        assert_eq!(
            tick_times(&harness),
            vec![10_000, 10_100, 10_150, 10_400, 10_650]
        );
        assert_eq!(
            harness.executor.scheduled_periods(),
            vec![Duration::from_millis(100), Duration::from_millis(250)]
        );
    }

    #[test]
    fn test_retarget_to_non_positive_uses_default() {
        let harness = harness(60);
        harness.scheduler.start().unwrap();
        harness.scheduler.set_target_fps(-7);

        assert_eq!(harness.scheduler.target_fps(), -7);
        assert_eq!(harness.scheduler.effective_fps(), 30);
        assert_eq!(
            harness.executor.scheduled_periods().last(),
            Some(&Duration::from_nanos(33_333_333))
        );
    }

    #[test]
    fn test_retarget_while_stopped_only_stores_rate() {
        let harness = harness(10);
        harness.scheduler.set_target_fps(20);
        assert!(!harness.scheduler.is_running());
        assert!(harness.executor.scheduled_periods().is_empty());

        harness.scheduler.start().unwrap();
        assert_eq!(
            harness.executor.scheduled_periods(),
            vec![Duration::from_millis(50)]
        );
    }

    #[test]
    fn test_stop_and_restart() {
        let harness = harness(10);
        harness.scheduler.start().unwrap();
        harness.executor.advance(Duration::from_millis(100));

        assert!(harness.scheduler.stop());
        assert!(!harness.scheduler.stop());
        assert!(!harness.scheduler.is_running());

        harness.executor.advance(Duration::from_millis(500));
        assert_eq!(tick_times(&harness), vec![10_000, 10_100]);

        harness.scheduler.start().unwrap();
        harness.executor.advance(Duration::ZERO);
        assert_eq!(tick_times(&harness), vec![10_000, 10_100, 10_600]);
        // 重新开始后delta从start开始计算
        assert_eq!(harness.deltas.lock().unwrap().last(), Some(&(10_600, 0)));
    }

    #[test]
    fn test_failing_tick_does_not_stop_the_loop() {
        let clock = Arc::new(ManualClock::new(0));
        let executor = Arc::new(ManualExecutor::new(Arc::clone(&clock)));
        let ticks = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&ticks);
        let scheduler = FrameScheduler::new(executor.clone(), clock.clone(), 10, move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                1 => anyhow::bail!("boom"),
                2 => panic!("kaboom"),
                _ => Ok(()),
            }
        });

        scheduler.start().unwrap();
        executor.advance(Duration::from_millis(400));

        assert_eq!(ticks.load(Ordering::SeqCst), 5);
        assert_eq!(scheduler.failed_ticks(), 2);
        assert!(scheduler.is_running());
    }

    /// Keeps firing every task it was given, cancelled or not, like an executor
    /// whose cancellation lands after a run was already dispatched.
    #[derive(Default)]
    struct LateCancelExecutor {
        tasks: Mutex<Vec<Task>>,
        cancels: Arc<AtomicU64>,
    }

    struct LateCancelHandle {
        cancels: Arc<AtomicU64>,
    }

    impl ScheduledTask for LateCancelHandle {
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            false
        }
    }

    impl Executor for LateCancelExecutor {
        fn schedule_at_fixed_rate(&self, _period: Duration, task: Task) -> Box<dyn ScheduledTask> {
            self.tasks.lock().unwrap().push(task);
            Box::new(LateCancelHandle {
                cancels: Arc::clone(&self.cancels),
            })
        }
    }

    impl LateCancelExecutor {
        fn fire_all(&self) {
            for task in self.tasks.lock().unwrap().iter_mut() {
                task();
            }
        }
    }

    #[test]
    fn test_stale_schedule_never_ticks() {
        let clock = Arc::new(ManualClock::new(0));
        let executor = Arc::new(LateCancelExecutor::default());
        let ticks = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&ticks);
        let scheduler = FrameScheduler::new(executor.clone(), clock.clone(), 10, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        scheduler.start().unwrap();
        executor.fire_all();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // 旧调度仍在触发，但只有新调度会执行tick
        scheduler.set_target_fps(20);
        assert_eq!(executor.cancels.load(Ordering::SeqCst), 1);
        executor.fire_all();
        executor.fire_all();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(scheduler.stop());
        assert_eq!(executor.cancels.load(Ordering::SeqCst), 2);
        clock.advance(Duration::from_millis(100));
        executor.fire_all();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.frame_clock().now(), 0);
    }

    #[test]
    fn test_drop_cancels_schedule() {
        let harness = harness(10);
        harness.scheduler.start().unwrap();
        let executor = Arc::clone(&harness.executor);
        drop(harness);
        assert_eq!(executor.active(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("oops"));
        assert_eq!(panic_message(payload.as_ref()), "oops");
        let payload: Box<dyn Any + Send> = Box::new(3);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
