//! Binds the scheduler to the offscreen surface and a [`Game`].
//!
//! Each tick runs, in order: delta computation, [`Game::update`], draw context
//! acquisition at the drawable's current size, [`Game::render`], presentation.
//! A failure anywhere ends that tick only; the next one starts on schedule.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;

use crate::benchmark::Benchmark;
use crate::clock::{Clock, FrameClock, SystemClock};
use crate::executor::{Executor, ThreadExecutor};
use crate::game_config::GameConfig;
use crate::scheduler::{panic_message, FrameScheduler, LoopError};
use crate::surface::{BufferedSurface, DrawContext, Drawable};

/// What a concrete game provides to the loop.
pub trait Game: Send + 'static {
    /// Advances game state by `delta` milliseconds.
    fn update(&mut self, delta: u64) -> anyhow::Result<()>;

    /// Draws the current state. The context may still hold the previous frame.
    fn render(&mut self, ctx: &mut DrawContext) -> anyhow::Result<()>;
}

/// Everything a tick touches, owned by the loop and locked for each tick.
pub struct LoopState<G, D> {
    game: G,
    drawable: D,
    surface: BufferedSurface,
    benchmark: Benchmark,
}

impl<G: Game, D: Drawable> LoopState<G, D> {
    fn new(game: G, drawable: D, benchmark: bool) -> Self {
        Self {
            game,
            drawable,
            surface: BufferedSurface::new(),
            benchmark: Benchmark::new(benchmark),
        }
    }

    /// Runs one frame. Errors and panics both count as a failed tick.
    fn tick(&mut self, delta: u64) -> anyhow::Result<()> {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.frame(delta))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "game panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        if result.is_err() {
            self.benchmark.record_failure();
        }
        result
    }

    fn frame(&mut self, delta: u64) -> anyhow::Result<()> {
        self.benchmark.record_tick(delta);

        self.game.update(delta).context("update failed")?;

        let (width, height) = self.drawable.size();
        let Some(ctx) = self.surface.acquire(width, height) else {
            log::debug!("drawable area is {width}x{height}, skipping render");
            return Ok(());
        };

        self.game.render(ctx).context("render failed")?;

        self.surface
            .present(&mut self.drawable)
            .context("present failed")
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    pub fn drawable(&self) -> &D {
        &self.drawable
    }

    pub fn drawable_mut(&mut self) -> &mut D {
        &mut self.drawable
    }

    pub fn surface(&self) -> &BufferedSurface {
        &self.surface
    }

    pub fn benchmark(&self) -> &Benchmark {
        &self.benchmark
    }
}

/// A game driven at a target frame rate, presenting to a [`Drawable`].
///
/// Constructed stopped. Control methods may be called from any thread and
/// never wait for a tick in progress.
pub struct GameLoop<G, D> {
    state: Arc<Mutex<LoopState<G, D>>>,
    scheduler: FrameScheduler,
}

impl<G: Game, D: Drawable + 'static> GameLoop<G, D> {
    /// Ticks on a dedicated thread, timed by the system clock.
    pub fn new(game: G, drawable: D, config: &GameConfig) -> anyhow::Result<Self> {
        let executor = ThreadExecutor::new()?;
        Ok(Self::with_runtime(
            game,
            drawable,
            config,
            Arc::new(executor),
            Arc::new(SystemClock::new()),
        ))
    }

    pub fn with_runtime(
        game: G,
        drawable: D,
        config: &GameConfig,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = Arc::new(Mutex::new(LoopState::new(game, drawable, config.get_benchmark())));

        let tick_state = Arc::clone(&state);
        let scheduler = FrameScheduler::new(
            executor,
            clock,
            config.get_target_fps(),
            move |delta| {
                let mut state = tick_state.lock().unwrap_or_else(PoisonError::into_inner);
                state.tick(delta)
            },
        );

        Self { state, scheduler }
    }

    pub fn start(&self) -> Result<(), LoopError> {
        self.scheduler.start()
    }

    pub fn stop(&self) -> bool {
        self.scheduler.stop()
    }

    pub fn set_target_fps(&self, target_fps: i32) {
        self.scheduler.set_target_fps(target_fps)
    }

    pub fn target_fps(&self) -> i32 {
        self.scheduler.target_fps()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Start time of the current tick in milliseconds.
    pub fn now(&self) -> u64 {
        self.scheduler.frame_clock().now()
    }

    pub fn frame_clock(&self) -> FrameClock {
        self.scheduler.frame_clock()
    }

    pub fn failed_ticks(&self) -> u64 {
        self.scheduler.failed_ticks()
    }

    /// Locks the loop state. Waits for a tick in progress to finish.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut LoopState<G, D>) -> R) -> R {
        f(&mut self.lock_state())
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState<G, D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
