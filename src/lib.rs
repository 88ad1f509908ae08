use std::sync::Arc;

use anyhow::Context;
use pollster::FutureExt;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalPosition,
    event::*,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes},
};

mod benchmark;
mod clock;
mod executor;
mod game_config;
mod game_loop;
mod scheduler;
mod surface;
pub mod testing;
mod window;

pub use benchmark::{Benchmark, Summary};
pub use clock::{Clock, FrameClock, SystemClock};
pub use executor::{Executor, ScheduledTask, Task, ThreadExecutor};
pub use game_config::{
    effective_fps, frame_period, GameConfig, DEFAULT_TARGET_FPS, MINIMUM_WINDOW_SIZE,
};
pub use game_loop::{Game, GameLoop, LoopState};
pub use scheduler::{FrameScheduler, LoopError, TickFn};
pub use surface::{BufferedSurface, DrawContext, Drawable, ImageDrawable};
pub use window::{WindowDrawable, WindowSize};

struct App<G: Game> {
    config: GameConfig,
    game: Option<G>,
    game_loop: Option<GameLoop<G, WindowDrawable>>,
    // 窗口最后一个引用留在事件循环线程释放
    window: Option<Arc<Window>>,
    window_size: Option<WindowSize>,
    error: Option<anyhow::Error>,
}

impl<G: Game> App<G> {
    fn new(game: G, config: GameConfig) -> Self {
        Self {
            config,
            game: Some(game),
            game_loop: None,
            window: None,
            window_size: None,
            error: None,
        }
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<Arc<Window>> {
        let size = self.config.get_window_size();
        let mut window_attributes = WindowAttributes::default()
            .with_title(self.config.get_title())
            .with_inner_size(size)
            .with_min_inner_size(MINIMUM_WINDOW_SIZE);

        // 窗口居中
        if let Some(monitor) = event_loop.primary_monitor() {
            let area = monitor.size();
            let origin = monitor.position();
            window_attributes = window_attributes.with_position(PhysicalPosition::new(
                origin.x + (area.width.saturating_sub(size.width) / 2) as i32,
                origin.y + (area.height.saturating_sub(size.height) / 2) as i32,
            ));
        }

        let window = event_loop
            .create_window(window_attributes)
            .context("failed to create game window")?;
        Ok(Arc::new(window))
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let Some(game) = self.game.take() else {
            return Ok(());
        };

        let window = self.create_window(event_loop)?;
        let drawable = WindowDrawable::new(Arc::clone(&window)).block_on()?;
        self.window_size = Some(drawable.size_handle());
        self.window = Some(window);

        let game_loop = GameLoop::new(game, drawable, &self.config)?;
        game_loop.start()?;
        self.game_loop = Some(game_loop);
        Ok(())
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        // 先停止游戏循环，再关闭窗口
        if let Some(game_loop) = self.game_loop.take() {
            game_loop.stop();
        }
        // 工作线程已退出，窗口在事件循环线程释放
        self.window_size = None;
        drop(self.window.take());
        event_loop.exit();
    }
}

//窗口事件处理
impl<G: Game> ApplicationHandler for App<G> {
    //Windows平台中，仅初始化会调用
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if let Err(err) = self.start(event_loop) {
            log::error!("{err:#}");
            self.error = Some(err);
            self.exit(event_loop);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        state: ElementState::Pressed,
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        ..
                    },
                ..
            } => self.exit(event_loop),
            // 帧由游戏循环线程绘制，窗口只需要尺寸
            WindowEvent::Resized(physical_size) => {
                log::debug!(
                    "window resized to {}x{}",
                    physical_size.width,
                    physical_size.height
                );
                if let Some(window_size) = &self.window_size {
                    window_size.set(physical_size);
                }
            }
            _ => {}
        }
    }
}

/// Opens a window and runs `game` in it until the window is closed or Escape is pressed.
pub fn run<G: Game>(game: G, config: GameConfig) -> anyhow::Result<()> {
    // 已有logger时忽略
    let _ = env_logger::try_init();

    let event_loop = EventLoop::new().context("failed to create event loop")?;

    let mut app = App::new(game, config);

    event_loop
        .run_app(&mut app)
        .context("event loop terminated abnormally")?;

    match app.error.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
