use std::time::Duration;

use winit::dpi::PhysicalSize;

/// 目标帧数小于等于0时使用的默认值
pub const DEFAULT_TARGET_FPS: u32 = 30;

/// 窗口可调整到的最小尺寸
pub const MINIMUM_WINDOW_SIZE: PhysicalSize<u32> = PhysicalSize::new(800, 600);

const FPS_ENV: &str = "SIMPLE_GAME_FPS";
const BENCHMARK_ENV: &str = "SIMPLE_GAME_BENCHMARK";

/*
GameConfig
存放游戏启动参数：窗口标题、窗口大小、目标帧数。
target_fps 保存原始输入，真正使用的帧数在创建调度器时才计算。
 */
#[derive(Debug, Clone)]
pub struct GameConfig {
    title: String,
    target_fps: i32,
    window_size: PhysicalSize<u32>,
    benchmark: bool,
}

impl GameConfig {
    pub fn new() -> Self {
        Self {
            title: String::from("simple-game"),
            target_fps: DEFAULT_TARGET_FPS as i32,
            window_size: MINIMUM_WINDOW_SIZE,
            benchmark: false,
        }
    }

    /// Applies `SIMPLE_GAME_FPS` and `SIMPLE_GAME_BENCHMARK` on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        if let Ok(value) = std::env::var(FPS_ENV) {
            match value.trim().parse::<i32>() {
                Ok(fps) => config.target_fps = fps,
                Err(err) => log::warn!("ignoring {FPS_ENV}={value:?}: {err}"),
            }
        }

        if let Ok(value) = std::env::var(BENCHMARK_ENV) {
            match value.trim() {
                "1" | "true" | "on" => config.benchmark = true,
                "0" | "false" | "off" => config.benchmark = false,
                other => log::warn!("ignoring {BENCHMARK_ENV}={other:?}"),
            }
        }

        config
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_target_fps(mut self, target_fps: i32) -> Self {
        self.target_fps = target_fps;
        self
    }

    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window_size = PhysicalSize::new(width, height);
        self
    }

    pub fn with_benchmark(mut self, benchmark: bool) -> Self {
        self.benchmark = benchmark;
        self
    }

    pub fn get_title(&self) -> &str {
        &self.title
    }

    pub fn get_benchmark(&self) -> bool {
        self.benchmark
    }

    pub fn get_target_fps(&self) -> i32 {
        self.target_fps
    }

    /// Requested size, never smaller than [`MINIMUM_WINDOW_SIZE`].
    pub fn get_window_size(&self) -> PhysicalSize<u32> {
        PhysicalSize::new(
            self.window_size.width.max(MINIMUM_WINDOW_SIZE.width),
            self.window_size.height.max(MINIMUM_WINDOW_SIZE.height),
        )
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The rate a schedule actually runs at for a raw target.
pub fn effective_fps(target_fps: i32) -> u32 {
    if target_fps <= 0 {
        DEFAULT_TARGET_FPS
    } else {
        target_fps as u32
    }
}

/// One second divided by `fps`, truncated to whole nanoseconds.
pub fn frame_period(fps: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_period_is_exact() {
        for fps in [1, 7, 10, 30, 60, 144, 1000, 999_999_937] {
            assert_eq!(
                frame_period(fps).as_nanos(),
                1_000_000_000u128 / fps as u128
            );
        }
        assert_eq!(frame_period(3), Duration::from_nanos(333_333_333));
    }

    #[test]
    fn test_non_positive_fps_uses_default() {
        assert_eq!(effective_fps(0), DEFAULT_TARGET_FPS);
        assert_eq!(effective_fps(-1), DEFAULT_TARGET_FPS);
        assert_eq!(effective_fps(i32::MIN), DEFAULT_TARGET_FPS);
        assert_eq!(effective_fps(45), 45);
    }

    #[test]
    fn test_config_keeps_raw_fps() {
        let config = GameConfig::new().with_target_fps(-5);
        assert_eq!(config.get_target_fps(), -5);
        assert_eq!(effective_fps(config.get_target_fps()), 30);
    }

    #[test]
    fn test_builder_values_are_read_back() {
        let config = GameConfig::default();
        assert_eq!(config.get_title(), "simple-game");
        assert!(!config.get_benchmark());

        let config = config.with_title("bounce").with_benchmark(true);
        assert_eq!(config.get_title(), "bounce");
        assert!(config.get_benchmark());
    }

    #[test]
    fn test_window_size_is_clamped() {
        let config = GameConfig::new().with_window_size(320, 1080);
        assert_eq!(config.get_window_size(), PhysicalSize::new(800, 1080));
    }
}
