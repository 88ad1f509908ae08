use image::Rgba;
use simple_game::{DrawContext, Game, GameConfig};

const BACKGROUND: Rgba<u8> = Rgba([25, 51, 76, 255]);
const BOX_COLOR: Rgba<u8> = Rgba([240, 200, 80, 255]);
const BOX_SIZE: u32 = 48;

// 速度单位：像素/秒
struct Bounce {
    position: (f32, f32),
    velocity: (f32, f32),
    bounds: (u32, u32),
}

impl Game for Bounce {
    fn update(&mut self, delta: u64) -> anyhow::Result<()> {
        let dt = delta as f32 / 1000.0;
        let max_x = self.bounds.0.saturating_sub(BOX_SIZE) as f32;
        let max_y = self.bounds.1.saturating_sub(BOX_SIZE) as f32;

        self.position.0 += self.velocity.0 * dt;
        self.position.1 += self.velocity.1 * dt;

        if self.position.0 <= 0.0 || self.position.0 >= max_x {
            self.velocity.0 = -self.velocity.0;
            self.position.0 = self.position.0.clamp(0.0, max_x);
        }
        if self.position.1 <= 0.0 || self.position.1 >= max_y {
            self.velocity.1 = -self.velocity.1;
            self.position.1 = self.position.1.clamp(0.0, max_y);
        }
        Ok(())
    }

    fn render(&mut self, ctx: &mut DrawContext) -> anyhow::Result<()> {
        self.bounds = ctx.size();
        ctx.clear(BACKGROUND);
        ctx.fill_rect(
            self.position.0 as i32,
            self.position.1 as i32,
            BOX_SIZE,
            BOX_SIZE,
            BOX_COLOR,
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let config = GameConfig::from_env().with_title("bounce");
    let game = Bounce {
        position: (100.0, 100.0),
        velocity: (240.0, 180.0),
        bounds: (config.get_window_size().width, config.get_window_size().height),
    };
    simple_game::run(game, config)
}
