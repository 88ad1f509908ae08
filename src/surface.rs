//! Offscreen frame buffer that games draw into before it is presented.
//!
//! [`BufferedSurface`] keeps exactly one RGBA image sized to the drawable area.
//! The image and its [`DrawContext`] are reused for as long as the drawable
//! keeps its size, so steady-state rendering does not allocate. A size change
//! drops the old context and allocates a new one.

use std::path::Path;

use anyhow::Context;
use image::{imageops, Rgba, RgbaImage};

/// The visible area frames are presented to, usually a window.
pub trait Drawable: Send {
    /// Current size of the drawable area in physical pixels.
    fn size(&self) -> (u32, u32);

    /// Copies a finished frame onto the drawable at (0,0) without scaling.
    fn present(&mut self, frame: &RgbaImage) -> anyhow::Result<()>;
}

/// Mutable drawing target handed to [`Game::render`](crate::Game::render).
///
/// The pixels are not cleared between ticks. A frame that does not repaint
/// everything keeps whatever the previous frame left behind.
pub struct DrawContext {
    id: u64,
    image: RgbaImage,
}

impl DrawContext {
    fn new(id: u64, width: u32, height: u32) -> Self {
        Self {
            id,
            image: RgbaImage::new(width, height),
        }
    }

    /// Identity of this context. Changes only when the surface is reallocated.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbaImage {
        &mut self.image
    }

    pub fn clear(&mut self, color: Rgba<u8>) {
        self.image.pixels_mut().for_each(|pixel| *pixel = color);
    }

    /// Sets one pixel. Coordinates outside the surface are ignored.
    pub fn put_pixel(&mut self, x: i32, y: i32, color: Rgba<u8>) {
        if x < 0 || y < 0 || x as u32 >= self.image.width() || y as u32 >= self.image.height() {
            return;
        }
        self.image.put_pixel(x as u32, y as u32, color);
    }

    /// Fills a rectangle, clipped to the surface.
    pub fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>) {
        let left = i64::from(x).max(0);
        let top = i64::from(y).max(0);
        let right = (i64::from(x) + i64::from(width)).min(i64::from(self.image.width()));
        let bottom = (i64::from(y) + i64::from(height)).min(i64::from(self.image.height()));

        for py in top..bottom {
            for px in left..right {
                self.image.put_pixel(px as u32, py as u32, color);
            }
        }
    }

    /// Alpha-blends `source` with its top-left corner at (x,y), clipped to the surface.
    pub fn draw_image(&mut self, source: &RgbaImage, x: i64, y: i64) {
        imageops::overlay(&mut self.image, source, x, y);
    }
}

/// Owns the offscreen image and keeps it sized to the drawable area.
#[derive(Default)]
pub struct BufferedSurface {
    context: Option<DrawContext>,
    allocations: u64,
}

impl BufferedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a draw context of exactly `width × height`.
    ///
    /// The existing context is returned while the size matches. A zero width or
    /// height yields `None` and leaves the current surface untouched.
    pub fn acquire(&mut self, width: u32, height: u32) -> Option<&mut DrawContext> {
        if width == 0 || height == 0 {
            return None;
        }

        let reuse = self
            .context
            .as_ref()
            .is_some_and(|context| context.size() == (width, height));

        if !reuse {
            // 先释放旧的缓冲，再创建新的
            if let Some(old) = self.context.take() {
                log::debug!(
                    "resizing frame buffer {}x{} -> {width}x{height}",
                    old.width(),
                    old.height()
                );
            }
            self.allocations += 1;
            self.context = Some(DrawContext::new(self.allocations, width, height));
        }

        self.context.as_mut()
    }

    /// Copies the current frame onto `target`. Does nothing before the first allocation.
    pub fn present(&self, target: &mut dyn Drawable) -> anyhow::Result<()> {
        match &self.context {
            Some(context) => target.present(&context.image),
            None => Ok(()),
        }
    }

    pub fn context(&self) -> Option<&DrawContext> {
        self.context.as_ref()
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.context.as_ref().map(DrawContext::size)
    }

    /// How many times an image has been allocated so far.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

/// A drawable backed by an in-memory image, for headless hosts and screenshots.
pub struct ImageDrawable {
    image: RgbaImage,
    presented: u64,
}

impl ImageDrawable {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            presented: 0,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Changes the drawable area. Pixels inside the new bounds are kept.
    pub fn resize(&mut self, width: u32, height: u32) {
        let mut image = RgbaImage::new(width, height);
        imageops::replace(&mut image, &self.image, 0, 0);
        self.image = image;
    }

    /// Number of frames presented so far.
    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        self.image
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("保存帧失败: {}", path.display()))
    }
}

impl Drawable for ImageDrawable {
    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn present(&mut self, frame: &RgbaImage) -> anyhow::Result<()> {
        imageops::replace(&mut self.image, frame, 0, 0);
        self.presented += 1;
        Ok(())
    }
}
