use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use image::RgbaImage;
use wgpu::*;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::surface::Drawable;

// 离屏帧上传到GPU时使用的纹理格式
const FRAME_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

struct FrameTexture {
    texture: Texture,
    bind_group: BindGroup,
    size: (u32, u32),
}

/// Last known inner size of a window, shared between the event loop and the game loop.
///
/// The event loop writes it on `Resized`; the game loop thread only reads it and
/// never queries winit, which on some platforms blocks on the main thread.
#[derive(Clone, Debug)]
pub struct WindowSize(Arc<AtomicU64>);

impl WindowSize {
    pub fn new(size: PhysicalSize<u32>) -> Self {
        Self(Arc::new(AtomicU64::new(pack(size))))
    }

    pub fn set(&self, size: PhysicalSize<u32>) {
        self.0.store(pack(size), Ordering::Release);
    }

    pub fn get(&self) -> PhysicalSize<u32> {
        let packed = self.0.load(Ordering::Acquire);
        PhysicalSize::new((packed >> 32) as u32, packed as u32)
    }
}

// 高32位宽，低32位高
fn pack(size: PhysicalSize<u32>) -> u64 {
    (u64::from(size.width) << 32) | u64::from(size.height)
}

/// A winit window that frames are presented to through wgpu.
pub struct WindowDrawable {
    size: WindowSize,
    surface: Surface<'static>,
    device: Device,
    queue: Queue,
    config: SurfaceConfiguration,
    bind_group_layout: BindGroupLayout,
    render_pipeline: RenderPipeline,
    frame_texture: Option<FrameTexture>,
}

impl WindowDrawable {
    /// Must be called on the event loop thread, it reads the window's current size.
    pub async fn new(window: Arc<Window>) -> anyhow::Result<Self> {
        let size = window.inner_size();

        let instance = Instance::new(&InstanceDescriptor {
            backends: Backends::PRIMARY,
            ..Default::default()
        });

        let surface = instance
            .create_surface(Arc::clone(&window))
            .context("failed to create window surface")?;

        //info about graphics card, such as name and backend the adapter uses
        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::default(),
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("no graphics adapter can present to this window")?;

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("Game Device"),
                    required_features: Features::empty(),
                    required_limits: Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .context("failed to open graphics device")?;

        let surface_caps = surface.get_capabilities(&adapter);

        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .context("window surface reports no formats")?;

        let config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("Frame Bind Group Layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: false },
                    view_dimension: TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            }],
        });

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: ShaderSource::Wgsl(include_str!("blit.wgsl").into()),
        });

        let render_pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Blit Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let render_pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Blit render pipeline"),
            layout: Some(&render_pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: PipelineCompilationOptions::default(),
            },
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(ColorTargetState {
                    format: config.format,
                    blend: None,
                    write_mask: ColorWrites::ALL,
                })],
                compilation_options: PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            size: WindowSize::new(size),
            surface,
            device,
            queue,
            config,
            bind_group_layout,
            render_pipeline,
            frame_texture: None,
        })
    }

    /// Handle the event loop updates when the window is resized.
    pub fn size_handle(&self) -> WindowSize {
        self.size.clone()
    }

    fn reconfigure(&mut self, width: u32, height: u32) {
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
    }

    fn create_frame_texture(&self, width: u32, height: u32) -> FrameTexture {
        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("Frame Texture"),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::TextureView(&view),
            }],
        });

        FrameTexture {
            texture,
            bind_group,
            size: (width, height),
        }
    }

    /// Copies the frame into a GPU texture of the same size.
    fn upload_frame(&mut self, frame: &RgbaImage) {
        let (width, height) = frame.dimensions();

        let frame_texture = match self.frame_texture.take() {
            Some(existing) if existing.size == (width, height) => existing,
            _ => self.create_frame_texture(width, height),
        };
        let frame_texture = self.frame_texture.insert(frame_texture);

        self.queue.write_texture(
            TexelCopyTextureInfo {
                texture: &frame_texture.texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            frame.as_raw(),
            TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }
}

impl Drawable for WindowDrawable {
    fn size(&self) -> (u32, u32) {
        let size = self.size.get();
        (size.width, size.height)
    }

    fn present(&mut self, frame: &RgbaImage) -> anyhow::Result<()> {
        let (width, height) = self.size();
        if width == 0 || height == 0 {
            return Ok(());
        }
        if (self.config.width, self.config.height) != (width, height) {
            self.reconfigure(width, height);
        }

        self.upload_frame(frame);

        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            // Reconfigure the surface if it's lost or outdated, the next tick presents again
            Err(SurfaceError::Lost | SurfaceError::Outdated) => {
                log::warn!("window surface lost, reconfiguring");
                self.reconfigure(width, height);
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to acquire window surface texture"),
        };
        let view = output
            .texture
            .create_view(&TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Present Encoder"),
            });

        //这个大括号是必须的
        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(Color::BLACK),
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            if let Some(frame_texture) = &self.frame_texture {
                render_pass.set_pipeline(&self.render_pipeline);
                render_pass.set_bind_group(0, &frame_texture.bind_group, &[]);
                render_pass.draw(0..3, 0..1);
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_shared_between_handles() {
        let size = WindowSize::new(PhysicalSize::new(800, 600));
        let handle = size.clone();

        handle.set(PhysicalSize::new(1920, 1080));
        assert_eq!(size.get(), PhysicalSize::new(1920, 1080));

        handle.set(PhysicalSize::new(0, 0));
        assert_eq!(size.get(), PhysicalSize::new(0, 0));
    }

    #[test]
    fn test_window_size_keeps_full_range() {
        let size = WindowSize::new(PhysicalSize::new(u32::MAX, 1));
        assert_eq!(size.get(), PhysicalSize::new(u32::MAX, 1));

        size.set(PhysicalSize::new(1, u32::MAX));
        assert_eq!(size.get(), PhysicalSize::new(1, u32::MAX));
    }
}
