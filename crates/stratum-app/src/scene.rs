// SPDX-License-Identifier: CEPL-1.0
//! Textured triangle drawn through the stratum-vk object model.
//!
//! Everything that lives as long as the device is committed to one
//! [`Deallocator`]. The depth image and framebuffers depend on the
//! swapchain extent, so they sit in a separate queue that is drained and
//! refilled on every resize.

use anyhow::{bail, Context as _, Result};
use bytemuck::{Pod, Zeroable};
use std::time::Instant;
use stratum_core::Config;
use stratum_platform::winit::raw_window_handle::HasDisplayHandle;
use stratum_platform::winit::window::Window;
use stratum_platform::WindowSize;
use stratum_render::{FrameController, FrameHooks, FrameStatus, RenderSize};
use stratum_vk::ash::khr::swapchain;
use stratum_vk::ash::vk;
use stratum_vk::descriptor::{self, DescriptorUpdateQueue};
use stratum_vk::format::{VertexFormat, VertexLayout};
use stratum_vk::pipeline::PipelineLayoutBuilder;
use stratum_vk::render_pass::{default_clear_values, default_rp_begin_info, viewport_and_scissor};
use stratum_vk::shader::{shader_module_from_source, ShaderOptions, ShaderStageBundle};
use stratum_vk::swapchain::clamp_extent;
use stratum_vk::{
    command, resource, Attachment, Buffer, BufferInfo, Context, DeallocationQueue, Deallocator,
    FramebufferSet, GraphicsPipelineAssembler, ImageInfo, LinkedAllocator, Pipeline,
    PresentSync, RenderPassAssembler, SamplerAssembler, Skeleton, SwapchainFrames, VkAllocator,
};
use tracing::{debug, info};

const VERTEX_SHADER: &str = r#"
#version 450
layout(location = 0) in vec3 in_position;
layout(location = 1) in vec2 in_uv;
layout(location = 0) out vec2 uv;

layout(push_constant) uniform Push {
    vec2 offset;
    float scale;
    float aspect;
} pc;

void main() {
    vec2 p = in_position.xy * pc.scale;
    p.x /= pc.aspect;
    gl_Position = vec4(p + pc.offset, in_position.z, 1.0);
    uv = in_uv;
}
"#;

const FRAGMENT_SHADER: &str = r#"
#version 450
layout(location = 0) in vec2 uv;
layout(location = 0) out vec4 color;

layout(binding = 0) uniform sampler2D checker;
layout(binding = 1) uniform Tint {
    vec4 tint;
};

void main() {
    color = texture(checker, uv) * tint;
}
"#;

const TEXTURE_SIZE: u32 = 64;
const CHECKER_CELL: u32 = 8;
const TINT: [f32; 4] = [1.0, 0.85, 0.6, 1.0];

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

const VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.8, 0.0],
        uv: [0.5, 0.0],
    },
    Vertex {
        position: [0.8, 0.8, 0.0],
        uv: [1.0, 1.0],
    },
    Vertex {
        position: [-0.8, 0.8, 0.0],
        uv: [0.0, 1.0],
    },
];

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Push {
    offset: [f32; 2],
    scale: f32,
    aspect: f32,
}

/// RGBA8 checkerboard, `size` pixels square with `cell`-pixel squares.
pub fn checker_pixels(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            let v = if (x / cell + y / cell) % 2 == 0 { 0xff } else { 0x30 };
            [v, v, v, 0xff]
        })
        .collect()
}

/// Startup choices the scene needs from the app's configuration.
#[derive(Clone, Debug)]
pub struct SceneSettings {
    pub context: Config,
    pub frames_in_flight: usize,
    pub present_mode: Option<vk::PresentModeKHR>,
    pub clear_color: [f32; 4],
}

struct Gpu {
    skeleton: Skeleton,
    dal: Deallocator,
    sized: DeallocationQueue,
    props: vk::PhysicalDeviceMemoryProperties,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: Pipeline,
    descriptor: vk::DescriptorSet,
    vertices: Buffer,
    clear_color: [f32; 4],
    started: Instant,
}

impl Gpu {
    fn new(ctx: &Context, skeleton: Skeleton, clear_color: [f32; 4]) -> Self {
        let props = ctx.memory_properties(skeleton.phys);
        let dal = Deallocator::new(skeleton.device.clone());
        Gpu {
            skeleton,
            dal,
            sized: DeallocationQueue::new(),
            props,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            pipeline: Pipeline::default(),
            descriptor: vk::DescriptorSet::null(),
            vertices: Buffer::default(),
            clear_color,
            started: Instant::now(),
        }
    }

    /// Create every device-lifetime object and the per-slot frame state.
    fn populate(&mut self, frames_in_flight: usize) -> Result<SwapchainFrames> {
        let device = self.skeleton.device.clone();

        let pool = command::command_pool(
            &device,
            self.skeleton.families.graphics,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
        .try_commit(&mut self.dal)?;

        self.render_pass = RenderPassAssembler::new()
            .add_attachment(Attachment::color(self.skeleton.swapchain.format))
            .add_attachment(Attachment::depth())
            .add_subpass(vk::PipelineBindPoint::GRAPHICS)
            .color_attachment(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .depth_attachment(1, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .done()
            .add_dependency_access(vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ..Default::default()
            })
            .build(&device)
            .try_commit(&mut self.dal)?;

        let options = ShaderOptions::default();
        let vert = shader_module_from_source(
            &device,
            VERTEX_SHADER,
            "scene.vert",
            vk::ShaderStageFlags::VERTEX,
            &options,
        )
        .try_commit(&mut self.dal)?;
        let frag = shader_module_from_source(
            &device,
            FRAGMENT_SHADER,
            "scene.frag",
            vk::ShaderStageFlags::FRAGMENT,
            &options,
        )
        .try_commit(&mut self.dal)?;

        self.pipeline = GraphicsPipelineAssembler::new()
            .with_render_pass(self.render_pass, 0)
            .with_vertex_layout(VertexLayout::new(&[VertexFormat::Vec3, VertexFormat::Vec2]))
            .with_shader_bundle(
                ShaderStageBundle::new()
                    .attach(vert, vk::ShaderStageFlags::VERTEX)
                    .attach(frag, vk::ShaderStageFlags::FRAGMENT),
            )
            .with_dsl_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .with_dsl_binding(1, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::FRAGMENT)
            .with_push_constant::<Push>(vk::ShaderStageFlags::VERTEX, 0)
            .depth(true, true)
            .compile(&device)
            .try_commit(&mut self.dal)?;

        // vertex and tint buffers live and die together
        let allocator = VkAllocator::new(&device, &self.props);
        let linked = LinkedAllocator::bind(&allocator)
            .buffer(&BufferInfo::host_visible(
                std::mem::size_of_val(&VERTICES) as vk::DeviceSize,
                vk::BufferUsageFlags::VERTEX_BUFFER,
            ))
            .buffer(&BufferInfo::host_visible(
                std::mem::size_of_val(&TINT) as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            ))
            .commit(&mut self.dal)?;
        let (Some(vertices), Some(tint)) = (linked.buffer(0), linked.buffer(1)) else {
            bail!("linked allocation returned {} resources, expected 2", linked.len());
        };
        resource::upload(&device, &vertices, &VERTICES)?;
        resource::upload(&device, &tint, &[TINT])?;
        self.vertices = vertices;

        let texture = resource::texture(
            &device,
            &self.props,
            pool,
            self.skeleton.graphics_queue,
            &ImageInfo::new(
                vk::Extent2D {
                    width: TEXTURE_SIZE,
                    height: TEXTURE_SIZE,
                },
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            ),
            &checker_pixels(TEXTURE_SIZE, CHECKER_CELL),
        )
        .try_commit(&mut self.dal)?;
        let sampler = SamplerAssembler::new()
            .filter(vk::Filter::NEAREST, vk::Filter::NEAREST)
            .build(&device)
            .try_commit(&mut self.dal)?;

        let dsl = self
            .pipeline
            .dsl
            .context("pipeline was compiled without a descriptor set layout")?;
        let descriptor_pool = descriptor::descriptor_pool(
            &device,
            1,
            &descriptor::pool_sizes(&self.pipeline.bindings, 1),
            vk::DescriptorPoolCreateFlags::empty(),
        )
        .try_commit(&mut self.dal)?;
        self.descriptor = descriptor::allocate_descriptor_sets(&device, descriptor_pool, dsl, 1)?
            .into_iter()
            .next()
            .context("descriptor pool returned no sets")?;
        DescriptorUpdateQueue::new(self.descriptor, &self.pipeline)
            .queue_image(
                0,
                0,
                sampler,
                texture.view,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?
            .queue_buffer(1, 0, tint.buffer, 0, vk::WHOLE_SIZE)?
            .apply(&device);

        self.build_targets()?;

        let commands = command::allocate_command_buffers(&device, pool, frames_in_flight as u32)?;
        let sync = PresentSync::create(&device, frames_in_flight).try_commit(&mut self.dal)?;
        let frames = SwapchainFrames::new(
            &device,
            &self.skeleton.swapchain_loader,
            self.skeleton.swapchain.handle,
            (self.skeleton.graphics_queue, self.skeleton.present_queue),
            sync,
            commands,
        )?;
        info!(
            "scene ready: {} objects registered, {} frames in flight",
            self.dal.pending(),
            frames_in_flight
        );
        Ok(frames)
    }

    /// Depth image and one framebuffer per swapchain image at the current
    /// extent.
    fn build_targets(&mut self) -> Result<()> {
        let device = &self.skeleton.device;
        let extent = self.skeleton.extent;
        let depth = resource::image(device, &self.props, &ImageInfo::depth(extent))
            .try_stage(&mut self.sized)?;
        self.framebuffers = FramebufferSet::new(self.render_pass, extent)
            .with_shared(depth.view)
            .build(device, &self.skeleton.swapchain.views)
            .try_stage(&mut self.sized)?;
        debug!(
            "{} framebuffers at {}x{}",
            self.framebuffers.len(),
            extent.width,
            extent.height
        );
        Ok(())
    }

    /// Rebuild the swapchain and everything sized by it. Returns false when
    /// the window never settled on a usable size.
    fn rebuild(
        &mut self,
        ctx: &Context,
        window: &Window,
        frames: &mut SwapchainFrames,
    ) -> Result<bool> {
        let mut source = WindowSize::new(window);
        if self.skeleton.resize(ctx, &mut source)?.is_none() {
            return Ok(false);
        }
        // the device is idle after a successful skeleton resize
        let released = self.sized.drain(&self.skeleton.device);
        debug!("released {released} size-dependent objects");
        self.build_targets()?;
        frames.set_swapchain(self.skeleton.swapchain.handle);
        Ok(true)
    }

    fn record(&self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()> {
        let framebuffer = *self
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("no framebuffer for swapchain image {image_index}"))?;
        let device = &self.skeleton.device;
        let extent = self.skeleton.extent;

        let mut clears = default_clear_values(2);
        clears[0] = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        };
        let begin = default_rp_begin_info(self.render_pass, framebuffer, extent, &clears);

        let t = self.started.elapsed().as_secs_f32();
        let push = Push {
            offset: [0.25 * t.sin(), 0.0],
            scale: 0.8,
            aspect: self.skeleton.aspect_ratio(),
        };

        unsafe { device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE) };
        self.pipeline.bind(device, cmd);
        viewport_and_scissor(device, cmd, extent);
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertices.buffer], &[0]);
        }
        self.pipeline.bind_descriptor_set(device, cmd, self.descriptor);
        self.pipeline
            .push_constants(device, cmd, vk::ShaderStageFlags::VERTEX, 0, &push);
        unsafe {
            device.cmd_draw(cmd, VERTICES.len() as u32, 1, 0, 0);
            device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    /// Idle the device, release size-dependent objects, then tear down the
    /// skeleton (which drains the deallocator first).
    fn destroy(mut self, ctx: &Context) -> Result<()> {
        unsafe { self.skeleton.device.device_wait_idle() }?;
        self.sized.drain(&self.skeleton.device);
        self.skeleton.destroy(ctx, &mut self.dal)?;
        Ok(())
    }
}

/// Hooks handed to the frame controller for one frame.
struct Pass<'a> {
    gpu: &'a mut Gpu,
    ctx: &'a Context,
    window: &'a Window,
}

impl FrameHooks<SwapchainFrames> for Pass<'_> {
    fn render(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()> {
        self.gpu.record(cmd, image_index)
    }

    fn resize(&mut self, frames: &mut SwapchainFrames) -> Result<()> {
        self.gpu.rebuild(self.ctx, self.window, frames)?;
        Ok(())
    }
}

/// The swapchain is rebuilt at `clamp_extent(caps, window)`, so that is the
/// size to compare against, not the raw window size.
fn needs_rebuild(
    caps: &vk::SurfaceCapabilitiesKHR,
    window: vk::Extent2D,
    current: vk::Extent2D,
) -> bool {
    clamp_extent(caps, window) != current
}

pub struct Scene {
    ctx: Context,
    gpu: Gpu,
    frames: SwapchainFrames,
    controller: FrameController,
}

impl Scene {
    pub fn new(settings: &SceneSettings, window: &Window) -> Result<Self> {
        let display = window.display_handle()?.as_raw();
        let ctx = Context::new(&settings.context, display)?;
        match Self::build(&ctx, settings, window) {
            Ok((gpu, frames)) => {
                let controller = FrameController::for_backend(&frames);
                Ok(Scene {
                    ctx,
                    gpu,
                    frames,
                    controller,
                })
            }
            Err(e) => {
                ctx.destroy();
                Err(e)
            }
        }
    }

    fn build(
        ctx: &Context,
        settings: &SceneSettings,
        window: &Window,
    ) -> Result<(Gpu, SwapchainFrames)> {
        let phys = ctx.pick_physical_device(|_, p| ctx.physical_device_able(p, &[swapchain::NAME]))?;
        let size = window.inner_size();
        let skeleton = Skeleton::new(
            ctx,
            phys,
            window,
            RenderSize::new(size.width.max(1), size.height.max(1)),
            &[],
            settings.present_mode,
        )?;

        let mut gpu = Gpu::new(ctx, skeleton, settings.clear_color);
        match gpu.populate(settings.frames_in_flight) {
            Ok(frames) => Ok((gpu, frames)),
            Err(e) => {
                gpu.destroy(ctx)?;
                Err(e)
            }
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.gpu.skeleton.extent
    }

    /// Run one frame through the controller.
    pub fn frame(&mut self, window: &Window) -> Result<FrameStatus> {
        let mut pass = Pass {
            gpu: &mut self.gpu,
            ctx: &self.ctx,
            window,
        };
        self.controller.frame(&mut self.frames, &mut pass)
    }

    /// Rebuild after the window reported a new size, when the size the
    /// surface would actually accept differs from the swapchain extent.
    pub fn resize(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let skeleton = &self.gpu.skeleton;
        let caps = unsafe {
            self.ctx
                .surface_loader
                .get_physical_device_surface_capabilities(skeleton.phys, skeleton.surface)
        }
        .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let want = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        if skeleton.swapchain.is_usable() && !needs_rebuild(&caps, want, self.extent()) {
            return Ok(());
        }
        self.gpu.rebuild(&self.ctx, window, &mut self.frames)?;
        Ok(())
    }

    pub fn destroy(self) -> Result<()> {
        info!(
            "presented {} frames, {} resizes",
            self.controller.presented(),
            self.controller.resizes()
        );
        self.gpu.destroy(&self.ctx)?;
        self.ctx.destroy();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_per_cell() {
        let px = checker_pixels(4, 2);
        assert_eq!(px.len(), 4 * 4 * 4);
        let at = |x: usize, y: usize| px[(y * 4 + x) * 4];
        assert_eq!(at(0, 0), 0xff);
        assert_eq!(at(1, 1), 0xff);
        assert_eq!(at(2, 0), 0x30);
        assert_eq!(at(0, 2), 0x30);
        assert_eq!(at(2, 2), 0xff);
        assert!(px.chunks(4).all(|p| p[3] == 0xff));
    }

    #[test]
    fn push_block_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<Push>(), 16);
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        assert_eq!(
            VertexLayout::new(&[VertexFormat::Vec3, VertexFormat::Vec2]).stride(),
            std::mem::size_of::<Vertex>() as u32
        );
    }

    #[test]
    fn clamped_window_size_does_not_force_rebuilds() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 768,
            },
            ..Default::default()
        };
        let current = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        let oversized = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert!(!needs_rebuild(&caps, oversized, current));
        assert!(!needs_rebuild(&caps, current, current));
        let smaller = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert!(needs_rebuild(&caps, smaller, current));
    }
}
