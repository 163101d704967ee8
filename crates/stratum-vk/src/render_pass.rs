// SPDX-License-Identifier: CEPL-1.0
//! Render pass assembly and the objects that hang off a render pass:
//! framebuffers, clear values and the viewport.
//!
//! Attachment indices are positional. The n-th `add_attachment` call is
//! attachment `n`, and subpass references are passed through untouched;
//! an out-of-range reference surfaces as a driver or validation error.

use crate::dealloc::{ComposedProxy, Composer, ReturnProxy};
use ash::vk;
use tracing::debug;

/// One attachment description with by-value setters.
#[derive(Clone, Copy, Debug)]
pub struct Attachment {
    desc: vk::AttachmentDescription,
}

impl Attachment {
    pub fn new(format: vk::Format) -> Self {
        Attachment {
            desc: vk::AttachmentDescription {
                format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::DONT_CARE,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::GENERAL,
                ..Default::default()
            },
        }
    }

    /// Cleared, stored and handed to the presentation engine.
    pub fn color(format: vk::Format) -> Self {
        Self::new(format)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
    }

    /// D32_SFLOAT, cleared each pass and discarded afterwards.
    pub fn depth() -> Self {
        Self::new(vk::Format::D32_SFLOAT)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.desc.format = format;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.desc.samples = samples;
        self
    }

    pub fn load_op(mut self, op: vk::AttachmentLoadOp) -> Self {
        self.desc.load_op = op;
        self
    }

    pub fn store_op(mut self, op: vk::AttachmentStoreOp) -> Self {
        self.desc.store_op = op;
        self
    }

    pub fn stencil_ops(mut self, load: vk::AttachmentLoadOp, store: vk::AttachmentStoreOp) -> Self {
        self.desc.stencil_load_op = load;
        self.desc.stencil_store_op = store;
        self
    }

    pub fn initial_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.desc.initial_layout = layout;
        self
    }

    pub fn final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.desc.final_layout = layout;
        self
    }

    pub fn description(&self) -> vk::AttachmentDescription {
        self.desc
    }
}

impl From<Attachment> for vk::AttachmentDescription {
    fn from(a: Attachment) -> Self {
        a.desc
    }
}

/// Attachment references of one subpass.
#[derive(Clone, Debug, Default)]
pub struct SubpassLayout {
    pub bind_point: vk::PipelineBindPoint,
    pub inputs: Vec<vk::AttachmentReference>,
    pub colors: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

/// Everything a render pass is created from, in creation order.
#[derive(Clone, Debug, Default)]
pub struct RenderPassLayout {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassLayout>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassAssembler {
    layout: RenderPassLayout,
}

impl RenderPassAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_attachment(mut self, attachment: impl Into<vk::AttachmentDescription>) -> Self {
        self.layout.attachments.push(attachment.into());
        self
    }

    /// Start a subpass; `done` hands the assembler back.
    pub fn add_subpass(self, bind_point: vk::PipelineBindPoint) -> SubpassAssembler {
        SubpassAssembler {
            parent: self,
            subpass: SubpassLayout {
                bind_point,
                ..Default::default()
            },
        }
    }

    pub fn add_dependency(
        mut self,
        src: u32,
        dst: u32,
        src_mask: vk::PipelineStageFlags,
        dst_mask: vk::PipelineStageFlags,
    ) -> Self {
        self.layout.dependencies.push(vk::SubpassDependency {
            src_subpass: src,
            dst_subpass: dst,
            src_stage_mask: src_mask,
            dst_stage_mask: dst_mask,
            ..Default::default()
        });
        self
    }

    /// Dependency with explicit access masks.
    pub fn add_dependency_access(mut self, dependency: vk::SubpassDependency) -> Self {
        self.layout.dependencies.push(dependency);
        self
    }

    pub fn finish(self) -> RenderPassLayout {
        self.layout
    }

    pub fn build(self, device: &ash::Device) -> ReturnProxy<vk::RenderPass> {
        let layout = self.finish();
        debug!(
            "render pass: {} attachments, {} subpasses, {} dependencies",
            layout.attachments.len(),
            layout.subpasses.len(),
            layout.dependencies.len()
        );
        let subpasses: Vec<vk::SubpassDescription<'_>> = layout
            .subpasses
            .iter()
            .map(|s| {
                let desc = vk::SubpassDescription::default()
                    .pipeline_bind_point(s.bind_point)
                    .input_attachments(&s.inputs)
                    .color_attachments(&s.colors);
                match &s.depth {
                    Some(depth) => desc.depth_stencil_attachment(depth),
                    None => desc,
                }
            })
            .collect();
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&layout.attachments)
            .subpasses(&subpasses)
            .dependencies(&layout.dependencies);
        ReturnProxy::from_result(
            "vkCreateRenderPass",
            unsafe { device.create_render_pass(&info, None) },
            |d, rp| unsafe { d.destroy_render_pass(rp, None) },
        )
    }
}

pub struct SubpassAssembler {
    parent: RenderPassAssembler,
    subpass: SubpassLayout,
}

impl SubpassAssembler {
    pub fn input_attachment(mut self, attachment: u32, layout: vk::ImageLayout) -> Self {
        self.subpass
            .inputs
            .push(vk::AttachmentReference { attachment, layout });
        self
    }

    pub fn color_attachment(mut self, attachment: u32, layout: vk::ImageLayout) -> Self {
        self.subpass
            .colors
            .push(vk::AttachmentReference { attachment, layout });
        self
    }

    /// At most one per subpass; a second call replaces the first.
    pub fn depth_attachment(mut self, attachment: u32, layout: vk::ImageLayout) -> Self {
        self.subpass.depth = Some(vk::AttachmentReference { attachment, layout });
        self
    }

    pub fn done(mut self) -> RenderPassAssembler {
        self.parent.layout.subpasses.push(self.subpass);
        self.parent
    }
}

pub fn framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    attachments: &[vk::ImageView],
) -> ReturnProxy<vk::Framebuffer> {
    let info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);
    ReturnProxy::from_result(
        "vkCreateFramebuffer",
        unsafe { device.create_framebuffer(&info, None) },
        |d, fb| unsafe { d.destroy_framebuffer(fb, None) },
    )
}

/// One framebuffer per swapchain view. Each framebuffer takes its
/// swapchain view as attachment 0 followed by the shared views (a depth
/// target, usually) in the order they were added.
#[derive(Clone, Debug)]
pub struct FramebufferSet {
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    shared: Vec<vk::ImageView>,
}

impl FramebufferSet {
    pub fn new(render_pass: vk::RenderPass, extent: vk::Extent2D) -> Self {
        FramebufferSet {
            render_pass,
            extent,
            shared: Vec::new(),
        }
    }

    pub fn with_shared(mut self, view: vk::ImageView) -> Self {
        self.shared.push(view);
        self
    }

    pub fn attachments_for(&self, view: vk::ImageView) -> Vec<vk::ImageView> {
        std::iter::once(view).chain(self.shared.iter().copied()).collect()
    }

    pub fn build(self, device: &ash::Device, views: &[vk::ImageView]) -> ComposedProxy<Vec<vk::Framebuffer>> {
        let mut c = Composer::new("framebuffer set");
        let mut out = Vec::with_capacity(views.len());
        for &view in views {
            let attachments = self.attachments_for(view);
            match c.stage(framebuffer(device, self.render_pass, self.extent, &attachments)) {
                Some(fb) => out.push(fb),
                None => break,
            }
        }
        c.finish(device, out)
    }
}

/// Clear values for `count` attachments: the first is black opaque
/// color, every later one is depth 1.0.
pub fn default_clear_values(count: usize) -> Vec<vk::ClearValue> {
    (0..count)
        .map(|i| {
            if i == 0 {
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 1.0],
                    },
                }
            } else {
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                }
            }
        })
        .collect()
}

/// Begin info over the full `extent`.
pub fn default_rp_begin_info<'a>(
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    clear_values: &'a [vk::ClearValue],
) -> vk::RenderPassBeginInfo<'a> {
    vk::RenderPassBeginInfo::default()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        })
        .clear_values(clear_values)
}

pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn viewport_and_scissor(device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = full_viewport(extent);
    let scissor = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent,
    };
    unsafe {
        device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
        device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
    }
}
