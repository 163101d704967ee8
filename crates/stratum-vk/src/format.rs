// SPDX-License-Identifier: CEPL-1.0
//! Translation tables: vertex tags to Vulkan formats, image layouts to
//! barrier masks, and readable names for log lines.

use crate::error::{Error, Result};
use ash::vk;
use tracing::error;

/// Closed set of vertex attribute shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexFormat {
    Float,
    Vec2,
    Vec3,
    Vec4,
}

impl VertexFormat {
    pub fn format(self) -> vk::Format {
        match self {
            VertexFormat::Float => vk::Format::R32_SFLOAT,
            VertexFormat::Vec2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Vec3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
        }
    }

    /// Size in bytes.
    pub fn size(self) -> u32 {
        4 * match self {
            VertexFormat::Float => 1,
            VertexFormat::Vec2 => 2,
            VertexFormat::Vec3 => 3,
            VertexFormat::Vec4 => 4,
        }
    }
}

/// Tightly packed, per-vertex attributes of one vertex buffer binding.
/// Locations follow field order starting at 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexLayout {
    binding: u32,
    fields: Vec<VertexFormat>,
}

impl VertexLayout {
    pub fn new(fields: &[VertexFormat]) -> Self {
        VertexLayout {
            binding: 0,
            fields: fields.to_vec(),
        }
    }

    pub fn with_binding(mut self, binding: u32) -> Self {
        self.binding = binding;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn stride(&self) -> u32 {
        self.fields.iter().map(|f| f.size()).sum()
    }

    pub fn binding_description(&self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: self.binding,
            stride: self.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attributes(&self) -> Vec<vk::VertexInputAttributeDescription> {
        let mut offset = 0;
        self.fields
            .iter()
            .enumerate()
            .map(|(location, field)| {
                let attr = vk::VertexInputAttributeDescription {
                    location: location as u32,
                    binding: self.binding,
                    format: field.format(),
                    offset,
                };
                offset += field.size();
                attr
            })
            .collect()
    }
}

/// Masks for one `vkCmdPipelineBarrier` image transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

fn src_masks(layout: vk::ImageLayout) -> Option<(vk::AccessFlags, vk::PipelineStageFlags)> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};
    Some(match layout {
        L::UNDEFINED => (A::empty(), S::TOP_OF_PIPE),
        L::GENERAL => (A::empty(), S::HOST),
        L::PREINITIALIZED => (A::HOST_WRITE, S::HOST),
        L::COLOR_ATTACHMENT_OPTIMAL => (A::COLOR_ATTACHMENT_WRITE, S::COLOR_ATTACHMENT_OUTPUT),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::LATE_FRAGMENT_TESTS,
        ),
        L::SHADER_READ_ONLY_OPTIMAL => (A::SHADER_READ, S::FRAGMENT_SHADER),
        L::TRANSFER_SRC_OPTIMAL => (A::TRANSFER_READ, S::TRANSFER),
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::PRESENT_SRC_KHR => (A::MEMORY_READ, S::BOTTOM_OF_PIPE),
        _ => return None,
    })
}

fn dst_masks(layout: vk::ImageLayout) -> Option<(vk::AccessFlags, vk::PipelineStageFlags)> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};
    Some(match layout {
        L::GENERAL => (A::empty(), S::HOST),
        L::COLOR_ATTACHMENT_OPTIMAL => (A::COLOR_ATTACHMENT_WRITE, S::COLOR_ATTACHMENT_OUTPUT),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        L::SHADER_READ_ONLY_OPTIMAL => (A::SHADER_READ, S::FRAGMENT_SHADER),
        L::TRANSFER_SRC_OPTIMAL => (A::TRANSFER_READ, S::TRANSFER),
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::PRESENT_SRC_KHR => (A::empty(), S::BOTTOM_OF_PIPE),
        _ => return None,
    })
}

pub fn layout_transition(from: vk::ImageLayout, to: vk::ImageLayout) -> Result<LayoutTransition> {
    let Some((src_access, src_stage)) = src_masks(from) else {
        error!("unsupported source layout {from:?}");
        return Err(Error::Configuration(format!("unsupported source layout {from:?}")));
    };
    let Some((dst_access, dst_stage)) = dst_masks(to) else {
        error!("unsupported target layout {to:?}");
        return Err(Error::Configuration(format!("unsupported target layout {to:?}")));
    };
    Ok(LayoutTransition {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect covered by views and barriers of an image with `format`.
pub fn aspect_of(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        f if is_depth_format(f) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Bytes per texel of uncompressed color and depth formats; `None` for
/// anything outside the table (compressed, multi-planar, exotic).
pub fn texel_size(format: vk::Format) -> Option<u32> {
    use vk::Format as F;
    Some(match format {
        F::R8_UNORM | F::R8_SRGB | F::R8_UINT | F::S8_UINT => 1,
        F::R8G8_UNORM | F::R8G8_SRGB | F::R16_SFLOAT | F::R16_UNORM | F::D16_UNORM => 2,
        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SRGB
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB
        | F::A2B10G10R10_UNORM_PACK32
        | F::R16G16_SFLOAT
        | F::R32_SFLOAT
        | F::R32_UINT
        | F::D32_SFLOAT
        | F::X8_D24_UNORM_PACK32
        | F::D24_UNORM_S8_UINT => 4,
        F::R16G16B16A16_SFLOAT | F::R16G16B16A16_UNORM | F::R32G32_SFLOAT => 8,
        F::R32G32B32_SFLOAT => 12,
        F::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    })
}

// Info only
pub fn format_name(f: vk::Format) -> &'static str {
    match f {
        vk::Format::B8G8R8A8_UNORM => "B8G8R8A8_UNORM",
        vk::Format::B8G8R8A8_SRGB => "B8G8R8A8_SRGB",
        vk::Format::R8G8B8A8_SRGB => "R8G8B8A8_SRGB",
        vk::Format::R8G8B8A8_UNORM => "R8G8B8A8_UNORM",
        vk::Format::A2B10G10R10_UNORM_PACK32 => "A2B10G10R10_UNORM",
        vk::Format::R16G16B16A16_SFLOAT => "R16G16B16A16_SFLOAT",
        vk::Format::D32_SFLOAT => "D32_SFLOAT",
        _ => "OTHER",
    }
}

pub fn color_space_name(cs: vk::ColorSpaceKHR) -> &'static str {
    match cs {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => "SRGB_NONLINEAR",
        vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT => "DISPLAY_P3_NONLINEAR",
        vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT => "EXTENDED_SRGB_LINEAR",
        _ => "OTHER",
    }
}

pub fn present_mode_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VertexFormat::*;

    #[test]
    fn layout_offsets_follow_field_order() {
        let layout = VertexLayout::new(&[Vec3, Vec3, Vec2]).with_binding(1);
        assert_eq!(layout.stride(), 32);
        let attrs = layout.attributes();
        let got: Vec<_> = attrs
            .iter()
            .map(|a| (a.location, a.binding, a.format, a.offset))
            .collect();
        assert_eq!(
            got,
            vec![
                (0, 1, vk::Format::R32G32B32_SFLOAT, 0),
                (1, 1, vk::Format::R32G32B32_SFLOAT, 12),
                (2, 1, vk::Format::R32G32_SFLOAT, 24),
            ]
        );
        let binding = layout.binding_description();
        assert_eq!(binding.binding, 1);
        assert_eq!(binding.stride, 32);
    }

    #[test]
    fn upload_then_sample_transitions() {
        let t = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(t.src_access, vk::AccessFlags::empty());
        assert_eq!(t.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(t.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let t = layout_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(t.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(t.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn depth_target_transition() {
        let t = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert!(t.dst_access.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(t.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn undefined_is_never_a_target() {
        assert!(layout_transition(vk::ImageLayout::GENERAL, vk::ImageLayout::UNDEFINED).is_err());
    }

    #[test]
    fn aspects() {
        assert_eq!(aspect_of(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_of(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_of(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }
}
