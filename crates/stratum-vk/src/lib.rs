// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan object lifetimes and frame pacing on top of `ash`.
//!
//! Creation helpers hand back proxies ([`ReturnProxy`], [`ComposedProxy`])
//! that register teardown with a [`Deallocator`] when committed. The
//! [`SwapchainFrames`] backend plugs the swapchain into
//! [`stratum_render::FrameController`].

pub mod command;
pub mod context;
pub mod dealloc;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod linked;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod resource;
pub mod shader;
pub mod skeleton;
pub mod swapchain;
pub mod sync;

pub use ash;
pub use context::{Context, QueueFamilies};
pub use dealloc::{ComposedProxy, Composer, DeallocationQueue, Deallocator, ReturnProxy};
pub use error::{Error, Result};
pub use linked::{DeviceAllocator, Linked, LinkedAllocator, LinkedResource, VkAllocator};
pub use pipeline::{
    ComputePipelineAssembler, GraphicsPipelineAssembler, Pipeline, PipelineLayoutBuilder,
};
pub use render_pass::{Attachment, FramebufferSet, RenderPassAssembler};
pub use resource::{Buffer, BufferInfo, Image, ImageInfo, SamplerAssembler};
pub use skeleton::Skeleton;
pub use swapchain::Swapchain;
pub use sync::{PresentSync, SwapchainFrames, SyncFrame};
