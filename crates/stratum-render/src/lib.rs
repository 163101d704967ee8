// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic frame pacing.
//!
//! [`FrameController`] drives the wait → acquire → record → submit → present
//! cycle over anything implementing [`FrameBackend`]; the Vulkan crate
//! provides the real implementation, tests provide scripted ones.

mod frame;
mod size;

pub use frame::{FrameController, FrameError, FrameHooks, FrameStatus};
pub use size::{stable_size, SizeSource};

use anyhow::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        RenderSize { width, height }
    }

    /// True when either side is zero (minimized window).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Outcome of talking to the presentation surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceOperation {
    /// Image index that was acquired or presented.
    Ready(u32),
    /// Surface parameters are stale; swapchain-derived objects must be rebuilt.
    Resize,
    /// Unrecoverable failure.
    Failed,
}

/// Per-slot primitives a [`FrameController`] needs from a graphics backend.
///
/// `slot` is always the frame-in-flight index, never a swapchain image index.
pub trait FrameBackend {
    type CommandBuffer: Copy;

    fn frames_in_flight(&self) -> usize;

    /// Block until the GPU is done with the work last submitted for `slot`.
    fn wait_previous(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next presentable image. Must leave the slot's fence
    /// signaled: a frame abandoned between acquire and submit would
    /// otherwise stall the next `wait_previous` on that slot forever.
    fn acquire(&mut self, slot: usize) -> Result<SurfaceOperation>;

    /// Reset and begin recording the slot's command buffer.
    fn begin(&mut self, slot: usize) -> Result<Self::CommandBuffer>;

    /// Finish recording and submit, waiting on image-available and
    /// signaling render-finished plus the slot's fence. The fence is reset
    /// here, immediately before the submit.
    fn submit(&mut self, slot: usize, cmd: Self::CommandBuffer) -> Result<()>;

    /// Queue `image_index` for presentation. A stale surface yields
    /// `Resize`; other errors are returned as `Err`.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<SurfaceOperation>;
}
