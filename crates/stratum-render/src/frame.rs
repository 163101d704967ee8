// SPDX-License-Identifier: CEPL-1.0
use crate::{FrameBackend, SurfaceOperation};
use anyhow::Result;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("failed to acquire a swapchain image")]
    AcquireFailed,
    #[error("failed to present a swapchain image")]
    PresentFailed,
}

/// What happened during one call to [`FrameController::frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Work for `slot` was submitted and `image_index` presented.
    /// `resized` is set when presentation reported a stale surface and the
    /// resize hook already ran.
    Presented {
        slot: usize,
        image_index: u32,
        resized: bool,
    },
    /// Acquisition reported a stale surface. Nothing was submitted and the
    /// slot did not advance.
    Resized,
}

/// Caller side of a frame: record commands, rebuild after a resize.
pub trait FrameHooks<B: FrameBackend> {
    fn render(&mut self, cmd: B::CommandBuffer, image_index: u32) -> Result<()>;
    fn resize(&mut self, backend: &mut B) -> Result<()>;
}

impl<B, R, Z> FrameHooks<B> for (R, Z)
where
    B: FrameBackend,
    R: FnMut(B::CommandBuffer, u32) -> Result<()>,
    Z: FnMut(&mut B) -> Result<()>,
{
    fn render(&mut self, cmd: B::CommandBuffer, image_index: u32) -> Result<()> {
        (self.0)(cmd, image_index)
    }

    fn resize(&mut self, backend: &mut B) -> Result<()> {
        (self.1)(backend)
    }
}

/// Cycles frame-in-flight slots modulo `frames_in_flight`.
#[derive(Debug)]
pub struct FrameController {
    frames_in_flight: usize,
    slot: usize,
    presented: u64,
    resizes: u64,
}

impl FrameController {
    pub fn new(frames_in_flight: usize) -> Self {
        FrameController {
            frames_in_flight: frames_in_flight.max(1),
            slot: 0,
            presented: 0,
            resizes: 0,
        }
    }

    pub fn for_backend<B: FrameBackend>(backend: &B) -> Self {
        Self::new(backend.frames_in_flight())
    }

    /// Slot the next frame will use.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn resizes(&self) -> u64 {
        self.resizes
    }

    /// Run one full iteration of the frame state machine.
    pub fn frame<B, H>(&mut self, backend: &mut B, hooks: &mut H) -> Result<FrameStatus>
    where
        B: FrameBackend,
        H: FrameHooks<B>,
    {
        let slot = self.slot;

        // 1) CPU waits for the GPU to release this slot
        backend.wait_previous(slot)?;

        // 2) Acquire; stale surface abandons the frame without advancing
        let image_index = match backend.acquire(slot)? {
            SurfaceOperation::Ready(index) => index,
            SurfaceOperation::Resize => {
                debug!("acquire reported stale surface (slot {slot})");
                self.resizes += 1;
                hooks.resize(backend)?;
                return Ok(FrameStatus::Resized);
            }
            SurfaceOperation::Failed => {
                error!("acquire failed (slot {slot})");
                return Err(FrameError::AcquireFailed.into());
            }
        };

        // 3) Record + submit
        let cmd = backend.begin(slot)?;
        hooks.render(cmd, image_index)?;
        backend.submit(slot, cmd)?;

        // 4) Present. The slot's work is already queued, so the index
        // advances even when the surface turns out to be stale.
        match backend.present(slot, image_index)? {
            SurfaceOperation::Ready(_) => {
                self.advance(slot);
                Ok(FrameStatus::Presented {
                    slot,
                    image_index,
                    resized: false,
                })
            }
            SurfaceOperation::Resize => {
                debug!("present reported stale surface (slot {slot})");
                self.advance(slot);
                self.resizes += 1;
                hooks.resize(backend)?;
                Ok(FrameStatus::Presented {
                    slot,
                    image_index,
                    resized: true,
                })
            }
            SurfaceOperation::Failed => {
                error!("present failed (slot {slot})");
                Err(FrameError::PresentFailed.into())
            }
        }
    }

    fn advance(&mut self, slot: usize) {
        self.slot = (slot + 1) % self.frames_in_flight;
        self.presented += 1;
    }

    /// Drive [`FrameController::frame`] until `should_exit` returns true.
    /// Returns the number of iterations run.
    pub fn run<B, H, X>(&mut self, backend: &mut B, hooks: &mut H, mut should_exit: X) -> Result<u64>
    where
        B: FrameBackend,
        H: FrameHooks<B>,
        X: FnMut() -> bool,
    {
        let mut iterations = 0;
        while !should_exit() {
            self.frame(backend, hooks)?;
            iterations += 1;
        }
        Ok(iterations)
    }
}
