// SPDX-License-Identifier: CEPL-1.0
//! Per-slot synchronization and the Vulkan [`FrameBackend`].

use crate::dealloc::{ComposedProxy, Composer, ReturnProxy};
use crate::error::{Error, Result, VkContext};
use ash::khr::swapchain;
use ash::prelude::VkResult;
use ash::vk;
use stratum_render::{FrameBackend, SurfaceOperation};
use tracing::{error, warn};

/// The three primitives of one frame-in-flight slot.
#[derive(Clone, Copy, Debug)]
pub struct SyncFrame {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

/// Parallel arrays indexed by frame-in-flight slot.
#[derive(Clone, Debug, Default)]
pub struct PresentSync {
    pub image_available: Vec<vk::Semaphore>,
    pub render_finished: Vec<vk::Semaphore>,
    pub in_flight: Vec<vk::Fence>,
}

fn semaphore(device: &ash::Device) -> ReturnProxy<vk::Semaphore> {
    ReturnProxy::from_result(
        "vkCreateSemaphore",
        unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) },
        |d, s| unsafe { d.destroy_semaphore(s, None) },
    )
}

/// Created signaled so the first wait on each slot returns at once.
fn signaled_fence(device: &ash::Device) -> ReturnProxy<vk::Fence> {
    let info = vk::FenceCreateInfo {
        flags: vk::FenceCreateFlags::SIGNALED,
        ..Default::default()
    };
    ReturnProxy::from_result(
        "vkCreateFence",
        unsafe { device.create_fence(&info, None) },
        |d, f| unsafe { d.destroy_fence(f, None) },
    )
}

impl PresentSync {
    pub fn create(device: &ash::Device, frames_in_flight: usize) -> ComposedProxy<PresentSync> {
        let mut c = Composer::new("present sync");
        let mut sync = PresentSync::default();
        for _ in 0..frames_in_flight {
            let (Some(a), Some(r), Some(f)) = (
                c.stage(semaphore(device)),
                c.stage(semaphore(device)),
                c.stage(signaled_fence(device)),
            ) else {
                break;
            };
            sync.image_available.push(a);
            sync.render_finished.push(r);
            sync.in_flight.push(f);
        }
        c.finish(device, sync)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn frame(&self, slot: usize) -> SyncFrame {
        SyncFrame {
            image_available: self.image_available[slot],
            render_finished: self.render_finished[slot],
            in_flight: self.in_flight[slot],
        }
    }
}

pub fn wait_for_frame(device: &ash::Device, frame: &SyncFrame) -> Result<()> {
    unsafe { device.wait_for_fences(std::slice::from_ref(&frame.in_flight), true, u64::MAX) }
        .vk_op("vkWaitForFences")
}

fn acquire_status(result: VkResult<(u32, bool)>) -> SurfaceOperation {
    match result {
        Ok((index, _suboptimal)) => SurfaceOperation::Ready(index),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            warn!("acquire: swapchain out of date");
            SurfaceOperation::Resize
        }
        Err(e) => {
            error!("vkAcquireNextImageKHR failed: {e:?}");
            SurfaceOperation::Failed
        }
    }
}

fn present_status(result: VkResult<bool>) -> Result<SurfaceOperation> {
    match result {
        Ok(_suboptimal) => Ok(SurfaceOperation::Ready(0)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            warn!("present: swapchain out of date");
            Ok(SurfaceOperation::Resize)
        }
        Err(result) => Err(Error::Vk {
            op: "vkQueuePresentKHR",
            result,
        }),
    }
}

/// A null handle is what a failed rebuild leaves behind.
fn unusable_swapchain(swapchain: vk::SwapchainKHR) -> Option<SurfaceOperation> {
    if swapchain == vk::SwapchainKHR::null() {
        error!("acquire on a swapchain that failed to rebuild");
        Some(SurfaceOperation::Failed)
    } else {
        None
    }
}

/// Acquire the next image, signaling the slot's image-available
/// semaphore. The slot's fence is left alone; it is reset right before the
/// submit that signals it again.
pub fn acquire_image(
    loader: &swapchain::Device,
    swapchain: vk::SwapchainKHR,
    frame: &SyncFrame,
) -> Result<SurfaceOperation> {
    if let Some(op) = unusable_swapchain(swapchain) {
        return Ok(op);
    }
    Ok(acquire_status(unsafe {
        loader.acquire_next_image(swapchain, u64::MAX, frame.image_available, vk::Fence::null())
    }))
}

/// Present `index`, waiting on the slot's render-finished semaphore when
/// a frame is given.
pub fn present_image(
    loader: &swapchain::Device,
    queue: vk::Queue,
    swapchain: vk::SwapchainKHR,
    frame: Option<&SyncFrame>,
    index: u32,
) -> Result<SurfaceOperation> {
    let waits: Vec<vk::Semaphore> = frame.map(|f| f.render_finished).into_iter().collect();
    let info = vk::PresentInfoKHR::default()
        .wait_semaphores(&waits)
        .swapchains(std::slice::from_ref(&swapchain))
        .image_indices(std::slice::from_ref(&index));
    present_status(unsafe { loader.queue_present(queue, &info) }).map(|op| match op {
        SurfaceOperation::Ready(_) => SurfaceOperation::Ready(index),
        other => other,
    })
}

/// Vulkan side of the frame loop: one command buffer and one
/// [`SyncFrame`] per slot.
pub struct SwapchainFrames {
    device: ash::Device,
    loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    graphics: vk::Queue,
    present: vk::Queue,
    sync: PresentSync,
    commands: Vec<vk::CommandBuffer>,
}

impl SwapchainFrames {
    pub fn new(
        device: &ash::Device,
        loader: &swapchain::Device,
        swapchain: vk::SwapchainKHR,
        queues: (vk::Queue, vk::Queue),
        sync: PresentSync,
        commands: Vec<vk::CommandBuffer>,
    ) -> Result<Self> {
        if sync.is_empty() || sync.len() != commands.len() {
            return Err(Error::Configuration(format!(
                "{} sync slots but {} command buffers",
                sync.len(),
                commands.len()
            )));
        }
        Ok(SwapchainFrames {
            device: device.clone(),
            loader: loader.clone(),
            swapchain,
            graphics: queues.0,
            present: queues.1,
            sync,
            commands,
        })
    }

    /// Point at a rebuilt swapchain.
    pub fn set_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        self.swapchain = swapchain;
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn sync(&self) -> &PresentSync {
        &self.sync
    }
}

impl FrameBackend for SwapchainFrames {
    type CommandBuffer = vk::CommandBuffer;

    fn frames_in_flight(&self) -> usize {
        self.sync.len()
    }

    fn wait_previous(&mut self, slot: usize) -> anyhow::Result<()> {
        Ok(wait_for_frame(&self.device, &self.sync.frame(slot))?)
    }

    fn acquire(&mut self, slot: usize) -> anyhow::Result<SurfaceOperation> {
        Ok(acquire_image(
            &self.loader,
            self.swapchain,
            &self.sync.frame(slot),
        )?)
    }

    fn begin(&mut self, slot: usize) -> anyhow::Result<vk::CommandBuffer> {
        let cmd = self.commands[slot];
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .vk_op("vkResetCommandBuffer")?;
            self.device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .vk_op("vkBeginCommandBuffer")?;
        }
        Ok(cmd)
    }

    fn submit(&mut self, slot: usize, cmd: vk::CommandBuffer) -> anyhow::Result<()> {
        let frame = self.sync.frame(slot);
        unsafe { self.device.end_command_buffer(cmd) }.vk_op("vkEndCommandBuffer")?;

        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(std::slice::from_ref(&frame.image_available))
            .wait_dst_stage_mask(std::slice::from_ref(&wait_stage))
            .command_buffers(std::slice::from_ref(&cmd))
            .signal_semaphores(std::slice::from_ref(&frame.render_finished));
        // unsignaled only once a submit is certain to signal it again
        unsafe {
            self.device
                .reset_fences(std::slice::from_ref(&frame.in_flight))
                .vk_op("vkResetFences")?;
            self.device
                .queue_submit(self.graphics, std::slice::from_ref(&submit), frame.in_flight)
                .vk_op("vkQueueSubmit")?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> anyhow::Result<SurfaceOperation> {
        let frame = self.sync.frame(slot);
        Ok(present_image(
            &self.loader,
            self.present,
            self.swapchain,
            Some(&frame),
            image_index,
        )?)
    }
}
