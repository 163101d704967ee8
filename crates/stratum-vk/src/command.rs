// SPDX-License-Identifier: CEPL-1.0
use crate::dealloc::ReturnProxy;
use crate::error::{Result, VkContext};
use ash::vk;

pub fn command_pool(
    device: &ash::Device,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
) -> ReturnProxy<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo {
        queue_family_index: queue_family,
        flags,
        ..Default::default()
    };
    ReturnProxy::from_result(
        "vkCreateCommandPool",
        unsafe { device.create_command_pool(&info, None) },
        |d, pool| unsafe { d.destroy_command_pool(pool, None) },
    )
}

/// Primary command buffers; they are freed with their pool.
pub fn allocate_command_buffers(
    device: &ash::Device,
    pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let info = vk::CommandBufferAllocateInfo {
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: count,
        ..Default::default()
    };
    unsafe { device.allocate_command_buffers(&info) }.vk_op("vkAllocateCommandBuffers")
}

/// Record with `record`, submit to `queue` and block until the queue is
/// idle. For one-off transfers only; it stalls the whole queue.
pub fn submit_now(
    device: &ash::Device,
    pool: vk::CommandPool,
    queue: vk::Queue,
    record: impl FnOnce(vk::CommandBuffer) -> Result<()>,
) -> Result<()> {
    let cmd = allocate_command_buffers(device, pool, 1)?[0];
    let result = unsafe { record_and_wait(device, queue, cmd, record) };
    unsafe { device.free_command_buffers(pool, std::slice::from_ref(&cmd)) };
    result
}

unsafe fn record_and_wait(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    record: impl FnOnce(vk::CommandBuffer) -> Result<()>,
) -> Result<()> {
    let bi = vk::CommandBufferBeginInfo {
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    unsafe { device.begin_command_buffer(cmd, &bi) }.vk_op("vkBeginCommandBuffer")?;
    record(cmd)?;
    unsafe { device.end_command_buffer(cmd) }.vk_op("vkEndCommandBuffer")?;

    let si = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
    unsafe { device.queue_submit(queue, std::slice::from_ref(&si), vk::Fence::null()) }
        .vk_op("vkQueueSubmit")?;
    unsafe { device.queue_wait_idle(queue) }.vk_op("vkQueueWaitIdle")
}
