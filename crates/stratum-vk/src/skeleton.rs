// SPDX-License-Identifier: CEPL-1.0
//! Device, surface, queues and swapchain for one window.

use crate::context::{Context, QueueFamilies};
use crate::dealloc::Deallocator;
use crate::error::{Error, Result, VkContext};
use crate::swapchain::{clamp_extent, Swapchain};
use ash::khr::swapchain;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use stratum_render::{stable_size, RenderSize, SizeSource};
use tracing::{debug, info, warn};

/// Reads of the window size before resize recovery gives up.
const MAX_SIZE_POLLS: usize = 500;

/// Optional features the skeleton turns on whenever the device has them.
pub fn enabled_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        fill_mode_non_solid: supported.fill_mode_non_solid,
        independent_blend: supported.independent_blend,
        geometry_shader: supported.geometry_shader,
        ..Default::default()
    }
}

fn unique_families(families: QueueFamilies) -> Vec<u32> {
    if families.graphics == families.present {
        vec![families.graphics]
    } else {
        vec![families.graphics, families.present]
    }
}

pub struct Skeleton {
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub surface: vk::SurfaceKHR,
    pub families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub swapchain_loader: swapchain::Device,
    pub swapchain: Swapchain,
    pub extent: vk::Extent2D,
}

impl Skeleton {
    /// Build everything needed to present to `window` from `phys`.
    /// `extensions` are device extensions on top of `VK_KHR_swapchain`.
    pub fn new<W>(
        ctx: &Context,
        phys: vk::PhysicalDevice,
        window: &W,
        size: RenderSize,
        extensions: &[&CStr],
        present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let dh = window.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();
        let surface = unsafe { ash_window::create_surface(&ctx.entry, &ctx.instance, dh, wh, None) }
            .vk_op("vkCreateSurfaceKHR")?;

        let built = unsafe { Self::with_surface(ctx, phys, surface, size, extensions, present_mode) };
        if built.is_err() {
            unsafe { ctx.surface_loader.destroy_surface(surface, None) };
        }
        built
    }

    unsafe fn with_surface(
        ctx: &Context,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        size: RenderSize,
        extensions: &[&CStr],
        present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let families = ctx.queue_families(phys, surface)?;
        let device = unsafe { create_device(ctx, phys, families, extensions) }?;
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        let swapchain_loader = swapchain::Device::new(&ctx.instance, &device);

        let want = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let swapchain = match Swapchain::create(
            &ctx.surface_loader,
            &swapchain_loader,
            &device,
            phys,
            surface,
            want,
            families,
            present_mode,
        ) {
            Ok(sc) => sc,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };
        let extent = swapchain.extent();
        Ok(Skeleton {
            phys,
            device,
            surface,
            families,
            graphics_queue,
            present_queue,
            swapchain_loader,
            swapchain,
            extent,
        })
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }

    /// Wait for a stable nonzero window size, idle the device and rebuild
    /// the swapchain at that size. Returns `None` without touching
    /// anything when the window never settled (minimized).
    pub fn resize<S: SizeSource + ?Sized>(
        &mut self,
        ctx: &Context,
        source: &mut S,
    ) -> Result<Option<vk::Extent2D>> {
        let Some(size) = stable_size(source, MAX_SIZE_POLLS) else {
            warn!("window size did not settle; skipping swapchain rebuild");
            return Ok(None);
        };
        let caps = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(self.phys, self.surface)
        }
        .vk_op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let extent = clamp_extent(
            &caps,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        );

        unsafe { self.device.device_wait_idle() }.vk_op("vkDeviceWaitIdle")?;
        self.swapchain
            .resize(&self.swapchain_loader, &self.device, extent)?;
        self.extent = extent;
        info!("resized to {}x{}", extent.width, extent.height);
        Ok(Some(extent))
    }

    /// Idle the device, run every pending destructor, then destroy the
    /// swapchain, device and surface.
    pub fn destroy(mut self, ctx: &Context, dal: &mut Deallocator) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.vk_op("vkDeviceWaitIdle")?;
        let drained = dal.drain();
        debug!("released {drained} objects");
        self.swapchain.destroy(&self.swapchain_loader, &self.device);
        unsafe {
            self.device.destroy_device(None);
            ctx.surface_loader.destroy_surface(self.surface, None);
        }
        Ok(())
    }
}

unsafe fn create_device(
    ctx: &Context,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
    extensions: &[&CStr],
) -> Result<ash::Device> {
    let mut names: Vec<&CStr> = vec![swapchain::NAME];
    names.extend(extensions.iter().copied().filter(|e| *e != swapchain::NAME));
    if !ctx.physical_device_able(phys, &names) {
        return Err(Error::Configuration(format!(
            "{} lacks a required device extension",
            ctx.device_name(phys)
        )));
    }
    let name_ptrs: Vec<_> = names.iter().map(|n| n.as_ptr()).collect();

    let priorities = [1.0f32];
    let queues: Vec<vk::DeviceQueueCreateInfo<'_>> = unique_families(families)
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let supported = unsafe { ctx.instance.get_physical_device_features(phys) };
    let features = enabled_features(&supported);
    let info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queues)
        .enabled_extension_names(&name_ptrs)
        .enabled_features(&features);
    let device = unsafe { ctx.instance.create_device(phys, &info, None) }.vk_op("vkCreateDevice")?;
    debug!(
        "device created: graphics family {}, present family {}",
        families.graphics, families.present
    );
    Ok(device)
}
