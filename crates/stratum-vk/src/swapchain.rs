// SPDX-License-Identifier: CEPL-1.0
//! Swapchain negotiation and in-place rebuild.

use crate::context::QueueFamilies;
use crate::error::{Error, Result, VkContext};
use crate::format::{color_space_name, format_name, present_mode_name};
use crate::resource::create_view;
use ash::khr::{surface, swapchain};
use ash::vk;
use tracing::{debug, error, info, warn};

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

const PRESENT_MODE_ORDER: [vk::PresentModeKHR; 3] = [
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::IMMEDIATE,
    vk::PresentModeKHR::FIFO,
];

/// A lone UNDEFINED entry means the surface takes any format.
pub fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Ok(PREFERRED_FORMAT);
        }
    }
    if let Some(f) = formats.iter().copied().find(|f| {
        f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
    }) {
        return Ok(f);
    }
    match formats.first() {
        Some(&f) => {
            warn!(
                "surface lacks {} / {}; using {}",
                format_name(PREFERRED_FORMAT.format),
                color_space_name(PREFERRED_FORMAT.color_space),
                format_name(f.format)
            );
            Ok(f)
        }
        None => Err(Error::Configuration("surface reports no formats".into())),
    }
}

/// `priority` if the surface offers it, then MAILBOX, IMMEDIATE, FIFO.
pub fn pick_present_mode(
    modes: &[vk::PresentModeKHR],
    priority: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    priority
        .into_iter()
        .chain(PRESENT_MODE_ORDER)
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn clamp_extent(caps: &vk::SurfaceCapabilitiesKHR, want: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: want.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: want.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// The surface's own extent unless it defers to the window (`u32::MAX`).
pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        clamp_extent(caps, want)
    }
}

/// One more than the minimum, capped by the maximum (0 means no cap).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

fn pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

fn composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    if caps
        .supported_composite_alpha
        .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
    {
        vk::CompositeAlphaFlagsKHR::OPAQUE
    } else {
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
    }
}

/// Creation parameters kept so a resize only has to change the extent.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainParams {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    families: [u32; 2],
}

impl SwapchainParams {
    pub fn negotiate(
        surface: vk::SurfaceKHR,
        caps: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        modes: &[vk::PresentModeKHR],
        want: vk::Extent2D,
        families: QueueFamilies,
        priority: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        Ok(SwapchainParams {
            surface,
            min_image_count: image_count(caps),
            format: pick_surface_format(formats)?,
            extent: extent_from_caps(caps, want),
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            pre_transform: pre_transform(caps),
            composite_alpha: composite_alpha(caps),
            present_mode: pick_present_mode(modes, priority),
            families: [families.graphics, families.present],
        })
    }

    pub fn sharing_mode(&self) -> vk::SharingMode {
        if self.families[0] != self.families[1] {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }

    pub fn create_info(&self, old: vk::SwapchainKHR) -> vk::SwapchainCreateInfoKHR<'_> {
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(self.min_image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(self.usage)
            .image_sharing_mode(self.sharing_mode())
            .pre_transform(self.pre_transform)
            .composite_alpha(self.composite_alpha)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old);
        if self.sharing_mode() == vk::SharingMode::CONCURRENT {
            info.queue_family_indices(&self.families)
        } else {
            info
        }
    }
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub params: SwapchainParams,
}

unsafe fn create_views(
    device: &ash::Device,
    images: &[vk::Image],
    format: vk::Format,
) -> Result<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        match unsafe { create_view(device, image, format) } {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    unsafe { device.destroy_image_view(view, None) };
                }
                return Err(e);
            }
        }
    }
    Ok(views)
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        surface_loader: &surface::Instance,
        loader: &swapchain::Device,
        device: &ash::Device,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        want: vk::Extent2D,
        families: QueueFamilies,
        priority: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let (caps, formats, modes) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(phys, surface)
                    .vk_op("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                surface_loader
                    .get_physical_device_surface_formats(phys, surface)
                    .vk_op("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                surface_loader
                    .get_physical_device_surface_present_modes(phys, surface)
                    .vk_op("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            )
        };
        let params =
            SwapchainParams::negotiate(surface, &caps, &formats, &modes, want, families, priority)?;
        let mut sc = Swapchain {
            handle: vk::SwapchainKHR::null(),
            format: params.format.format,
            color_space: params.format.color_space,
            images: Vec::new(),
            views: Vec::new(),
            params,
        };
        sc.build(loader, device, vk::SwapchainKHR::null())?;
        info!(
            "swapchain: {} / {}, {}, {}x{}, {} images",
            format_name(sc.format),
            color_space_name(sc.color_space),
            present_mode_name(params.present_mode),
            params.extent.width,
            params.extent.height,
            sc.images.len()
        );
        Ok(sc)
    }

    fn build(&mut self, loader: &swapchain::Device, device: &ash::Device, old: vk::SwapchainKHR) -> Result<()> {
        let info = self.params.create_info(old);
        let handle = unsafe { loader.create_swapchain(&info, None) }.vk_op("vkCreateSwapchainKHR")?;
        let built = unsafe { loader.get_swapchain_images(handle) }
            .vk_op("vkGetSwapchainImagesKHR")
            .and_then(|images| {
                let views = unsafe { create_views(device, &images, self.format) }?;
                Ok((images, views))
            });
        match built {
            Ok((images, views)) => {
                self.handle = handle;
                self.images = images;
                self.views = views;
                Ok(())
            }
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                Err(e)
            }
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.params.extent
    }

    /// False once a rebuild failed; the handle is null and there are no
    /// views to render into.
    pub fn is_usable(&self) -> bool {
        self.handle != vk::SwapchainKHR::null() && !self.views.is_empty()
    }

    /// Rebuild with a new extent. The caller must have idled the device.
    ///
    /// The old swapchain is retired by the create call whether or not it
    /// succeeds, so on failure the swapchain is left unusable and
    /// [`Swapchain::is_usable`] reports it.
    pub fn resize(
        &mut self,
        loader: &swapchain::Device,
        device: &ash::Device,
        extent: vk::Extent2D,
    ) -> Result<()> {
        for view in self.views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
        self.images.clear();
        let old = std::mem::replace(&mut self.handle, vk::SwapchainKHR::null());
        self.params.extent = extent;
        let rebuilt = self.build(loader, device, old);
        unsafe { loader.destroy_swapchain(old, None) };
        match &rebuilt {
            Ok(()) => debug!("swapchain resized to {}x{}", extent.width, extent.height),
            Err(e) => error!(
                "swapchain rebuild at {}x{} failed, swapchain unusable: {e}",
                extent.width, extent.height
            ),
        }
        rebuilt
    }

    pub fn destroy(&mut self, loader: &swapchain::Device, device: &ash::Device) {
        for view in self.views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.handle, None) };
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            ..Default::default()
        }
    }

    fn sf(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn undefined_surface_format_means_preferred() {
        let got = pick_surface_format(&[sf(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)]).unwrap();
        assert_eq!(got.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn preferred_surface_format_wins_over_order() {
        let formats = [
            sf(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(pick_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_UNORM);
        let other = [sf(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(pick_surface_format(&other).unwrap().format, vk::Format::R8G8B8A8_SRGB);
        assert!(pick_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_order() {
        use vk::PresentModeKHR as M;
        assert_eq!(pick_present_mode(&[M::FIFO, M::IMMEDIATE, M::MAILBOX], None), M::MAILBOX);
        assert_eq!(pick_present_mode(&[M::FIFO, M::IMMEDIATE], None), M::IMMEDIATE);
        assert_eq!(pick_present_mode(&[M::FIFO], None), M::FIFO);
        assert_eq!(
            pick_present_mode(&[M::FIFO, M::MAILBOX, M::FIFO_RELAXED], Some(M::FIFO_RELAXED)),
            M::FIFO_RELAXED
        );
        // an unsupported priority falls through to the default order
        assert_eq!(pick_present_mode(&[M::FIFO], Some(M::MAILBOX)), M::FIFO);
    }

    #[test]
    fn extent_follows_surface_unless_deferred() {
        let mut c = caps();
        let want = vk::Extent2D {
            width: 4000,
            height: 8,
        };
        assert_eq!(
            extent_from_caps(&c, want),
            vk::Extent2D {
                width: 1920,
                height: 16
            }
        );
        c.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert_eq!(extent_from_caps(&c, want), c.current_extent);
    }

    #[test]
    fn image_count_is_capped() {
        let mut c = caps();
        assert_eq!(image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(image_count(&c), 2);
        c.max_image_count = 0;
        assert_eq!(image_count(&c), 3);
    }

    #[test]
    fn negotiated_params() {
        let c = caps();
        let formats = [sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        let split = QueueFamilies {
            graphics: 0,
            present: 1,
        };
        let p = SwapchainParams::negotiate(
            vk::SurfaceKHR::null(),
            &c,
            &formats,
            &[vk::PresentModeKHR::FIFO],
            vk::Extent2D {
                width: 640,
                height: 480,
            },
            split,
            None,
        )
        .unwrap();
        assert_eq!(p.pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
        assert_eq!(p.composite_alpha, vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED);
        assert!(p.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert_eq!(p.sharing_mode(), vk::SharingMode::CONCURRENT);
        let info = p.create_info(vk::SwapchainKHR::null());
        assert_eq!(info.queue_family_index_count, 2);
        assert_eq!(info.image_extent.width, 640);

        let shared = SwapchainParams {
            families: [0, 0],
            ..p
        };
        assert_eq!(shared.sharing_mode(), vk::SharingMode::EXCLUSIVE);
        assert_eq!(shared.create_info(vk::SwapchainKHR::null()).queue_family_index_count, 0);
    }

    #[test]
    fn failed_rebuild_leaves_swapchain_unusable() {
        use ash::vk::Handle;
        let params = SwapchainParams::negotiate(
            vk::SurfaceKHR::null(),
            &caps(),
            &[sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            &[vk::PresentModeKHR::FIFO],
            vk::Extent2D {
                width: 640,
                height: 480,
            },
            QueueFamilies {
                graphics: 0,
                present: 0,
            },
            None,
        )
        .unwrap();
        let mut sc = Swapchain {
            handle: vk::SwapchainKHR::from_raw(7),
            format: params.format.format,
            color_space: params.format.color_space,
            images: vec![vk::Image::from_raw(1)],
            views: vec![vk::ImageView::from_raw(2)],
            params,
        };
        assert!(sc.is_usable());

        // what resize leaves behind when the create call fails
        sc.views.clear();
        sc.images.clear();
        sc.handle = vk::SwapchainKHR::null();
        assert!(!sc.is_usable());
    }
}
