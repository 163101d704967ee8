// SPDX-License-Identifier: CEPL-1.0
//! Buffers, images and samplers, each handed out through a proxy.

use crate::command::submit_now;
use crate::dealloc::{ComposedProxy, Composer, ReturnProxy};
use crate::error::{Error, Result, VkContext};
use crate::format::{aspect_of, layout_transition, texel_size};
use crate::memory::find_memory_type;
use ash::vk;
use bytemuck::Pod;
use tracing::{error, warn};

/// Buffer with its own dedicated allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub requirements: vk::MemoryRequirements,
}

impl Buffer {
    pub fn size(&self) -> vk::DeviceSize {
        self.requirements.size
    }
}

/// 2D image with a view and a dedicated allocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub requirements: vk::MemoryRequirements,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl Image {
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_of(self.format)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
}

impl BufferInfo {
    /// Host-visible, host-coherent buffer (mappable without flushes).
    pub fn host_visible(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        BufferInfo {
            size,
            usage,
            memory: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub memory: vk::MemoryPropertyFlags,
}

impl ImageInfo {
    /// Device-local, optimally tiled.
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        ImageInfo {
            extent,
            format,
            usage,
            tiling: vk::ImageTiling::OPTIMAL,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    pub fn depth(extent: vk::Extent2D) -> Self {
        Self::new(
            extent,
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }
}

unsafe fn allocate(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    requirements: &vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let mai = vk::MemoryAllocateInfo {
        allocation_size: requirements.size,
        memory_type_index: find_memory_type(props, requirements.memory_type_bits, flags)?,
        ..Default::default()
    };
    unsafe { device.allocate_memory(&mai, None) }.vk_op("vkAllocateMemory")
}

unsafe fn create_buffer(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    info: &BufferInfo,
) -> Result<Buffer> {
    check_size(info.size, "buffer")?;
    let bci = vk::BufferCreateInfo {
        size: info.size,
        usage: info.usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let buffer = unsafe { device.create_buffer(&bci, None) }.vk_op("vkCreateBuffer")?;
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let bound = unsafe { allocate(device, props, &requirements, info.memory) }.and_then(|memory| {
        match unsafe { device.bind_buffer_memory(buffer, memory, 0) }.vk_op("vkBindBufferMemory") {
            Ok(()) => Ok(memory),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                Err(e)
            }
        }
    });
    match bound {
        Ok(memory) => Ok(Buffer {
            buffer,
            memory,
            requirements,
        }),
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            Err(e)
        }
    }
}

unsafe fn create_image(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    info: &ImageInfo,
) -> Result<Image> {
    check_extent(info.extent, "image")?;
    let ici = vk::ImageCreateInfo {
        image_type: vk::ImageType::TYPE_2D,
        format: info.format,
        extent: vk::Extent3D {
            width: info.extent.width,
            height: info.extent.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: info.tiling,
        usage: info.usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    };
    let image = unsafe { device.create_image(&ici, None) }.vk_op("vkCreateImage")?;
    let requirements = unsafe { device.get_image_memory_requirements(image) };

    let memory = match unsafe { allocate(device, props, &requirements, info.memory) } {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };
    let view = unsafe { device.bind_image_memory(image, memory, 0) }
        .vk_op("vkBindImageMemory")
        .and_then(|()| unsafe { create_view(device, image, info.format) });
    match view {
        Ok(view) => Ok(Image {
            image,
            view,
            memory,
            requirements,
            extent: info.extent,
            format: info.format,
        }),
        Err(e) => {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            Err(e)
        }
    }
}

pub(crate) unsafe fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo {
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: aspect_of(format),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    unsafe { device.create_image_view(&info, None) }.vk_op("vkCreateImageView")
}

pub fn buffer(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    info: &BufferInfo,
) -> ReturnProxy<Buffer> {
    ReturnProxy::from_result("buffer", unsafe { create_buffer(device, props, info) }, |d, b| unsafe {
        d.destroy_buffer(b.buffer, None);
        d.free_memory(b.memory, None);
    })
}

pub fn image(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    info: &ImageInfo,
) -> ReturnProxy<Image> {
    ReturnProxy::from_result("image", unsafe { create_image(device, props, info) }, |d, i| unsafe {
        d.destroy_image_view(i.view, None);
        d.destroy_image(i.image, None);
        d.free_memory(i.memory, None);
    })
}

/// Copy `data` into a host-visible buffer. Extra elements beyond the
/// allocation are dropped with a warning.
pub fn upload<T: Pod>(device: &ash::Device, buffer: &Buffer, data: &[T]) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let size = clamp_len(bytes.len(), buffer.size(), "upload");
    if size == 0 {
        return Ok(());
    }
    unsafe {
        let ptr = device
            .map_memory(buffer.memory, 0, size as vk::DeviceSize, vk::MemoryMapFlags::empty())
            .vk_op("vkMapMemory")?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), size);
        device.unmap_memory(buffer.memory);
    }
    Ok(())
}

/// Read a host-visible buffer back into `out`.
pub fn download<T: Pod>(device: &ash::Device, buffer: &Buffer, out: &mut [T]) -> Result<()> {
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
    let size = clamp_len(bytes.len(), buffer.size(), "download");
    if size == 0 {
        return Ok(());
    }
    unsafe {
        let ptr = device
            .map_memory(buffer.memory, 0, size as vk::DeviceSize, vk::MemoryMapFlags::empty())
            .vk_op("vkMapMemory")?;
        std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), bytes.as_mut_ptr(), size);
        device.unmap_memory(buffer.memory);
    }
    Ok(())
}

fn clamp_len(requested: usize, available: vk::DeviceSize, what: &str) -> usize {
    let available = usize::try_from(available).unwrap_or(usize::MAX);
    if requested > available {
        warn!("{what}: {requested} bytes requested, buffer holds {available}; truncating");
    }
    requested.min(available)
}

/// Host-visible buffer created and filled in one step.
pub fn filled_buffer<T: Pod>(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> ComposedProxy<Buffer> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;
    let mut c = Composer::new("filled buffer");
    let staged = c.stage(buffer(device, props, &BufferInfo::host_visible(size, usage)));
    let buf = staged.unwrap_or_default();
    if staged.is_some() {
        if let Err(e) = upload(device, &buf, data) {
            error!("filled buffer upload failed: {e}");
            c.poison();
        }
    }
    c.finish(device, buf)
}

/// Device-local sampled image filled from `pixels` through a staging
/// buffer. The staging buffer lives as long as the image.
pub fn texture(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    pool: vk::CommandPool,
    queue: vk::Queue,
    info: &ImageInfo,
    pixels: &[u8],
) -> ComposedProxy<Image> {
    let info = ImageInfo {
        usage: info.usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        ..*info
    };
    if let Err(e) = check_pixels(&info, pixels.len()) {
        error!("{e}");
        return ComposedProxy::failed("texture");
    }
    let mut c = Composer::new("texture");
    let Some(img) = c.stage(image(device, props, &info)) else {
        return c.finish(device, Image::default());
    };
    let staging = c.stage(buffer(
        device,
        props,
        &BufferInfo::host_visible(pixels.len() as vk::DeviceSize, vk::BufferUsageFlags::TRANSFER_SRC),
    ));
    if let Some(staging) = staging {
        let filled = upload(device, &staging, pixels).and_then(|()| {
            submit_now(device, pool, queue, |cmd| {
                transition(
                    device,
                    cmd,
                    img.image,
                    img.aspect(),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )?;
                copy_buffer_to_image(device, cmd, &img, &staging, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                transition(
                    device,
                    cmd,
                    img.image,
                    img.aspect(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            })
        });
        if let Err(e) = filled {
            error!("texture upload failed: {e}");
            c.poison();
        }
    }
    c.finish(device, img)
}

/// Record an image layout barrier.
pub fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
) -> Result<()> {
    let t = layout_transition(from, to)?;
    let barrier = vk::ImageMemoryBarrier {
        src_access_mask: t.src_access,
        dst_access_mask: t.dst_access,
        old_layout: from,
        new_layout: to,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            t.src_stage,
            t.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    }
    Ok(())
}

fn full_copy_region(image: &Image) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: image.aspect(),
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: image.extent.width,
            height: image.extent.height,
            depth: 1,
        },
    }
}

pub fn copy_buffer_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: &Image,
    buffer: &Buffer,
    layout: vk::ImageLayout,
) {
    let region = full_copy_region(image);
    unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            buffer.buffer,
            image.image,
            layout,
            std::slice::from_ref(&region),
        )
    };
}

pub fn copy_image_to_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: &Image,
    buffer: &Buffer,
    layout: vk::ImageLayout,
) {
    let region = full_copy_region(image);
    unsafe {
        device.cmd_copy_image_to_buffer(
            cmd,
            image.image,
            layout,
            buffer.buffer,
            std::slice::from_ref(&region),
        )
    };
}

/// Sampler description; linear filtering and repeat addressing unless
/// told otherwise.
#[derive(Clone, Copy, Debug)]
pub struct SamplerAssembler {
    mag: vk::Filter,
    min: vk::Filter,
    mipmap: vk::SamplerMipmapMode,
    address: vk::SamplerAddressMode,
    border: vk::BorderColor,
    anisotropy: Option<f32>,
}

impl Default for SamplerAssembler {
    fn default() -> Self {
        SamplerAssembler {
            mag: vk::Filter::LINEAR,
            min: vk::Filter::LINEAR,
            mipmap: vk::SamplerMipmapMode::LINEAR,
            address: vk::SamplerAddressMode::REPEAT,
            border: vk::BorderColor::INT_OPAQUE_BLACK,
            anisotropy: None,
        }
    }
}

impl SamplerAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, mag: vk::Filter, min: vk::Filter) -> Self {
        self.mag = mag;
        self.min = min;
        self
    }

    pub fn mipmap(mut self, mode: vk::SamplerMipmapMode) -> Self {
        self.mipmap = mode;
        self
    }

    pub fn address(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address = mode;
        self
    }

    pub fn border(mut self, color: vk::BorderColor) -> Self {
        self.border = color;
        self
    }

    pub fn anisotropy(mut self, max: f32) -> Self {
        self.anisotropy = Some(max);
        self
    }

    pub fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo {
            mag_filter: self.mag,
            min_filter: self.min,
            mipmap_mode: self.mipmap,
            address_mode_u: self.address,
            address_mode_v: self.address,
            address_mode_w: self.address,
            anisotropy_enable: self.anisotropy.is_some() as vk::Bool32,
            max_anisotropy: self.anisotropy.unwrap_or(1.0),
            border_color: self.border,
            compare_op: vk::CompareOp::ALWAYS,
            max_lod: vk::LOD_CLAMP_NONE,
            ..Default::default()
        }
    }

    pub fn build(self, device: &ash::Device) -> ReturnProxy<vk::Sampler> {
        let info = self.create_info();
        ReturnProxy::from_result(
            "vkCreateSampler",
            unsafe { device.create_sampler(&info, None) },
            |d, s| unsafe { d.destroy_sampler(s, None) },
        )
    }
}

pub(crate) fn check_size(size: vk::DeviceSize, what: &str) -> Result<()> {
    if size == 0 {
        return Err(Error::Configuration(format!("{what}: zero size")));
    }
    Ok(())
}

/// `len` must cover the whole image, one texel per pixel.
fn check_pixels(info: &ImageInfo, len: usize) -> Result<()> {
    check_extent(info.extent, "texture")?;
    let texel = texel_size(info.format).ok_or_else(|| {
        Error::Configuration(format!("texture: no texel size known for {:?}", info.format))
    })?;
    let expected = info.extent.width as u64 * info.extent.height as u64 * texel as u64;
    if len as u64 != expected {
        return Err(Error::Configuration(format!(
            "texture: {len} bytes of pixels for a {}x{} {:?} image ({expected} expected)",
            info.extent.width, info.extent.height, info.format
        )));
    }
    Ok(())
}

/// Fail early on zero-sized requests that Vulkan rejects as invalid usage.
pub(crate) fn check_extent(extent: vk::Extent2D, what: &str) -> Result<()> {
    if extent.width == 0 || extent.height == 0 {
        return Err(Error::Configuration(format!("{what}: zero extent {extent:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_defaults() {
        let info = SamplerAssembler::new().create_info();
        assert_eq!(info.mag_filter, vk::Filter::LINEAR);
        assert_eq!(info.min_filter, vk::Filter::LINEAR);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.border_color, vk::BorderColor::INT_OPAQUE_BLACK);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
    }

    #[test]
    fn sampler_overrides() {
        let info = SamplerAssembler::new()
            .filter(vk::Filter::NEAREST, vk::Filter::NEAREST)
            .address(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .anisotropy(8.0)
            .create_info();
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 8.0);
    }

    #[test]
    fn transfer_sizes_are_clamped() {
        assert_eq!(clamp_len(64, 256, "t"), 64);
        assert_eq!(clamp_len(300, 256, "t"), 256);
    }

    #[test]
    fn image_presets() {
        let extent = vk::Extent2D {
            width: 4,
            height: 2,
        };
        let depth = ImageInfo::depth(extent);
        assert_eq!(depth.format, vk::Format::D32_SFLOAT);
        assert_eq!(depth.memory, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(depth.tiling, vk::ImageTiling::OPTIMAL);
        assert!(check_extent(extent, "depth").is_ok());
        assert!(check_extent(vk::Extent2D::default(), "depth").is_err());
    }

    #[test]
    fn empty_buffers_are_rejected() {
        assert!(matches!(check_size(0, "filled buffer"), Err(Error::Configuration(_))));
        assert!(check_size(16, "filled buffer").is_ok());
    }

    #[test]
    fn texture_pixels_must_cover_the_image() {
        let info = ImageInfo::new(
            vk::Extent2D {
                width: 4,
                height: 2,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
        );
        assert!(check_pixels(&info, 4 * 2 * 4).is_ok());
        assert!(matches!(check_pixels(&info, 4 * 2 * 4 - 1), Err(Error::Configuration(_))));
        assert!(check_pixels(&info, 0).is_err());

        let packed = ImageInfo {
            format: vk::Format::BC1_RGB_UNORM_BLOCK,
            ..info
        };
        assert!(check_pixels(&packed, 16).is_err());
    }
}
