// SPDX-License-Identifier: CEPL-1.0
use crate::dealloc::ReturnProxy;
use crate::error::{Error, Result, VkContext};
use crate::pipeline::{BindingMap, Pipeline};
use crate::resource::{Buffer, Image};
use ash::vk;
use std::collections::BTreeMap;
use tracing::error;

pub fn descriptor_pool(
    device: &ash::Device,
    max_sets: u32,
    sizes: &[vk::DescriptorPoolSize],
    flags: vk::DescriptorPoolCreateFlags,
) -> ReturnProxy<vk::DescriptorPool> {
    let info = vk::DescriptorPoolCreateInfo::default()
        .flags(flags)
        .max_sets(max_sets)
        .pool_sizes(sizes);
    ReturnProxy::from_result(
        "vkCreateDescriptorPool",
        unsafe { device.create_descriptor_pool(&info, None) },
        |d, p| unsafe { d.destroy_descriptor_pool(p, None) },
    )
}

/// Pool sizes that fit `sets` copies of the layout described by `bindings`.
pub fn pool_sizes(bindings: &BindingMap, sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut totals: BTreeMap<i32, u32> = BTreeMap::new();
    for info in bindings.values() {
        // Clamped; the driver rejects an oversized pool rather than wrapping.
        let total = totals.entry(info.descriptor_type.as_raw()).or_default();
        *total = total.saturating_add(info.count.saturating_mul(sets));
    }
    totals
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

pub fn allocate_descriptor_sets(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: usize,
) -> Result<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; count];
    let info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    unsafe { device.allocate_descriptor_sets(&info) }.vk_op("vkAllocateDescriptorSets")
}

fn is_image_type(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::SAMPLER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT
    )
}

fn is_buffer_type(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Info {
    Image(usize),
    Buffer(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Pending {
    binding: u32,
    element: u32,
    ty: vk::DescriptorType,
    info: Info,
}

/// Batched writes into one descriptor set, checked against the binding
/// map of the pipeline the set was allocated for.
pub struct DescriptorUpdateQueue<'p> {
    set: vk::DescriptorSet,
    bindings: &'p BindingMap,
    images: Vec<vk::DescriptorImageInfo>,
    buffers: Vec<vk::DescriptorBufferInfo>,
    pending: Vec<Pending>,
}

impl<'p> DescriptorUpdateQueue<'p> {
    pub fn new(set: vk::DescriptorSet, pipeline: &'p Pipeline) -> Self {
        Self::with_bindings(set, &pipeline.bindings)
    }

    pub fn with_bindings(set: vk::DescriptorSet, bindings: &'p BindingMap) -> Self {
        DescriptorUpdateQueue {
            set,
            bindings,
            images: Vec::new(),
            buffers: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn check(
        &self,
        binding: u32,
        element: u32,
        kind_ok: fn(vk::DescriptorType) -> bool,
        kind: &str,
    ) -> Result<vk::DescriptorType> {
        let reject = |msg: String| {
            error!("descriptor write rejected: {msg}");
            Err(Error::Descriptor(msg))
        };
        let Some(info) = self.bindings.get(&binding) else {
            return reject(format!("binding {binding} is not declared"));
        };
        if element >= info.count {
            return reject(format!(
                "binding {binding} has {} elements, write targets element {element}",
                info.count
            ));
        }
        if !kind_ok(info.descriptor_type) {
            return reject(format!(
                "binding {binding} is {:?}, cannot take a {kind} write",
                info.descriptor_type
            ));
        }
        Ok(info.descriptor_type)
    }

    pub fn queue_image(
        mut self,
        binding: u32,
        element: u32,
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) -> Result<Self> {
        let ty = self.check(binding, element, is_image_type, "image")?;
        self.images.push(vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        });
        self.pending.push(Pending {
            binding,
            element,
            ty,
            info: Info::Image(self.images.len() - 1),
        });
        Ok(self)
    }

    pub fn queue_buffer(
        mut self,
        binding: u32,
        element: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Result<Self> {
        let ty = self.check(binding, element, is_buffer_type, "buffer")?;
        self.buffers.push(vk::DescriptorBufferInfo {
            buffer,
            offset,
            range,
        });
        self.pending.push(Pending {
            binding,
            element,
            ty,
            info: Info::Buffer(self.buffers.len() - 1),
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn writes(&self) -> Vec<vk::WriteDescriptorSet<'_>> {
        self.pending
            .iter()
            .map(|p| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(p.binding)
                    .dst_array_element(p.element)
                    .descriptor_type(p.ty);
                match p.info {
                    Info::Image(i) => write.image_info(std::slice::from_ref(&self.images[i])),
                    Info::Buffer(i) => write.buffer_info(std::slice::from_ref(&self.buffers[i])),
                }
            })
            .collect()
    }

    /// Submit every queued write in one `vkUpdateDescriptorSets`.
    pub fn apply(self, device: &ash::Device) {
        let writes = self.writes();
        if !writes.is_empty() {
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }
    }
}

/// Write `image` with `sampler` as a combined image sampler.
pub fn bind_image(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    image: &Image,
    sampler: vk::Sampler,
) {
    let info = vk::DescriptorImageInfo {
        sampler,
        image_view: image.view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    };
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(std::slice::from_ref(&info));
    unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
}

/// Write the whole of `buffer` as a descriptor of type `ty`.
pub fn bind_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: &Buffer,
    ty: vk::DescriptorType,
) {
    let info = vk::DescriptorBufferInfo {
        buffer: buffer.buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(ty)
        .buffer_info(std::slice::from_ref(&info));
    unsafe { device.update_descriptor_sets(std::slice::from_ref(&write), &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BindingInfo;

    fn layout() -> BindingMap {
        let mut map = BindingMap::new();
        map.insert(
            0,
            BindingInfo {
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: 2,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
        );
        map.insert(
            1,
            BindingInfo {
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            },
        );
        map
    }

    #[test]
    fn accepts_matching_writes_and_builds_them_in_order() {
        let map = layout();
        let queue = DescriptorUpdateQueue::with_bindings(vk::DescriptorSet::null(), &map)
            .queue_buffer(1, 0, vk::Buffer::null(), 0, 64)
            .unwrap()
            .queue_image(
                0,
                1,
                vk::Sampler::null(),
                vk::ImageView::null(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .unwrap();
        assert_eq!(queue.len(), 2);
        let writes = queue.writes();
        assert_eq!(writes[0].dst_binding, 1);
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(writes[0].descriptor_count, 1);
        assert!(!writes[0].p_buffer_info.is_null());
        assert_eq!(writes[1].dst_array_element, 1);
        assert!(!writes[1].p_image_info.is_null());
    }

    #[test]
    fn rejects_undeclared_binding() {
        let map = layout();
        let err = DescriptorUpdateQueue::with_bindings(vk::DescriptorSet::null(), &map)
            .queue_buffer(5, 0, vk::Buffer::null(), 0, 16)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Descriptor(_)));
    }

    #[test]
    fn rejects_element_past_count() {
        let map = layout();
        let res = DescriptorUpdateQueue::with_bindings(vk::DescriptorSet::null(), &map).queue_image(
            0,
            2,
            vk::Sampler::null(),
            vk::ImageView::null(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert!(res.is_err());
    }

    #[test]
    fn rejects_kind_mismatch() {
        let map = layout();
        let q = DescriptorUpdateQueue::with_bindings(vk::DescriptorSet::null(), &map);
        assert!(q.queue_buffer(0, 0, vk::Buffer::null(), 0, 16).is_err());
        let q = DescriptorUpdateQueue::with_bindings(vk::DescriptorSet::null(), &map);
        assert!(q
            .queue_image(
                1,
                0,
                vk::Sampler::null(),
                vk::ImageView::null(),
                vk::ImageLayout::GENERAL
            )
            .is_err());
    }

    #[test]
    fn pool_sizes_scale_with_set_count() {
        let mut map = layout();
        map.insert(
            2,
            BindingInfo {
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
        );
        let sizes = pool_sizes(&map, 3);
        let find = |ty| sizes.iter().find(|s| s.ty == ty).map(|s| s.descriptor_count);
        assert_eq!(find(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), Some(6));
        assert_eq!(find(vk::DescriptorType::UNIFORM_BUFFER), Some(6));
        assert_eq!(sizes.len(), 2);
    }

    #[test]
    fn huge_requests_saturate() {
        let mut map = layout();
        map.get_mut(&0).unwrap().count = u32::MAX;
        let sizes = pool_sizes(&map, 4);
        let sampler = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(sampler.descriptor_count, u32::MAX);
    }
}
