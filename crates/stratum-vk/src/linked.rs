// SPDX-License-Identifier: CEPL-1.0
//! Allocate several buffers and images as one unit.
//!
//! ```ignore
//! let linked = LinkedAllocator::bind(&VkAllocator::new(&device, &props))
//!     .buffer(&BufferInfo::host_visible(size, vk::BufferUsageFlags::VERTEX_BUFFER))
//!     .image(&ImageInfo::depth(extent))
//!     .commit(&mut dal)?;
//! ```
//!
//! Every step stages its destructor in a transient queue. `commit` moves
//! the whole queue into the deallocator, or, if any step failed, destroys
//! the objects that were created and registers nothing.

use crate::dealloc::{Composer, Deallocator, ReturnProxy};
use crate::error::Result;
use crate::resource::{self, Buffer, BufferInfo, Image, ImageInfo};
use ash::vk;
use tracing::debug;

/// Source of buffers and images for the linked allocator.
pub trait DeviceAllocator {
    type Device;

    fn device(&self) -> &Self::Device;
    fn allocate_buffer(&self, info: &BufferInfo) -> ReturnProxy<Buffer, Self::Device>;
    fn allocate_image(&self, info: &ImageInfo) -> ReturnProxy<Image, Self::Device>;
}

/// Dedicated-allocation buffers and images on a real device.
#[derive(Clone, Copy)]
pub struct VkAllocator<'a> {
    device: &'a ash::Device,
    props: &'a vk::PhysicalDeviceMemoryProperties,
}

impl<'a> VkAllocator<'a> {
    pub fn new(device: &'a ash::Device, props: &'a vk::PhysicalDeviceMemoryProperties) -> Self {
        VkAllocator { device, props }
    }
}

impl DeviceAllocator for VkAllocator<'_> {
    type Device = ash::Device;

    fn device(&self) -> &ash::Device {
        self.device
    }

    fn allocate_buffer(&self, info: &BufferInfo) -> ReturnProxy<Buffer> {
        resource::buffer(self.device, self.props, info)
    }

    fn allocate_image(&self, info: &ImageInfo) -> ReturnProxy<Image> {
        resource::image(self.device, self.props, info)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum LinkedResource {
    Buffer(Buffer),
    Image(Image),
}

impl LinkedResource {
    pub fn as_buffer(&self) -> Option<Buffer> {
        match self {
            LinkedResource::Buffer(b) => Some(*b),
            LinkedResource::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<Image> {
        match self {
            LinkedResource::Image(i) => Some(*i),
            LinkedResource::Buffer(_) => None,
        }
    }
}

/// Committed result: the lone resource of a one-step chain, or every
/// resource in step order.
#[derive(Clone, Debug)]
pub enum Linked {
    Single(LinkedResource),
    Group(Vec<LinkedResource>),
}

impl Linked {
    pub fn len(&self) -> usize {
        match self {
            Linked::Single(_) => 1,
            Linked::Group(all) => all.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<LinkedResource> {
        match self {
            Linked::Single(r) => (index == 0).then_some(*r),
            Linked::Group(all) => all.get(index).copied(),
        }
    }

    pub fn buffer(&self, index: usize) -> Option<Buffer> {
        self.get(index)?.as_buffer()
    }

    pub fn image(&self, index: usize) -> Option<Image> {
        self.get(index)?.as_image()
    }

    pub fn into_vec(self) -> Vec<LinkedResource> {
        match self {
            Linked::Single(r) => vec![r],
            Linked::Group(all) => all,
        }
    }
}

#[must_use = "nothing is registered until commit"]
pub struct LinkedAllocator<'a, A: DeviceAllocator> {
    allocator: &'a A,
    composer: Composer<A::Device>,
    resources: Vec<LinkedResource>,
}

impl<'a, A: DeviceAllocator> LinkedAllocator<'a, A> {
    pub fn bind(allocator: &'a A) -> Self {
        LinkedAllocator {
            allocator,
            composer: Composer::new("linked allocation"),
            resources: Vec::new(),
        }
    }

    fn step<T>(
        mut self,
        what: &str,
        create: impl FnOnce(&A) -> ReturnProxy<T, A::Device>,
        wrap: fn(T) -> LinkedResource,
    ) -> Self {
        if self.composer.is_failed() {
            debug!("linked allocation: skipping {what} after an earlier failure");
            return self;
        }
        if let Some(value) = self.composer.stage(create(self.allocator)) {
            self.resources.push(wrap(value));
        }
        self
    }

    pub fn buffer(self, info: &BufferInfo) -> Self {
        self.step("buffer", |a| a.allocate_buffer(info), LinkedResource::Buffer)
    }

    pub fn image(self, info: &ImageInfo) -> Self {
        self.step("image", |a| a.allocate_image(info), LinkedResource::Image)
    }

    pub fn is_failed(&self) -> bool {
        self.composer.is_failed()
    }

    pub fn commit(self, dal: &mut Deallocator<A::Device>) -> Result<Linked> {
        let value = match <[LinkedResource; 1]>::try_from(self.resources) {
            Ok([one]) => Linked::Single(one),
            Err(all) => Linked::Group(all),
        };
        self.composer
            .finish(self.allocator.device(), value)
            .try_commit(dal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dealloc::tests::Tracker;
    use crate::error::Error;
    use ash::vk::Handle;
    use std::cell::Cell;

    /// Hands out sequential ids and fails the step numbered `fail_at`.
    struct MockAllocator {
        tracker: Tracker,
        fail_at: Option<u64>,
        calls: Cell<u64>,
    }

    impl MockAllocator {
        fn new(fail_at: Option<u64>) -> Self {
            MockAllocator {
                tracker: Tracker::default(),
                fail_at,
                calls: Cell::new(0),
            }
        }

        fn next(&self) -> Option<u64> {
            let id = self.calls.get() + 1;
            self.calls.set(id);
            (self.fail_at != Some(id)).then_some(id)
        }
    }

    impl DeviceAllocator for MockAllocator {
        type Device = Tracker;

        fn device(&self) -> &Tracker {
            &self.tracker
        }

        fn allocate_buffer(&self, _: &BufferInfo) -> ReturnProxy<Buffer, Tracker> {
            match self.next() {
                Some(id) => ReturnProxy::created(
                    "buffer",
                    Buffer {
                        buffer: vk::Buffer::from_raw(id),
                        ..Default::default()
                    },
                    move |t: &Tracker| t.destroyed.borrow_mut().push(id),
                ),
                None => ReturnProxy::failed("buffer"),
            }
        }

        fn allocate_image(&self, _: &ImageInfo) -> ReturnProxy<Image, Tracker> {
            match self.next() {
                Some(id) => ReturnProxy::created(
                    "image",
                    Image {
                        image: vk::Image::from_raw(id),
                        ..Default::default()
                    },
                    move |t: &Tracker| t.destroyed.borrow_mut().push(id),
                ),
                None => ReturnProxy::failed("image"),
            }
        }
    }

    fn info() -> BufferInfo {
        BufferInfo::host_visible(64, vk::BufferUsageFlags::VERTEX_BUFFER)
    }

    #[test]
    fn single_step_commits_single() {
        let alloc = MockAllocator::new(None);
        let mut dal = Deallocator::new(Tracker::default());
        let linked = LinkedAllocator::bind(&alloc).buffer(&info()).commit(&mut dal).unwrap();
        assert!(matches!(linked, Linked::Single(LinkedResource::Buffer(_))));
        assert_eq!(linked.buffer(0).unwrap().buffer.as_raw(), 1);
        assert_eq!(dal.pending(), 1);
    }

    #[test]
    fn group_keeps_step_order() {
        let alloc = MockAllocator::new(None);
        let mut dal = Deallocator::new(Tracker::default());
        let extent = vk::Extent2D {
            width: 8,
            height: 8,
        };
        let linked = LinkedAllocator::bind(&alloc)
            .buffer(&info())
            .image(&ImageInfo::depth(extent))
            .buffer(&info())
            .commit(&mut dal)
            .unwrap();
        assert_eq!(linked.len(), 3);
        assert_eq!(linked.buffer(0).unwrap().buffer.as_raw(), 1);
        assert_eq!(linked.image(1).unwrap().image.as_raw(), 2);
        assert!(linked.image(2).is_none());
        assert_eq!(dal.pending(), 3);
        dal.drain();
        assert_eq!(dal.device().log(), vec![1, 2, 3]);
    }

    #[test]
    fn failed_second_step_destroys_first_and_registers_nothing() {
        let alloc = MockAllocator::new(Some(2));
        let mut dal = Deallocator::new(Tracker::default());
        let chain = LinkedAllocator::bind(&alloc).buffer(&info()).buffer(&info());
        assert!(chain.is_failed());
        let result = chain.commit(&mut dal);

        assert!(matches!(result, Err(Error::Failed("linked allocation"))));
        assert_eq!(dal.pending(), 0);
        // buffer A was created and destroyed during the rollback
        assert_eq!(alloc.tracker.log(), vec![1]);
    }

    #[test]
    fn steps_after_failure_are_skipped() {
        let alloc = MockAllocator::new(Some(1));
        let mut dal = Deallocator::new(Tracker::default());
        let result = LinkedAllocator::bind(&alloc)
            .buffer(&info())
            .buffer(&info())
            .buffer(&info())
            .commit(&mut dal);
        assert!(result.is_err());
        assert_eq!(alloc.calls.get(), 1);
        assert!(alloc.tracker.log().is_empty());
    }
}
