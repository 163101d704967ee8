// SPDX-License-Identifier: CEPL-1.0
//! Deferred teardown.
//!
//! Every creation helper in this crate returns a [`ReturnProxy`] (one
//! object) or a [`ComposedProxy`] (a group built together). A proxy is
//! either a live value plus the closure that destroys it, or a failure
//! carrying nothing. Consuming it moves the closure into a
//! [`DeallocationQueue`]: the long-lived one inside a [`Deallocator`]
//! (`commit`) or a transient one used while composing (`stage`).
//!
//! Queues run their records front to back, in registration order. An
//! object and its satellites (a view of an image, memory bound to a
//! buffer) are freed inside a single record, so each record stands alone.
//!
//! The types are generic over the device so that the bookkeeping can be
//! exercised without a GPU.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use tracing::{error, warn};

type Record<D> = Box<dyn FnOnce(&D)>;

/// Ordered list of pending destructors.
pub struct DeallocationQueue<D = ash::Device> {
    records: VecDeque<Record<D>>,
}

impl<D> Default for DeallocationQueue<D> {
    fn default() -> Self {
        DeallocationQueue {
            records: VecDeque::new(),
        }
    }
}

impl<D> fmt::Debug for DeallocationQueue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeallocationQueue")
            .field("pending", &self.records.len())
            .finish()
    }
}

impl<D> DeallocationQueue<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: impl FnOnce(&D) + 'static) {
        self.records.push_back(Box::new(record));
    }

    /// Move every record of `other` to the back of `self`, keeping order.
    pub fn append(&mut self, other: &mut DeallocationQueue<D>) {
        self.records.append(&mut other.records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run every record, first registered first, and leave the queue empty.
    pub fn drain(&mut self, device: &D) -> usize {
        let count = self.records.len();
        while let Some(record) = self.records.pop_front() {
            record(device);
        }
        count
    }
}

impl<D> Drop for DeallocationQueue<D> {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            warn!(
                "dropping deallocation queue with {} pending records; resources leak",
                self.records.len()
            );
        }
    }
}

/// Device-owned queue. Drained explicitly or on drop, which must happen
/// before the device itself is destroyed.
pub struct Deallocator<D = ash::Device> {
    device: D,
    queue: DeallocationQueue<D>,
}

impl<D> Deallocator<D> {
    pub fn new(device: D) -> Self {
        Deallocator {
            device,
            queue: DeallocationQueue::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn push(&mut self, record: impl FnOnce(&D) + 'static) {
        self.queue.push(record);
    }

    pub fn append(&mut self, queue: &mut DeallocationQueue<D>) {
        self.queue.append(queue);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn drain(&mut self) -> usize {
        self.queue.drain(&self.device)
    }
}

impl<D> Drop for Deallocator<D> {
    fn drop(&mut self) {
        self.queue.drain(&self.device);
    }
}

/// Single-use result of one creation call.
#[must_use = "a proxy registers nothing until it is committed or staged"]
pub struct ReturnProxy<T, D = ash::Device> {
    op: &'static str,
    state: Option<(T, Record<D>)>,
}

impl<T, D> ReturnProxy<T, D> {
    pub fn created(op: &'static str, value: T, destroy: impl FnOnce(&D) + 'static) -> Self {
        ReturnProxy {
            op,
            state: Some((value, Box::new(destroy))),
        }
    }

    pub fn failed(op: &'static str) -> Self {
        ReturnProxy { op, state: None }
    }

    /// Wrap a creation result, logging on failure. `destroy` receives a
    /// copy of the value when the record runs.
    pub fn from_result<E: fmt::Display>(
        op: &'static str,
        result: std::result::Result<T, E>,
        destroy: fn(&D, T),
    ) -> Self
    where
        T: Copy + 'static,
        D: 'static,
    {
        match result {
            Ok(value) => Self::created(op, value, move |d| destroy(d, value)),
            Err(e) => {
                error!("{op} failed: {e}");
                Self::failed(op)
            }
        }
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_none()
    }

    /// Register the destructor with `dal` and return the value; a failed
    /// proxy yields `T::default()` and registers nothing.
    pub fn commit(self, dal: &mut Deallocator<D>) -> T
    where
        T: Default,
    {
        self.stage(&mut dal.queue)
    }

    pub fn stage(self, queue: &mut DeallocationQueue<D>) -> T
    where
        T: Default,
    {
        self.try_stage(queue).unwrap_or_default()
    }

    pub fn try_commit(self, dal: &mut Deallocator<D>) -> Result<T> {
        self.try_stage(&mut dal.queue)
    }

    pub fn try_stage(self, queue: &mut DeallocationQueue<D>) -> Result<T> {
        match self.state {
            Some((value, record)) => {
                queue.records.push_back(record);
                Ok(value)
            }
            None => Err(Error::Failed(self.op)),
        }
    }

    /// Take the value and drop the destructor; the caller owns teardown.
    pub fn into_unmanaged(self) -> Option<T> {
        self.state.map(|(value, _)| value)
    }
}

impl<T: fmt::Debug, D> fmt::Debug for ReturnProxy<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnProxy")
            .field("op", &self.op)
            .field("value", &self.state.as_ref().map(|(v, _)| v))
            .finish()
    }
}

/// Result of building several objects together; committed all or nothing.
#[must_use = "a proxy registers nothing until it is committed or staged"]
pub struct ComposedProxy<T, D = ash::Device> {
    op: &'static str,
    state: Option<(T, DeallocationQueue<D>)>,
}

impl<T, D> ComposedProxy<T, D> {
    pub fn failed(op: &'static str) -> Self {
        ComposedProxy { op, state: None }
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_none()
    }

    /// Number of records that a successful commit would move.
    pub fn records(&self) -> usize {
        self.state.as_ref().map_or(0, |(_, q)| q.len())
    }

    pub fn commit(self, dal: &mut Deallocator<D>) -> T
    where
        T: Default,
    {
        self.stage(&mut dal.queue)
    }

    pub fn stage(self, queue: &mut DeallocationQueue<D>) -> T
    where
        T: Default,
    {
        self.try_stage(queue).unwrap_or_default()
    }

    pub fn try_commit(self, dal: &mut Deallocator<D>) -> Result<T> {
        self.try_stage(&mut dal.queue)
    }

    pub fn try_stage(self, queue: &mut DeallocationQueue<D>) -> Result<T> {
        match self.state {
            Some((value, mut records)) => {
                queue.append(&mut records);
                Ok(value)
            }
            None => Err(Error::Failed(self.op)),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ComposedProxy<U, D> {
        ComposedProxy {
            op: self.op,
            state: self.state.map(|(value, queue)| (f(value), queue)),
        }
    }
}

/// Collects staged proxies for one multi-object build.
///
/// Once any staged proxy fails the composer is poisoned; `finish` then
/// destroys every object staged so far and yields a failed
/// [`ComposedProxy`] that registers nothing.
pub struct Composer<D = ash::Device> {
    op: &'static str,
    queue: DeallocationQueue<D>,
    failed: bool,
}

impl<D> Composer<D> {
    pub fn new(op: &'static str) -> Self {
        Composer {
            op,
            queue: DeallocationQueue::new(),
            failed: false,
        }
    }

    /// Stage `proxy`; returns `None` (and poisons) if it failed.
    pub fn stage<T>(&mut self, proxy: ReturnProxy<T, D>) -> Option<T> {
        if proxy.is_failed() {
            self.failed = true;
        }
        proxy.try_stage(&mut self.queue).ok()
    }

    pub fn stage_composed<T>(&mut self, proxy: ComposedProxy<T, D>) -> Option<T> {
        if proxy.is_failed() {
            self.failed = true;
        }
        proxy.try_stage(&mut self.queue).ok()
    }

    /// Register an extra destructor for something created outside a proxy.
    pub fn push(&mut self, record: impl FnOnce(&D) + 'static) {
        self.queue.push(record);
    }

    /// Mark the build failed for a reason detected by the caller.
    pub fn poison(&mut self) {
        self.failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn staged(&self) -> usize {
        self.queue.len()
    }

    pub fn finish<T>(mut self, device: &D, value: T) -> ComposedProxy<T, D> {
        if self.failed {
            let rolled_back = self.queue.drain(device);
            error!("{} failed; destroyed {rolled_back} partial objects", self.op);
            return ComposedProxy::failed(self.op);
        }
        ComposedProxy {
            op: self.op,
            state: Some((value, std::mem::take(&mut self.queue))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Stand-in device that records destructor calls.
    #[derive(Default)]
    pub(crate) struct Tracker {
        pub destroyed: RefCell<Vec<u64>>,
    }

    impl Tracker {
        pub fn log(&self) -> Vec<u64> {
            self.destroyed.borrow().clone()
        }
    }

    pub(crate) fn handle(id: u64) -> ReturnProxy<u64, Tracker> {
        ReturnProxy::created("test", id, move |t: &Tracker| {
            t.destroyed.borrow_mut().push(id)
        })
    }

    #[test]
    fn drain_runs_each_record_once_in_registration_order() {
        let mut dal = Deallocator::new(Tracker::default());
        for id in 1..=5 {
            let v = handle(id).commit(&mut dal);
            assert_eq!(v, id);
        }
        assert_eq!(dal.pending(), 5);
        assert_eq!(dal.drain(), 5);
        assert_eq!(dal.pending(), 0);
        assert_eq!(dal.device().log(), vec![1, 2, 3, 4, 5]);

        // a second drain is a no-op
        assert_eq!(dal.drain(), 0);
        assert_eq!(dal.device().log().len(), 5);
    }

    #[test]
    fn failed_proxy_commits_default_and_nothing_else() {
        let mut dal = Deallocator::new(Tracker::default());
        let p: ReturnProxy<u64, Tracker> = ReturnProxy::failed("vkCreateBuffer");
        assert!(p.is_failed());
        assert_eq!(p.commit(&mut dal), 0);
        assert_eq!(dal.pending(), 0);

        let p: ReturnProxy<u64, Tracker> = ReturnProxy::failed("vkCreateBuffer");
        assert!(matches!(p.try_commit(&mut dal), Err(Error::Failed("vkCreateBuffer"))));
    }

    #[test]
    fn from_result_maps_status() {
        fn destroy(t: &Tracker, v: u64) {
            t.destroyed.borrow_mut().push(v);
        }
        let mut dal = Deallocator::new(Tracker::default());
        let ok = ReturnProxy::from_result("op", Ok::<_, ash::vk::Result>(7u64), destroy);
        let bad: ReturnProxy<u64, Tracker> =
            ReturnProxy::from_result("op", Err(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY), destroy);
        assert_eq!(ok.commit(&mut dal), 7);
        assert!(bad.is_failed());
        assert_eq!(bad.commit(&mut dal), 0);
        dal.drain();
        assert_eq!(dal.device().log(), vec![7]);
    }

    #[test]
    fn staged_batch_lands_after_existing_records() {
        let mut dal = Deallocator::new(Tracker::default());
        handle(1).commit(&mut dal);
        let mut local = DeallocationQueue::new();
        handle(2).stage(&mut local);
        handle(3).stage(&mut local);
        assert_eq!(dal.pending(), 1);
        dal.append(&mut local);
        assert!(local.is_empty());
        dal.drain();
        assert_eq!(dal.device().log(), vec![1, 2, 3]);
    }

    #[test]
    fn composed_failure_rolls_back_and_registers_nothing() {
        let tracker = Tracker::default();
        let mut dal = Deallocator::new(Tracker::default());
        let mut c = Composer::new("bundle");
        assert_eq!(c.stage(handle(10)), Some(10));
        assert_eq!(c.stage(handle(11)), Some(11));
        assert_eq!(c.stage(ReturnProxy::failed("third")), None::<u64>);
        assert!(c.is_failed());

        let proxy = c.finish(&tracker, (10, 11));
        assert!(proxy.is_failed());
        assert_eq!(proxy.records(), 0);
        assert_eq!(proxy.commit(&mut dal), (0, 0));
        assert_eq!(dal.pending(), 0);
        // partial objects were destroyed right away, not leaked
        assert_eq!(tracker.log(), vec![10, 11]);
    }

    #[test]
    fn composed_success_moves_whole_group() {
        let tracker = Tracker::default();
        let mut dal = Deallocator::new(Tracker::default());
        let mut c = Composer::new("bundle");
        let a = c.stage(handle(1)).unwrap();
        let b = c.stage(handle(2)).unwrap();
        let proxy = c.finish(&tracker, (a, b));
        assert_eq!(proxy.records(), 2);
        assert_eq!(proxy.commit(&mut dal), (1, 2));
        assert_eq!(dal.pending(), 2);
        assert!(tracker.log().is_empty());
    }

    #[test]
    fn unmanaged_value_skips_registration() {
        let mut dal = Deallocator::new(Tracker::default());
        assert_eq!(handle(4).into_unmanaged(), Some(4));
        dal.drain();
        assert!(dal.device().log().is_empty());
    }
}
