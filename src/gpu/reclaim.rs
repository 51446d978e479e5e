use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use ash::vk;

use super::allocator::DeviceAllocation;

/// A driver handle whose owner is gone but whose destruction must wait for
/// the GPU. Closed set of variants; the context dispatches the real destroy
/// call per kind when an entry's generation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombieHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSet(vk::DescriptorSet, vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    PipelineLayout(vk::PipelineLayout),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    Allocation(DeviceAllocation),
}

#[derive(Debug)]
struct ReclaimEntry {
    fence_value: u64,
    handle: ZombieHandle,
}

impl PartialEq for ReclaimEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fence_value == other.fence_value
    }
}

impl Eq for ReclaimEntry {}

impl PartialOrd for ReclaimEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReclaimEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fence_value.cmp(&other.fence_value)
    }
}

/// Deferred destruction queue, ordered by fence generation.
///
/// Client-side `destroy` calls enqueue here with the generation of the last
/// submission that may reference the handle; [`collect`](Self::collect)
/// destroys exactly the prefix whose generations the device has proven
/// complete. An entry is never destroyed earlier; that is the property that
/// makes asynchronous GPU consumption safe against CPU-side teardown.
///
/// Enqueue takes a single short lock, which is sufficient at the expected
/// contention (one writer per recording thread, one consumer per frame).
#[derive(Default)]
pub struct DeletionQueue {
    pending: Mutex<BinaryHeap<Reverse<ReclaimEntry>>>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, handle: ZombieHandle, fence_value: u64) {
        self.pending
            .lock()
            .expect("deletion queue lock poisoned")
            .push(Reverse(ReclaimEntry {
                fence_value,
                handle,
            }));
    }

    /// Destroy every entry whose recorded generation is `<=
    /// completed_generation`; later entries are retained untouched.
    pub fn collect(&self, completed_generation: u64, mut destroy: impl FnMut(ZombieHandle)) {
        let mut pending = self.pending.lock().expect("deletion queue lock poisoned");
        while let Some(Reverse(entry)) = pending.peek() {
            if entry.fence_value > completed_generation {
                break;
            }
            let Reverse(entry) = pending.pop().unwrap();
            destroy(entry.handle);
        }
    }

    /// Teardown path: destroy everything regardless of generation. Only
    /// valid after the device has been fully drained.
    pub fn flush_all(&self, mut destroy: impl FnMut(ZombieHandle)) {
        let mut pending = self.pending.lock().expect("deletion queue lock poisoned");
        while let Some(Reverse(entry)) = pending.pop() {
            destroy(entry.handle);
        }
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .expect("deletion queue lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_zombie(raw: u64) -> ZombieHandle {
        ZombieHandle::Buffer(vk::Buffer::from_raw(raw))
    }

    use ash::vk::Handle as _;

    #[test]
    fn never_destroys_before_generation_completes() {
        let queue = DeletionQueue::new();
        queue.enqueue(buffer_zombie(1), 5);
        queue.enqueue(buffer_zombie(2), 7);

        let mut destroyed = Vec::new();
        // Mock fence: nothing has completed yet.
        queue.collect(4, |h| destroyed.push(h));
        assert!(destroyed.is_empty());
        assert_eq!(queue.len(), 2);

        queue.collect(5, |h| destroyed.push(h));
        assert_eq!(destroyed, vec![buffer_zombie(1)]);
        assert_eq!(queue.len(), 1);

        queue.collect(7, |h| destroyed.push(h));
        assert_eq!(destroyed, vec![buffer_zombie(1), buffer_zombie(2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn collects_in_generation_order_not_insertion_order() {
        let queue = DeletionQueue::new();
        queue.enqueue(buffer_zombie(30), 3);
        queue.enqueue(buffer_zombie(10), 1);
        queue.enqueue(buffer_zombie(20), 2);

        let mut destroyed = Vec::new();
        queue.collect(u64::MAX, |h| destroyed.push(h));
        assert_eq!(
            destroyed,
            vec![buffer_zombie(10), buffer_zombie(20), buffer_zombie(30)]
        );
    }

    #[test]
    fn flush_all_ignores_generations() {
        let queue = DeletionQueue::new();
        queue.enqueue(buffer_zombie(1), u64::MAX);
        let mut destroyed = 0;
        queue.flush_all(|_| destroyed += 1);
        assert_eq!(destroyed, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn entries_at_exactly_the_completed_generation_are_destroyed() {
        let queue = DeletionQueue::new();
        queue.enqueue(buffer_zombie(9), 9);
        let mut destroyed = Vec::new();
        queue.collect(9, |h| destroyed.push(h));
        assert_eq!(destroyed.len(), 1);
    }
}
