use std::collections::HashMap;

use ash::vk;

use crate::utils::Handle;

use super::allocator::DeviceAllocation;
use super::error::{GPUError, Result};
use super::structs::{
    AspectMask, BufferUsage, Format, ImageUsage, MemoryVisibility, SampleCount,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
    /// Stacked locks for ring-buffer style resources; each lock claims a
    /// fresh arena slice rather than contending for the same bytes.
    Accumulate,
}

/// Lock bookkeeping shared by buffers and images: at most one outstanding
/// exclusive lock, with opt-in accumulation for volatile resources.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct LockState {
    exclusive: bool,
    count: u32,
}

impl LockState {
    fn acquire(&mut self, mode: LockMode, accumulation_allowed: bool, name: &str) -> Result<()> {
        match mode {
            LockMode::Read | LockMode::Write => {
                if self.count > 0 {
                    return Err(GPUError::LockConflict(name.to_string()));
                }
                self.exclusive = true;
                self.count = 1;
                Ok(())
            }
            LockMode::Accumulate => {
                if !accumulation_allowed {
                    return Err(GPUError::LockConflict(name.to_string()));
                }
                if self.exclusive {
                    return Err(GPUError::LockConflict(name.to_string()));
                }
                self.count += 1;
                Ok(())
            }
        }
    }

    fn release(&mut self, name: &str) {
        if self.count == 0 {
            log::warn!("unlock of `{name}` which is not locked");
            return;
        }
        self.count -= 1;
        if self.count == 0 {
            self.exclusive = false;
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.count > 0
    }
}

/// Driver-level sampler object.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sampler {
    pub(crate) raw: vk::Sampler,
}

/// A read/write projection of a buffer: plain data, no driver object. Holds
/// only the owning handle (lookup, never lifetime extension); the offset is
/// resolved against the buffer's current placement at descriptor-write
/// time, so a moved or rotated buffer invalidates nothing here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferView {
    pub buffer: Handle<Buffer>,
    pub offset: u64,
    /// `u64::MAX` extends to the end of the buffer.
    pub size: u64,
}

impl BufferView {
    pub fn new(buffer: Handle<Buffer>) -> Self {
        Self {
            buffer,
            offset: 0,
            size: u64::MAX,
        }
    }
}

/// Cache key for one image view: format override plus mip/array range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageViewKey {
    pub format: Format,
    pub mip_base: u32,
    pub mip_count: u32,
    pub layer_base: u32,
    pub layer_count: u32,
    pub aspect: AspectMask,
}

/// Memory-backed buffer resource. Usage flags are fixed at creation; the
/// backing allocation may move (defragmentation) or rotate every lock
/// (volatile), after which cached state is regenerated lazily.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) allocation: DeviceAllocation,
    pub(crate) usage: BufferUsage,
    pub(crate) visibility: MemoryVisibility,
    pub(crate) byte_size: u64,
    pub(crate) volatile: bool,
    /// Offset of the live slice inside the volatile arena.
    pub(crate) ring_offset: u64,
    /// Base of the host mapping for the current placement; null when the
    /// memory is not host visible.
    pub(crate) mapped: *mut u8,
    pub(crate) lock: LockState,
    /// Fence generation of the last submission that referenced this buffer.
    pub(crate) last_submit: u64,
    /// Bumped whenever the backing bytes change identity (move, rotation);
    /// descriptor writes snapshot it to detect staleness.
    pub(crate) revision: u32,
    pub(crate) debug_name: String,
}

unsafe impl Send for Buffer {}

impl Buffer {
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn visibility(&self) -> MemoryVisibility {
        self.visibility
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub(crate) fn acquire_lock(&mut self, mode: LockMode) -> Result<()> {
        self.lock.acquire(mode, self.volatile, &self.debug_name)
    }

    pub(crate) fn release_lock(&mut self) {
        self.lock.release(&self.debug_name);
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Point the buffer at a new backing slice of the volatile arena. Any
    /// previously handed-out pointer or cached descriptor is stale after
    /// this.
    pub(crate) fn rotate(&mut self, ring_offset: u64, mapped: *mut u8) {
        debug_assert!(self.volatile);
        self.ring_offset = ring_offset;
        self.mapped = mapped;
        self.revision = self.revision.wrapping_add(1);
    }

    /// Rebind after a defragmentation move: new driver object, new
    /// allocation, new mapping. Returns the old driver handle for deferred
    /// destruction.
    pub(crate) fn rebind(
        &mut self,
        raw: vk::Buffer,
        allocation: DeviceAllocation,
        mapped: *mut u8,
    ) -> vk::Buffer {
        let old = std::mem::replace(&mut self.raw, raw);
        self.allocation = allocation;
        self.mapped = mapped;
        self.revision = self.revision.wrapping_add(1);
        old
    }
}

/// Memory-backed image resource with its cached views.
#[derive(Debug)]
pub struct Image {
    pub(crate) raw: vk::Image,
    pub(crate) allocation: DeviceAllocation,
    pub(crate) dim: [u32; 3],
    pub(crate) layers: u32,
    pub(crate) format: Format,
    pub(crate) mip_levels: u32,
    pub(crate) samples: SampleCount,
    pub(crate) usage: ImageUsage,
    pub(crate) views: HashMap<ImageViewKey, vk::ImageView>,
    pub(crate) lock: LockState,
    pub(crate) last_submit: u64,
    pub(crate) revision: u32,
    pub(crate) debug_name: String,
}

impl Image {
    pub fn format(&self) -> Format {
        self.format
    }

    pub fn dim(&self) -> [u32; 3] {
        self.dim
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn usage(&self) -> ImageUsage {
        self.usage
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub(crate) fn acquire_lock(&mut self, mode: LockMode) -> Result<()> {
        self.lock.acquire(mode, false, &self.debug_name)
    }

    pub(crate) fn release_lock(&mut self) {
        self.lock.release(&self.debug_name);
    }

    pub(crate) fn cached_view(&self, key: &ImageViewKey) -> Option<vk::ImageView> {
        self.views.get(key).copied()
    }

    pub(crate) fn cache_view(&mut self, key: ImageViewKey, view: vk::ImageView) {
        self.views.insert(key, view);
    }

    /// Tear down every cached view. Returns the raw handles so the caller
    /// can route them through the deferred deletion queue; from this moment
    /// until regeneration, no cached view of this image exists.
    pub(crate) fn take_views(&mut self) -> Vec<vk::ImageView> {
        self.views.drain().map(|(_, v)| v).collect()
    }

    /// Rebind after a defragmentation move. Cached views refer to the old
    /// driver object and are drained along with it.
    pub(crate) fn rebind(
        &mut self,
        raw: vk::Image,
        allocation: DeviceAllocation,
    ) -> (vk::Image, Vec<vk::ImageView>) {
        let old = std::mem::replace(&mut self.raw, raw);
        self.allocation = allocation;
        self.revision = self.revision.wrapping_add(1);
        (old, self.take_views())
    }
}

/// Upper bound on mip chain length for an image of the given dimensions:
/// floor(log2(max dimension)) + 1.
pub fn max_mip_levels(dim: [u32; 3]) -> u32 {
    let max_dim = dim.iter().copied().max().unwrap_or(1).max(1);
    32 - max_dim.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_buffer(volatile: bool) -> Buffer {
        Buffer {
            raw: vk::Buffer::null(),
            allocation: DeviceAllocation::default(),
            usage: BufferUsage::UNIFORM,
            visibility: MemoryVisibility::CpuAndGpu,
            byte_size: 256,
            volatile,
            ring_offset: 0,
            mapped: std::ptr::null_mut(),
            lock: LockState::default(),
            last_submit: 0,
            revision: 0,
            debug_name: String::from("test"),
        }
    }

    #[test]
    fn exclusive_lock_conflicts() {
        let mut buf = test_buffer(false);
        buf.acquire_lock(LockMode::Write).unwrap();
        assert!(matches!(
            buf.acquire_lock(LockMode::Read).unwrap_err(),
            GPUError::LockConflict(_)
        ));
        buf.release_lock();
        buf.acquire_lock(LockMode::Read).unwrap();
    }

    #[test]
    fn lock_unlock_cycles_are_idempotent() {
        let mut buf = test_buffer(false);
        for _ in 0..50 {
            buf.acquire_lock(LockMode::Write).unwrap();
            assert!(buf.is_locked());
            buf.release_lock();
            assert!(!buf.is_locked());
        }
    }

    #[test]
    fn accumulation_requires_volatile() {
        let mut plain = test_buffer(false);
        assert!(plain.acquire_lock(LockMode::Accumulate).is_err());

        let mut ring = test_buffer(true);
        ring.acquire_lock(LockMode::Accumulate).unwrap();
        ring.acquire_lock(LockMode::Accumulate).unwrap();
        assert!(ring.is_locked());
        // An exclusive lock cannot join outstanding accumulation locks.
        assert!(ring.acquire_lock(LockMode::Write).is_err());
        ring.release_lock();
        ring.release_lock();
        assert!(!ring.is_locked());
    }

    #[test]
    fn rotation_bumps_revision() {
        let mut buf = test_buffer(true);
        let before = buf.revision();
        buf.rotate(512, std::ptr::null_mut());
        assert_ne!(buf.revision(), before);
        assert_eq!(buf.ring_offset, 512);
    }

    fn test_image() -> Image {
        Image {
            raw: vk::Image::null(),
            allocation: DeviceAllocation::default(),
            dim: [64, 64, 1],
            layers: 1,
            format: Format::RGBA8,
            mip_levels: 1,
            samples: SampleCount::S1,
            usage: ImageUsage::SAMPLED,
            views: HashMap::new(),
            lock: LockState::default(),
            last_submit: 0,
            revision: 0,
            debug_name: String::from("img"),
        }
    }

    fn key(mip_base: u32) -> ImageViewKey {
        ImageViewKey {
            format: Format::RGBA8,
            mip_base,
            mip_count: 1,
            layer_base: 0,
            layer_count: 1,
            aspect: AspectMask::Color,
        }
    }

    #[test]
    fn view_cache_hits_by_range() {
        use ash::vk::Handle as _;
        let mut img = test_image();
        assert_eq!(img.cached_view(&key(0)), None);
        img.cache_view(key(0), vk::ImageView::from_raw(7));
        img.cache_view(key(1), vk::ImageView::from_raw(8));
        assert_eq!(img.cached_view(&key(0)), Some(vk::ImageView::from_raw(7)));
        assert_eq!(img.cached_view(&key(1)), Some(vk::ImageView::from_raw(8)));
    }

    #[test]
    fn rebind_drains_every_cached_view() {
        use ash::vk::Handle as _;
        let mut img = test_image();
        img.cache_view(key(0), vk::ImageView::from_raw(7));
        img.cache_view(key(1), vk::ImageView::from_raw(8));
        let before = img.revision();
        let (_old, views) = img.rebind(vk::Image::from_raw(2), DeviceAllocation::default());
        assert_eq!(views.len(), 2);
        assert_eq!(img.cached_view(&key(0)), None);
        assert_ne!(img.revision(), before);
    }

    #[test]
    fn mip_levels_bound() {
        assert_eq!(max_mip_levels([1, 1, 1]), 1);
        assert_eq!(max_mip_levels([256, 256, 1]), 9);
        assert_eq!(max_mip_levels([1024, 512, 1]), 11);
    }
}
