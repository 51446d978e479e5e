use std::collections::HashMap;

use super::error::{GPUError, Result};
use super::structs::MemoryPriority;

/// Default size of one device memory page. Sub-allocations are carved out of
/// pages; anything larger than [`DEDICATED_THRESHOLD`] gets its own block.
pub const PAGE_SIZE: u64 = 64 << 20;
pub const DEDICATED_THRESHOLD: u64 = PAGE_SIZE / 4;

/// Opaque handle to one raw device memory block, owned by the heap backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u64);

/// Driver seam for raw memory blocks. The Vulkan implementation lives in
/// `gpu::vulkan::memory`; tests drive the allocator with a mock.
pub trait HeapBackend {
    fn alloc_block(&mut self, size: u64, memory_type: u32) -> Result<BlockHandle>;
    fn free_block(&mut self, block: BlockHandle);
    /// Copy bytes between blocks. Used for eviction and defragmentation
    /// moves; may stall on the transfer internally.
    fn copy(
        &mut self,
        src: BlockHandle,
        src_offset: u64,
        dst: BlockHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;
    /// Host-visible memory type used as the eviction target.
    fn host_memory_type(&self) -> u32;
}

pub type AllocId = u64;

/// One region inside a device memory page. Owned exclusively by the resource
/// that requested it; returned to the allocator on destroy or move.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceAllocation {
    pub(crate) id: AllocId,
    pub(crate) page: u32,
    pub offset: u64,
    pub size: u64,
    pub(crate) memory_type: u32,
    pub(crate) dedicated: bool,
}

impl DeviceAllocation {
    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AllocationRequest {
    pub size: u64,
    pub align: u64,
    pub memory_type_mask: u32,
    pub priority: MemoryPriority,
}

impl Default for AllocationRequest {
    fn default() -> Self {
        Self {
            size: 0,
            align: 1,
            memory_type_mask: !0,
            priority: MemoryPriority::Normal,
        }
    }
}

/// Resource-side hook for defragmentation: after the allocator has copied the
/// bytes into `to`, the owner must rebind its driver objects and invalidate
/// every cached view of the old region.
pub trait AllocationMover {
    fn relocate(&mut self, from: &DeviceAllocation, to: &DeviceAllocation);
}

#[derive(Clone, Copy, Debug)]
struct FreeBlock {
    offset: u64,
    size: u64,
}

#[derive(Clone, Copy, Debug)]
struct LiveAlloc {
    offset: u64,
    size: u64,
    align: u64,
    priority: MemoryPriority,
    evictable: bool,
    last_used_frame: u64,
}

struct Page {
    block: BlockHandle,
    memory_type: u32,
    size: u64,
    used: u64,
    dedicated: bool,
    /// Sorted by offset, adjacent blocks coalesced.
    free: Vec<FreeBlock>,
    live: HashMap<AllocId, LiveAlloc>,
}

struct EvictedAlloc {
    host_block: BlockHandle,
    size: u64,
    align: u64,
    memory_type: u32,
    priority: MemoryPriority,
}

fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Sub-allocating device memory manager: first-fit free lists over fixed-size
/// pages per memory type, a dedicated-block path for large requests, LRU
/// eviction to host memory, and move-based defragmentation.
pub struct DeviceAllocator<H: HeapBackend> {
    heap: H,
    pages: Vec<Option<Page>>,
    /// live allocation id -> page index
    index: HashMap<AllocId, u32>,
    evicted: HashMap<AllocId, EvictedAlloc>,
    next_id: AllocId,
    frame: u64,
    page_size: u64,
    dedicated_threshold: u64,
}

impl<H: HeapBackend> DeviceAllocator<H> {
    pub fn new(heap: H) -> Self {
        Self::with_page_size(heap, PAGE_SIZE, DEDICATED_THRESHOLD)
    }

    pub fn with_page_size(heap: H, page_size: u64, dedicated_threshold: u64) -> Self {
        Self {
            heap,
            pages: Vec::new(),
            index: HashMap::new(),
            evicted: HashMap::new(),
            next_id: 1,
            frame: 0,
            page_size,
            dedicated_threshold,
        }
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    /// Backing block of an allocation's page, for binding driver objects.
    pub fn block_of(&self, alloc: &DeviceAllocation) -> Option<BlockHandle> {
        self.pages
            .get(alloc.page as usize)?
            .as_ref()
            .map(|p| p.block)
    }

    /// Never blocks on the GPU. Fails with [`GPUError::OutOfMemory`] once
    /// existing pages and a fresh page attempt are exhausted; the caller may
    /// defragment or evict and retry, or drop the request.
    pub fn allocate(&mut self, req: &AllocationRequest) -> Result<DeviceAllocation> {
        let id = self.next_id;
        self.next_id += 1;
        self.allocate_as(id, req)
    }

    pub fn free(&mut self, alloc: DeviceAllocation) {
        if alloc.is_null() {
            return;
        }
        if let Some(ev) = self.evicted.remove(&alloc.id) {
            self.heap.free_block(ev.host_block);
            return;
        }
        if self.index.remove(&alloc.id).is_none() {
            log::warn!("free of unknown allocation id {}", alloc.id);
            return;
        }
        let page_idx = alloc.page as usize;
        let empty = {
            let page = match self.pages[page_idx].as_mut() {
                Some(p) => p,
                None => return,
            };
            if alloc.dedicated {
                true
            } else {
                if let Some(live) = page.live.remove(&alloc.id) {
                    Self::insert_free(&mut page.free, live.offset, live.size);
                    page.used -= live.size;
                }
                false
            }
        };
        if empty {
            let page = self.pages[page_idx].take().unwrap();
            self.heap.free_block(page.block);
        }
    }

    /// Record that the resource owning `alloc` was touched this frame.
    pub fn note_access(&mut self, alloc: &DeviceAllocation) {
        let frame = self.frame;
        if let Some(live) = self.live_mut(alloc.id) {
            live.last_used_frame = frame;
        }
    }

    pub fn mark_evictable(&mut self, alloc: &DeviceAllocation, evictable: bool) {
        if let Some(live) = self.live_mut(alloc.id) {
            live.evictable = evictable;
        }
    }

    pub fn is_evicted(&self, alloc: &DeviceAllocation) -> bool {
        self.evicted.contains_key(&alloc.id)
    }

    /// Advance the allocator's frame counter and release pages that emptied.
    pub fn end_frame(&mut self, frame: u64) {
        self.frame = frame;
        self.release_empty_pages();
    }

    /// Force evictable allocations that have not been touched for
    /// `idle_frames` out to host memory. Returns the ids moved out; their
    /// owners must treat views and driver objects as stale until restored.
    pub fn evict_cold(&mut self, idle_frames: u64) -> Result<Vec<AllocId>> {
        let cutoff = self.frame.saturating_sub(idle_frames);
        let mut candidates: Vec<(AllocId, u32)> = Vec::new();
        for (idx, page) in self.pages.iter().enumerate() {
            let Some(page) = page else { continue };
            for (id, live) in &page.live {
                if live.evictable && live.last_used_frame < cutoff {
                    candidates.push((*id, idx as u32));
                }
            }
        }
        // Coldest and lowest priority first.
        candidates.sort_by_key(|(id, page)| {
            let live = &self.pages[*page as usize].as_ref().unwrap().live[id];
            (live.priority, live.last_used_frame)
        });

        let mut out = Vec::new();
        for (id, page_idx) in candidates {
            self.evict_one(id, page_idx)?;
            out.push(id);
        }
        Ok(out)
    }

    /// Bring an evicted allocation back into device memory (one copy back).
    /// Returns the same id at its new location; a no-op for resident
    /// allocations.
    pub fn restore(&mut self, alloc: &DeviceAllocation) -> Result<DeviceAllocation> {
        let Some(ev) = self.evicted.remove(&alloc.id) else {
            return Ok(*alloc);
        };
        let req = AllocationRequest {
            size: ev.size,
            align: ev.align,
            memory_type_mask: 1 << ev.memory_type,
            priority: ev.priority,
        };
        let fresh = match self.allocate_as(alloc.id, &req) {
            Ok(a) => a,
            Err(e) => {
                self.evicted.insert(
                    alloc.id,
                    EvictedAlloc {
                        host_block: ev.host_block,
                        size: ev.size,
                        align: ev.align,
                        memory_type: ev.memory_type,
                        priority: ev.priority,
                    },
                );
                return Err(e);
            }
        };
        let dst = self.block_of(&fresh).ok_or(GPUError::InvalidHandle)?;
        self.heap.copy(ev.host_block, 0, dst, fresh.offset, ev.size)?;
        self.heap.free_block(ev.host_block);
        log::debug!("restored allocation {} ({} bytes)", alloc.id, ev.size);
        Ok(fresh)
    }

    /// Best-effort compaction: repack live allocations from sparse pages into
    /// the free space of other pages, invoking `mover` for each relocation,
    /// then release pages that emptied. Returns the number of moves.
    pub fn defragment(&mut self, mover: &mut dyn AllocationMover) -> usize {
        let mut moves = 0;

        let mut candidates: Vec<u32> = self
            .pages
            .iter()
            .enumerate()
            .filter_map(|(idx, page)| {
                let page = page.as_ref()?;
                (!page.dedicated && page.used > 0 && page.used < page.size / 2)
                    .then_some(idx as u32)
            })
            .collect();
        // Sparsest page first gives the best shot at emptying it entirely.
        candidates.sort_by_key(|idx| self.pages[*idx as usize].as_ref().unwrap().used);

        for page_idx in candidates {
            let mut entries: Vec<(AllocId, LiveAlloc)> = {
                let Some(page) = self.pages[page_idx as usize].as_ref() else {
                    continue;
                };
                page.live.iter().map(|(id, l)| (*id, *l)).collect()
            };
            entries.sort_by_key(|(_, l)| l.offset);

            for (id, live) in entries {
                let memory_type = self.pages[page_idx as usize]
                    .as_ref()
                    .map(|p| p.memory_type);
                let Some(memory_type) = memory_type else { break };
                let Some((dst_page, dst_offset)) =
                    self.place(live.size, live.align, 1 << memory_type, Some(page_idx))
                else {
                    continue;
                };

                let src_block = self.pages[page_idx as usize].as_ref().unwrap().block;
                let dst_block = self.pages[dst_page as usize].as_ref().unwrap().block;
                if let Err(e) =
                    self.heap
                        .copy(src_block, live.offset, dst_block, dst_offset, live.size)
                {
                    log::warn!("defrag copy failed, leaving allocation {id} in place: {e}");
                    self.unplace(dst_page, dst_offset, live.size);
                    continue;
                }

                let old = DeviceAllocation {
                    id,
                    page: page_idx,
                    offset: live.offset,
                    size: live.size,
                    memory_type,
                    dedicated: false,
                };
                let new = DeviceAllocation {
                    id,
                    page: dst_page,
                    offset: dst_offset,
                    size: live.size,
                    memory_type,
                    dedicated: false,
                };

                {
                    let dst = self.pages[dst_page as usize].as_mut().unwrap();
                    dst.live.insert(id, LiveAlloc { offset: dst_offset, ..live });
                    dst.used += live.size;
                }
                {
                    let src = self.pages[page_idx as usize].as_mut().unwrap();
                    src.live.remove(&id);
                    Self::insert_free(&mut src.free, live.offset, live.size);
                    src.used -= live.size;
                }
                self.index.insert(id, dst_page);

                mover.relocate(&old, &new);
                log::debug!(
                    "defrag moved allocation {id}: page {} @{:#x} -> page {} @{:#x}",
                    old.page,
                    old.offset,
                    new.page,
                    new.offset
                );
                moves += 1;
            }
        }

        self.release_empty_pages();
        moves
    }

    pub fn page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    pub fn bytes_used(&self) -> u64 {
        self.pages
            .iter()
            .flatten()
            .map(|p| if p.dedicated { p.size } else { p.used })
            .sum()
    }

    // ---- internals -------------------------------------------------------

    fn live_mut(&mut self, id: AllocId) -> Option<&mut LiveAlloc> {
        let page = *self.index.get(&id)?;
        self.pages[page as usize].as_mut()?.live.get_mut(&id)
    }

    fn allocate_as(&mut self, id: AllocId, req: &AllocationRequest) -> Result<DeviceAllocation> {
        let size = req.size.max(1);
        let align = req.align.max(1);
        if req.memory_type_mask == 0 {
            return Err(GPUError::OutOfMemory {
                size,
                memory_type_mask: 0,
            });
        }

        if size > self.dedicated_threshold {
            return self.allocate_dedicated(id, size, align, req);
        }

        if let Some((page, offset)) = self.place(size, align, req.memory_type_mask, None) {
            self.register(id, page, offset, size, align, req.priority);
            return Ok(self.allocation(id, page, offset, size));
        }

        // No room anywhere; grow by one page.
        let memory_type = self.pick_memory_type(req.memory_type_mask);
        let page = self.new_page(self.page_size, memory_type, false).map_err(|e| {
            log::warn!(
                "page allocation failed ({} bytes, type {}): {e}",
                self.page_size,
                memory_type
            );
            GPUError::OutOfMemory {
                size,
                memory_type_mask: req.memory_type_mask,
            }
        })?;
        let (page, offset) = self
            .try_fit(page, size, align)
            .map(|offset| (page, offset))
            .expect("fresh page must fit a sub-threshold allocation");
        self.register(id, page, offset, size, align, req.priority);
        Ok(self.allocation(id, page, offset, size))
    }

    fn allocate_dedicated(
        &mut self,
        id: AllocId,
        size: u64,
        align: u64,
        req: &AllocationRequest,
    ) -> Result<DeviceAllocation> {
        let memory_type = self.pick_memory_type(req.memory_type_mask);
        let block_size = align_up(size, align);
        let page = self.new_page(block_size, memory_type, true).map_err(|e| {
            log::warn!("dedicated allocation failed ({block_size} bytes): {e}");
            GPUError::OutOfMemory {
                size,
                memory_type_mask: req.memory_type_mask,
            }
        })?;
        {
            let p = self.pages[page as usize].as_mut().unwrap();
            p.free.clear();
            p.used = size;
            p.live.insert(
                id,
                LiveAlloc {
                    offset: 0,
                    size,
                    align,
                    priority: req.priority,
                    evictable: false,
                    last_used_frame: self.frame,
                },
            );
        }
        self.index.insert(id, page);
        Ok(DeviceAllocation {
            id,
            page,
            offset: 0,
            size,
            memory_type: self.pages[page as usize].as_ref().unwrap().memory_type,
            dedicated: true,
        })
    }

    fn allocation(&self, id: AllocId, page: u32, offset: u64, size: u64) -> DeviceAllocation {
        DeviceAllocation {
            id,
            page,
            offset,
            size,
            memory_type: self.pages[page as usize].as_ref().unwrap().memory_type,
            dedicated: false,
        }
    }

    fn register(
        &mut self,
        id: AllocId,
        page: u32,
        offset: u64,
        size: u64,
        align: u64,
        priority: MemoryPriority,
    ) {
        let frame = self.frame;
        let p = self.pages[page as usize].as_mut().unwrap();
        p.live.insert(
            id,
            LiveAlloc {
                offset,
                size,
                align,
                priority,
                evictable: false,
                last_used_frame: frame,
            },
        );
        p.used += size;
        self.index.insert(id, page);
    }

    /// First-fit search across existing non-dedicated pages.
    fn place(
        &mut self,
        size: u64,
        align: u64,
        memory_type_mask: u32,
        exclude: Option<u32>,
    ) -> Option<(u32, u64)> {
        for idx in 0..self.pages.len() {
            if exclude == Some(idx as u32) {
                continue;
            }
            let fits = match self.pages[idx].as_ref() {
                Some(p) if !p.dedicated && (memory_type_mask >> p.memory_type) & 1 == 1 => true,
                _ => false,
            };
            if !fits {
                continue;
            }
            if let Some(offset) = self.try_fit(idx as u32, size, align) {
                return Some((idx as u32, offset));
            }
        }
        None
    }

    /// Carve `size` bytes out of a page's free list, honoring `align`.
    fn try_fit(&mut self, page: u32, size: u64, align: u64) -> Option<u64> {
        let p = self.pages[page as usize].as_mut()?;
        for i in 0..p.free.len() {
            let blk = p.free[i];
            let aligned = align_up(blk.offset, align);
            let pad = aligned - blk.offset;
            if pad + size > blk.size {
                continue;
            }
            let tail = blk.size - pad - size;
            p.free.remove(i);
            if pad > 0 {
                Self::insert_free(&mut p.free, blk.offset, pad);
            }
            if tail > 0 {
                Self::insert_free(&mut p.free, aligned + size, tail);
            }
            return Some(aligned);
        }
        None
    }

    /// Undo a `place` that was never registered (failed defrag copy).
    fn unplace(&mut self, page: u32, offset: u64, size: u64) {
        if let Some(p) = self.pages[page as usize].as_mut() {
            Self::insert_free(&mut p.free, offset, size);
        }
    }

    fn insert_free(free: &mut Vec<FreeBlock>, offset: u64, size: u64) {
        let pos = free.partition_point(|b| b.offset < offset);
        free.insert(pos, FreeBlock { offset, size });

        // Coalesce with the next block, then the previous one.
        if pos + 1 < free.len() && free[pos].offset + free[pos].size == free[pos + 1].offset {
            free[pos].size += free[pos + 1].size;
            free.remove(pos + 1);
        }
        if pos > 0 && free[pos - 1].offset + free[pos - 1].size == free[pos].offset {
            free[pos - 1].size += free[pos].size;
            free.remove(pos);
        }
    }

    fn pick_memory_type(&self, mask: u32) -> u32 {
        for page in self.pages.iter().flatten() {
            if !page.dedicated && (mask >> page.memory_type) & 1 == 1 {
                return page.memory_type;
            }
        }
        mask.trailing_zeros()
    }

    fn new_page(&mut self, size: u64, memory_type: u32, dedicated: bool) -> Result<u32> {
        let block = self.heap.alloc_block(size, memory_type)?;
        let page = Page {
            block,
            memory_type,
            size,
            used: 0,
            dedicated,
            free: vec![FreeBlock { offset: 0, size }],
            live: HashMap::new(),
        };
        match self.pages.iter().position(|slot| slot.is_none()) {
            Some(idx) => {
                self.pages[idx] = Some(page);
                Ok(idx as u32)
            }
            None => {
                self.pages.push(Some(page));
                Ok((self.pages.len() - 1) as u32)
            }
        }
    }

    fn evict_one(&mut self, id: AllocId, page_idx: u32) -> Result<()> {
        let (live, block, memory_type) = {
            let page = self.pages[page_idx as usize].as_ref().unwrap();
            (page.live[&id], page.block, page.memory_type)
        };
        let host_type = self.heap.host_memory_type();
        let host_block = self.heap.alloc_block(live.size, host_type)?;
        if let Err(e) = self
            .heap
            .copy(block, live.offset, host_block, 0, live.size)
        {
            self.heap.free_block(host_block);
            return Err(e);
        }

        let dedicated_empty = {
            let page = self.pages[page_idx as usize].as_mut().unwrap();
            page.live.remove(&id);
            Self::insert_free(&mut page.free, live.offset, live.size);
            page.used -= live.size;
            page.dedicated && page.used == 0
        };
        if dedicated_empty {
            let page = self.pages[page_idx as usize].take().unwrap();
            self.heap.free_block(page.block);
        }
        self.index.remove(&id);
        self.evicted.insert(
            id,
            EvictedAlloc {
                host_block,
                size: live.size,
                align: live.align,
                memory_type,
                priority: live.priority,
            },
        );
        log::debug!(
            "evicted allocation {id} ({} bytes, idle since frame {})",
            live.size,
            live.last_used_frame
        );
        Ok(())
    }

    fn release_empty_pages(&mut self) {
        for slot in self.pages.iter_mut() {
            let empty = matches!(slot, Some(p) if !p.dedicated && p.used == 0);
            if empty {
                let page = slot.take().unwrap();
                self.heap.free_block(page.block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory heap with an optional capacity cap, so out-of-memory paths
    /// and byte-accurate copies are observable.
    struct MockHeap {
        blocks: HashMap<u64, Vec<u8>>,
        next: u64,
        capacity: u64,
        allocated: u64,
    }

    impl MockHeap {
        fn new() -> Self {
            Self::with_capacity(u64::MAX)
        }

        fn with_capacity(capacity: u64) -> Self {
            Self {
                blocks: HashMap::new(),
                next: 1,
                capacity,
                allocated: 0,
            }
        }

        fn write(&mut self, block: BlockHandle, offset: u64, data: &[u8]) {
            let b = self.blocks.get_mut(&block.0).unwrap();
            b[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }

        fn read(&self, block: BlockHandle, offset: u64, len: usize) -> Vec<u8> {
            let b = &self.blocks[&block.0];
            b[offset as usize..offset as usize + len].to_vec()
        }
    }

    impl HeapBackend for MockHeap {
        fn alloc_block(&mut self, size: u64, _memory_type: u32) -> Result<BlockHandle> {
            if self.allocated + size > self.capacity {
                return Err(GPUError::OutOfMemory {
                    size,
                    memory_type_mask: 0,
                });
            }
            let id = self.next;
            self.next += 1;
            self.allocated += size;
            self.blocks.insert(id, vec![0u8; size as usize]);
            Ok(BlockHandle(id))
        }

        fn free_block(&mut self, block: BlockHandle) {
            if let Some(b) = self.blocks.remove(&block.0) {
                self.allocated -= b.len() as u64;
            }
        }

        fn copy(
            &mut self,
            src: BlockHandle,
            src_offset: u64,
            dst: BlockHandle,
            dst_offset: u64,
            size: u64,
        ) -> Result<()> {
            let data = self.read(src, src_offset, size as usize);
            self.write(dst, dst_offset, &data);
            Ok(())
        }

        fn host_memory_type(&self) -> u32 {
            31
        }
    }

    fn small_allocator() -> DeviceAllocator<MockHeap> {
        // 4 KiB pages, 1 KiB dedicated threshold keeps tests readable.
        DeviceAllocator::with_page_size(MockHeap::new(), 4096, 1024)
    }

    fn req(size: u64, align: u64) -> AllocationRequest {
        AllocationRequest {
            size,
            align,
            memory_type_mask: 1,
            priority: MemoryPriority::Normal,
        }
    }

    /// Exhaustive bookkeeping check: free list sorted and coalesced, live
    /// allocations disjoint from each other and from the free list, and the
    /// used counter exact.
    fn check_consistency(alloc: &DeviceAllocator<MockHeap>) {
        for page in alloc.pages.iter().flatten() {
            let mut spans: Vec<(u64, u64, bool)> = page
                .free
                .iter()
                .map(|b| (b.offset, b.size, false))
                .chain(page.live.values().map(|l| (l.offset, l.size, true)))
                .collect();
            spans.sort_by_key(|(o, _, _)| *o);
            let mut cursor = 0u64;
            let mut used = 0u64;
            for (offset, size, live) in spans {
                assert!(offset >= cursor, "overlapping spans in page");
                cursor = offset + size;
                if live {
                    used += size;
                }
            }
            assert!(cursor <= page.size);
            assert_eq!(used, page.used);
            for w in page.free.windows(2) {
                assert!(w[0].offset + w[0].size < w[1].offset, "uncoalesced free blocks");
            }
        }
    }

    #[test]
    fn free_then_allocate_reuses_region() {
        let mut alloc = small_allocator();
        let a = alloc.allocate(&req(256, 16)).unwrap();
        let first = (a.page, a.offset);
        alloc.free(a);
        let b = alloc.allocate(&req(256, 16)).unwrap();
        assert_eq!((b.page, b.offset), first);
        check_consistency(&alloc);
    }

    #[test]
    fn first_fit_packs_into_one_page() {
        let mut alloc = small_allocator();
        let mut handles = Vec::new();
        for _ in 0..8 {
            handles.push(alloc.allocate(&req(512, 1)).unwrap());
        }
        assert_eq!(alloc.page_count(), 1);
        // One more does not fit; a second page appears.
        handles.push(alloc.allocate(&req(512, 1)).unwrap());
        assert_eq!(alloc.page_count(), 2);
        check_consistency(&alloc);
        for h in handles {
            alloc.free(h);
        }
        alloc.end_frame(1);
        assert_eq!(alloc.page_count(), 0);
    }

    #[test]
    fn alignment_is_honored() {
        let mut alloc = small_allocator();
        let _a = alloc.allocate(&req(10, 1)).unwrap();
        let b = alloc.allocate(&req(64, 256)).unwrap();
        assert_eq!(b.offset % 256, 0);
        check_consistency(&alloc);
    }

    #[test]
    fn large_requests_get_dedicated_blocks() {
        let mut alloc = small_allocator();
        let a = alloc.allocate(&req(2048, 1)).unwrap();
        assert!(a.dedicated);
        let b = alloc.allocate(&req(64, 1)).unwrap();
        assert!(!b.dedicated);
        assert_ne!(a.page, b.page);
        alloc.free(a);
        // The dedicated page is gone immediately; the shared page remains.
        assert_eq!(alloc.page_count(), 1);
        check_consistency(&alloc);
    }

    #[test]
    fn coalescing_allows_big_refill() {
        let mut alloc = small_allocator();
        let a = alloc.allocate(&req(1024, 1)).unwrap();
        let b = alloc.allocate(&req(1024, 1)).unwrap();
        let c = alloc.allocate(&req(1024, 1)).unwrap();
        alloc.free(a);
        alloc.free(b);
        // a+b coalesce into one 2048-byte hole in front of c.
        let d = alloc.allocate(&req(1024 + 1024, 1)).unwrap();
        assert_eq!(d.offset, 0);
        assert_eq!(d.page, c.page);
        check_consistency(&alloc);
    }

    #[test]
    fn out_of_memory_is_reported_not_panicked() {
        let heap = MockHeap::with_capacity(4096);
        let mut alloc = DeviceAllocator::with_page_size(heap, 4096, 1024);
        let _a = alloc.allocate(&req(512, 1)).unwrap();
        let err = alloc.allocate(&req(4000, 1)).unwrap_err();
        assert!(matches!(err, GPUError::OutOfMemory { .. }));
    }

    #[test]
    fn randomized_churn_never_overlaps() {
        let mut alloc = small_allocator();
        let mut live: Vec<DeviceAllocation> = Vec::new();
        // Deterministic pseudo-random walk.
        let mut state = 0x12345678u64;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for _ in 0..500 {
            if rand() % 3 != 0 || live.is_empty() {
                let size = (rand() % 700 + 1) as u64;
                let align = 1u64 << (rand() % 6);
                if let Ok(a) = alloc.allocate(&req(size, align)) {
                    live.push(a);
                }
            } else {
                let idx = (rand() as usize) % live.len();
                alloc.free(live.swap_remove(idx));
            }
            check_consistency(&alloc);
        }
    }

    #[test]
    fn eviction_roundtrip_preserves_bytes() {
        let mut alloc = small_allocator();
        let a = alloc.allocate(&req(256, 1)).unwrap();
        let block = alloc.block_of(&a).unwrap();
        let payload: Vec<u8> = (0..256).map(|i| i as u8).collect();
        alloc.heap_mut().write(block, a.offset, &payload);

        alloc.mark_evictable(&a, true);
        alloc.end_frame(10);
        let evicted = alloc.evict_cold(5).unwrap();
        assert_eq!(evicted, vec![a.id]);
        assert!(alloc.is_evicted(&a));

        let restored = alloc.restore(&a).unwrap();
        assert_eq!(restored.id, a.id);
        assert!(!alloc.is_evicted(&restored));
        let block = alloc.block_of(&restored).unwrap();
        assert_eq!(
            alloc.heap().read(block, restored.offset, 256),
            payload
        );
        check_consistency(&alloc);
    }

    #[test]
    fn dedicated_allocations_can_be_evicted_and_restored() {
        let mut alloc = small_allocator();
        let a = alloc.allocate(&req(2048, 1)).unwrap();
        assert!(a.dedicated);
        alloc.mark_evictable(&a, true);
        alloc.end_frame(10);
        assert_eq!(alloc.evict_cold(5).unwrap(), vec![a.id]);
        // The dedicated block is released as soon as its contents move out.
        assert_eq!(alloc.page_count(), 0);
        let restored = alloc.restore(&a).unwrap();
        assert!(restored.dedicated);
        assert_eq!(restored.id, a.id);
        check_consistency(&alloc);
    }

    #[test]
    fn recently_used_allocations_stay_resident() {
        let mut alloc = small_allocator();
        let a = alloc.allocate(&req(128, 1)).unwrap();
        alloc.mark_evictable(&a, true);
        alloc.end_frame(10);
        alloc.note_access(&a);
        let evicted = alloc.evict_cold(5).unwrap();
        assert!(evicted.is_empty());
    }

    struct RecordingMover {
        moves: Vec<(DeviceAllocation, DeviceAllocation)>,
    }

    impl AllocationMover for RecordingMover {
        fn relocate(&mut self, from: &DeviceAllocation, to: &DeviceAllocation) {
            self.moves.push((*from, *to));
        }
    }

    #[test]
    fn defragment_compacts_sparse_pages() {
        let mut alloc = small_allocator();
        // Fill two pages, then free most of the second so it goes sparse.
        let mut first_page = Vec::new();
        for _ in 0..8 {
            first_page.push(alloc.allocate(&req(512, 1)).unwrap());
        }
        let keep = alloc.allocate(&req(512, 1)).unwrap();
        let drop0 = alloc.allocate(&req(512, 1)).unwrap();
        assert_eq!(alloc.page_count(), 2);

        // Open a hole in page 0 so the survivor has somewhere to go.
        alloc.free(first_page.pop().unwrap());
        alloc.free(drop0);

        let block = alloc.block_of(&keep).unwrap();
        alloc.heap_mut().write(block, keep.offset, &[0xAB; 512]);

        let mut mover = RecordingMover { moves: Vec::new() };
        let moved = alloc.defragment(&mut mover);
        assert_eq!(moved, 1);
        assert_eq!(mover.moves.len(), 1);
        let (from, to) = mover.moves[0];
        assert_eq!(from.id, keep.id);
        assert_ne!(from.page, to.page);

        // Bytes travelled with the move and the sparse page was released.
        let block = alloc.block_of(&to).unwrap();
        assert_eq!(alloc.heap().read(block, to.offset, 512), vec![0xAB; 512]);
        assert_eq!(alloc.page_count(), 1);
        check_consistency(&alloc);
    }

    #[test]
    fn lock_free_roundtrip_is_stable_over_many_cycles() {
        // Repeated allocate/free of the same shape must not grow bookkeeping.
        let mut alloc = small_allocator();
        let probe = alloc.allocate(&req(64, 16)).unwrap();
        let expected = (probe.page, probe.offset);
        alloc.free(probe);
        for _ in 0..100 {
            let a = alloc.allocate(&req(64, 16)).unwrap();
            assert_eq!((a.page, a.offset), expected);
            alloc.free(a);
        }
        check_consistency(&alloc);
    }
}
