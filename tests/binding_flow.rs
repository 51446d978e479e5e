//! End-to-end flow over the device-independent layer: allocate backing
//! memory, write through a lock-shaped sequence, build a descriptor layout
//! from reflection, and verify the patched bytecode agrees with the final
//! binding assignment.

use std::collections::HashMap;

use koji::gpu::allocator::{
    AllocationRequest, BlockHandle, DeviceAllocator, HeapBackend,
};
use koji::gpu::error::{GPUError, Result};
use koji::gpu::layout::{
    DescriptorBinding, DescriptorKind, DeviceBindingLimits, LayoutBuilder, LayoutCache,
    LayoutPolicy,
};
use koji::gpu::reclaim::{DeletionQueue, ZombieHandle};
use koji::gpu::reflect::{
    name_hash, patch_spirv_bindings, BindingKind, ReflectedBinding, StageMask, StageReflection,
    WordPatchLocation,
};
use koji::gpu::structs::MemoryPriority;

struct MemHeap {
    blocks: HashMap<u64, Vec<u8>>,
    next: u64,
}

impl MemHeap {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            next: 1,
        }
    }
}

impl HeapBackend for MemHeap {
    fn alloc_block(&mut self, size: u64, _memory_type: u32) -> Result<BlockHandle> {
        let id = self.next;
        self.next += 1;
        self.blocks.insert(id, vec![0u8; size as usize]);
        Ok(BlockHandle(id))
    }

    fn free_block(&mut self, block: BlockHandle) {
        self.blocks.remove(&block.0);
    }

    fn copy(
        &mut self,
        src: BlockHandle,
        src_offset: u64,
        dst: BlockHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let data = self.blocks[&src.0][src_offset as usize..(src_offset + size) as usize].to_vec();
        self.blocks.get_mut(&dst.0).unwrap()[dst_offset as usize..(dst_offset + size) as usize]
            .copy_from_slice(&data);
        Ok(())
    }

    fn host_memory_type(&self) -> u32 {
        31
    }
}

#[test]
fn uniform_buffer_bind_slot_matches_patched_bytecode() {
    // A 256-byte uniform buffer, written through a lock/unlock-shaped
    // sequence against the allocator's backing memory.
    let mut allocator = DeviceAllocator::with_page_size(MemHeap::new(), 4096, 1024);
    let allocation = allocator
        .allocate(&AllocationRequest {
            size: 256,
            align: 256,
            memory_type_mask: 1,
            priority: MemoryPriority::Normal,
        })
        .unwrap();
    let block = allocator.block_of(&allocation).unwrap();
    let payload: Vec<u8> = (0..=255u8).collect();
    allocator
        .heap_mut()
        .blocks
        .get_mut(&block.0)
        .unwrap()[allocation.offset as usize..allocation.offset as usize + 256]
        .copy_from_slice(&payload);

    // Layout: two hand-authored bindings occupy slots 0 and 1 of set 0, so
    // the reflected uniform (shader-local index 0) must land at binding 2.
    let mut builder = LayoutBuilder::new(
        "per_draw",
        LayoutPolicy::default(),
        DeviceBindingLimits::default(),
    );
    builder.add_binding(
        0,
        DescriptorBinding {
            binding: 0,
            kind: DescriptorKind::StorageBuffer,
            stages: StageMask::VERTEX,
            ..Default::default()
        },
    );
    builder.add_binding(
        0,
        DescriptorBinding {
            binding: 1,
            kind: DescriptorKind::CombinedImageSampler,
            stages: StageMask::VERTEX,
            ..Default::default()
        },
    );

    let reflection = StageReflection {
        stage: StageMask::VERTEX,
        bindings: vec![ReflectedBinding {
            name_hash: name_hash("per_draw"),
            kind: BindingKind::UniformBuffer,
            slot: 0,
            patch: WordPatchLocation {
                set_word: 10,
                binding_word: 11,
            },
            ..Default::default()
        }],
    };

    let cache = LayoutCache::new();
    let info = cache.get_or_insert(
        builder
            .finalize_bindings(&[reflection.clone()], &[])
            .unwrap(),
    );

    let (set, binding) = info.remap.lookup(StageMask::VERTEX, 0).unwrap();
    assert_eq!((set, binding), (0, 2));

    // The bytecode literals must agree with the remap table exactly.
    let mut words = vec![0u32; 32];
    patch_spirv_bindings(&mut words, &reflection, &info.remap).unwrap();
    assert_eq!(words[10], set);
    assert_eq!(words[11], binding);

    // The written bytes are still intact in the bound region.
    assert_eq!(
        &allocator.heap().blocks[&block.0]
            [allocation.offset as usize..allocation.offset as usize + 256],
        payload.as_slice()
    );

    allocator.free(allocation);
}

#[test]
fn shared_layout_survives_resource_churn() {
    // Two structurally identical "shaders" must resolve to one cached
    // layout no matter how many resources come and go in between.
    let cache = LayoutCache::new();
    let builder = LayoutBuilder::new(
        "material",
        LayoutPolicy::default(),
        DeviceBindingLimits::default(),
    );
    let stages = vec![StageReflection {
        stage: StageMask::FRAGMENT,
        bindings: vec![ReflectedBinding {
            name_hash: name_hash("albedo"),
            kind: BindingKind::CombinedImageSampler,
            slot: 0,
            ..Default::default()
        }],
    }];

    let first = cache.get_or_insert(builder.finalize_bindings(&stages, &[]).unwrap());

    let mut allocator = DeviceAllocator::with_page_size(MemHeap::new(), 4096, 1024);
    for _ in 0..32 {
        let a = allocator
            .allocate(&AllocationRequest {
                size: 128,
                align: 16,
                memory_type_mask: 1,
                priority: MemoryPriority::Normal,
            })
            .unwrap();
        allocator.free(a);
    }

    let second = cache.get_or_insert(builder.finalize_bindings(&stages, &[]).unwrap());
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);
}

#[test]
fn destruction_is_gated_on_fence_progress() {
    // Simulated frame loop: a resource destroyed at generation 3 must not
    // be reclaimed while the mock fence has only reached generation 2.
    use ash::vk::Handle as _;

    let queue = DeletionQueue::new();
    let mut destroyed: Vec<u64> = Vec::new();

    let submit_generation = 3u64;
    queue.enqueue(
        ZombieHandle::Buffer(ash::vk::Buffer::from_raw(42)),
        submit_generation,
    );

    for completed in 0..=2u64 {
        queue.collect(completed, |z| {
            if let ZombieHandle::Buffer(b) = z {
                destroyed.push(b.as_raw());
            }
        });
        assert!(destroyed.is_empty(), "destroyed before fence completion");
    }

    queue.collect(3, |z| {
        if let ZombieHandle::Buffer(b) = z {
            destroyed.push(b.as_raw());
        }
    });
    assert_eq!(destroyed, vec![42]);
}

#[test]
fn out_of_memory_recovers_after_defragmentation() {
    use koji::gpu::allocator::{AllocationMover, DeviceAllocation};

    struct NullMover;
    impl AllocationMover for NullMover {
        fn relocate(&mut self, _from: &DeviceAllocation, _to: &DeviceAllocation) {}
    }

    // Heap capped at two pages; fragment both, then recover via defrag.
    struct CappedHeap {
        inner: MemHeap,
        budget: u64,
        used: u64,
    }
    impl HeapBackend for CappedHeap {
        fn alloc_block(&mut self, size: u64, memory_type: u32) -> Result<BlockHandle> {
            if self.used + size > self.budget {
                return Err(GPUError::OutOfMemory {
                    size,
                    memory_type_mask: 1 << memory_type,
                });
            }
            self.used += size;
            self.inner.alloc_block(size, memory_type)
        }
        fn free_block(&mut self, block: BlockHandle) {
            if let Some(b) = self.inner.blocks.get(&block.0) {
                self.used -= b.len() as u64;
            }
            self.inner.free_block(block);
        }
        fn copy(
            &mut self,
            src: BlockHandle,
            src_offset: u64,
            dst: BlockHandle,
            dst_offset: u64,
            size: u64,
        ) -> Result<()> {
            self.inner.copy(src, src_offset, dst, dst_offset, size)
        }
        fn host_memory_type(&self) -> u32 {
            self.inner.host_memory_type()
        }
    }

    let heap = CappedHeap {
        inner: MemHeap::new(),
        budget: 8192,
        used: 0,
    };
    let mut allocator = DeviceAllocator::with_page_size(heap, 4096, 4096);

    let req = |size| AllocationRequest {
        size,
        align: 1,
        memory_type_mask: 1,
        priority: MemoryPriority::Normal,
    };

    // Page 1: keep one allocation, free the rest.
    let keep_a = allocator.allocate(&req(1024)).unwrap();
    let drop_a = allocator.allocate(&req(3072)).unwrap();
    // Page 2: same shape.
    let drop_b = allocator.allocate(&req(3072)).unwrap();
    let keep_b = allocator.allocate(&req(1024)).unwrap();
    allocator.free(drop_a);
    allocator.free(drop_b);

    // Both pages are half-empty but no third page fits under the cap.
    let err = allocator.allocate(&req(4000)).unwrap_err();
    assert!(matches!(err, GPUError::OutOfMemory { .. }));

    // Defragmentation packs the survivors together and frees a page.
    let moved = allocator.defragment(&mut NullMover);
    assert!(moved >= 1);
    let retry = allocator.allocate(&req(4000));
    assert!(retry.is_ok(), "allocation should succeed after compaction");

    allocator.free(keep_a);
    allocator.free(keep_b);
    allocator.free(retry.unwrap());
}
