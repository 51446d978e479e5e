use std::collections::HashMap;

use ash::vk;

use crate::gpu::allocator::{BlockHandle, HeapBackend};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::MemoryVisibility;

struct MemoryBlock {
    memory: vk::DeviceMemory,
    size: u64,
    /// Base of the host mapping; null for device-local blocks.
    mapped: *mut u8,
    /// Full-size transfer buffer aliasing the block, so eviction and
    /// defragmentation copies can run through the transfer queue even for
    /// memory that is not host visible.
    transfer: vk::Buffer,
}

/// [`HeapBackend`] over raw `vkAllocateMemory` blocks.
pub struct VulkanHeap {
    device: ash::Device,
    props: vk::PhysicalDeviceMemoryProperties,
    blocks: HashMap<u64, MemoryBlock>,
    next: u64,
    queue: vk::Queue,
    cmd_pool: vk::CommandPool,
    cmd_buf: vk::CommandBuffer,
    fence: vk::Fence,
}

unsafe impl Send for VulkanHeap {}

impl VulkanHeap {
    pub(super) fn new(
        device: ash::Device,
        props: vk::PhysicalDeviceMemoryProperties,
        queue: vk::Queue,
        queue_family: u32,
    ) -> Result<Self> {
        let cmd_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .build(),
                None,
            )?
        };
        let cmd_buf = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(cmd_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )?[0]
        };
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder().build(), None)? };
        Ok(Self {
            device,
            props,
            blocks: HashMap::new(),
            next: 1,
            queue,
            cmd_pool,
            cmd_buf,
            fence,
        })
    }

    /// Bitmask of memory types that satisfy `type_bits` and the requested
    /// visibility. Feeds the allocator's `memory_type_mask`.
    pub fn memory_type_mask(&self, type_bits: u32, visibility: MemoryVisibility) -> u32 {
        let required = match visibility {
            MemoryVisibility::Gpu => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryVisibility::CpuAndGpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let mut mask = 0u32;
        for i in 0..self.props.memory_type_count {
            if (type_bits >> i) & 1 == 1
                && self.props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
            {
                mask |= 1 << i;
            }
        }
        // Fall back to any compatible type rather than failing outright.
        if mask == 0 {
            mask = type_bits;
        }
        mask
    }

    pub fn memory_of(&self, block: BlockHandle) -> Option<vk::DeviceMemory> {
        self.blocks.get(&block.0).map(|b| b.memory)
    }

    pub fn mapped_of(&self, block: BlockHandle) -> *mut u8 {
        self.blocks
            .get(&block.0)
            .map_or(std::ptr::null_mut(), |b| b.mapped)
    }

    pub(super) fn destroy(&mut self) {
        unsafe {
            for (_, block) in self.blocks.drain() {
                self.device.destroy_buffer(block.transfer, None);
                if !block.mapped.is_null() {
                    self.device.unmap_memory(block.memory);
                }
                self.device.free_memory(block.memory, None);
            }
            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.cmd_pool, None);
        }
    }

    fn host_visible(&self, memory_type: u32) -> bool {
        self.props.memory_types[memory_type as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn transfer_copy(
        &mut self,
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        unsafe {
            self.device.begin_command_buffer(
                self.cmd_buf,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )?;
            self.device.cmd_copy_buffer(
                self.cmd_buf,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                }],
            );
            self.device.end_command_buffer(self.cmd_buf)?;
            self.device.queue_submit(
                self.queue,
                &[vk::SubmitInfo::builder()
                    .command_buffers(&[self.cmd_buf])
                    .build()],
                self.fence,
            )?;
            self.device
                .wait_for_fences(&[self.fence], true, u64::MAX)?;
            self.device.reset_fences(&[self.fence])?;
            self.device
                .reset_command_buffer(self.cmd_buf, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }
}

impl HeapBackend for VulkanHeap {
    fn alloc_block(&mut self, size: u64, memory_type: u32) -> Result<BlockHandle> {
        let memory = unsafe {
            self.device.allocate_memory(
                &vk::MemoryAllocateInfo::builder()
                    .allocation_size(size)
                    .memory_type_index(memory_type)
                    .build(),
                None,
            )
        }
        .map_err(|res| match res {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GPUError::OutOfMemory {
                    size,
                    memory_type_mask: 1 << memory_type,
                }
            }
            other => GPUError::Vulkan(other),
        })?;

        let mapped = if self.host_visible(memory_type) {
            unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
                    as *mut u8
            }
        } else {
            std::ptr::null_mut()
        };

        let transfer = unsafe {
            let buf = self.device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size)
                    .usage(
                        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                None,
            )?;
            self.device.bind_buffer_memory(buf, memory, 0)?;
            buf
        };

        let id = self.next;
        self.next += 1;
        self.blocks.insert(
            id,
            MemoryBlock {
                memory,
                size,
                mapped,
                transfer,
            },
        );
        Ok(BlockHandle(id))
    }

    fn free_block(&mut self, block: BlockHandle) {
        if let Some(block) = self.blocks.remove(&block.0) {
            unsafe {
                self.device.destroy_buffer(block.transfer, None);
                if !block.mapped.is_null() {
                    self.device.unmap_memory(block.memory);
                }
                self.device.free_memory(block.memory, None);
            }
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
        let (src_block, dst_block) = match (self.blocks.get(&src.0), self.blocks.get(&dst.0)) {
            (Some(s), Some(d)) => (s, d),
            _ => return Err(GPUError::InvalidHandle),
        };
        debug_assert!(src_offset + size <= src_block.size);
        debug_assert!(dst_offset + size <= dst_block.size);

        if !src_block.mapped.is_null() && !dst_block.mapped.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src_block.mapped.add(src_offset as usize),
                    dst_block.mapped.add(dst_offset as usize),
                    size as usize,
                );
            }
            return Ok(());
        }

        let (src_buf, dst_buf) = (src_block.transfer, dst_block.transfer);
        self.transfer_copy(src_buf, src_offset, dst_buf, dst_offset, size)
    }

    fn host_memory_type(&self) -> u32 {
        for i in 0..self.props.memory_type_count {
            let flags = self.props.memory_types[i as usize].property_flags;
            if flags.contains(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ) && !flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            {
                return i;
            }
        }
        // Unified-memory devices: every type is device local.
        for i in 0..self.props.memory_type_count {
            if self.props.memory_types[i as usize]
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            {
                return i;
            }
        }
        0
    }
}
