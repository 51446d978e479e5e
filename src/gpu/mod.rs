pub mod allocator;
pub mod error;
pub mod layout;
pub mod reclaim;
pub mod reflect;
pub mod renderpass;
pub mod resource;
pub mod structs;
pub mod transient;
pub mod vulkan;

pub use allocator::{
    AllocationMover, AllocationRequest, BlockHandle, DeviceAllocation, DeviceAllocator,
    HeapBackend, DEDICATED_THRESHOLD, PAGE_SIZE,
};
pub use error::{GPUError, Result};
pub use layout::{
    BindingRemap, DescriptorBinding, DescriptorKind, DescriptorSetLayoutInfo, DeviceBindingLimits,
    DynamicBufferPolicy, ImmutableSamplerBinding, LayoutBuilder, LayoutCache, LayoutPolicy,
    PipelineLayoutInfo, PushConstantRange, RemapEntry, SetLayout, SetPlacement, StageRemap,
};
pub use reclaim::{DeletionQueue, ZombieHandle};
pub use reflect::{
    name_hash, patch_spirv_bindings, BindingKind, PatchCache, ReflectedBinding, ShaderStage,
    StageMask, StageReflection, WordPatchLocation,
};
pub use renderpass::{
    build_render_pass_description, AttachmentRef, DeviceCaps, PassHint, RenderPassCache,
    RenderPassDescription, RenderTargetLayout, SubpassDependencyDesc, SubpassDesc,
};
pub use resource::{max_mip_levels, Buffer, BufferView, Image, ImageViewKey, LockMode, Sampler};
pub use structs::*;
pub use transient::{RingArena, RingSlice};
pub use vulkan::*;
