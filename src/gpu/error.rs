use ash::vk;
use thiserror::Error;

pub type Result<T, E = GPUError> = std::result::Result<T, E>;

/// Error taxonomy for the resource/binding layer.
///
/// Configuration errors (`LayoutLimit`, `CapabilityMismatch`,
/// `InvalidRenderTarget`) are fatal at build time and carry the identity of
/// the offending layout. `OutOfMemory` is the one recoverable class: the
/// caller may defragment/evict and retry, or drop the request. Lifetime
/// violations have no variant here on purpose; destruction is always routed
/// through the reclaim queue, and breaking that invariant is a bug, not an
/// error value.
#[derive(Debug, Error)]
pub enum GPUError {
    #[error("device out of memory allocating {size} bytes (memory type mask {memory_type_mask:#x})")]
    OutOfMemory { size: u64, memory_type_mask: u32 },

    #[error("descriptor layout `{layout}` exceeds device limit: {limit} allows {max}, layout uses {requested}")]
    LayoutLimit {
        layout: String,
        limit: &'static str,
        max: u32,
        requested: u32,
    },

    #[error("device lacks required capability: {0}")]
    CapabilityMismatch(&'static str),

    #[error("invalid render target layout: {0}")]
    InvalidRenderTarget(&'static str),

    #[error("invalid resource descriptor: {0}")]
    InvalidDescriptor(&'static str),

    #[error("stale or invalid handle")]
    InvalidHandle,

    #[error("buffer `{0}` is not backed by host-visible memory")]
    NotHostVisible(String),

    #[error("resource `{0}` is already locked")]
    LockConflict(String),

    #[error("binding patch word {word} out of range for shader of {len} words")]
    PatchOutOfRange { word: usize, len: usize },

    #[error("shader-local binding {slot} has no slot in the pipeline layout")]
    UnmappedBinding { slot: u32 },

    #[error("ran out of handle slots")]
    SlotError,

    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("vulkan loading error: {0}")]
    Loading(#[from] ash::LoadingError),
}
