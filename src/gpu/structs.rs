use crate::utils::Handle;
use bitflags::bitflags;

#[cfg(feature = "koji-serde")]
use serde::{Deserialize, Serialize};

use super::resource::Image;

#[repr(C)]
#[derive(Default, Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum MemoryVisibility {
    Gpu,
    #[default]
    CpuAndGpu,
}

/// Hint passed through to the allocator; low priority allocations are the
/// first eviction candidates under memory pressure.
#[repr(C)]
#[derive(Default, Hash, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum MemoryPriority {
    Low,
    #[default]
    Normal,
    High,
}

bitflags! {
    /// What a buffer may be used as. Fixed at creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX       = 1 << 0;
        const INDEX        = 1 << 1;
        const UNIFORM      = 1 << 2;
        const STORAGE      = 1 << 3;
        const INDIRECT     = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

bitflags! {
    /// What an image may be used as. Fixed at creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        const SAMPLED          = 1 << 0;
        const STORAGE          = 1 << 1;
        const COLOR_TARGET     = 1 << 2;
        const DEPTH_TARGET     = 1 << 3;
        const INPUT_ATTACHMENT = 1 << 4;
        const TRANSFER_SRC     = 1 << 5;
        const TRANSFER_DST     = 1 << 6;
    }
}

#[repr(C)]
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum Format {
    R8Sint,
    R8Uint,
    RG8Unorm,
    BGRA8,
    #[default]
    RGBA8,
    RGBA8Unorm,
    RG16F,
    RGBA16F,
    R32F,
    RGBA32F,
    D24S8,
    D32F,
}

impl Format {
    pub fn is_depth(&self) -> bool {
        matches!(self, Format::D24S8 | Format::D32F)
    }
}

#[repr(C)]
#[derive(Hash, Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum LoadOp {
    Load,
    Clear,
    #[default]
    DontCare,
}

#[repr(C)]
#[derive(Hash, Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum StoreOp {
    Store,
    #[default]
    DontCare,
}

#[repr(C)]
#[derive(Hash, Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum SampleCount {
    #[default]
    S1,
    S2,
    S4,
}

#[repr(C)]
#[derive(Hash, Clone, Debug, Default, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum AspectMask {
    #[default]
    Color,
    Depth,
    Stencil,
    DepthStencil,
}

#[derive(Debug, Hash, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Hash, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub struct Rect2D {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum SamplerMipmapMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum BorderColor {
    OpaqueBlack,
    OpaqueWhite,
    TransparentBlack,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub struct SamplerInfo {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub border_color: BorderColor,
    pub unnormalized_coordinates: bool,
    pub compare_enable: bool,
    pub mipmap_mode: SamplerMipmapMode,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        SamplerInfo {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
            border_color: BorderColor::OpaqueBlack,
            unnormalized_coordinates: false,
            compare_enable: false,
            mipmap_mode: SamplerMipmapMode::Linear,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferInfo<'a> {
    pub debug_name: &'a str,
    pub byte_size: u64,
    pub visibility: MemoryVisibility,
    pub usage: BufferUsage,
    pub priority: MemoryPriority,
    /// Per-frame transient data: backed by the ring arena instead of a
    /// persistent allocation, rebound on every lock.
    pub volatile: bool,
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> Default for BufferInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            byte_size: 1024,
            visibility: MemoryVisibility::CpuAndGpu,
            usage: BufferUsage::UNIFORM,
            priority: MemoryPriority::Normal,
            volatile: false,
            initial_data: None,
        }
    }
}

/// Valid ranges: every entry of `dim` ≥ 1; `layers` ≥ 1;
/// `mip_levels` ≤ floor(log2(max dimension)) + 1.
#[derive(Clone, Copy, Debug)]
pub struct ImageInfo<'a> {
    pub debug_name: &'a str,
    pub dim: [u32; 3],
    pub layers: u32,
    pub format: Format,
    pub mip_levels: u32,
    pub samples: SampleCount,
    pub usage: ImageUsage,
    pub priority: MemoryPriority,
    pub initial_data: Option<&'a [u8]>,
}

impl<'a> Default for ImageInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            dim: [1, 1, 1],
            layers: 1,
            format: Format::RGBA8,
            mip_levels: 1,
            samples: SampleCount::S1,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            priority: MemoryPriority::Normal,
            initial_data: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageViewInfo<'a> {
    pub debug_name: &'a str,
    pub img: Handle<Image>,
    /// `None` reuses the image's own format.
    pub format: Option<Format>,
    pub mip_base: u32,
    pub mip_count: u32,
    pub layer_base: u32,
    pub layer_count: u32,
    pub aspect: AspectMask,
}

impl<'a> Default for ImageViewInfo<'a> {
    fn default() -> Self {
        Self {
            debug_name: "",
            img: Default::default(),
            format: None,
            mip_base: 0,
            mip_count: 1,
            layer_base: 0,
            layer_count: 1,
            aspect: AspectMask::Color,
        }
    }
}

#[derive(Default, Clone, Copy, Debug)]
pub struct ContextInfo {
    pub device_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0.0, 0.0, 0.0, 1.0])
    }
}

#[derive(Hash, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub struct AttachmentDescription {
    pub format: Format,
    pub samples: SampleCount,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
}
