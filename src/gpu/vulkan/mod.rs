use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle as VkRawHandle;
use ash::Entry;

use crate::utils::{Handle, PerFrame, Pool};

use super::allocator::{
    AllocationMover, AllocationRequest, DeviceAllocation, DeviceAllocator,
};
use super::error::{GPUError, Result};
use super::layout::{
    DescriptorSetLayoutInfo, DeviceBindingLimits, ImmutableSamplerBinding, LayoutBuilder,
    LayoutCache, LayoutPolicy, PipelineLayoutInfo, PushConstantRange,
};
use super::reclaim::{DeletionQueue, ZombieHandle};
use super::reflect::{PatchCache, StageReflection};
use super::renderpass::{DeviceCaps, RenderPassCache, RenderPassDescription, RenderTargetLayout};
use super::resource::{Buffer, BufferView, Image, ImageViewKey, LockMode, Sampler};
use super::structs::*;
use super::transient::RingArena;

pub mod conversions;
pub mod memory;

pub use conversions::*;
use memory::VulkanHeap;

/// Size of the ring-buffer arena backing volatile resources.
const TRANSIENT_ARENA_SIZE: u64 = 8 << 20;

pub const DEBUG_LAYER_NAMES: [*const c_char; 1] =
    [b"VK_LAYER_KHRONOS_validation\0".as_ptr() as *const c_char];

#[derive(Default, Clone, Copy)]
struct Queue {
    queue: vk::Queue,
    family: u32,
}

#[derive(Copy, Clone, Default)]
pub struct Semaphore {
    raw: vk::Semaphore,
}

/// Point on the submission timeline; compare against the context's
/// completed generation or pass to [`Context::wait`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncPoint {
    pub generation: u64,
}

struct InFlightSubmit {
    fence: vk::Fence,
    generation: u64,
}

/// Driver-level realization of one deduplicated descriptor layout: the
/// `vk::DescriptorSetLayout` per set plus the pool descriptor sets are
/// allocated from. Shared by every shader whose binding tables hash and
/// compare equal.
pub struct BindGroupLayout {
    pub(crate) info: Arc<DescriptorSetLayoutInfo>,
    pub(crate) raw_sets: Vec<vk::DescriptorSetLayout>,
    pub(crate) pool: vk::DescriptorPool,
}

pub struct BindGroup {
    pub(crate) set: vk::DescriptorSet,
    pub(crate) set_id: u32,
    pub(crate) layout: Handle<BindGroupLayout>,
}

pub struct PipelineLayout {
    pub(crate) info: PipelineLayoutInfo,
    pub(crate) raw: vk::PipelineLayout,
}

pub struct RenderPass {
    pub(crate) raw: vk::RenderPass,
    pub(crate) desc: Arc<RenderPassDescription>,
}

pub struct Framebuffer {
    pub(crate) raw: vk::Framebuffer,
    pub(crate) render_pass: Handle<RenderPass>,
    pub(crate) extent: Extent,
}

/// A resource as it appears in a descriptor write.
#[derive(Clone, Copy, Debug)]
pub enum ShaderResource {
    UniformBuffer(BufferView),
    StorageBuffer(BufferView),
    SampledImage(Handle<Image>, ImageViewKey, Handle<Sampler>),
    StorageImage(Handle<Image>, ImageViewKey),
    InputAttachment(Handle<Image>, ImageViewKey),
}

#[derive(Clone, Copy, Debug)]
pub struct BindingInfo {
    pub binding: u32,
    pub resource: ShaderResource,
}

pub struct BindGroupInfo<'a> {
    pub debug_name: &'a str,
    pub layout: Handle<BindGroupLayout>,
    pub set: u32,
    pub bindings: &'a [BindingInfo],
}

pub struct BindGroupLayoutInfo<'a> {
    pub debug_name: &'a str,
    pub stages: &'a [StageReflection],
    pub immutable_samplers: &'a [ImmutableSamplerBinding],
    pub policy: LayoutPolicy,
}

#[derive(Clone, Copy)]
pub struct FramebufferAttachment {
    pub image: Handle<Image>,
    pub view: ImageViewKey,
}

pub struct FramebufferInfo<'a> {
    pub debug_name: &'a str,
    pub render_pass: Handle<RenderPass>,
    pub attachments: &'a [FramebufferAttachment],
    pub extent: Extent,
}

pub struct SubmitInfo<'a> {
    pub wait_sems: &'a [Handle<Semaphore>],
    pub signal_sems: &'a [Handle<Semaphore>],
}

impl<'a> Default for SubmitInfo<'a> {
    fn default() -> Self {
        Self {
            wait_sems: &[],
            signal_sems: &[],
        }
    }
}

pub struct RenderPassBegin<'a> {
    pub render_pass: Handle<RenderPass>,
    pub framebuffer: Handle<Framebuffer>,
    pub render_area: Rect2D,
    pub clear_values: &'a [ClearValue],
}

#[derive(Default, Clone, Copy)]
pub struct Draw {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Default, Clone, Copy)]
pub struct DrawIndexed {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[derive(Clone, Copy)]
pub struct CopyBuffer {
    pub src: BufferView,
    pub dst: BufferView,
    pub amount: u64,
}

/// Per-thread/per-queue recording surface. Operations execute in recorded
/// order within one list; across lists only the submission/semaphore graph
/// orders anything.
pub struct CommandList {
    cmd_buf: vk::CommandBuffer,
    recording: bool,
    in_render_pass: bool,
    touched_buffers: Vec<Handle<Buffer>>,
    touched_images: Vec<Handle<Image>>,
    debug_name: String,
}

#[derive(Clone, Copy)]
enum ResourceRef {
    Buffer(Handle<Buffer>),
    Image(Handle<Image>),
}

#[derive(Default)]
struct MoveRecorder {
    moves: Vec<(DeviceAllocation, DeviceAllocation)>,
}

impl AllocationMover for MoveRecorder {
    fn relocate(&mut self, from: &DeviceAllocation, to: &DeviceAllocation) {
        self.moves.push((*from, *to));
    }
}

/// The device context: owns the driver objects, the allocator, every cache,
/// and the reclamation queue. What the original design kept in process-wide
/// singletons lives here explicitly.
pub struct Context {
    entry: Entry,
    instance: ash::Instance,
    pdevice: vk::PhysicalDevice,
    device: ash::Device,
    properties: vk::PhysicalDeviceProperties,
    gfx_queue: Queue,

    allocator: DeviceAllocator<VulkanHeap>,
    binding_limits: DeviceBindingLimits,
    caps: DeviceCaps,
    allow_shading_rate: bool,

    layout_cache: LayoutCache,
    patch_cache: PatchCache,
    render_pass_cache: RenderPassCache,
    reclaim: DeletionQueue,

    buffers: Pool<Buffer>,
    images: Pool<Image>,
    samplers: Pool<Sampler>,
    bind_group_layouts: Pool<BindGroupLayout>,
    bind_groups: Pool<BindGroup>,
    pipeline_layouts: Pool<PipelineLayout>,
    render_passes: Pool<RenderPass>,
    framebuffers: Pool<Framebuffer>,
    semaphores: Pool<Semaphore>,

    /// Driver-object dedup: Arc identity of the cached info -> handle.
    bind_group_layout_lookup: HashMap<usize, Handle<BindGroupLayout>>,
    render_pass_lookup: HashMap<usize, Handle<RenderPass>>,
    owners: HashMap<u64, ResourceRef>,
    /// Staging windows opened by `lock_image`, flushed on unlock.
    image_locks: HashMap<Handle<Image>, (Handle<Buffer>, LockMode)>,

    cmd_pool: vk::CommandPool,
    free_cmd_bufs: Vec<vk::CommandBuffer>,
    free_fences: Vec<vk::Fence>,
    in_flight: Vec<InFlightSubmit>,
    submit_generation: u64,
    completed_generation: u64,
    frame: u64,

    arena: RingArena,
    arena_buffer: vk::Buffer,
    arena_allocation: DeviceAllocation,
    arena_mapped: *mut u8,

    debug_utils: Option<ash::extensions::ext::DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::warn!(
        "[{:?}][{:?}] {}",
        message_severity,
        message_type,
        message.to_string_lossy()
    );
    vk::FALSE
}

impl Context {
    /// Construct a headless device context. Surface/swapchain management is
    /// an external collaborator; nothing here touches windowing.
    pub fn headless(info: &ContextInfo) -> Result<Self> {
        let enable_validation = std::env::var("KOJI_VALIDATION").map_or(false, |v| v == "1");

        let entry = unsafe { Entry::load() }?;
        let app_info = vk::ApplicationInfo {
            api_version: vk::make_api_version(0, 1, 2, 0),
            ..Default::default()
        };

        let mut inst_exts = Vec::new();
        let mut inst_layers = Vec::new();
        if enable_validation {
            inst_exts.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            let available_layers = entry.enumerate_instance_layer_properties()?;
            for &layer in &DEBUG_LAYER_NAMES {
                let name = unsafe { CStr::from_ptr(layer) };
                if available_layers
                    .iter()
                    .any(|prop| unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) == name })
                {
                    inst_layers.push(layer);
                }
            }
        }

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_extension_names(&inst_exts)
                    .enabled_layer_names(&inst_layers)
                    .build(),
                None,
            )
        }?;

        let pdevices = unsafe { instance.enumerate_physical_devices()? };
        let pdevice = *pdevices
            .get(info.device_index)
            .ok_or(GPUError::InvalidHandle)?;
        let properties = unsafe { instance.get_physical_device_properties(pdevice) };
        let memory_props = unsafe { instance.get_physical_device_memory_properties(pdevice) };

        let queue_props = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        let gfx_family = queue_props
            .iter()
            .enumerate()
            .find(|(_, prop)| prop.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(idx, _)| idx as u32)
            .ok_or(GPUError::CapabilityMismatch("graphics queue"))?;

        let supports_vulkan11 = vk::api_version_major(properties.api_version) > 1
            || (vk::api_version_major(properties.api_version) == 1
                && vk::api_version_minor(properties.api_version) >= 1);

        // Feature queries: multiview and the density-map attachment both
        // gate render-pass construction later.
        let mut multiview_query = vk::PhysicalDeviceMultiviewFeatures::default();
        let mut density_query = vk::PhysicalDeviceFragmentDensityMapFeaturesEXT::default();
        if supports_vulkan11 {
            let mut query = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut multiview_query)
                .push_next(&mut density_query)
                .build();
            unsafe { instance.get_physical_device_features2(pdevice, &mut query) };
        }

        let device_exts = unsafe { instance.enumerate_device_extension_properties(pdevice) }?;
        let has_ext = |name: &CStr| {
            device_exts
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        };
        let density_ext =
            unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_EXT_fragment_density_map\0") };
        let use_density = has_ext(density_ext) && density_query.fragment_density_map == vk::TRUE;

        let mut extensions_to_enable: Vec<*const c_char> = Vec::new();
        if use_density {
            extensions_to_enable.push(density_ext.as_ptr());
        }

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(gfx_family)
            .queue_priorities(&priorities)
            .build()];

        let features = vk::PhysicalDeviceFeatures::default();
        let mut multiview_enable = vk::PhysicalDeviceMultiviewFeatures {
            multiview: multiview_query.multiview,
            ..Default::default()
        };
        let mut density_enable = vk::PhysicalDeviceFragmentDensityMapFeaturesEXT {
            fragment_density_map: if use_density { vk::TRUE } else { vk::FALSE },
            ..Default::default()
        };

        let mut device_ci = vk::DeviceCreateInfo::builder()
            .enabled_extension_names(&extensions_to_enable)
            .queue_create_infos(&queue_infos)
            .enabled_features(&features);
        if supports_vulkan11 {
            device_ci = device_ci.push_next(&mut multiview_enable);
            if use_density {
                device_ci = device_ci.push_next(&mut density_enable);
            }
        }

        let device = unsafe { instance.create_device(pdevice, &device_ci.build(), None) }?;
        let gfx_queue = Queue {
            queue: unsafe { device.get_device_queue(gfx_family, 0) },
            family: gfx_family,
        };

        let (debug_utils, debug_messenger) = if enable_validation {
            let utils = ash::extensions::ext::DebugUtils::new(&entry, &instance);
            let messenger = unsafe {
                utils.create_debug_utils_messenger(
                    &vk::DebugUtilsMessengerCreateInfoEXT::builder()
                        .message_severity(
                            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                        )
                        .message_type(
                            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                        )
                        .pfn_user_callback(Some(vulkan_debug_callback))
                        .build(),
                    None,
                )?
            };
            (Some(utils), Some(messenger))
        } else {
            (None, None)
        };

        let heap = VulkanHeap::new(device.clone(), memory_props, gfx_queue.queue, gfx_family)?;
        let mut allocator = DeviceAllocator::new(heap);

        let limits = &properties.limits;
        let binding_limits = DeviceBindingLimits {
            max_bound_sets: limits.max_bound_descriptor_sets,
            max_samplers_per_set: limits.max_per_stage_descriptor_samplers,
            max_uniform_buffers_per_set: limits.max_per_stage_descriptor_uniform_buffers,
            max_dynamic_uniform_buffers_per_set: limits.max_descriptor_set_uniform_buffers_dynamic,
            max_storage_buffers_per_set: limits.max_per_stage_descriptor_storage_buffers,
            max_sampled_images_per_set: limits.max_per_stage_descriptor_sampled_images,
            max_storage_images_per_set: limits.max_per_stage_descriptor_storage_images,
            max_input_attachments_per_set: limits.max_per_stage_descriptor_input_attachments,
        };
        let caps = DeviceCaps {
            multiview: multiview_query.multiview == vk::TRUE,
            fragment_shading_rate: use_density,
            max_color_attachments: limits.max_color_attachments,
        };

        let cmd_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(gfx_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .build(),
                None,
            )?
        };

        // Volatile ring arena: one persistently mapped host-visible buffer.
        let arena_align = limits.min_uniform_buffer_offset_alignment.max(4);
        let (arena_buffer, arena_allocation, arena_mapped) = {
            let raw = unsafe {
                device.create_buffer(
                    &vk::BufferCreateInfo::builder()
                        .size(TRANSIENT_ARENA_SIZE)
                        .usage(
                            vk::BufferUsageFlags::UNIFORM_BUFFER
                                | vk::BufferUsageFlags::STORAGE_BUFFER
                                | vk::BufferUsageFlags::VERTEX_BUFFER
                                | vk::BufferUsageFlags::INDEX_BUFFER
                                | vk::BufferUsageFlags::TRANSFER_SRC,
                        )
                        .sharing_mode(vk::SharingMode::EXCLUSIVE)
                        .build(),
                    None,
                )?
            };
            let reqs = unsafe { device.get_buffer_memory_requirements(raw) };
            let mask = allocator
                .heap()
                .memory_type_mask(reqs.memory_type_bits, MemoryVisibility::CpuAndGpu);
            let allocation = allocator.allocate(&AllocationRequest {
                size: reqs.size,
                align: reqs.alignment,
                memory_type_mask: mask,
                priority: MemoryPriority::High,
            })?;
            let block = allocator
                .block_of(&allocation)
                .ok_or(GPUError::InvalidHandle)?;
            let memory = allocator
                .heap()
                .memory_of(block)
                .ok_or(GPUError::InvalidHandle)?;
            unsafe { device.bind_buffer_memory(raw, memory, allocation.offset)? };
            let base = allocator.heap().mapped_of(block);
            if base.is_null() {
                return Err(GPUError::NotHostVisible("transient arena".to_string()));
            }
            let mapped = unsafe { base.add(allocation.offset as usize) };
            (raw, allocation, mapped)
        };

        Ok(Self {
            entry,
            instance,
            pdevice,
            device,
            properties,
            gfx_queue,
            allocator,
            binding_limits,
            caps,
            allow_shading_rate: use_density,
            layout_cache: LayoutCache::new(),
            patch_cache: PatchCache::new(),
            render_pass_cache: RenderPassCache::new(),
            reclaim: DeletionQueue::new(),
            buffers: Pool::new(1024),
            images: Pool::new(1024),
            samplers: Pool::new(64),
            bind_group_layouts: Pool::new(64),
            bind_groups: Pool::new(256),
            pipeline_layouts: Pool::new(64),
            render_passes: Pool::new(64),
            framebuffers: Pool::new(64),
            semaphores: Pool::new(64),
            bind_group_layout_lookup: HashMap::new(),
            render_pass_lookup: HashMap::new(),
            owners: HashMap::new(),
            image_locks: HashMap::new(),
            cmd_pool,
            free_cmd_bufs: Vec::new(),
            free_fences: Vec::new(),
            in_flight: Vec::new(),
            submit_generation: 0,
            completed_generation: 0,
            frame: 0,
            arena: RingArena::new(TRANSIENT_ARENA_SIZE, arena_align),
            arena_buffer,
            arena_allocation,
            arena_mapped,
            debug_utils,
            debug_messenger,
        })
    }

    pub fn binding_limits(&self) -> DeviceBindingLimits {
        self.binding_limits
    }

    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdevice
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Global gate for attachment-driven variable-rate shading.
    pub fn set_allow_shading_rate(&mut self, allow: bool) {
        self.allow_shading_rate = allow && self.caps.fragment_shading_rate;
    }

    pub fn completed(&self) -> SyncPoint {
        SyncPoint {
            generation: self.completed_generation,
        }
    }

    fn set_name<T: VkRawHandle + Copy>(&self, obj: T, name: &str, t: vk::ObjectType) {
        if name.is_empty() {
            return;
        }
        if let Some(utils) = &self.debug_utils {
            if let Ok(cname) = CString::new(name) {
                let info = vk::DebugUtilsObjectNameInfoEXT::builder()
                    .object_type(t)
                    .object_handle(obj.as_raw())
                    .object_name(&cname)
                    .build();
                unsafe {
                    let _ = utils.set_debug_utils_object_name(self.device.handle(), &info);
                }
            }
        }
    }

    // ---- resources -------------------------------------------------------

    pub fn make_buffer(&mut self, info: &BufferInfo) -> Result<Handle<Buffer>> {
        if info.volatile {
            return self.make_volatile_buffer(info);
        }

        let usage = convert_buffer_usage(info.usage)
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let raw = unsafe {
            self.device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(info.byte_size)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                None,
            )?
        };
        let reqs = unsafe { self.device.get_buffer_memory_requirements(raw) };
        let mask = self
            .allocator
            .heap()
            .memory_type_mask(reqs.memory_type_bits, info.visibility);
        let allocation = match self.allocator.allocate(&AllocationRequest {
            size: reqs.size,
            align: reqs.alignment,
            memory_type_mask: mask,
            priority: info.priority,
        }) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(raw, None) };
                log::warn!("buffer `{}` allocation failed: {e}", info.debug_name);
                return Err(e);
            }
        };
        let block = self
            .allocator
            .block_of(&allocation)
            .ok_or(GPUError::InvalidHandle)?;
        let memory = self
            .allocator
            .heap()
            .memory_of(block)
            .ok_or(GPUError::InvalidHandle)?;
        unsafe { self.device.bind_buffer_memory(raw, memory, allocation.offset)? };
        let mapped_base = self.allocator.heap().mapped_of(block);
        let mapped = if mapped_base.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { mapped_base.add(allocation.offset as usize) }
        };
        self.set_name(raw, info.debug_name, vk::ObjectType::BUFFER);

        let buffer = Buffer {
            raw,
            allocation,
            usage: info.usage,
            visibility: info.visibility,
            byte_size: info.byte_size,
            volatile: false,
            ring_offset: 0,
            mapped,
            lock: Default::default(),
            last_submit: 0,
            revision: 0,
            debug_name: info.debug_name.to_string(),
        };
        let handle = self.buffers.insert(buffer).ok_or(GPUError::SlotError)?;
        self.owners
            .insert(allocation.id, ResourceRef::Buffer(handle));

        if let Some(data) = info.initial_data {
            if !mapped.is_null() {
                let len = data.len().min(info.byte_size as usize);
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, len) };
            } else {
                self.upload_to_buffer(handle, 0, data)?;
            }
        }
        Ok(handle)
    }

    fn make_volatile_buffer(&mut self, info: &BufferInfo) -> Result<Handle<Buffer>> {
        // Backed by the ring arena; placement happens at each lock.
        let buffer = Buffer {
            raw: self.arena_buffer,
            allocation: DeviceAllocation::default(),
            usage: info.usage,
            visibility: MemoryVisibility::CpuAndGpu,
            byte_size: info.byte_size,
            volatile: true,
            ring_offset: 0,
            mapped: std::ptr::null_mut(),
            lock: Default::default(),
            last_submit: 0,
            revision: 0,
            debug_name: info.debug_name.to_string(),
        };
        self.buffers.insert(buffer).ok_or(GPUError::SlotError)
    }

    pub fn make_image(&mut self, info: &ImageInfo) -> Result<Handle<Image>> {
        let max_mips = super::resource::max_mip_levels(info.dim);
        if info.mip_levels == 0 || info.mip_levels > max_mips {
            return Err(GPUError::InvalidDescriptor(
                "mip count outside the valid range for these dimensions",
            ));
        }

        let usage = convert_image_usage(info.usage)
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        let raw = unsafe {
            self.device.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(if info.dim[2] > 1 {
                        vk::ImageType::TYPE_3D
                    } else {
                        vk::ImageType::TYPE_2D
                    })
                    .format(lib_to_vk_image_format(&info.format))
                    .extent(vk::Extent3D {
                        width: info.dim[0],
                        height: info.dim[1],
                        depth: info.dim[2],
                    })
                    .mip_levels(info.mip_levels)
                    .array_layers(info.layers)
                    .samples(convert_sample_count(info.samples))
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .build(),
                None,
            )?
        };
        let reqs = unsafe { self.device.get_image_memory_requirements(raw) };
        let mask = self
            .allocator
            .heap()
            .memory_type_mask(reqs.memory_type_bits, MemoryVisibility::Gpu);
        let allocation = match self.allocator.allocate(&AllocationRequest {
            size: reqs.size,
            align: reqs.alignment,
            memory_type_mask: mask,
            priority: info.priority,
        }) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_image(raw, None) };
                log::warn!("image `{}` allocation failed: {e}", info.debug_name);
                return Err(e);
            }
        };
        let block = self
            .allocator
            .block_of(&allocation)
            .ok_or(GPUError::InvalidHandle)?;
        let memory = self
            .allocator
            .heap()
            .memory_of(block)
            .ok_or(GPUError::InvalidHandle)?;
        unsafe { self.device.bind_image_memory(raw, memory, allocation.offset)? };
        self.set_name(raw, info.debug_name, vk::ObjectType::IMAGE);

        let image = Image {
            raw,
            allocation,
            dim: info.dim,
            layers: info.layers,
            format: info.format,
            mip_levels: info.mip_levels,
            samples: info.samples,
            usage: info.usage,
            views: HashMap::new(),
            lock: Default::default(),
            last_submit: 0,
            revision: 0,
            debug_name: info.debug_name.to_string(),
        };
        let handle = self.images.insert(image).ok_or(GPUError::SlotError)?;
        self.owners.insert(allocation.id, ResourceRef::Image(handle));

        if let Some(data) = info.initial_data {
            self.upload_to_image(handle, data)?;
        }
        Ok(handle)
    }

    pub fn make_sampler(&mut self, info: &SamplerInfo) -> Result<Handle<Sampler>> {
        let raw = unsafe { self.device.create_sampler(&(*info).into(), None)? };
        self.samplers
            .insert(Sampler { raw })
            .ok_or(GPUError::SlotError)
    }

    pub fn make_semaphore(&mut self) -> Result<Handle<Semaphore>> {
        let raw = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::builder().build(), None)?
        };
        self.semaphores
            .insert(Semaphore { raw })
            .ok_or(GPUError::SlotError)
    }

    /// Cached per (format, mip range, array range) on the owning image;
    /// regenerated lazily after invalidation.
    pub fn get_or_create_image_view(
        &mut self,
        image: Handle<Image>,
        key: &ImageViewKey,
    ) -> Result<vk::ImageView> {
        self.ensure_resident_image(image)?;
        let (raw, cached) = {
            let img = self.images.get_ref(image).ok_or(GPUError::InvalidHandle)?;
            (img.raw, img.cached_view(key))
        };
        if let Some(view) = cached {
            return Ok(view);
        }
        let view_type = {
            let img = self.images.get_ref(image).ok_or(GPUError::InvalidHandle)?;
            if img.dim()[2] > 1 {
                vk::ImageViewType::TYPE_3D
            } else if key.layer_count > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            }
        };
        let view = unsafe {
            self.device.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(raw)
                    .view_type(view_type)
                    .format(lib_to_vk_image_format(&key.format))
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: key.aspect.into(),
                        base_mip_level: key.mip_base,
                        level_count: key.mip_count,
                        base_array_layer: key.layer_base,
                        layer_count: key.layer_count,
                    })
                    .build(),
                None,
            )?
        };
        let img = self.images.get_mut_ref(image).ok_or(GPUError::InvalidHandle)?;
        img.cache_view(*key, view);
        Ok(view)
    }

    pub fn make_image_view(&mut self, info: &ImageViewInfo) -> Result<vk::ImageView> {
        let format = match info.format {
            Some(f) => f,
            None => self
                .images
                .get_ref(info.img)
                .ok_or(GPUError::InvalidHandle)?
                .format(),
        };
        let key = ImageViewKey {
            format,
            mip_base: info.mip_base,
            mip_count: info.mip_count,
            layer_base: info.layer_base,
            layer_count: info.layer_count,
            aspect: info.aspect,
        };
        self.get_or_create_image_view(info.img, &key)
    }

    // ---- locks -----------------------------------------------------------

    /// Map a byte range for CPU access. Volatile buffers rotate onto a
    /// fresh arena slice (stalling only if the whole ring is in flight);
    /// persistent buffers wait for the GPU only when a write overlaps an
    /// in-flight submission.
    pub fn lock_buffer(
        &mut self,
        handle: Handle<Buffer>,
        offset: u64,
        size: u64,
        mode: LockMode,
    ) -> Result<*mut u8> {
        self.ensure_resident_buffer(handle)?;
        let (volatile, byte_size, last_submit) = {
            let buf = self.buffers.get_ref(handle).ok_or(GPUError::InvalidHandle)?;
            (buf.volatile, buf.byte_size, buf.last_submit)
        };
        if offset + size.max(1) > byte_size {
            return Err(GPUError::InvalidHandle);
        }

        if volatile {
            let generation = self.submit_generation + 1;
            let slice = match self.arena.bump(byte_size, generation) {
                Some(s) => s,
                None => {
                    // Ring exhausted; wait for the oldest submission.
                    let target = self.completed_generation + 1;
                    self.wait(SyncPoint { generation: target })?;
                    self.arena.retire(self.completed_generation);
                    self.arena
                        .bump(byte_size, generation)
                        .ok_or(GPUError::OutOfMemory {
                            size: byte_size,
                            memory_type_mask: 0,
                        })?
                }
            };
            let base = unsafe { self.arena_mapped.add(slice.offset as usize) };
            let buf = self
                .buffers
                .get_mut_ref(handle)
                .ok_or(GPUError::InvalidHandle)?;
            buf.acquire_lock(mode)?;
            buf.rotate(slice.offset, base);
            return Ok(unsafe { base.add(offset as usize) });
        }

        if mode == LockMode::Write && last_submit > self.completed_generation {
            self.wait(SyncPoint {
                generation: last_submit,
            })?;
        }
        let alloc = {
            let buf = self
                .buffers
                .get_mut_ref(handle)
                .ok_or(GPUError::InvalidHandle)?;
            if buf.mapped.is_null() {
                return Err(GPUError::NotHostVisible(buf.debug_name.clone()));
            }
            buf.acquire_lock(mode)?;
            buf.allocation
        };
        self.allocator.note_access(&alloc);
        let buf = self.buffers.get_ref(handle).unwrap();
        Ok(unsafe { buf.mapped.add(offset as usize) })
    }

    /// Current identity of a buffer's backing bytes; changes on every move
    /// or volatile rotation.
    pub fn buffer_revision(&self, handle: Handle<Buffer>) -> Option<u32> {
        self.buffers.get_ref(handle).map(|b| b.revision())
    }

    pub fn unlock_buffer(&mut self, handle: Handle<Buffer>) -> Result<()> {
        let buf = self
            .buffers
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)?;
        buf.release_lock();
        Ok(())
    }

    /// Open a CPU window onto an image through a staging buffer. Read locks
    /// fill the window from the image first; write locks flush back on
    /// unlock.
    pub fn lock_image(&mut self, handle: Handle<Image>, mode: LockMode) -> Result<*mut u8> {
        self.ensure_resident_image(handle)?;
        let byte_size = self.image_byte_size(handle)?;
        let last_submit = self
            .images
            .get_ref(handle)
            .ok_or(GPUError::InvalidHandle)?
            .last_submit;
        if mode == LockMode::Write && last_submit > self.completed_generation {
            self.wait(SyncPoint {
                generation: last_submit,
            })?;
        }

        let staging = self.make_buffer(&BufferInfo {
            debug_name: "image lock staging",
            byte_size,
            visibility: MemoryVisibility::CpuAndGpu,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            priority: MemoryPriority::Low,
            volatile: false,
            initial_data: None,
        })?;
        if mode == LockMode::Read {
            if let Err(e) = self.copy_image_to_staging(handle, staging) {
                self.destroy_buffer(staging);
                return Err(e);
            }
        }
        let locked = self
            .images
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)
            .and_then(|img| img.acquire_lock(mode));
        if let Err(e) = locked {
            self.destroy_buffer(staging);
            return Err(e);
        }
        let alloc = self.images.get_ref(handle).unwrap().allocation;
        self.allocator.note_access(&alloc);
        self.image_locks.insert(handle, (staging, mode));
        Ok(self.buffers.get_ref(staging).unwrap().mapped)
    }

    pub fn unlock_image(&mut self, handle: Handle<Image>) -> Result<()> {
        let Some((staging, mode)) = self.image_locks.remove(&handle) else {
            return Err(GPUError::InvalidHandle);
        };
        if mode != LockMode::Read {
            self.copy_staging_to_image(handle, staging)?;
        }
        if let Some(img) = self.images.get_mut_ref(handle) {
            img.release_lock();
        }
        self.destroy_buffer(staging);
        Ok(())
    }

    /// Byte size of an image's mip-0 contents across all layers.
    fn image_byte_size(&self, handle: Handle<Image>) -> Result<u64> {
        let img = self.images.get_ref(handle).ok_or(GPUError::InvalidHandle)?;
        let [w, h, d] = img.dim();
        Ok(w as u64
            * h as u64
            * d as u64
            * img.layers as u64
            * format_byte_size(&img.format()) as u64)
    }

    // ---- eviction / defragmentation -------------------------------------

    pub fn mark_buffer_evictable(&mut self, handle: Handle<Buffer>, evictable: bool) {
        if let Some(buf) = self.buffers.get_ref(handle) {
            let alloc = buf.allocation;
            self.allocator.mark_evictable(&alloc, evictable);
        }
    }

    pub fn mark_image_evictable(&mut self, handle: Handle<Image>, evictable: bool) {
        if let Some(img) = self.images.get_ref(handle) {
            let alloc = img.allocation;
            self.allocator.mark_evictable(&alloc, evictable);
        }
    }

    /// Force cold evictable allocations out to host memory. Their driver
    /// objects are retired through the reclaim queue; the next access
    /// restores and rebinds transparently.
    pub fn evict_cold(&mut self, idle_frames: u64) -> Result<usize> {
        let ids = self.allocator.evict_cold(idle_frames)?;
        let generation = self.submit_generation;
        for id in &ids {
            match self.owners.get(id).copied() {
                Some(ResourceRef::Buffer(h)) => {
                    if let Some(buf) = self.buffers.get_mut_ref(h) {
                        let old = buf.rebind(vk::Buffer::null(), buf.allocation, std::ptr::null_mut());
                        if old != vk::Buffer::null() {
                            self.reclaim.enqueue(ZombieHandle::Buffer(old), generation);
                        }
                    }
                }
                Some(ResourceRef::Image(h)) => {
                    if let Some(img) = self.images.get_mut_ref(h) {
                        let (old, views) = img.rebind(vk::Image::null(), img.allocation);
                        if old != vk::Image::null() {
                            self.reclaim.enqueue(ZombieHandle::Image(old), generation);
                        }
                        for view in views {
                            self.reclaim.enqueue(ZombieHandle::ImageView(view), generation);
                        }
                    }
                }
                None => {}
            }
        }
        Ok(ids.len())
    }

    /// Best-effort compaction; the allocator moves the bytes, then every
    /// affected resource is rebound and its views invalidated.
    pub fn defragment(&mut self) -> Result<usize> {
        let mut recorder = MoveRecorder::default();
        let count = self.allocator.defragment(&mut recorder);
        for (from, to) in recorder.moves {
            match self.owners.get(&from.id).copied() {
                Some(ResourceRef::Buffer(h)) => self.rebind_buffer_at(h, to)?,
                Some(ResourceRef::Image(h)) => self.rebind_image_at(h, to)?,
                None => {}
            }
        }
        Ok(count)
    }

    fn ensure_resident_buffer(&mut self, handle: Handle<Buffer>) -> Result<()> {
        let alloc = self
            .buffers
            .get_ref(handle)
            .ok_or(GPUError::InvalidHandle)?
            .allocation;
        if alloc.is_null() || !self.allocator.is_evicted(&alloc) {
            return Ok(());
        }
        let fresh = self.allocator.restore(&alloc)?;
        self.rebind_buffer_at(handle, fresh)
    }

    fn ensure_resident_image(&mut self, handle: Handle<Image>) -> Result<()> {
        let alloc = self
            .images
            .get_ref(handle)
            .ok_or(GPUError::InvalidHandle)?
            .allocation;
        if alloc.is_null() || !self.allocator.is_evicted(&alloc) {
            return Ok(());
        }
        let fresh = self.allocator.restore(&alloc)?;
        self.rebind_image_at(handle, fresh)
    }

    fn rebind_buffer_at(&mut self, handle: Handle<Buffer>, fresh: DeviceAllocation) -> Result<()> {
        let (usage, byte_size, name) = {
            let buf = self.buffers.get_ref(handle).ok_or(GPUError::InvalidHandle)?;
            (buf.usage, buf.byte_size, buf.debug_name.clone())
        };
        let raw = unsafe {
            self.device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(byte_size)
                    .usage(
                        convert_buffer_usage(usage)
                            | vk::BufferUsageFlags::TRANSFER_SRC
                            | vk::BufferUsageFlags::TRANSFER_DST,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                None,
            )?
        };
        let block = self
            .allocator
            .block_of(&fresh)
            .ok_or(GPUError::InvalidHandle)?;
        let memory = self
            .allocator
            .heap()
            .memory_of(block)
            .ok_or(GPUError::InvalidHandle)?;
        unsafe { self.device.bind_buffer_memory(raw, memory, fresh.offset)? };
        self.set_name(raw, &name, vk::ObjectType::BUFFER);
        let mapped_base = self.allocator.heap().mapped_of(block);
        let mapped = if mapped_base.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { mapped_base.add(fresh.offset as usize) }
        };

        let generation = self.submit_generation;
        let buf = self
            .buffers
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)?;
        let old = buf.rebind(raw, fresh, mapped);
        if old != vk::Buffer::null() {
            self.reclaim.enqueue(ZombieHandle::Buffer(old), generation);
        }
        self.owners.insert(fresh.id, ResourceRef::Buffer(handle));
        Ok(())
    }

    fn rebind_image_at(&mut self, handle: Handle<Image>, fresh: DeviceAllocation) -> Result<()> {
        let (dim, layers, format, mips, samples, usage, name) = {
            let img = self.images.get_ref(handle).ok_or(GPUError::InvalidHandle)?;
            (
                img.dim,
                img.layers,
                img.format,
                img.mip_levels,
                img.samples,
                img.usage,
                img.debug_name.clone(),
            )
        };
        let raw = unsafe {
            self.device.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(if dim[2] > 1 {
                        vk::ImageType::TYPE_3D
                    } else {
                        vk::ImageType::TYPE_2D
                    })
                    .format(lib_to_vk_image_format(&format))
                    .extent(vk::Extent3D {
                        width: dim[0],
                        height: dim[1],
                        depth: dim[2],
                    })
                    .mip_levels(mips)
                    .array_layers(layers)
                    .samples(convert_sample_count(samples))
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(
                        convert_image_usage(usage)
                            | vk::ImageUsageFlags::TRANSFER_SRC
                            | vk::ImageUsageFlags::TRANSFER_DST,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .build(),
                None,
            )?
        };
        let block = self
            .allocator
            .block_of(&fresh)
            .ok_or(GPUError::InvalidHandle)?;
        let memory = self
            .allocator
            .heap()
            .memory_of(block)
            .ok_or(GPUError::InvalidHandle)?;
        unsafe { self.device.bind_image_memory(raw, memory, fresh.offset)? };
        self.set_name(raw, &name, vk::ObjectType::IMAGE);

        let generation = self.submit_generation;
        let img = self
            .images
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidHandle)?;
        let (old, views) = img.rebind(raw, fresh);
        if old != vk::Image::null() {
            self.reclaim.enqueue(ZombieHandle::Image(old), generation);
        }
        for view in views {
            self.reclaim.enqueue(ZombieHandle::ImageView(view), generation);
        }
        self.owners.insert(fresh.id, ResourceRef::Image(handle));
        Ok(())
    }

    // ---- descriptor layouts / bind groups --------------------------------

    /// Build (or fetch) the deduplicated layout for a stage combination and
    /// realize it as driver objects. Structurally identical reflections
    /// return the same handle.
    pub fn make_bind_group_layout(
        &mut self,
        info: &BindGroupLayoutInfo,
    ) -> Result<Handle<BindGroupLayout>> {
        let builder = LayoutBuilder::new(info.debug_name, info.policy, self.binding_limits);
        let built = builder.finalize_bindings(info.stages, info.immutable_samplers)?;
        let shared = self.layout_cache.get_or_insert(built);

        let key = Arc::as_ptr(&shared) as usize;
        if let Some(existing) = self.bind_group_layout_lookup.get(&key) {
            return Ok(*existing);
        }

        // Immutable sampler raw handles, kept alive for the create call.
        let mut raw_sets = Vec::with_capacity(shared.sets.len());
        for set in &shared.sets {
            let mut sampler_storage: Vec<Vec<vk::Sampler>> = Vec::with_capacity(set.bindings.len());
            let mut bindings = Vec::with_capacity(set.bindings.len());
            for binding in &set.bindings {
                let mut b = vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(convert_descriptor_kind(binding.kind))
                    .descriptor_count(binding.count)
                    .stage_flags(convert_stage_mask(binding.stages));
                if let Some(sampler) = binding.immutable_sampler {
                    let raw = self
                        .samplers
                        .get_ref(sampler)
                        .ok_or(GPUError::InvalidHandle)?
                        .raw;
                    sampler_storage.push(vec![raw; binding.count as usize]);
                    b = b.immutable_samplers(sampler_storage.last().unwrap());
                }
                bindings.push(b.build());
            }
            let raw = unsafe {
                self.device.create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::builder()
                        .bindings(&bindings)
                        .build(),
                    None,
                )?
            };
            self.set_name(raw, info.debug_name, vk::ObjectType::DESCRIPTOR_SET_LAYOUT);
            raw_sets.push(raw);
        }

        const MAX_SETS_PER_LAYOUT: u32 = 256;
        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for set in &shared.sets {
            for binding in &set.bindings {
                let ty = convert_descriptor_kind(binding.kind);
                let count = binding.count * MAX_SETS_PER_LAYOUT;
                match pool_sizes.iter_mut().find(|p| p.ty == ty) {
                    Some(p) => p.descriptor_count += count,
                    None => pool_sizes.push(vk::DescriptorPoolSize {
                        ty,
                        descriptor_count: count,
                    }),
                }
            }
        }
        if pool_sizes.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            });
        }
        let pool = unsafe {
            self.device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .pool_sizes(&pool_sizes)
                    .max_sets(MAX_SETS_PER_LAYOUT * shared.sets.len().max(1) as u32)
                    .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                    .build(),
                None,
            )?
        };
        self.set_name(pool, info.debug_name, vk::ObjectType::DESCRIPTOR_POOL);

        let handle = self
            .bind_group_layouts
            .insert(BindGroupLayout {
                info: shared,
                raw_sets,
                pool,
            })
            .ok_or(GPUError::SlotError)?;
        self.bind_group_layout_lookup.insert(key, handle);
        Ok(handle)
    }

    pub fn layout_info(&self, layout: Handle<BindGroupLayout>) -> Option<Arc<DescriptorSetLayoutInfo>> {
        self.bind_group_layouts
            .get_ref(layout)
            .map(|l| l.info.clone())
    }

    /// Patch a shader's binding literals against a built layout; cached per
    /// (shader, layout hash).
    pub fn patch_shader(
        &self,
        words: &[u32],
        stage: &StageReflection,
        layout: Handle<BindGroupLayout>,
    ) -> Result<Arc<Vec<u32>>> {
        let layout = self
            .bind_group_layouts
            .get_ref(layout)
            .ok_or(GPUError::InvalidHandle)?;
        self.patch_cache
            .get_or_patch(words, stage, &layout.info.remap, layout.info.hash)
    }

    pub fn make_bind_group(&mut self, info: &BindGroupInfo) -> Result<Handle<BindGroup>> {
        let (pool, set_layout) = {
            let layout = self
                .bind_group_layouts
                .get_ref(info.layout)
                .ok_or(GPUError::InvalidHandle)?;
            let raw = *layout
                .raw_sets
                .get(info.set as usize)
                .ok_or(GPUError::InvalidHandle)?;
            (layout.pool, raw)
        };
        let set = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&[set_layout])
                    .build(),
            )?[0]
        };
        self.set_name(set, info.debug_name, vk::ObjectType::DESCRIPTOR_SET);
        let handle = self
            .bind_groups
            .insert(BindGroup {
                set,
                set_id: info.set,
                layout: info.layout,
            })
            .ok_or(GPUError::SlotError)?;
        self.write_bind_group(handle, info.bindings)?;
        Ok(handle)
    }

    /// Write (or rewrite) descriptor slots from the resources' *current*
    /// placements. Called again after moves or volatile rotation.
    pub fn write_bind_group(
        &mut self,
        group: Handle<BindGroup>,
        bindings: &[BindingInfo],
    ) -> Result<()> {
        // Resolve views first; view creation may mutate image caches.
        let mut resolved_images: HashMap<usize, (vk::ImageView, vk::ImageLayout)> = HashMap::new();
        for (idx, b) in bindings.iter().enumerate() {
            match b.resource {
                ShaderResource::SampledImage(img, key, _)
                | ShaderResource::StorageImage(img, key)
                | ShaderResource::InputAttachment(img, key) => {
                    let view = self.get_or_create_image_view(img, &key)?;
                    let layout = match b.resource {
                        ShaderResource::StorageImage(..) => vk::ImageLayout::GENERAL,
                        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    };
                    resolved_images.insert(idx, (view, layout));
                }
                _ => {}
            }
        }

        let (set, set_id, layout_handle) = {
            let g = self.bind_groups.get_ref(group).ok_or(GPUError::InvalidHandle)?;
            (g.set, g.set_id, g.layout)
        };
        let layout = self
            .bind_group_layouts
            .get_ref(layout_handle)
            .ok_or(GPUError::InvalidHandle)?;
        let set_layout = layout
            .info
            .sets
            .get(set_id as usize)
            .ok_or(GPUError::InvalidHandle)?;

        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::with_capacity(bindings.len());
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(bindings.len());
        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(bindings.len());

        for (idx, b) in bindings.iter().enumerate() {
            let slot = set_layout
                .bindings
                .iter()
                .find(|s| s.binding == b.binding)
                .ok_or(GPUError::UnmappedBinding { slot: b.binding })?;
            let descriptor_type = convert_descriptor_kind(slot.kind);
            match b.resource {
                ShaderResource::UniformBuffer(view) | ShaderResource::StorageBuffer(view) => {
                    let (raw, offset, range) = self.resolve_buffer(&view)?;
                    // Dynamic bindings take their base here; the live offset
                    // arrives at bind time.
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: raw,
                        offset,
                        range,
                    });
                    writes.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(set)
                            .dst_binding(b.binding)
                            .descriptor_type(descriptor_type)
                            .buffer_info(std::slice::from_ref(buffer_infos.last().unwrap()))
                            .build(),
                    );
                }
                ShaderResource::SampledImage(_, _, sampler) => {
                    let (view, layout) = resolved_images[&idx];
                    let raw_sampler = self
                        .samplers
                        .get_ref(sampler)
                        .ok_or(GPUError::InvalidHandle)?
                        .raw;
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: raw_sampler,
                        image_view: view,
                        image_layout: layout,
                    });
                    writes.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(set)
                            .dst_binding(b.binding)
                            .descriptor_type(descriptor_type)
                            .image_info(std::slice::from_ref(image_infos.last().unwrap()))
                            .build(),
                    );
                }
                ShaderResource::StorageImage(..) | ShaderResource::InputAttachment(..) => {
                    let (view, layout) = resolved_images[&idx];
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: layout,
                    });
                    writes.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(set)
                            .dst_binding(b.binding)
                            .descriptor_type(descriptor_type)
                            .image_info(std::slice::from_ref(image_infos.last().unwrap()))
                            .build(),
                    );
                }
            }
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    pub fn make_pipeline_layout(
        &mut self,
        layout: Handle<BindGroupLayout>,
        push_constants: &[PushConstantRange],
    ) -> Result<Handle<PipelineLayout>> {
        let (raw_sets, info) = {
            let l = self
                .bind_group_layouts
                .get_ref(layout)
                .ok_or(GPUError::InvalidHandle)?;
            (l.raw_sets.clone(), l.info.clone())
        };
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: convert_stage_mask(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let raw = unsafe {
            self.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(&raw_sets)
                    .push_constant_ranges(&ranges)
                    .build(),
                None,
            )?
        };
        self.pipeline_layouts
            .insert(PipelineLayout {
                info: PipelineLayoutInfo::new(info, push_constants.to_vec()),
                raw,
            })
            .ok_or(GPUError::SlotError)
    }

    // ---- render passes ---------------------------------------------------

    /// Cache-first render pass creation: equal target layouts share one
    /// driver object for the lifetime of the context.
    pub fn get_or_create_render_pass(
        &mut self,
        layout: &RenderTargetLayout,
    ) -> Result<Handle<RenderPass>> {
        let desc =
            self.render_pass_cache
                .get_or_build(layout, &self.caps, self.allow_shading_rate)?;
        let key = Arc::as_ptr(&desc) as usize;
        if let Some(existing) = self.render_pass_lookup.get(&key) {
            return Ok(*existing);
        }
        let raw = self.realize_render_pass(&desc)?;
        let handle = self
            .render_passes
            .insert(RenderPass { raw, desc })
            .ok_or(GPUError::SlotError)?;
        self.render_pass_lookup.insert(key, handle);
        Ok(handle)
    }

    pub fn render_pass_description(
        &self,
        handle: Handle<RenderPass>,
    ) -> Option<Arc<RenderPassDescription>> {
        self.render_passes.get_ref(handle).map(|rp| rp.desc.clone())
    }

    fn realize_render_pass(&self, desc: &RenderPassDescription) -> Result<vk::RenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .attachments
            .iter()
            .map(|a| vk::AttachmentDescription {
                format: lib_to_vk_image_format(&a.desc.format),
                samples: convert_sample_count(a.desc.samples),
                load_op: convert_load_op(a.desc.load_op),
                store_op: convert_store_op(a.desc.store_op),
                stencil_load_op: convert_load_op(a.desc.stencil_load_op),
                stencil_store_op: convert_store_op(a.desc.stencil_store_op),
                initial_layout: a.initial_layout,
                final_layout: a.final_layout,
                ..Default::default()
            })
            .collect();

        struct SubpassRefs {
            colors: Vec<vk::AttachmentReference>,
            inputs: Vec<vk::AttachmentReference>,
            resolves: Vec<vk::AttachmentReference>,
            depth: Option<vk::AttachmentReference>,
        }
        let to_ref = |r: &super::renderpass::AttachmentRef| vk::AttachmentReference {
            attachment: r.attachment,
            layout: r.layout,
        };
        let refs: Vec<SubpassRefs> = desc
            .subpasses
            .iter()
            .map(|s| SubpassRefs {
                colors: s.colors.iter().map(to_ref).collect(),
                inputs: s.inputs.iter().map(to_ref).collect(),
                resolves: s.resolves.iter().map(to_ref).collect(),
                depth: s.depth.as_ref().map(to_ref),
            })
            .collect();

        let subpasses: Vec<vk::SubpassDescription> = refs
            .iter()
            .map(|r| {
                let mut b = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&r.colors)
                    .input_attachments(&r.inputs);
                if !r.resolves.is_empty() {
                    b = b.resolve_attachments(&r.resolves);
                }
                if let Some(d) = r.depth.as_ref() {
                    b = b.depth_stencil_attachment(d);
                }
                b.build()
            })
            .collect();

        let dependencies: Vec<vk::SubpassDependency> = desc
            .dependencies
            .iter()
            .map(|d| vk::SubpassDependency {
                src_subpass: d.src_subpass,
                dst_subpass: d.dst_subpass,
                src_stage_mask: d.src_stage,
                dst_stage_mask: d.dst_stage,
                src_access_mask: d.src_access,
                dst_access_mask: d.dst_access,
                dependency_flags: if d.by_region {
                    vk::DependencyFlags::BY_REGION
                } else {
                    vk::DependencyFlags::empty()
                },
            })
            .collect();

        let view_masks: Vec<u32> = if desc.view_mask != 0 {
            vec![desc.view_mask; desc.subpasses.len()]
        } else {
            Vec::new()
        };
        let correlation_masks = [desc.correlation_mask];
        let mut multiview = vk::RenderPassMultiviewCreateInfo::builder()
            .view_masks(&view_masks)
            .correlation_masks(&correlation_masks)
            .build();

        let mut density = vk::RenderPassFragmentDensityMapCreateInfoEXT {
            fragment_density_map_attachment: vk::AttachmentReference {
                attachment: desc.density_attachment.unwrap_or(vk::ATTACHMENT_UNUSED),
                layout: vk::ImageLayout::FRAGMENT_DENSITY_MAP_OPTIMAL_EXT,
            },
            ..Default::default()
        };

        let mut ci = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        if desc.view_mask != 0 {
            ci = ci.push_next(&mut multiview);
        }
        if desc.density_attachment.is_some() {
            ci = ci.push_next(&mut density);
        }

        Ok(unsafe { self.device.create_render_pass(&ci.build(), None)? })
    }

    pub fn make_framebuffer(&mut self, info: &FramebufferInfo) -> Result<Handle<Framebuffer>> {
        let rp_raw = self
            .render_passes
            .get_ref(info.render_pass)
            .ok_or(GPUError::InvalidHandle)?
            .raw;
        let mut views = Vec::with_capacity(info.attachments.len());
        for attachment in info.attachments {
            views.push(self.get_or_create_image_view(attachment.image, &attachment.view)?);
        }
        let raw = unsafe {
            self.device.create_framebuffer(
                &vk::FramebufferCreateInfo::builder()
                    .render_pass(rp_raw)
                    .attachments(&views)
                    .width(info.extent.width.max(1))
                    .height(info.extent.height.max(1))
                    .layers(1)
                    .build(),
                None,
            )?
        };
        self.set_name(raw, info.debug_name, vk::ObjectType::FRAMEBUFFER);
        self.framebuffers
            .insert(Framebuffer {
                raw,
                render_pass: info.render_pass,
                extent: info.extent,
            })
            .ok_or(GPUError::SlotError)
    }

    // ---- command recording ----------------------------------------------

    pub fn begin_command_list(&mut self, debug_name: &str) -> Result<CommandList> {
        let cmd_buf = match self.free_cmd_bufs.pop() {
            Some(buf) => buf,
            None => unsafe {
                self.device.allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::builder()
                        .command_pool(self.cmd_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1)
                        .build(),
                )?[0]
            },
        };
        unsafe {
            self.device
                .begin_command_buffer(cmd_buf, &vk::CommandBufferBeginInfo::builder().build())?;
        }
        self.set_name(cmd_buf, debug_name, vk::ObjectType::COMMAND_BUFFER);
        Ok(CommandList {
            cmd_buf,
            recording: true,
            in_render_pass: false,
            touched_buffers: Vec::new(),
            touched_images: Vec::new(),
            debug_name: debug_name.to_string(),
        })
    }

    pub fn cmd_begin_render_pass(
        &mut self,
        list: &mut CommandList,
        begin: &RenderPassBegin,
    ) -> Result<()> {
        debug_assert!(list.recording && !list.in_render_pass);
        let rp = self
            .render_passes
            .get_ref(begin.render_pass)
            .ok_or(GPUError::InvalidHandle)?
            .raw;
        let (fb, fb_extent) = {
            let fb = self
                .framebuffers
                .get_ref(begin.framebuffer)
                .ok_or(GPUError::InvalidHandle)?;
            if fb.render_pass != begin.render_pass {
                return Err(GPUError::InvalidHandle);
            }
            (fb.raw, fb.extent)
        };
        // A zero-sized render area means "the whole framebuffer".
        let render_area = if begin.render_area.w == 0 || begin.render_area.h == 0 {
            Rect2D {
                x: 0,
                y: 0,
                w: fb_extent.width,
                h: fb_extent.height,
            }
        } else {
            begin.render_area
        };
        let clear_values: Vec<vk::ClearValue> = begin
            .clear_values
            .iter()
            .map(|c| match c {
                ClearValue::Color(vals) => vk::ClearValue {
                    color: vk::ClearColorValue { float32: *vals },
                },
                ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: *depth,
                        stencil: *stencil,
                    },
                },
            })
            .collect();
        unsafe {
            self.device.cmd_begin_render_pass(
                list.cmd_buf,
                &vk::RenderPassBeginInfo::builder()
                    .render_pass(rp)
                    .framebuffer(fb)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D {
                            x: render_area.x as i32,
                            y: render_area.y as i32,
                        },
                        extent: vk::Extent2D {
                            width: render_area.w,
                            height: render_area.h,
                        },
                    })
                    .clear_values(&clear_values)
                    .build(),
                vk::SubpassContents::INLINE,
            );
        }
        list.in_render_pass = true;
        Ok(())
    }

    pub fn cmd_next_subpass(&mut self, list: &mut CommandList) {
        debug_assert!(list.in_render_pass);
        unsafe {
            self.device
                .cmd_next_subpass(list.cmd_buf, vk::SubpassContents::INLINE);
        }
    }

    pub fn cmd_end_render_pass(&mut self, list: &mut CommandList) {
        debug_assert!(list.in_render_pass);
        unsafe { self.device.cmd_end_render_pass(list.cmd_buf) };
        list.in_render_pass = false;
    }

    /// Bind a descriptor set. Dynamic bindings take their live offsets here
    /// rather than forcing a set rebuild.
    pub fn cmd_bind_group(
        &mut self,
        list: &mut CommandList,
        pipeline_layout: Handle<PipelineLayout>,
        group: Handle<BindGroup>,
        dynamic_offsets: &[u32],
    ) -> Result<()> {
        debug_assert!(list.recording);
        let layout = self
            .pipeline_layouts
            .get_ref(pipeline_layout)
            .ok_or(GPUError::InvalidHandle)?
            .raw;
        let g = self.bind_groups.get_ref(group).ok_or(GPUError::InvalidHandle)?;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                list.cmd_buf,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                g.set_id,
                &[g.set],
                dynamic_offsets,
            );
        }
        Ok(())
    }

    pub fn cmd_bind_vertex_buffer(
        &mut self,
        list: &mut CommandList,
        view: BufferView,
    ) -> Result<()> {
        let (raw, offset, _) = self.resolve_buffer(&view)?;
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(list.cmd_buf, 0, &[raw], &[offset]);
        }
        list.touched_buffers.push(view.buffer);
        Ok(())
    }

    pub fn cmd_bind_index_buffer(
        &mut self,
        list: &mut CommandList,
        view: BufferView,
    ) -> Result<()> {
        let (raw, offset, _) = self.resolve_buffer(&view)?;
        unsafe {
            self.device
                .cmd_bind_index_buffer(list.cmd_buf, raw, offset, vk::IndexType::UINT32);
        }
        list.touched_buffers.push(view.buffer);
        Ok(())
    }

    pub fn cmd_draw(&mut self, list: &mut CommandList, draw: &Draw) {
        debug_assert!(list.in_render_pass);
        unsafe {
            self.device.cmd_draw(
                list.cmd_buf,
                draw.vertex_count,
                draw.instance_count.max(1),
                draw.first_vertex,
                draw.first_instance,
            );
        }
    }

    pub fn cmd_draw_indexed(&mut self, list: &mut CommandList, draw: &DrawIndexed) {
        debug_assert!(list.in_render_pass);
        unsafe {
            self.device.cmd_draw_indexed(
                list.cmd_buf,
                draw.index_count,
                draw.instance_count.max(1),
                draw.first_index,
                draw.vertex_offset,
                draw.first_instance,
            );
        }
    }

    pub fn cmd_copy_buffer(&mut self, list: &mut CommandList, copy: &CopyBuffer) -> Result<()> {
        let (src, src_offset, src_range) = self.resolve_buffer(&copy.src)?;
        let (dst, dst_offset, _) = self.resolve_buffer(&copy.dst)?;
        let amount = if copy.amount == 0 { src_range } else { copy.amount };
        unsafe {
            self.device.cmd_copy_buffer(
                list.cmd_buf,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size: amount,
                }],
            );
        }
        list.touched_buffers.push(copy.src.buffer);
        list.touched_buffers.push(copy.dst.buffer);
        Ok(())
    }

    /// Touched resources are stamped with the new submission generation so
    /// later locks and destroys know when the GPU is done with them.
    pub fn submit(&mut self, list: &mut CommandList, info: &SubmitInfo) -> Result<SyncPoint> {
        debug_assert!(list.recording && !list.in_render_pass);
        unsafe { self.device.end_command_buffer(list.cmd_buf)? };
        list.recording = false;

        let generation = self.submit_generation + 1;

        let wait_sems: Vec<vk::Semaphore> = info
            .wait_sems
            .iter()
            .filter_map(|h| self.semaphores.get_ref(*h).map(|s| s.raw))
            .collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_sems.len()];
        let signal_sems: Vec<vk::Semaphore> = info
            .signal_sems
            .iter()
            .filter_map(|h| self.semaphores.get_ref(*h).map(|s| s.raw))
            .collect();

        let fence = match self.free_fences.pop() {
            Some(f) => f,
            None => unsafe {
                self.device
                    .create_fence(&vk::FenceCreateInfo::builder().build(), None)?
            },
        };

        let cmd_bufs = [list.cmd_buf];
        let submit = vk::SubmitInfo::builder()
            .command_buffers(&cmd_bufs)
            .wait_semaphores(&wait_sems)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_sems)
            .build();
        unsafe {
            self.device
                .queue_submit(self.gfx_queue.queue, &[submit], fence)?;
        }

        self.submit_generation = generation;
        self.in_flight.push(InFlightSubmit { fence, generation });
        log::trace!("submitted `{}` as generation {generation}", list.debug_name);

        for handle in list.touched_buffers.drain(..) {
            if let Some(buf) = self.buffers.get_mut_ref(handle) {
                buf.last_submit = generation;
                let alloc = buf.allocation;
                self.allocator.note_access(&alloc);
            }
        }
        for handle in list.touched_images.drain(..) {
            if let Some(img) = self.images.get_mut_ref(handle) {
                img.last_submit = generation;
                let alloc = img.allocation;
                self.allocator.note_access(&alloc);
            }
        }

        Ok(SyncPoint { generation })
    }

    pub fn reset_command_list(&mut self, list: &mut CommandList) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(list.cmd_buf, vk::CommandBufferResetFlags::empty())?;
            self.device
                .begin_command_buffer(list.cmd_buf, &vk::CommandBufferBeginInfo::builder().build())?;
        }
        list.recording = true;
        list.in_render_pass = false;
        Ok(())
    }

    pub fn destroy_command_list(&mut self, list: CommandList) {
        self.free_cmd_bufs.push(list.cmd_buf);
    }

    // ---- fences / frame boundary ----------------------------------------

    /// Block until the given point on the submission timeline has passed.
    pub fn wait(&mut self, point: SyncPoint) -> Result<()> {
        while self.completed_generation < point.generation {
            let Some(front) = self.in_flight.first() else {
                break;
            };
            let fence = front.fence;
            unsafe {
                self.device.wait_for_fences(&[fence], true, u64::MAX)?;
            }
            self.harvest_fences()?;
        }
        Ok(())
    }

    pub fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        let pending: Vec<u64> = self.in_flight.iter().map(|f| f.generation).collect();
        if let Some(max) = pending.iter().max() {
            self.completed_generation = self.completed_generation.max(*max);
        }
        for submit in std::mem::take(&mut self.in_flight) {
            unsafe { self.device.reset_fences(&[submit.fence])? };
            self.free_fences.push(submit.fence);
        }
        Ok(())
    }

    fn harvest_fences(&mut self) -> Result<()> {
        while let Some(front) = self.in_flight.first() {
            let signaled = unsafe { self.device.get_fence_status(front.fence)? };
            if !signaled {
                break;
            }
            let submit = self.in_flight.remove(0);
            self.completed_generation = self.completed_generation.max(submit.generation);
            unsafe { self.device.reset_fences(&[submit.fence])? };
            self.free_fences.push(submit.fence);
        }
        Ok(())
    }

    /// Frame boundary: observe fence progress, reclaim everything whose
    /// generation completed, retire ring-arena slices, and run allocator
    /// housekeeping. Call once per frame from the submission thread.
    pub fn end_frame(&mut self) -> Result<()> {
        self.frame += 1;
        self.harvest_fences()?;
        let completed = self.completed_generation;

        let mut zombies = Vec::new();
        self.reclaim.collect(completed, |z| zombies.push(z));
        for zombie in zombies {
            self.destroy_zombie(zombie);
        }

        self.arena.retire(completed);
        self.allocator.end_frame(self.frame);
        Ok(())
    }

    fn destroy_zombie(&mut self, zombie: ZombieHandle) {
        unsafe {
            match zombie {
                ZombieHandle::Buffer(b) => self.device.destroy_buffer(b, None),
                ZombieHandle::Image(i) => self.device.destroy_image(i, None),
                ZombieHandle::ImageView(v) => self.device.destroy_image_view(v, None),
                ZombieHandle::Sampler(s) => self.device.destroy_sampler(s, None),
                ZombieHandle::DescriptorPool(p) => self.device.destroy_descriptor_pool(p, None),
                ZombieHandle::DescriptorSet(s, p) => {
                    let _ = self.device.free_descriptor_sets(p, &[s]);
                }
                ZombieHandle::DescriptorSetLayout(l) => {
                    self.device.destroy_descriptor_set_layout(l, None)
                }
                ZombieHandle::PipelineLayout(l) => self.device.destroy_pipeline_layout(l, None),
                ZombieHandle::RenderPass(rp) => self.device.destroy_render_pass(rp, None),
                ZombieHandle::Framebuffer(fb) => self.device.destroy_framebuffer(fb, None),
                ZombieHandle::Fence(f) => self.device.destroy_fence(f, None),
                ZombieHandle::Semaphore(s) => self.device.destroy_semaphore(s, None),
                ZombieHandle::Allocation(a) => self.allocator.free(a),
            }
        }
    }

    // ---- deferred destruction -------------------------------------------

    /// All `destroy_*` calls below only enqueue; the real destroy happens
    /// at a frame boundary once the recorded generation is proven complete.
    pub fn destroy_buffer(&mut self, handle: Handle<Buffer>) {
        let Some(buf) = self.buffers.take(handle) else {
            return;
        };
        if buf.is_locked() {
            log::warn!("destroying `{}` while locked", buf.debug_name);
        }
        let generation = self.submit_generation;
        if !buf.volatile {
            if buf.raw != vk::Buffer::null() {
                self.reclaim.enqueue(ZombieHandle::Buffer(buf.raw), generation);
            }
            self.owners.remove(&buf.allocation.id);
            self.reclaim
                .enqueue(ZombieHandle::Allocation(buf.allocation), generation);
        }
    }

    pub fn destroy_image(&mut self, handle: Handle<Image>) {
        let Some(mut img) = self.images.take(handle) else {
            return;
        };
        let generation = self.submit_generation;
        for view in img.take_views() {
            self.reclaim.enqueue(ZombieHandle::ImageView(view), generation);
        }
        if img.raw != vk::Image::null() {
            self.reclaim.enqueue(ZombieHandle::Image(img.raw), generation);
        }
        self.owners.remove(&img.allocation.id);
        self.reclaim
            .enqueue(ZombieHandle::Allocation(img.allocation), generation);
    }

    pub fn destroy_sampler(&mut self, handle: Handle<Sampler>) {
        if let Some(sampler) = self.samplers.take(handle) {
            self.reclaim
                .enqueue(ZombieHandle::Sampler(sampler.raw), self.submit_generation);
        }
    }

    pub fn destroy_semaphore(&mut self, handle: Handle<Semaphore>) {
        if let Some(sem) = self.semaphores.take(handle) {
            self.reclaim
                .enqueue(ZombieHandle::Semaphore(sem.raw), self.submit_generation);
        }
    }

    pub fn destroy_bind_group(&mut self, handle: Handle<BindGroup>) {
        let Some(group) = self.bind_groups.take(handle) else {
            return;
        };
        if let Some(layout) = self.bind_group_layouts.get_ref(group.layout) {
            self.reclaim.enqueue(
                ZombieHandle::DescriptorSet(group.set, layout.pool),
                self.submit_generation,
            );
        }
    }

    pub fn destroy_framebuffer(&mut self, handle: Handle<Framebuffer>) {
        if let Some(fb) = self.framebuffers.take(handle) {
            self.reclaim
                .enqueue(ZombieHandle::Framebuffer(fb.raw), self.submit_generation);
        }
    }

    pub fn destroy_render_pass(&mut self, handle: Handle<RenderPass>) {
        let Some(rp) = self.render_passes.take(handle) else {
            return;
        };
        self.render_pass_lookup
            .remove(&(Arc::as_ptr(&rp.desc) as usize));
        self.reclaim
            .enqueue(ZombieHandle::RenderPass(rp.raw), self.submit_generation);
    }

    // ---- teardown --------------------------------------------------------

    /// Tear the context down: drains the GPU, flushes every pending
    /// reclamation, then destroys all remaining driver objects.
    pub fn destroy(mut self) {
        if self.wait_idle().is_err() {
            log::warn!("device wait failed during teardown");
        }

        let mut zombies = Vec::new();
        self.reclaim.flush_all(|z| zombies.push(z));
        for zombie in zombies {
            self.destroy_zombie(zombie);
        }

        unsafe {
            let device = self.device.clone();
            self.buffers.drain_occupied(|buf| {
                if !buf.volatile && buf.raw != vk::Buffer::null() {
                    device.destroy_buffer(buf.raw, None);
                }
            });
            self.images.drain_occupied(|mut img| {
                for view in img.take_views() {
                    device.destroy_image_view(view, None);
                }
                if img.raw != vk::Image::null() {
                    device.destroy_image(img.raw, None);
                }
            });
            self.samplers.drain_occupied(|s| {
                device.destroy_sampler(s.raw, None);
            });
            self.framebuffers.drain_occupied(|fb| {
                device.destroy_framebuffer(fb.raw, None);
            });
            self.render_passes.drain_occupied(|rp| {
                device.destroy_render_pass(rp.raw, None);
            });
            self.pipeline_layouts.drain_occupied(|pl| {
                device.destroy_pipeline_layout(pl.raw, None);
            });
            self.bind_group_layouts.drain_occupied(|layout| {
                for raw in &layout.raw_sets {
                    device.destroy_descriptor_set_layout(*raw, None);
                }
                device.destroy_descriptor_pool(layout.pool, None);
            });
            self.semaphores.drain_occupied(|s| {
                device.destroy_semaphore(s.raw, None);
            });
            for fence in self.free_fences.drain(..) {
                device.destroy_fence(fence, None);
            }
            device.destroy_buffer(self.arena_buffer, None);
            device.destroy_command_pool(self.cmd_pool, None);

            self.allocator.free(self.arena_allocation);
            self.allocator.heap_mut().destroy();

            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }

    // ---- helpers ---------------------------------------------------------

    fn resolve_buffer(&self, view: &BufferView) -> Result<(vk::Buffer, u64, u64)> {
        let buf = self
            .buffers
            .get_ref(view.buffer)
            .ok_or(GPUError::InvalidHandle)?;
        let raw = if buf.volatile { self.arena_buffer } else { buf.raw };
        if raw == vk::Buffer::null() {
            return Err(GPUError::InvalidHandle);
        }
        let base = if buf.volatile { buf.ring_offset } else { 0 };
        if view.offset >= buf.byte_size {
            return Err(GPUError::InvalidHandle);
        }
        let size = if view.size == u64::MAX {
            buf.byte_size - view.offset
        } else {
            view.size
        };
        Ok((raw, base + view.offset, size))
    }

    fn upload_to_buffer(&mut self, handle: Handle<Buffer>, offset: u64, data: &[u8]) -> Result<()> {
        let staging = self.make_buffer(&BufferInfo {
            debug_name: "upload staging",
            byte_size: data.len() as u64,
            visibility: MemoryVisibility::CpuAndGpu,
            usage: BufferUsage::TRANSFER_SRC,
            priority: MemoryPriority::Low,
            volatile: false,
            initial_data: Some(data),
        })?;
        let mut list = self.begin_command_list("upload")?;
        self.cmd_copy_buffer(
            &mut list,
            &CopyBuffer {
                src: BufferView::new(staging),
                dst: BufferView {
                    buffer: handle,
                    offset,
                    size: data.len() as u64,
                },
                amount: data.len() as u64,
            },
        )?;
        let point = self.submit(&mut list, &Default::default())?;
        self.wait(point)?;
        self.destroy_command_list(list);
        self.destroy_buffer(staging);
        Ok(())
    }

    fn upload_to_image(&mut self, handle: Handle<Image>, data: &[u8]) -> Result<()> {
        let staging = self.make_buffer(&BufferInfo {
            debug_name: "image upload staging",
            byte_size: data.len() as u64,
            visibility: MemoryVisibility::CpuAndGpu,
            usage: BufferUsage::TRANSFER_SRC,
            priority: MemoryPriority::Low,
            volatile: false,
            initial_data: Some(data),
        })?;
        let result = self.copy_staging_to_image(handle, staging);
        self.destroy_buffer(staging);
        result
    }

    fn image_copy_geometry(
        &self,
        handle: Handle<Image>,
    ) -> Result<(vk::Image, vk::ImageAspectFlags, vk::ImageSubresourceRange, vk::BufferImageCopy)>
    {
        let img = self.images.get_ref(handle).ok_or(GPUError::InvalidHandle)?;
        let aspect = if img.format().is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        };
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: img.layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: img.dim()[0],
                height: img.dim()[1],
                depth: img.dim()[2],
            },
        };
        Ok((img.raw, aspect, range, region))
    }

    /// One-shot staging -> image copy with the layout transitions around it.
    fn copy_staging_to_image(
        &mut self,
        handle: Handle<Image>,
        staging: Handle<Buffer>,
    ) -> Result<()> {
        let (raw, _aspect, range, region) = self.image_copy_geometry(handle)?;
        let staging_raw = self
            .buffers
            .get_ref(staging)
            .ok_or(GPUError::InvalidHandle)?
            .raw;

        let mut list = self.begin_command_list("image upload")?;
        unsafe {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .image(raw)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .subresource_range(range)
                .build();
            self.device.cmd_pipeline_barrier(
                list.cmd_buf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            self.device.cmd_copy_buffer_to_image(
                list.cmd_buf,
                staging_raw,
                raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            let to_shader = vk::ImageMemoryBarrier::builder()
                .image(raw)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .subresource_range(range)
                .build();
            self.device.cmd_pipeline_barrier(
                list.cmd_buf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        }
        let point = self.submit(&mut list, &Default::default())?;
        self.wait(point)?;
        self.destroy_command_list(list);
        Ok(())
    }

    /// One-shot image -> staging readback, for read locks and eviction
    /// verification paths.
    fn copy_image_to_staging(
        &mut self,
        handle: Handle<Image>,
        staging: Handle<Buffer>,
    ) -> Result<()> {
        let (raw, _aspect, range, region) = self.image_copy_geometry(handle)?;
        let staging_raw = self
            .buffers
            .get_ref(staging)
            .ok_or(GPUError::InvalidHandle)?
            .raw;

        let mut list = self.begin_command_list("image readback")?;
        unsafe {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .image(raw)
                .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_access_mask(vk::AccessFlags::SHADER_READ)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .subresource_range(range)
                .build();
            self.device.cmd_pipeline_barrier(
                list.cmd_buf,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            self.device.cmd_copy_image_to_buffer(
                list.cmd_buf,
                raw,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging_raw,
                &[region],
            );
            let back = vk::ImageMemoryBarrier::builder()
                .image(raw)
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .subresource_range(range)
                .build();
            self.device.cmd_pipeline_barrier(
                list.cmd_buf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[back],
            );
        }
        let point = self.submit(&mut list, &Default::default())?;
        self.wait(point)?;
        self.destroy_command_list(list);
        Ok(())
    }
}

/// Ring of command lists with one in-flight fence per frame: the standard
/// per-frame recording pattern for a submission thread.
pub struct CommandRing {
    frames: PerFrame<RingFrame>,
}

#[derive(Default)]
struct RingFrame {
    list: Option<CommandList>,
    pending: Option<SyncPoint>,
}

impl CommandRing {
    pub fn new(ctx: &mut Context, debug_name: &str, frame_count: usize) -> Result<Self> {
        let mut lists = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            lists.push(Some(ctx.begin_command_list(debug_name)?));
        }
        Ok(Self {
            frames: PerFrame::from_fn(frame_count, |i| RingFrame {
                list: lists[i].take(),
                pending: None,
            }),
        })
    }

    /// Wait for this frame's previous submission, reset its list, and hand
    /// it to the closure for recording.
    pub fn record<F>(&mut self, ctx: &mut Context, mut record_fn: F) -> Result<()>
    where
        F: FnMut(&mut Context, &mut CommandList) -> Result<()>,
    {
        let frame = self.frames.curr_mut();
        if let Some(point) = frame.pending.take() {
            ctx.wait(point)?;
        }
        let mut list = frame.list.take().expect("command ring frame in use");
        let result = ctx
            .reset_command_list(&mut list)
            .and_then(|_| record_fn(ctx, &mut list));
        self.frames.curr_mut().list = Some(list);
        result
    }

    pub fn submit(&mut self, ctx: &mut Context, info: &SubmitInfo) -> Result<SyncPoint> {
        let frame = self.frames.curr_mut();
        let mut list = frame.list.take().expect("command ring frame in use");
        let point = ctx.submit(&mut list, info)?;
        frame.list = Some(list);
        frame.pending = Some(point);
        self.frames.advance_next_frame();
        Ok(point)
    }

    pub fn wait_all(&mut self, ctx: &mut Context) -> Result<()> {
        let mut points = Vec::new();
        self.frames.for_each_mut(|frame| {
            if let Some(point) = frame.pending.take() {
                points.push(point);
            }
        });
        for point in points {
            ctx.wait(point)?;
        }
        Ok(())
    }

    pub fn destroy(mut self, ctx: &mut Context) {
        let _ = self.wait_all(ctx);
        self.frames.for_each_mut(|frame| {
            if let Some(list) = frame.list.take() {
                ctx.destroy_command_list(list);
            }
        });
    }
}
