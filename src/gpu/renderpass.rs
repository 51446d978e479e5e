use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use ash::vk;

use super::error::{GPUError, Result};
use super::structs::{AttachmentDescription, LoadOp};

/// Subpass sequencing requested by the renderer for one render target
/// layout.
#[derive(Hash, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PassHint {
    /// One subpass, attachments as given.
    #[default]
    Plain,
    /// Two subpasses; the second re-reads depth as an input attachment.
    DepthRead,
    /// Three subpasses: G-buffer fill, lighting with depth input, and a
    /// composition pass reading depth plus every G-buffer attachment.
    DeferredShading,
}

/// What the device actually supports; queried once at context creation and
/// checked at layout-authoring time. A missing capability is a hard error,
/// never a silently degraded pass.
#[derive(Clone, Copy, Debug)]
pub struct DeviceCaps {
    pub multiview: bool,
    pub fragment_shading_rate: bool,
    pub max_color_attachments: u32,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            multiview: false,
            fragment_shading_rate: false,
            max_color_attachments: 8,
        }
    }
}

/// Engine-side description of a render target: ordered color attachments
/// (for [`PassHint::DeferredShading`], index 0 is the scene color and the
/// rest are G-buffer), an optional depth attachment, resolve targets, and
/// the multi-view / shading-rate configuration.
#[derive(Hash, Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderTargetLayout {
    pub colors: Vec<AttachmentDescription>,
    pub depth: Option<AttachmentDescription>,
    /// Indices into `colors` that get a single-sampled resolve target.
    pub resolves: Vec<u32>,
    pub hint: PassHint,
    /// Zero disables multi-view. Applied uniformly to every subpass.
    pub view_mask: u32,
    /// Request an attachment-driven variable-rate-shading attachment.
    pub shading_rate: bool,
}

impl RenderTargetLayout {
    pub fn structural_hash(&self) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        let h = hasher.finish();
        (h as u32) ^ ((h >> 32) as u32)
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentRef {
    pub attachment: u32,
    pub layout: vk::ImageLayout,
}

#[derive(Hash, Clone, Debug, Default, PartialEq, Eq)]
pub struct SubpassDesc {
    pub colors: Vec<AttachmentRef>,
    pub inputs: Vec<AttachmentRef>,
    /// Parallel to `colors`; `vk::ATTACHMENT_UNUSED` where no resolve
    /// happens. Empty when the subpass resolves nothing.
    pub resolves: Vec<AttachmentRef>,
    pub depth: Option<AttachmentRef>,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubpassDependencyDesc {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub by_region: bool,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderPassAttachment {
    pub desc: AttachmentDescription,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// Platform-independent render pass description: the exact attachment,
/// subpass and dependency tables the driver object is created from.
/// Immutable once built; shared by every framebuffer/pipeline that targets
/// the same layout.
#[derive(Hash, Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderPassDescription {
    pub attachments: Vec<RenderPassAttachment>,
    pub subpasses: Vec<SubpassDesc>,
    pub dependencies: Vec<SubpassDependencyDesc>,
    pub view_mask: u32,
    pub correlation_mask: u32,
    /// Index of the fragment-density attachment when rate-driven shading is
    /// active.
    pub density_attachment: Option<u32>,
}

fn depth_to_fragment_dependency(src: u32, dst: u32) -> SubpassDependencyDesc {
    SubpassDependencyDesc {
        src_subpass: src,
        dst_subpass: dst,
        src_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_access: vk::AccessFlags::INPUT_ATTACHMENT_READ,
        by_region: true,
    }
}

fn color_to_fragment_dependency(src: u32, dst: u32) -> SubpassDependencyDesc {
    SubpassDependencyDesc {
        src_subpass: src,
        dst_subpass: dst,
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dst_access: vk::AccessFlags::INPUT_ATTACHMENT_READ,
        by_region: true,
    }
}

/// Build the subpass/dependency tables for a render target layout.
///
/// `allow_shading_rate` is the global gate; when it is off a requested
/// shading-rate attachment is simply not chained in (it is an optimization,
/// not part of the pass semantics). A missing *device* capability, by
/// contrast, is an error.
pub fn build_render_pass_description(
    layout: &RenderTargetLayout,
    caps: &DeviceCaps,
    allow_shading_rate: bool,
) -> Result<RenderPassDescription> {
    if layout.colors.len() as u32 > caps.max_color_attachments {
        return Err(GPUError::InvalidRenderTarget(
            "more color attachments than the device supports",
        ));
    }
    if layout.view_mask != 0 && !caps.multiview {
        return Err(GPUError::CapabilityMismatch("multiview"));
    }
    let depth_needed = matches!(layout.hint, PassHint::DepthRead | PassHint::DeferredShading);
    if depth_needed && layout.depth.is_none() {
        return Err(GPUError::InvalidRenderTarget(
            "hint re-reads depth but the layout has no depth attachment",
        ));
    }
    if layout.hint == PassHint::DeferredShading && layout.colors.len() < 2 {
        return Err(GPUError::InvalidRenderTarget(
            "deferred shading needs a scene color plus at least one auxiliary attachment",
        ));
    }
    for resolve in &layout.resolves {
        if *resolve as usize >= layout.colors.len() {
            return Err(GPUError::InvalidRenderTarget(
                "resolve index out of range",
            ));
        }
    }
    let uses_shading_rate = if layout.shading_rate && allow_shading_rate {
        if !caps.fragment_shading_rate {
            return Err(GPUError::CapabilityMismatch("fragment shading rate"));
        }
        true
    } else {
        if layout.shading_rate {
            log::debug!("shading-rate attachment requested but globally disabled; skipping");
        }
        false
    };

    // Attachment table: colors first, depth after, resolve targets last.
    let mut attachments = Vec::with_capacity(layout.colors.len() + 1 + layout.resolves.len());
    for color in &layout.colors {
        attachments.push(RenderPassAttachment {
            desc: *color,
            initial_layout: initial_layout_for(color, false),
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
    }
    let depth_index = layout.depth.map(|desc| {
        attachments.push(RenderPassAttachment {
            desc,
            initial_layout: initial_layout_for(&desc, true),
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        (attachments.len() - 1) as u32
    });
    let mut resolve_targets: Vec<AttachmentRef> = Vec::new();
    if !layout.resolves.is_empty() {
        resolve_targets = layout
            .colors
            .iter()
            .enumerate()
            .map(|(i, color)| {
                if layout.resolves.contains(&(i as u32)) {
                    attachments.push(RenderPassAttachment {
                        desc: AttachmentDescription {
                            samples: super::structs::SampleCount::S1,
                            ..*color
                        },
                        initial_layout: vk::ImageLayout::UNDEFINED,
                        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    });
                    AttachmentRef {
                        attachment: (attachments.len() - 1) as u32,
                        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    }
                } else {
                    AttachmentRef {
                        attachment: vk::ATTACHMENT_UNUSED,
                        layout: vk::ImageLayout::UNDEFINED,
                    }
                }
            })
            .collect();
    }

    let color_write = |i: u32| AttachmentRef {
        attachment: i,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let all_colors: Vec<AttachmentRef> =
        (0..layout.colors.len() as u32).map(color_write).collect();
    let depth_write = depth_index.map(|i| AttachmentRef {
        attachment: i,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    });
    let depth_read = depth_index.map(|i| AttachmentRef {
        attachment: i,
        layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    });
    let depth_input = depth_index.map(|i| AttachmentRef {
        attachment: i,
        layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    });

    let mut subpasses = Vec::new();
    let mut dependencies = Vec::new();
    match layout.hint {
        PassHint::Plain => {
            subpasses.push(SubpassDesc {
                colors: all_colors,
                inputs: Vec::new(),
                resolves: resolve_targets,
                depth: depth_write,
            });
        }
        PassHint::DepthRead => {
            subpasses.push(SubpassDesc {
                colors: all_colors.clone(),
                inputs: Vec::new(),
                resolves: Vec::new(),
                depth: depth_write,
            });
            subpasses.push(SubpassDesc {
                colors: all_colors,
                inputs: vec![depth_input.unwrap()],
                resolves: resolve_targets,
                depth: depth_read,
            });
            dependencies.push(depth_to_fragment_dependency(0, 1));
        }
        PassHint::DeferredShading => {
            // (0) scene color + G-buffer fill with depth test.
            subpasses.push(SubpassDesc {
                colors: all_colors.clone(),
                inputs: Vec::new(),
                resolves: Vec::new(),
                depth: depth_write,
            });
            // (1) still writing every color target, now sampling depth.
            subpasses.push(SubpassDesc {
                colors: all_colors.clone(),
                inputs: vec![depth_input.unwrap()],
                resolves: Vec::new(),
                depth: depth_read,
            });
            // (2) composition: reads depth + G-buffer, writes scene color.
            let mut inputs = vec![depth_input.unwrap()];
            inputs.extend((1..layout.colors.len() as u32).map(|i| AttachmentRef {
                attachment: i,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }));
            // Resolve refs must stay parallel to this subpass's single
            // color attachment.
            let mut resolves = resolve_targets;
            resolves.truncate(1);
            subpasses.push(SubpassDesc {
                colors: vec![color_write(0)],
                inputs,
                resolves,
                depth: depth_read,
            });
            dependencies.push(depth_to_fragment_dependency(0, 1));
            dependencies.push(color_to_fragment_dependency(1, 2));
        }
    }

    let density_attachment = uses_shading_rate.then(|| {
        attachments.push(RenderPassAttachment {
            desc: AttachmentDescription {
                format: super::structs::Format::RG8Unorm,
                load_op: LoadOp::Load,
                store_op: super::structs::StoreOp::DontCare,
                ..Default::default()
            },
            initial_layout: vk::ImageLayout::FRAGMENT_DENSITY_MAP_OPTIMAL_EXT,
            final_layout: vk::ImageLayout::FRAGMENT_DENSITY_MAP_OPTIMAL_EXT,
        });
        (attachments.len() - 1) as u32
    });

    Ok(RenderPassDescription {
        attachments,
        subpasses,
        dependencies,
        view_mask: layout.view_mask,
        correlation_mask: layout.view_mask,
        density_attachment,
    })
}

fn initial_layout_for(desc: &AttachmentDescription, depth: bool) -> vk::ImageLayout {
    // Only a loaded attachment has defined contents to preserve.
    if desc.load_op == LoadOp::Load {
        if depth {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        }
    } else {
        vk::ImageLayout::UNDEFINED
    }
}

/// Process-wide render pass description cache, keyed by the target layout's
/// structural hash with full equality verified on every hit.
#[derive(Default)]
pub struct RenderPassCache {
    inner: Mutex<HashMap<u32, Vec<(RenderTargetLayout, Arc<RenderPassDescription>)>>>,
}

impl RenderPassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &self,
        layout: &RenderTargetLayout,
        caps: &DeviceCaps,
        allow_shading_rate: bool,
    ) -> Result<Arc<RenderPassDescription>> {
        let key = layout.structural_hash();
        {
            let inner = self.inner.lock().expect("render pass cache lock poisoned");
            if let Some(bucket) = inner.get(&key) {
                for (cached_layout, desc) in bucket {
                    if cached_layout == layout {
                        return Ok(desc.clone());
                    }
                }
                log::warn!(
                    "render target layout hash collision on {key:#010x}; building a distinct pass"
                );
            }
        }

        let built = Arc::new(build_render_pass_description(layout, caps, allow_shading_rate)?);
        let mut inner = self.inner.lock().expect("render pass cache lock poisoned");
        let bucket = inner.entry(key).or_default();
        // Another thread may have built the same pass while we were out of
        // the lock; keep the first one.
        for (cached_layout, desc) in bucket.iter() {
            if cached_layout == layout {
                return Ok(desc.clone());
            }
        }
        bucket.push((layout.clone(), built.clone()));
        Ok(built)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("render pass cache lock poisoned")
            .values()
            .map(|b| b.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
