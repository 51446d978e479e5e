//! Render pass builder scenarios driven through the public cache API.

use std::sync::Arc;

use ash::vk;
use koji::gpu::error::GPUError;
use koji::gpu::renderpass::{DeviceCaps, PassHint, RenderPassCache, RenderTargetLayout};
use koji::gpu::structs::{AttachmentDescription, Format, LoadOp, SampleCount, StoreOp};

fn attachment(format: Format) -> AttachmentDescription {
    AttachmentDescription {
        format,
        samples: SampleCount::S1,
        load_op: LoadOp::Clear,
        store_op: StoreOp::Store,
        stencil_load_op: LoadOp::DontCare,
        stencil_store_op: StoreOp::DontCare,
    }
}

fn caps() -> DeviceCaps {
    DeviceCaps {
        multiview: true,
        fragment_shading_rate: false,
        max_color_attachments: 8,
    }
}

#[test]
fn same_attachments_different_hint_share_nothing_but_attachments() {
    let cache = RenderPassCache::new();

    let plain = RenderTargetLayout {
        colors: vec![attachment(Format::RGBA8)],
        depth: Some(attachment(Format::D32F)),
        hint: PassHint::Plain,
        ..Default::default()
    };
    let mut depth_read = plain.clone();
    depth_read.hint = PassHint::DepthRead;

    let a = cache.get_or_build(&plain, &caps(), false).unwrap();
    let b = cache.get_or_build(&depth_read, &caps(), false).unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(a.subpasses.len(), 1);
    assert_eq!(b.subpasses.len(), 2);
    // Identical attachment lists and load/store ops, whatever the hint.
    assert_eq!(a.attachments, b.attachments);
    assert_eq!(cache.len(), 2);
}

#[test]
fn deferred_shading_shape_is_exact() {
    let cache = RenderPassCache::new();
    let layout = RenderTargetLayout {
        colors: vec![
            attachment(Format::RGBA16F),
            attachment(Format::RGBA8),
            attachment(Format::RG16F),
            attachment(Format::R32F),
        ],
        depth: Some(attachment(Format::D24S8)),
        hint: PassHint::DeferredShading,
        ..Default::default()
    };
    let desc = cache.get_or_build(&layout, &caps(), false).unwrap();

    assert_eq!(desc.subpasses.len(), 3);
    assert_eq!(desc.dependencies.len(), 2);

    // Depth hand-off: depth writes of subpass 0 visible to fragment reads
    // of subpass 1.
    let depth_dep = &desc.dependencies[0];
    assert_eq!(
        depth_dep.src_access,
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
    );
    assert_eq!(depth_dep.dst_access, vk::AccessFlags::INPUT_ATTACHMENT_READ);
    assert!(depth_dep
        .src_stage
        .contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
    assert_eq!(depth_dep.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

    // G-buffer hand-off: color writes of subpass 1 visible to fragment
    // reads of subpass 2.
    let color_dep = &desc.dependencies[1];
    assert_eq!(color_dep.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    assert_eq!(color_dep.dst_access, vk::AccessFlags::INPUT_ATTACHMENT_READ);
    assert_eq!(
        color_dep.src_stage,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    );
    assert_eq!(color_dep.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

    // Composition subpass reads depth plus all three G-buffer attachments
    // and writes only the scene color.
    let composition = &desc.subpasses[2];
    assert_eq!(composition.inputs.len(), 4);
    assert_eq!(composition.colors.len(), 1);
    assert_eq!(composition.colors[0].attachment, 0);
}

#[test]
fn stereo_layout_needs_multiview() {
    let cache = RenderPassCache::new();
    let layout = RenderTargetLayout {
        colors: vec![attachment(Format::RGBA8)],
        view_mask: 0b11,
        ..Default::default()
    };

    let no_multiview = DeviceCaps {
        multiview: false,
        ..caps()
    };
    // Never silently degraded: a missing capability is a build-time error.
    assert!(matches!(
        cache.get_or_build(&layout, &no_multiview, false).unwrap_err(),
        GPUError::CapabilityMismatch("multiview")
    ));

    let desc = cache.get_or_build(&layout, &caps(), false).unwrap();
    assert_eq!(desc.view_mask, 0b11);
    assert_eq!(desc.correlation_mask, 0b11);
}

#[test]
fn cache_is_reference_identical_for_equal_layouts() {
    let cache = RenderPassCache::new();
    let make_layout = || RenderTargetLayout {
        colors: vec![attachment(Format::RGBA8)],
        depth: Some(attachment(Format::D32F)),
        hint: PassHint::DepthRead,
        ..Default::default()
    };
    let a = cache.get_or_build(&make_layout(), &caps(), false).unwrap();
    let b = cache.get_or_build(&make_layout(), &caps(), false).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);
}
