//! Driver-backed smoke tests. These need a Vulkan-capable device and
//! ICD, so they are ignored by default:
//!
//! ```sh
//! cargo test --test vulkan_smoke -- --ignored
//! ```

use koji::gpu::layout::LayoutPolicy;
use koji::gpu::reflect::{name_hash, BindingKind, ReflectedBinding, StageMask, StageReflection};
use koji::gpu::renderpass::{PassHint, RenderTargetLayout};
use koji::gpu::resource::LockMode;
use koji::gpu::structs::*;
use koji::gpu::vulkan::{BindGroupInfo, BindGroupLayoutInfo, BindingInfo, Context, ShaderResource};
use koji::gpu::BufferView;
use serial_test::serial;

fn attachment(format: Format) -> AttachmentDescription {
    AttachmentDescription {
        format,
        load_op: LoadOp::Clear,
        store_op: StoreOp::Store,
        ..Default::default()
    }
}

#[test]
#[serial]
#[ignore = "requires a Vulkan-capable device"]
fn buffer_lock_write_bind_cycle() {
    let mut ctx = Context::headless(&ContextInfo::default()).expect("headless context");

    let buffer = ctx
        .make_buffer(&BufferInfo {
            debug_name: "per_draw",
            byte_size: 256,
            visibility: MemoryVisibility::CpuAndGpu,
            usage: BufferUsage::UNIFORM,
            ..Default::default()
        })
        .unwrap();

    let ptr = ctx.lock_buffer(buffer, 0, 256, LockMode::Write).unwrap();
    unsafe {
        for i in 0..256 {
            *ptr.add(i) = i as u8;
        }
    }
    ctx.unlock_buffer(buffer).unwrap();

    let layout = ctx
        .make_bind_group_layout(&BindGroupLayoutInfo {
            debug_name: "per_draw",
            stages: &[StageReflection {
                stage: StageMask::VERTEX,
                bindings: vec![ReflectedBinding {
                    name_hash: name_hash("per_draw"),
                    kind: BindingKind::UniformBuffer,
                    slot: 0,
                    ..Default::default()
                }],
            }],
            immutable_samplers: &[],
            policy: LayoutPolicy::default(),
        })
        .unwrap();

    let group = ctx
        .make_bind_group(&BindGroupInfo {
            debug_name: "per_draw",
            layout,
            set: 0,
            bindings: &[BindingInfo {
                binding: 0,
                resource: ShaderResource::UniformBuffer(BufferView::new(buffer)),
            }],
        })
        .unwrap();

    ctx.destroy_bind_group(group);
    ctx.destroy_buffer(buffer);
    ctx.end_frame().unwrap();
    ctx.destroy();
}

#[test]
#[serial]
#[ignore = "requires a Vulkan-capable device"]
fn render_pass_and_empty_submit() {
    let mut ctx = Context::headless(&ContextInfo::default()).expect("headless context");

    let rp = ctx
        .get_or_create_render_pass(&RenderTargetLayout {
            colors: vec![attachment(Format::RGBA8)],
            depth: Some(attachment(Format::D32F)),
            hint: PassHint::Plain,
            ..Default::default()
        })
        .unwrap();
    // Identical layout: same handle, no new driver object.
    let rp2 = ctx
        .get_or_create_render_pass(&RenderTargetLayout {
            colors: vec![attachment(Format::RGBA8)],
            depth: Some(attachment(Format::D32F)),
            hint: PassHint::Plain,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rp, rp2);

    let mut list = ctx.begin_command_list("empty").unwrap();
    let point = ctx.submit(&mut list, &Default::default()).unwrap();
    ctx.wait(point).unwrap();
    ctx.destroy_command_list(list);

    ctx.destroy_render_pass(rp);
    ctx.end_frame().unwrap();
    ctx.destroy();
}

#[test]
#[serial]
#[ignore = "requires a Vulkan-capable device"]
fn volatile_buffer_rotates_per_lock() {
    let mut ctx = Context::headless(&ContextInfo::default()).expect("headless context");

    let buffer = ctx
        .make_buffer(&BufferInfo {
            debug_name: "transient",
            byte_size: 1024,
            usage: BufferUsage::UNIFORM,
            volatile: true,
            ..Default::default()
        })
        .unwrap();

    let mut revisions = Vec::new();
    for _ in 0..3 {
        let _ptr = ctx
            .lock_buffer(buffer, 0, 1024, LockMode::Accumulate)
            .unwrap();
        revisions.push(ctx.buffer_revision(buffer).unwrap());
        ctx.unlock_buffer(buffer).unwrap();
    }
    // Every lock rotates onto a fresh arena slice.
    assert!(revisions.windows(2).all(|w| w[0] != w[1]));

    ctx.destroy_buffer(buffer);
    ctx.end_frame().unwrap();
    ctx.destroy();
}
