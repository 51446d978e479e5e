use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::utils::Handle;

use super::error::{GPUError, Result};
use super::reflect::{BindingKind, StageMask, StageReflection};
use super::resource::Sampler;

/// How reflected bindings are grouped into descriptor sets.
///
/// `PerStage` is the default. `SharedUniforms` hoists uniform buffers that
/// appear in more than one stage into an extra shared set so their
/// descriptors are written once instead of per stage. `SingleSet` collapses
/// everything into set 0 for platforms with a tiny bound-set limit. The
/// choice is a performance knob, not a correctness requirement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetPlacement {
    #[default]
    PerStage,
    SharedUniforms,
    SingleSet,
}

/// Which uniform buffers get a dynamic offset supplied at bind time instead
/// of being baked into the descriptor set, avoiding set rebuilds when only
/// the offset changes between draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DynamicBufferPolicy {
    None,
    #[default]
    PackedOnly,
    All,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayoutPolicy {
    pub placement: SetPlacement,
    pub dynamic: DynamicBufferPolicy,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    UniformBuffer,
    DynamicUniformBuffer,
    StorageBuffer,
    DynamicStorageBuffer,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    InputAttachment,
}

impl From<BindingKind> for DescriptorKind {
    fn from(kind: BindingKind) -> Self {
        match kind {
            BindingKind::UniformBuffer => DescriptorKind::UniformBuffer,
            BindingKind::StorageBuffer => DescriptorKind::StorageBuffer,
            BindingKind::CombinedImageSampler => DescriptorKind::CombinedImageSampler,
            BindingKind::SampledImage => DescriptorKind::SampledImage,
            BindingKind::StorageImage => DescriptorKind::StorageImage,
            BindingKind::InputAttachment => DescriptorKind::InputAttachment,
        }
    }
}

/// One binding slot in its final, canonical form.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: StageMask,
    pub immutable_sampler: Option<Handle<Sampler>>,
}

impl Default for DescriptorBinding {
    fn default() -> Self {
        Self {
            binding: 0,
            kind: DescriptorKind::UniformBuffer,
            count: 1,
            stages: StageMask::empty(),
            immutable_sampler: None,
        }
    }
}

#[derive(Hash, Clone, Debug, Default, PartialEq, Eq)]
pub struct SetLayout {
    pub bindings: Vec<DescriptorBinding>,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemapEntry {
    /// Shader-local binding index as authored.
    pub slot: u32,
    pub set: u32,
    pub binding: u32,
}

#[derive(Hash, Clone, Debug, PartialEq, Eq)]
pub struct StageRemap {
    pub stage: StageMask,
    pub entries: Vec<RemapEntry>,
}

/// Per-stage table recording where each shader-local binding ended up, used
/// to rewrite the bytecode's literal set/binding operands after the fact.
#[derive(Hash, Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingRemap {
    pub stages: Vec<StageRemap>,
}

impl BindingRemap {
    pub fn lookup(&self, stage: StageMask, slot: u32) -> Option<(u32, u32)> {
        let stage_remap = self.stages.iter().find(|s| s.stage == stage)?;
        stage_remap
            .entries
            .iter()
            .find(|e| e.slot == slot)
            .map(|e| (e.set, e.binding))
    }
}

/// Canonical, immutable description of a full descriptor-set layout:
/// ordered binding slots per set, the per-stage remapping table, and a
/// structural hash used as the dedup cache key.
///
/// Built once per unique shader-stage combination and shared (`Arc`) by
/// every pipeline using that combination until context teardown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSetLayoutInfo {
    pub sets: Vec<SetLayout>,
    pub remap: BindingRemap,
    pub hash: u32,
}

/// Hard per-set ceilings taken from the device at context creation.
/// Violations are configuration errors at layout-build time, never runtime
/// conditions.
#[derive(Clone, Copy, Debug)]
pub struct DeviceBindingLimits {
    pub max_bound_sets: u32,
    pub max_samplers_per_set: u32,
    pub max_uniform_buffers_per_set: u32,
    pub max_dynamic_uniform_buffers_per_set: u32,
    pub max_storage_buffers_per_set: u32,
    pub max_sampled_images_per_set: u32,
    pub max_storage_images_per_set: u32,
    pub max_input_attachments_per_set: u32,
}

impl Default for DeviceBindingLimits {
    fn default() -> Self {
        // Vulkan required minimums; real devices overwrite these.
        Self {
            max_bound_sets: 4,
            max_samplers_per_set: 96,
            max_uniform_buffers_per_set: 72,
            max_dynamic_uniform_buffers_per_set: 8,
            max_storage_buffers_per_set: 24,
            max_sampled_images_per_set: 96,
            max_storage_images_per_set: 24,
            max_input_attachments_per_set: 4,
        }
    }
}

/// Attach a fixed sampler to every combined-image binding whose reflected
/// name hash matches.
#[derive(Clone, Copy, Debug)]
pub struct ImmutableSamplerBinding {
    pub name_hash: u32,
    pub sampler: Handle<Sampler>,
}

/// Assigns descriptor slots from per-stage reflection and produces the
/// canonical [`DescriptorSetLayoutInfo`].
pub struct LayoutBuilder {
    debug_name: String,
    policy: LayoutPolicy,
    limits: DeviceBindingLimits,
    manual: Vec<(u32, DescriptorBinding)>,
}

impl LayoutBuilder {
    pub fn new(debug_name: &str, policy: LayoutPolicy, limits: DeviceBindingLimits) -> Self {
        Self {
            debug_name: debug_name.to_string(),
            policy,
            limits,
            manual: Vec::new(),
        }
    }

    /// Pre-register a hand-authored binding at an explicit set/binding pair.
    /// Reflected bindings are assigned around these.
    pub fn add_binding(&mut self, set: u32, binding: DescriptorBinding) {
        self.manual.push((set, binding));
    }

    pub fn finalize_bindings(
        &self,
        stages: &[StageReflection],
        immutable_samplers: &[ImmutableSamplerBinding],
    ) -> Result<DescriptorSetLayoutInfo> {
        let mut sets: BTreeMap<u32, Vec<DescriptorBinding>> = BTreeMap::new();
        for (set, binding) in &self.manual {
            sets.entry(*set).or_default().push(*binding);
        }

        let mut remap: Vec<StageRemap> = stages
            .iter()
            .map(|s| StageRemap {
                stage: s.stage,
                entries: Vec::new(),
            })
            .collect();

        match self.policy.placement {
            SetPlacement::PerStage => {
                for (stage_index, stage) in stages.iter().enumerate() {
                    for refl in &stage.bindings {
                        let set = stage_index as u32;
                        let binding = Self::next_binding(&sets, set);
                        sets.entry(set).or_default().push(self.realize(
                            refl,
                            binding,
                            stage.stage,
                            immutable_samplers,
                        ));
                        remap[stage_index].entries.push(RemapEntry {
                            slot: refl.slot,
                            set,
                            binding,
                        });
                    }
                }
            }
            SetPlacement::SharedUniforms => {
                // A uniform buffer reflected under the same name by more
                // than one stage moves into one extra shared set.
                let mut seen: HashMap<u32, u32> = HashMap::new();
                for stage in stages {
                    let mut in_stage = HashSet::new();
                    for refl in &stage.bindings {
                        if refl.kind == BindingKind::UniformBuffer
                            && in_stage.insert(refl.name_hash)
                        {
                            *seen.entry(refl.name_hash).or_insert(0) += 1;
                        }
                    }
                }
                let shared: HashSet<u32> = seen
                    .into_iter()
                    .filter_map(|(name, stages)| (stages >= 2).then_some(name))
                    .collect();
                let shared_set = stages.len() as u32;
                let mut placed: HashMap<u32, (u32, u32, usize)> = HashMap::new();

                for (stage_index, stage) in stages.iter().enumerate() {
                    for refl in &stage.bindings {
                        if refl.kind == BindingKind::UniformBuffer
                            && shared.contains(&refl.name_hash)
                        {
                            let (set, binding) = match placed.get(&refl.name_hash) {
                                Some(&(set, binding, slot_idx)) => {
                                    sets.get_mut(&set).unwrap()[slot_idx].stages |= stage.stage;
                                    (set, binding)
                                }
                                None => {
                                    let binding = Self::next_binding(&sets, shared_set);
                                    let entry = sets.entry(shared_set).or_default();
                                    entry.push(self.realize(
                                        refl,
                                        binding,
                                        stage.stage,
                                        immutable_samplers,
                                    ));
                                    placed.insert(
                                        refl.name_hash,
                                        (shared_set, binding, entry.len() - 1),
                                    );
                                    (shared_set, binding)
                                }
                            };
                            remap[stage_index].entries.push(RemapEntry {
                                slot: refl.slot,
                                set,
                                binding,
                            });
                        } else {
                            let set = stage_index as u32;
                            let binding = Self::next_binding(&sets, set);
                            sets.entry(set).or_default().push(self.realize(
                                refl,
                                binding,
                                stage.stage,
                                immutable_samplers,
                            ));
                            remap[stage_index].entries.push(RemapEntry {
                                slot: refl.slot,
                                set,
                                binding,
                            });
                        }
                    }
                }
            }
            SetPlacement::SingleSet => {
                // Everything lands in set 0; a resource reflected by several
                // stages keeps one slot with a widened stage mask.
                let mut placed: HashMap<(u32, BindingKind), (u32, usize)> = HashMap::new();
                for (stage_index, stage) in stages.iter().enumerate() {
                    for refl in &stage.bindings {
                        let key = (refl.name_hash, refl.kind);
                        let binding = match placed.get(&key) {
                            Some(&(binding, slot_idx)) => {
                                sets.get_mut(&0).unwrap()[slot_idx].stages |= stage.stage;
                                binding
                            }
                            None => {
                                let binding = Self::next_binding(&sets, 0);
                                let entry = sets.entry(0).or_default();
                                entry.push(self.realize(
                                    refl,
                                    binding,
                                    stage.stage,
                                    immutable_samplers,
                                ));
                                placed.insert(key, (binding, entry.len() - 1));
                                binding
                            }
                        };
                        remap[stage_index].entries.push(RemapEntry {
                            slot: refl.slot,
                            set: 0,
                            binding,
                        });
                    }
                }
            }
        }

        let set_count = sets.keys().next_back().map_or(0, |max| max + 1);
        if set_count > self.limits.max_bound_sets {
            return Err(GPUError::LayoutLimit {
                layout: self.debug_name.clone(),
                limit: "maxBoundDescriptorSets",
                max: self.limits.max_bound_sets,
                requested: set_count,
            });
        }

        let mut canonical = vec![SetLayout::default(); set_count as usize];
        for (set, mut bindings) in sets {
            bindings.sort_by_key(|b| b.binding);
            canonical[set as usize] = SetLayout { bindings };
        }

        self.check_limits(&canonical)?;

        let remap = BindingRemap { stages: remap };
        let hash = structural_hash(&canonical, &remap);
        Ok(DescriptorSetLayoutInfo {
            sets: canonical,
            remap,
            hash,
        })
    }

    /// Map a reflected binding to its final slot: descriptor kind (with
    /// dynamic-offset promotion), stage mask, immutable sampler.
    fn realize(
        &self,
        refl: &super::reflect::ReflectedBinding,
        binding: u32,
        stage: StageMask,
        immutable_samplers: &[ImmutableSamplerBinding],
    ) -> DescriptorBinding {
        let kind = match (DescriptorKind::from(refl.kind), self.policy.dynamic) {
            (DescriptorKind::UniformBuffer, DynamicBufferPolicy::All) => {
                DescriptorKind::DynamicUniformBuffer
            }
            (DescriptorKind::UniformBuffer, DynamicBufferPolicy::PackedOnly)
                if refl.packed_scalars =>
            {
                DescriptorKind::DynamicUniformBuffer
            }
            (kind, _) => kind,
        };
        let immutable_sampler = (kind == DescriptorKind::CombinedImageSampler)
            .then(|| {
                immutable_samplers
                    .iter()
                    .find(|s| s.name_hash == refl.name_hash)
                    .map(|s| s.sampler)
            })
            .flatten();
        DescriptorBinding {
            binding,
            kind,
            count: refl.count.max(1),
            stages: stage,
            immutable_sampler,
        }
    }

    fn next_binding(sets: &BTreeMap<u32, Vec<DescriptorBinding>>, set: u32) -> u32 {
        sets.get(&set)
            .and_then(|bindings| bindings.iter().map(|b| b.binding).max())
            .map_or(0, |max| max + 1)
    }

    fn check_limits(&self, sets: &[SetLayout]) -> Result<()> {
        for set in sets {
            let count = |pred: fn(DescriptorKind) -> bool| -> u32 {
                set.bindings
                    .iter()
                    .filter(|b| pred(b.kind))
                    .map(|b| b.count)
                    .sum()
            };
            let checks: [(&'static str, u32, u32); 6] = [
                (
                    "maxPerStageDescriptorSamplers",
                    count(|k| k == DescriptorKind::CombinedImageSampler),
                    self.limits.max_samplers_per_set,
                ),
                (
                    "maxPerStageDescriptorUniformBuffers",
                    count(|k| {
                        matches!(
                            k,
                            DescriptorKind::UniformBuffer | DescriptorKind::DynamicUniformBuffer
                        )
                    }),
                    self.limits.max_uniform_buffers_per_set,
                ),
                (
                    "maxDescriptorSetUniformBuffersDynamic",
                    count(|k| k == DescriptorKind::DynamicUniformBuffer),
                    self.limits.max_dynamic_uniform_buffers_per_set,
                ),
                (
                    "maxPerStageDescriptorStorageBuffers",
                    count(|k| {
                        matches!(
                            k,
                            DescriptorKind::StorageBuffer | DescriptorKind::DynamicStorageBuffer
                        )
                    }),
                    self.limits.max_storage_buffers_per_set,
                ),
                (
                    "maxPerStageDescriptorStorageImages",
                    count(|k| k == DescriptorKind::StorageImage),
                    self.limits.max_storage_images_per_set,
                ),
                (
                    "maxPerStageDescriptorInputAttachments",
                    count(|k| k == DescriptorKind::InputAttachment),
                    self.limits.max_input_attachments_per_set,
                ),
            ];
            for (limit, requested, max) in checks {
                if requested > max {
                    return Err(GPUError::LayoutLimit {
                        layout: self.debug_name.clone(),
                        limit,
                        max,
                        requested,
                    });
                }
            }
        }
        Ok(())
    }
}

fn structural_hash(sets: &[SetLayout], remap: &BindingRemap) -> u32 {
    let mut hasher = DefaultHasher::new();
    sets.hash(&mut hasher);
    remap.hash(&mut hasher);
    let h = hasher.finish();
    (h as u32) ^ ((h >> 32) as u32)
}

/// Process-wide dedup map for descriptor layouts: two shaders with
/// structurally identical binding tables share one layout object (and,
/// downstream, one set of driver-level descriptor sets).
///
/// The full layout is stored next to its hash and verified on every hit; a
/// colliding-but-different layout is kept as a distinct entry rather than
/// reused.
#[derive(Default)]
pub struct LayoutCache {
    inner: Mutex<HashMap<u32, Vec<Arc<DescriptorSetLayoutInfo>>>>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&self, info: DescriptorSetLayoutInfo) -> Arc<DescriptorSetLayoutInfo> {
        let mut inner = self.inner.lock().expect("layout cache lock poisoned");
        let bucket = inner.entry(info.hash).or_default();
        for existing in bucket.iter() {
            if **existing == info {
                return existing.clone();
            }
        }
        if !bucket.is_empty() {
            log::warn!(
                "descriptor layout hash collision on {:#010x}; keeping layouts distinct",
                info.hash
            );
        }
        let shared = Arc::new(info);
        bucket.push(shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("layout cache lock poisoned")
            .values()
            .map(|b| b.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: StageMask,
    pub offset: u32,
    pub size: u32,
}

/// Pipeline-wide binding scheme: one shared descriptor layout plus push
/// constant ranges, 1:1 with a unique combination of stage binding tables.
#[derive(Clone, Debug)]
pub struct PipelineLayoutInfo {
    pub descriptors: Arc<DescriptorSetLayoutInfo>,
    pub push_constants: Vec<PushConstantRange>,
    pub hash: u32,
}

impl PipelineLayoutInfo {
    pub fn new(
        descriptors: Arc<DescriptorSetLayoutInfo>,
        push_constants: Vec<PushConstantRange>,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        descriptors.hash.hash(&mut hasher);
        push_constants.hash(&mut hasher);
        let h = hasher.finish();
        let hash = (h as u32) ^ ((h >> 32) as u32);
        Self {
            descriptors,
            push_constants,
            hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::reflect::{
        name_hash, patch_spirv_bindings, BindingKind, ReflectedBinding, StageReflection,
        WordPatchLocation,
    };

    fn uniform(name: &str, slot: u32) -> ReflectedBinding {
        ReflectedBinding {
            name_hash: name_hash(name),
            kind: BindingKind::UniformBuffer,
            slot,
            ..Default::default()
        }
    }

    fn sampled(name: &str, slot: u32) -> ReflectedBinding {
        ReflectedBinding {
            name_hash: name_hash(name),
            kind: BindingKind::CombinedImageSampler,
            slot,
            ..Default::default()
        }
    }

    fn vs_fs(vs: Vec<ReflectedBinding>, fs: Vec<ReflectedBinding>) -> Vec<StageReflection> {
        vec![
            StageReflection {
                stage: StageMask::VERTEX,
                bindings: vs,
            },
            StageReflection {
                stage: StageMask::FRAGMENT,
                bindings: fs,
            },
        ]
    }

    fn builder(policy: LayoutPolicy) -> LayoutBuilder {
        LayoutBuilder::new("test", policy, DeviceBindingLimits::default())
    }

    #[test]
    fn identical_binding_tables_share_one_layout() {
        let cache = LayoutCache::new();
        let b = builder(LayoutPolicy::default());

        let stages = vs_fs(
            vec![uniform("per_view", 0)],
            vec![sampled("albedo", 0), uniform("material", 1)],
        );
        let first = b.finalize_bindings(&stages, &[]).unwrap();
        let second = b.finalize_bindings(&stages, &[]).unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first, second);

        let a = cache.get_or_insert(first);
        let b = cache.get_or_insert(second);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn per_stage_placement_gives_one_set_per_stage() {
        let b = builder(LayoutPolicy::default());
        let stages = vs_fs(
            vec![uniform("per_view", 0)],
            vec![uniform("material", 0), sampled("albedo", 1)],
        );
        let info = b.finalize_bindings(&stages, &[]).unwrap();
        assert_eq!(info.sets.len(), 2);
        assert_eq!(info.sets[0].bindings.len(), 1);
        assert_eq!(info.sets[1].bindings.len(), 2);
        assert_eq!(info.remap.lookup(StageMask::VERTEX, 0), Some((0, 0)));
        assert_eq!(info.remap.lookup(StageMask::FRAGMENT, 0), Some((1, 0)));
        assert_eq!(info.remap.lookup(StageMask::FRAGMENT, 1), Some((1, 1)));
    }

    #[test]
    fn shared_uniforms_are_hoisted_into_extra_set() {
        let b = builder(LayoutPolicy {
            placement: SetPlacement::SharedUniforms,
            dynamic: DynamicBufferPolicy::None,
        });
        let stages = vs_fs(
            vec![uniform("globals", 0), uniform("per_draw", 1)],
            vec![uniform("globals", 0), sampled("albedo", 1)],
        );
        let info = b.finalize_bindings(&stages, &[]).unwrap();

        // Sets: 0 = vertex-only, 1 = fragment-only, 2 = shared.
        assert_eq!(info.sets.len(), 3);
        let shared = &info.sets[2].bindings;
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].stages, StageMask::VERTEX | StageMask::FRAGMENT);

        // Both stages remap their local slot onto the same shared slot.
        let vs = info.remap.lookup(StageMask::VERTEX, 0).unwrap();
        let fs = info.remap.lookup(StageMask::FRAGMENT, 0).unwrap();
        assert_eq!(vs, fs);
        assert_eq!(vs.0, 2);

        // The non-shared bindings stay in their stage sets, numbered from 0.
        assert_eq!(info.remap.lookup(StageMask::VERTEX, 1), Some((0, 0)));
        assert_eq!(info.remap.lookup(StageMask::FRAGMENT, 1), Some((1, 0)));
    }

    #[test]
    fn single_set_collapses_everything_to_set_zero() {
        let b = builder(LayoutPolicy {
            placement: SetPlacement::SingleSet,
            dynamic: DynamicBufferPolicy::None,
        });
        let stages = vs_fs(
            vec![uniform("globals", 0)],
            vec![uniform("globals", 0), sampled("albedo", 1)],
        );
        let info = b.finalize_bindings(&stages, &[]).unwrap();
        assert_eq!(info.sets.len(), 1);
        assert_eq!(info.sets[0].bindings.len(), 2);
        assert_eq!(
            info.sets[0].bindings[0].stages,
            StageMask::VERTEX | StageMask::FRAGMENT
        );
        assert_eq!(
            info.remap.lookup(StageMask::VERTEX, 0),
            info.remap.lookup(StageMask::FRAGMENT, 0)
        );
    }

    #[test]
    fn dynamic_promotion_follows_policy() {
        let packed = ReflectedBinding {
            packed_scalars: true,
            ..uniform("per_draw", 0)
        };
        let unpacked = uniform("misc", 1);
        let stages = vec![StageReflection {
            stage: StageMask::VERTEX,
            bindings: vec![packed, unpacked],
        }];

        let none = builder(LayoutPolicy {
            placement: SetPlacement::PerStage,
            dynamic: DynamicBufferPolicy::None,
        })
        .finalize_bindings(&stages, &[])
        .unwrap();
        assert!(none.sets[0]
            .bindings
            .iter()
            .all(|b| b.kind == DescriptorKind::UniformBuffer));

        let packed_only = builder(LayoutPolicy {
            placement: SetPlacement::PerStage,
            dynamic: DynamicBufferPolicy::PackedOnly,
        })
        .finalize_bindings(&stages, &[])
        .unwrap();
        assert_eq!(
            packed_only.sets[0].bindings[0].kind,
            DescriptorKind::DynamicUniformBuffer
        );
        assert_eq!(
            packed_only.sets[0].bindings[1].kind,
            DescriptorKind::UniformBuffer
        );

        let all = builder(LayoutPolicy {
            placement: SetPlacement::PerStage,
            dynamic: DynamicBufferPolicy::All,
        })
        .finalize_bindings(&stages, &[])
        .unwrap();
        assert!(all.sets[0]
            .bindings
            .iter()
            .all(|b| b.kind == DescriptorKind::DynamicUniformBuffer));

        // The promotion is structural: hashes differ between policies.
        assert_ne!(none.hash, all.hash);
    }

    #[test]
    fn immutable_samplers_attach_by_name() {
        let sampler = Handle::<Sampler>::new(3, 1);
        let b = builder(LayoutPolicy::default());
        let stages = vec![StageReflection {
            stage: StageMask::FRAGMENT,
            bindings: vec![sampled("albedo", 0), sampled("normal_map", 1)],
        }];
        let info = b
            .finalize_bindings(
                &stages,
                &[ImmutableSamplerBinding {
                    name_hash: name_hash("albedo"),
                    sampler,
                }],
            )
            .unwrap();
        assert_eq!(info.sets[0].bindings[0].immutable_sampler, Some(sampler));
        assert_eq!(info.sets[0].bindings[1].immutable_sampler, None);
    }

    #[test]
    fn device_limits_are_hard_errors() {
        let limits = DeviceBindingLimits {
            max_uniform_buffers_per_set: 1,
            ..Default::default()
        };
        let b = LayoutBuilder::new("too_many", LayoutPolicy::default(), limits);
        let stages = vec![StageReflection {
            stage: StageMask::VERTEX,
            bindings: vec![uniform("a", 0), uniform("b", 1)],
        }];
        let err = b.finalize_bindings(&stages, &[]).unwrap_err();
        match err {
            GPUError::LayoutLimit {
                layout,
                limit,
                max,
                requested,
            } => {
                assert_eq!(layout, "too_many");
                assert_eq!(limit, "maxPerStageDescriptorUniformBuffers");
                assert_eq!((max, requested), (1, 2));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn manual_bindings_shift_reflected_assignment() {
        let mut b = builder(LayoutPolicy::default());
        b.add_binding(
            0,
            DescriptorBinding {
                binding: 0,
                kind: DescriptorKind::StorageBuffer,
                stages: StageMask::VERTEX,
                ..Default::default()
            },
        );
        b.add_binding(
            0,
            DescriptorBinding {
                binding: 1,
                kind: DescriptorKind::CombinedImageSampler,
                stages: StageMask::VERTEX,
                ..Default::default()
            },
        );

        let stages = vec![StageReflection {
            stage: StageMask::VERTEX,
            bindings: vec![uniform("per_draw", 0)],
        }];
        let info = b.finalize_bindings(&stages, &[]).unwrap();
        // The reflected uniform lands after the two manual bindings.
        assert_eq!(info.remap.lookup(StageMask::VERTEX, 0), Some((0, 2)));

        // And the patched bytecode agrees with the remap table.
        let mut words = vec![0xFFFF_FFFFu32; 16];
        let reflection = StageReflection {
            stage: StageMask::VERTEX,
            bindings: vec![ReflectedBinding {
                patch: WordPatchLocation {
                    set_word: 5,
                    binding_word: 6,
                },
                ..uniform("per_draw", 0)
            }],
        };
        patch_spirv_bindings(&mut words, &reflection, &info.remap).unwrap();
        assert_eq!(words[5], 0);
        assert_eq!(words[6], 2);
    }

    #[test]
    fn colliding_hashes_stay_distinct_layouts() {
        let cache = LayoutCache::new();
        let b = builder(LayoutPolicy::default());
        let info_a = b
            .finalize_bindings(
                &vec![StageReflection {
                    stage: StageMask::VERTEX,
                    bindings: vec![uniform("a", 0)],
                }],
                &[],
            )
            .unwrap();
        // Forge a layout with a different structure but the same hash value.
        let mut info_b = b
            .finalize_bindings(
                &vec![StageReflection {
                    stage: StageMask::VERTEX,
                    bindings: vec![sampled("s", 0)],
                }],
                &[],
            )
            .unwrap();
        info_b.hash = info_a.hash;

        let a = cache.get_or_insert(info_a);
        let b = cache.get_or_insert(info_b);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn too_many_sets_is_rejected() {
        let limits = DeviceBindingLimits {
            max_bound_sets: 1,
            ..Default::default()
        };
        let b = LayoutBuilder::new("wide", LayoutPolicy::default(), limits);
        let stages = vs_fs(vec![uniform("a", 0)], vec![uniform("b", 0)]);
        assert!(matches!(
            b.finalize_bindings(&stages, &[]).unwrap_err(),
            GPUError::LayoutLimit { .. }
        ));
    }
}
