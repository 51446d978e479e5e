use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

#[cfg(feature = "koji-serde")]
use serde::{Deserialize, Serialize};

use super::error::{GPUError, Result};
use super::layout::BindingRemap;

#[repr(C)]
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StageMask: u32 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
    }
}

impl From<ShaderStage> for StageMask {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => StageMask::VERTEX,
            ShaderStage::Fragment => StageMask::FRAGMENT,
            ShaderStage::Compute => StageMask::COMPUTE,
        }
    }
}

/// The resource classes a shader can bind. Mirrors what the shader
/// front-end reflects; the layout builder maps these onto descriptor kinds.
#[repr(C)]
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    InputAttachment,
}

/// Word indices inside the SPIR-V stream where the binding's decoration
/// literals live, so the final set/binding assignment can be written back
/// into the bytecode after layout building.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub struct WordPatchLocation {
    pub set_word: usize,
    pub binding_word: usize,
}

/// One binding as reflected by the shader front-end.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "koji-serde", derive(Serialize, Deserialize))]
pub struct ReflectedBinding {
    /// Hash of the binding's source-level name; used to correlate the same
    /// resource across stages and to attach immutable samplers.
    pub name_hash: u32,
    pub kind: BindingKind,
    pub count: u32,
    /// Shader-local binding index as authored, before remapping.
    pub slot: u32,
    /// True when the buffer holds only tightly packed scalar data and may be
    /// promoted to a dynamic-offset binding.
    pub packed_scalars: bool,
    pub patch: WordPatchLocation,
}

impl Default for ReflectedBinding {
    fn default() -> Self {
        Self {
            name_hash: 0,
            kind: BindingKind::UniformBuffer,
            count: 1,
            slot: 0,
            packed_scalars: false,
            patch: WordPatchLocation::default(),
        }
    }
}

/// Everything the layout builder needs to know about one shader stage.
#[derive(Hash, Clone, Debug, PartialEq, Eq, Default)]
pub struct StageReflection {
    pub stage: StageMask,
    pub bindings: Vec<ReflectedBinding>,
}

/// FNV-1a over a binding name; the same function the shader front-end uses
/// for its reflection tables.
pub fn name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Rewrite the set/binding literals of every reflected binding in place,
/// using the final assignment recorded in `remap`.
pub fn patch_spirv_bindings(
    words: &mut [u32],
    stage: &StageReflection,
    remap: &BindingRemap,
) -> Result<()> {
    for binding in &stage.bindings {
        let (set, slot) = remap
            .lookup(stage.stage, binding.slot)
            .ok_or(GPUError::UnmappedBinding { slot: binding.slot })?;
        for word in [binding.patch.set_word, binding.patch.binding_word] {
            if word >= words.len() {
                return Err(GPUError::PatchOutOfRange {
                    word,
                    len: words.len(),
                });
            }
        }
        words[binding.patch.set_word] = set;
        words[binding.patch.binding_word] = slot;
    }
    Ok(())
}

/// Cache of patched bytecode, keyed by (shader content, layout hash).
///
/// The same shader may be paired with several layouts across pipelines
/// (different immutable samplers, different stage combinations), so the
/// layout hash is part of the key.
#[derive(Default)]
pub struct PatchCache {
    patched: Mutex<HashMap<(u64, u32), Arc<Vec<u32>>>>,
}

impl PatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_patch(
        &self,
        words: &[u32],
        stage: &StageReflection,
        remap: &BindingRemap,
        layout_hash: u32,
    ) -> Result<Arc<Vec<u32>>> {
        let mut hasher = DefaultHasher::new();
        words.hash(&mut hasher);
        stage.stage.hash(&mut hasher);
        let shader_hash = hasher.finish();

        let key = (shader_hash, layout_hash);
        if let Some(hit) = self
            .patched
            .lock()
            .expect("patch cache lock poisoned")
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let mut patched = words.to_vec();
        patch_spirv_bindings(&mut patched, stage, remap)?;
        let patched = Arc::new(patched);
        self.patched
            .lock()
            .expect("patch cache lock poisoned")
            .insert(key, patched.clone());
        Ok(patched)
    }

    pub fn len(&self) -> usize {
        self.patched.lock().expect("patch cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::layout::{BindingRemap, RemapEntry, StageRemap};

    fn remap_single(stage: StageMask, slot: u32, set: u32, binding: u32) -> BindingRemap {
        BindingRemap {
            stages: vec![StageRemap {
                stage,
                entries: vec![RemapEntry { slot, set, binding }],
            }],
        }
    }

    fn reflection_single(slot: u32, set_word: usize, binding_word: usize) -> StageReflection {
        StageReflection {
            stage: StageMask::VERTEX,
            bindings: vec![ReflectedBinding {
                name_hash: name_hash("per_draw"),
                slot,
                patch: WordPatchLocation {
                    set_word,
                    binding_word,
                },
                ..Default::default()
            }],
        }
    }

    #[test]
    fn patch_rewrites_only_the_decorated_words() {
        let mut words: Vec<u32> = (100..110).collect();
        let reflection = reflection_single(0, 3, 4);
        let remap = remap_single(StageMask::VERTEX, 0, 2, 7);

        patch_spirv_bindings(&mut words, &reflection, &remap).unwrap();
        assert_eq!(words[3], 2);
        assert_eq!(words[4], 7);
        for (i, w) in words.iter().enumerate() {
            if i != 3 && i != 4 {
                assert_eq!(*w, 100 + i as u32);
            }
        }
    }

    #[test]
    fn patch_out_of_range_is_an_error() {
        let mut words = vec![0u32; 4];
        let reflection = reflection_single(0, 3, 9);
        let remap = remap_single(StageMask::VERTEX, 0, 0, 0);
        let err = patch_spirv_bindings(&mut words, &reflection, &remap).unwrap_err();
        assert!(matches!(err, GPUError::PatchOutOfRange { word: 9, len: 4 }));
    }

    #[test]
    fn missing_remap_entry_is_an_error() {
        let mut words = vec![0u32; 8];
        let reflection = reflection_single(5, 1, 2);
        let remap = remap_single(StageMask::VERTEX, 0, 0, 0);
        let err = patch_spirv_bindings(&mut words, &reflection, &remap).unwrap_err();
        assert!(matches!(err, GPUError::UnmappedBinding { slot: 5 }));
    }

    #[test]
    fn cache_reuses_patches_per_layout() {
        let cache = PatchCache::new();
        let words = vec![0u32; 8];
        let reflection = reflection_single(0, 1, 2);
        let remap_a = remap_single(StageMask::VERTEX, 0, 0, 1);
        let remap_b = remap_single(StageMask::VERTEX, 0, 1, 3);

        let a1 = cache
            .get_or_patch(&words, &reflection, &remap_a, 0xAAAA)
            .unwrap();
        let a2 = cache
            .get_or_patch(&words, &reflection, &remap_a, 0xAAAA)
            .unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(cache.len(), 1);

        // Same shader against a different layout patches separately.
        let b = cache
            .get_or_patch(&words, &reflection, &remap_b, 0xBBBB)
            .unwrap();
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(b[1], 1);
        assert_eq!(b[2], 3);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn name_hash_is_stable_and_distinguishes() {
        assert_eq!(name_hash("scene"), name_hash("scene"));
        assert_ne!(name_hash("scene"), name_hash("material"));
    }
}
