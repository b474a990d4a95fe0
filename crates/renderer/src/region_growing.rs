//! Flood-fill region growing as repeated full-volume passes over two
//! ping-pong masks, with a discardable preview.

use std::collections::HashMap;

use model::{AtlasLayout, VoxelIndex};
use render_protocol::{ContextKey, MergeFunction, MergeParams, TargetKey};
use volume::{
    ContextSet, GrowStep, MASK_INSIDE, SliceSource, TargetDescriptor, VolumeError,
    VolumetricImage, kernels,
};

/// Upper bound of the commit strength setting and of the step count.
pub const MAX_REGION_GROWING_STEPS: u32 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionGrowingState {
    Idle,
    SeedPlaced,
    /// A grown mask is held as preview.
    Growing,
}

/// Number of A→B→A rounds that lets a region cross the whole volume.
pub fn blip_steps_for(layout: &AtlasLayout) -> u32 {
    let reach = layout
        .voxel_count()
        .sum()
        .min(u64::from(MAX_REGION_GROWING_STEPS)) as u32;
    reach.div_ceil(2)
}

#[derive(Debug, Clone, Copy)]
struct MaskPair {
    a: TargetKey,
    b: TargetKey,
}

#[derive(Debug)]
pub struct RegionGrowingRenderer {
    state: RegionGrowingState,
    seed: Option<VoxelIndex>,
    steps: u32,
    mask_layout: Option<AtlasLayout>,
    mask_contexts: Vec<ContextKey>,
    masks: HashMap<ContextKey, MaskPair>,
    cpu_masks: [Vec<u8>; 2],
}

impl Default for RegionGrowingRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionGrowingRenderer {
    pub fn new() -> Self {
        Self {
            state: RegionGrowingState::Idle,
            seed: None,
            steps: 0,
            mask_layout: None,
            mask_contexts: Vec::new(),
            masks: HashMap::new(),
            cpu_masks: [Vec::new(), Vec::new()],
        }
    }

    pub fn state(&self) -> RegionGrowingState {
        self.state
    }

    pub fn holds_preview(&self) -> bool {
        self.state == RegionGrowingState::Growing
    }

    pub fn seed(&self) -> Option<VoxelIndex> {
        self.seed
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn set_steps(&mut self, value: i64) {
        self.steps = value.clamp(0, i64::from(MAX_REGION_GROWING_STEPS)) as u32;
    }

    /// Commit weight derived from the step setting.
    pub fn commit_weight(&self) -> f32 {
        let max = MAX_REGION_GROWING_STEPS as f32 + 1.0;
        (max - self.steps as f32) / max
    }

    /// Starts a session at `voxel` of `source`, dropping any previous preview.
    pub fn set_seed(
        &mut self,
        contexts: &mut ContextSet,
        source: &VolumetricImage,
        voxel: VoxelIndex,
    ) -> Result<(), VolumeError> {
        source.layout().check_voxel(voxel)?;
        self.ensure_masks(contexts, source.layout())?;
        self.seed = Some(voxel);
        self.write_seed_mask(contexts);
        self.state = RegionGrowingState::SeedPlaced;
        Ok(())
    }

    /// Grows far enough to cover the volume.
    pub fn do_region_growing(
        &mut self,
        contexts: &mut ContextSet,
        source: &mut VolumetricImage,
        threshold: u8,
    ) -> Result<(), VolumeError> {
        let blip_steps = blip_steps_for(source.layout());
        self.grow_for(contexts, source, threshold, blip_steps)
    }

    /// Restarts from the seed and runs exactly `blip_steps` A→B→A rounds.
    pub fn grow_for(
        &mut self,
        contexts: &mut ContextSet,
        source: &mut VolumetricImage,
        threshold: u8,
        blip_steps: u32,
    ) -> Result<(), VolumeError> {
        let Some(seed) = self.seed else {
            log::debug!("region growing skipped: no seed placed");
            return Ok(());
        };
        let layout = *source.layout();
        let seed_value = source.get_voxel(contexts, seed, 0)?;
        let step = GrowStep {
            seed_value,
            threshold,
        };
        self.ensure_masks(contexts, &layout)?;
        self.write_seed_mask(contexts);

        if self.masks.is_empty() {
            let atlas = source.get_atlas(contexts);
            let [a, b] = &mut self.cpu_masks;
            for _ in 0..blip_steps {
                kernels::grow_region(atlas, &layout, step, a, b);
                kernels::grow_region(atlas, &layout, step, b, a);
            }
        } else {
            for key in self.mask_contexts.clone() {
                let Some(atlas) = source.current_target(contexts, key) else {
                    log::debug!("region growing skipped on context {key:?}: image not attached");
                    continue;
                };
                let masks = self.masks[&key];
                let Some(context) = contexts.get_mut(key) else {
                    continue;
                };
                for _ in 0..blip_steps {
                    context.grow_region(atlas, &layout, step, masks.a, masks.b);
                    context.grow_region(atlas, &layout, step, masks.b, masks.a);
                }
            }
        }
        log::debug!("region grown from {seed:?}: value {seed_value}, {blip_steps} rounds");
        self.state = RegionGrowingState::Growing;
        Ok(())
    }

    /// Adds the preview mask into `annotation` and ends the session.
    /// Returns whether anything was written.
    pub fn flush_to_annotation(
        &mut self,
        contexts: &mut ContextSet,
        annotation: &mut VolumetricImage,
    ) -> Result<bool, VolumeError> {
        if !self.holds_preview() {
            log::debug!("flush skipped: no region preview");
            return Ok(false);
        }
        let params = MergeParams::new(MergeFunction::Add).with_weight(self.commit_weight());
        if self.masks.is_empty() {
            annotation.write_volume(contexts, SliceSource::Bytes(&self.cpu_masks[0]), params)?;
        } else {
            let sources: HashMap<ContextKey, TargetKey> =
                self.masks.iter().map(|(key, masks)| (*key, masks.a)).collect();
            annotation.write_volume(contexts, SliceSource::Targets(&sources), params)?;
        }
        self.discard(contexts);
        Ok(true)
    }

    /// Drops the preview and the seed. Calling it again is harmless.
    pub fn discard(&mut self, contexts: &mut ContextSet) {
        for (key, masks) in &self.masks {
            if let Some(context) = contexts.get_mut(*key) {
                context.clear_target(masks.a);
                context.clear_target(masks.b);
            }
        }
        for mask in &mut self.cpu_masks {
            mask.fill(0);
        }
        self.seed = None;
        self.state = RegionGrowingState::Idle;
    }

    /// The current mask, one byte per atlas texel.
    pub fn preview_mask(&self, contexts: &mut ContextSet) -> Option<Vec<u8>> {
        if !self.holds_preview() {
            return None;
        }
        match self.mask_contexts.first() {
            Some(key) => {
                let masks = self.masks.get(key)?;
                Some(contexts.get_mut(*key)?.read_pixels(masks.a))
            }
            None => Some(self.cpu_masks[0].clone()),
        }
    }

    pub fn release(&mut self, contexts: &mut ContextSet) {
        self.discard(contexts);
        self.destroy_masks(contexts);
        self.mask_layout = None;
        self.cpu_masks = [Vec::new(), Vec::new()];
    }

    /// (Re)creates the mask targets when the volume shape or the context set
    /// changed.
    fn ensure_masks(&mut self, contexts: &mut ContextSet, layout: &AtlasLayout) -> Result<(), VolumeError> {
        let mask_layout = layout.with_components(1)?;
        let keys = contexts.keys();
        if self.mask_layout == Some(mask_layout) && self.mask_contexts == keys {
            return Ok(());
        }
        self.destroy_masks(contexts);
        let descriptor = TargetDescriptor::for_atlas("region_growing.mask", &mask_layout);
        for key in &keys {
            if let Some(context) = contexts.get_mut(*key) {
                let a = context.create_target(descriptor);
                let b = context.create_target(descriptor);
                self.masks.insert(*key, MaskPair { a, b });
            }
        }
        self.cpu_masks = [
            vec![0; mask_layout.byte_len()],
            vec![0; mask_layout.byte_len()],
        ];
        self.mask_layout = Some(mask_layout);
        self.mask_contexts = keys;
        Ok(())
    }

    fn destroy_masks(&mut self, contexts: &mut ContextSet) {
        for (key, masks) in self.masks.drain() {
            if let Some(context) = contexts.get_mut(key) {
                context.destroy_target(masks.a);
                context.destroy_target(masks.b);
            }
        }
        self.mask_contexts.clear();
    }

    /// Clears both masks and marks the seed voxel in mask A.
    fn write_seed_mask(&mut self, contexts: &mut ContextSet) {
        let (Some(seed), Some(layout)) = (self.seed, self.mask_layout) else {
            return;
        };
        let texel = layout.texel_index(seed);
        for mask in &mut self.cpu_masks {
            mask.fill(0);
        }
        self.cpu_masks[0][texel] = MASK_INSIDE;
        for (key, masks) in &self.masks {
            if let Some(context) = contexts.get_mut(*key) {
                context.clear_target(masks.b);
                context.upload(masks.a, 0, &self.cpu_masks[0]);
            }
        }
    }
}
