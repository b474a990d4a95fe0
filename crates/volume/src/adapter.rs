//! Slice-level reads and writes on a [`VolumetricImage`].
//!
//! Every write reaches every attached context through the same merge pass, so
//! the contexts stay identical and the CPU buffer only has to be refreshed
//! from one of them.

use std::collections::HashMap;

use model::{AtlasRegion, ViewPlane};
use render_protocol::{ContextKey, MergeParams, TargetKey};

use crate::context::{ContextSet, TargetDescriptor};
use crate::image::{VolumetricImage, check_len};
use crate::{VolumeError, kernels};

/// Kind of region-shaped scratch target kept per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ScratchSlot {
    Plane(ViewPlane),
    Volume,
}

impl ScratchSlot {
    fn for_region(region: AtlasRegion) -> Self {
        match region {
            AtlasRegion::Slice { plane, .. } => ScratchSlot::Plane(plane),
            AtlasRegion::Volume => ScratchSlot::Volume,
        }
    }
}

/// Extracted slices keyed by `(slice index, plane)`. Any write to the image
/// invalidates every entry.
#[derive(Debug, Default)]
pub(crate) struct SliceCache {
    entries: HashMap<(u32, ViewPlane), Vec<u8>>,
}

impl SliceCache {
    fn get(&self, index: u32, plane: ViewPlane) -> Option<&Vec<u8>> {
        self.entries.get(&(index, plane))
    }

    fn insert(&mut self, index: u32, plane: ViewPlane, bytes: Vec<u8>) {
        self.entries.insert((index, plane), bytes);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Where the data of a slice write comes from.
#[derive(Debug, Clone, Copy)]
pub enum SliceSource<'a> {
    /// Region-shaped bytes, uploaded to every context.
    Bytes(&'a [u8]),
    /// A region-shaped target already rendered on each attached context.
    Targets(&'a HashMap<ContextKey, TargetKey>),
}

impl VolumetricImage {
    /// Extracts one slice along `plane`, region-shaped with the image's
    /// component count.
    pub fn read_slice(
        &mut self,
        contexts: &mut ContextSet,
        index: u32,
        plane: ViewPlane,
    ) -> Result<Vec<u8>, VolumeError> {
        let region = AtlasRegion::Slice { plane, index };
        region.validate(self.voxel_count())?;
        if let Some(cached) = self.slice_cache.get(index, plane) {
            self.stats.slice_cache_hits += 1;
            return Ok(cached.clone());
        }
        self.stats.slice_cache_misses += 1;
        let layout = *self.layout();
        let bytes = if self.has_gpu_updates() {
            self.read_region_from_context(contexts, region)
        } else {
            let mut out = vec![0; region.source_byte_len(&layout)];
            kernels::extract_region(self.cpu_data(), &layout, region, &mut out);
            out
        };
        self.slice_cache.insert(index, plane, bytes.clone());
        Ok(bytes)
    }

    /// Extracts `region` on a context that already holds the GPU edits and
    /// reads only the region back.
    fn read_region_from_context(&mut self, contexts: &mut ContextSet, region: AtlasRegion) -> Vec<u8> {
        let Some(index) = self.contexts.first_current() else {
            panic!("GPU edits pending but no rendering context holds a current atlas");
        };
        let key = self.contexts.key(index);
        let atlas = self.contexts.target(index);
        let scratch = self.scratch_target(contexts, key, region);
        let layout = *self.layout();
        let context = contexts.expect_mut(key);
        context.extract_region(atlas, &layout, region, scratch);
        let mut bytes = context.read_pixels(scratch);
        bytes.truncate(region.source_byte_len(&layout));
        bytes
    }

    /// Merges one slice into the volume on every attached context.
    pub fn write_slice(
        &mut self,
        contexts: &mut ContextSet,
        index: u32,
        plane: ViewPlane,
        source: SliceSource<'_>,
        params: MergeParams,
    ) -> Result<(), VolumeError> {
        self.write_region(contexts, AtlasRegion::Slice { plane, index }, source, params)
    }

    /// Merges a whole atlas-shaped buffer or target into the volume.
    pub fn write_volume(
        &mut self,
        contexts: &mut ContextSet,
        source: SliceSource<'_>,
        params: MergeParams,
    ) -> Result<(), VolumeError> {
        self.write_region(contexts, AtlasRegion::Volume, source, params)
    }

    fn write_region(
        &mut self,
        contexts: &mut ContextSet,
        region: AtlasRegion,
        source: SliceSource<'_>,
        params: MergeParams,
    ) -> Result<(), VolumeError> {
        region.validate(self.voxel_count())?;
        let layout = *self.layout();
        let expected = region.source_byte_len(&layout);
        match source {
            SliceSource::Bytes(bytes) => check_len(expected, bytes.len())?,
            SliceSource::Targets(targets) => self.check_source_targets(contexts, region, targets)?,
        }

        if self.contexts.is_empty() {
            let SliceSource::Bytes(bytes) = source else {
                log::debug!("target write skipped: no rendering context attached");
                return Ok(());
            };
            kernels::merge_region(self.cpu_data_mut(), &layout, region, bytes, params);
            return Ok(());
        }

        self.prepare_gpu_edit(contexts);
        let entries: Vec<(ContextKey, TargetKey)> = self.contexts.entries().collect();
        for (key, atlas) in entries {
            let source_target = match source {
                SliceSource::Bytes(bytes) => {
                    let scratch = self.scratch_target(contexts, key, region);
                    contexts.expect_mut(key).upload(scratch, 0, bytes);
                    scratch
                }
                SliceSource::Targets(targets) => targets[&key],
            };
            contexts
                .expect_mut(key)
                .merge_region(atlas, &layout, region, source_target, params);
        }
        self.finish_gpu_edit();
        Ok(())
    }

    fn check_source_targets(
        &self,
        contexts: &ContextSet,
        region: AtlasRegion,
        targets: &HashMap<ContextKey, TargetKey>,
    ) -> Result<(), VolumeError> {
        let expected = TargetDescriptor::for_region("", self.layout(), region);
        for &key in self.contexts.keys() {
            let Some(&target) = targets.get(&key) else {
                return Err(VolumeError::MissingSourceTarget { context: key });
            };
            let descriptor = contexts
                .get(key)
                .and_then(|context| context.target_descriptor(target));
            let matches = descriptor.is_some_and(|descriptor| {
                (descriptor.width, descriptor.height, descriptor.components)
                    == (expected.width, expected.height, expected.components)
            });
            if !matches {
                return Err(VolumeError::SourceTargetMismatch { context: key });
            }
        }
        Ok(())
    }

    /// Region-shaped scratch target on `key`, created on first use.
    fn scratch_target(
        &mut self,
        contexts: &mut ContextSet,
        key: ContextKey,
        region: AtlasRegion,
    ) -> TargetKey {
        let slot = ScratchSlot::for_region(region);
        if let Some(target) = self.scratch.get(&(key, slot)) {
            return *target;
        }
        let descriptor = TargetDescriptor::for_region("volume.scratch", self.layout(), region);
        let target = contexts.expect_mut(key).create_target(descriptor);
        self.scratch.insert((key, slot), target);
        target
    }

    pub fn cached_slices(&self) -> usize {
        self.slice_cache.len()
    }
}
