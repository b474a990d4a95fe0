//! The authoritative representation of one volume: a CPU atlas buffer plus
//! one atlas target per rendering context, kept coherent by dirty flags.

use std::collections::{BTreeSet, HashMap};

use model::{AtlasLayout, AtlasRegion, ViewPlane, VoxelCount, VoxelIndex};
use render_protocol::{ContextKey, MergeParams, TargetKey, VoxelWrite};

use crate::adapter::{ScratchSlot, SliceCache};
use crate::context::{ContextSet, TargetDescriptor, UPLOAD_ALIGNMENT, aligned_upload_range};
use crate::context_table::ContextTable;
use crate::VolumeError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeStats {
    /// GPU to CPU read-backs of the whole atlas.
    pub pull_backs: u64,
    /// Full CPU to GPU atlas uploads.
    pub full_uploads: u64,
    /// Pending-edit uploads, counted per context.
    pub partial_uploads: u64,
    pub slice_cache_hits: u64,
    pub slice_cache_misses: u64,
}

pub struct VolumetricImage {
    layout: AtlasLayout,
    data: Vec<u8>,
    pub(crate) contexts: ContextTable,
    /// The CPU buffer is behind the contexts.
    has_gpu_updates: bool,
    pending_voxels: Vec<Vec<VoxelWrite>>,
    pub(crate) slice_cache: SliceCache,
    pub(crate) scratch: HashMap<(ContextKey, ScratchSlot), TargetKey>,
    pub(crate) stats: VolumeStats,
}

impl std::fmt::Debug for VolumetricImage {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("VolumetricImage")
            .field("layout", &self.layout)
            .field("contexts", &self.contexts.len())
            .field("has_gpu_updates", &self.has_gpu_updates)
            .field("pending_batches", &self.pending_voxels.len())
            .finish()
    }
}

impl VolumetricImage {
    pub fn new(voxel_count: VoxelCount, components: u8) -> Result<Self, VolumeError> {
        let layout = AtlasLayout::new(voxel_count, components)?;
        Ok(Self::with_layout(layout, vec![0; layout.byte_len()]))
    }

    /// Builds an image from an atlas-packed buffer.
    pub fn from_atlas(
        voxel_count: VoxelCount,
        components: u8,
        data: Vec<u8>,
    ) -> Result<Self, VolumeError> {
        let layout = AtlasLayout::new(voxel_count, components)?;
        check_len(layout.byte_len(), data.len())?;
        Ok(Self::with_layout(layout, data))
    }

    /// Builds an image from voxels in x-fastest, then y, then z order.
    pub fn from_voxels(
        voxel_count: VoxelCount,
        components: u8,
        voxels: &[u8],
    ) -> Result<Self, VolumeError> {
        let layout = AtlasLayout::new(voxel_count, components)?;
        check_len(
            voxel_count.voxels() as usize * components as usize,
            voxels.len(),
        )?;
        let mut data = vec![0; layout.byte_len()];
        for z in 0..voxel_count.z {
            let region = AtlasRegion::Slice {
                plane: ViewPlane::NATIVE,
                index: z,
            };
            let slice_bytes = region.source_byte_len(&layout);
            let start = z as usize * slice_bytes;
            crate::kernels::merge_region(
                &mut data,
                &layout,
                region,
                &voxels[start..start + slice_bytes],
                MergeParams::default(),
            );
        }
        Ok(Self::with_layout(layout, data))
    }

    fn with_layout(layout: AtlasLayout, data: Vec<u8>) -> Self {
        Self {
            layout,
            data,
            contexts: ContextTable::default(),
            has_gpu_updates: false,
            pending_voxels: Vec::new(),
            slice_cache: SliceCache::default(),
            scratch: HashMap::new(),
            stats: VolumeStats::default(),
        }
    }

    pub fn layout(&self) -> &AtlasLayout {
        &self.layout
    }

    pub fn voxel_count(&self) -> VoxelCount {
        self.layout.voxel_count()
    }

    pub fn components(&self) -> u8 {
        self.layout.components()
    }

    pub fn has_gpu_updates(&self) -> bool {
        self.has_gpu_updates
    }

    pub fn has_cpu_updates(&self, key: ContextKey) -> Option<bool> {
        let index = self.contexts.position(key)?;
        Some(self.contexts.has_cpu_updates(index))
    }

    pub fn pending_batches(&self) -> usize {
        self.pending_voxels.len()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn stats(&self) -> VolumeStats {
        self.stats
    }

    /// Allocates this image's atlas target on `key`. No-op if already attached.
    pub fn attach_context(&mut self, contexts: &mut ContextSet, key: ContextKey) {
        if self.contexts.position(key).is_some() {
            return;
        }
        let Some(context) = contexts.get_mut(key) else {
            log::debug!("attach skipped: context {key:?} is not registered");
            return;
        };
        let target = context.create_target(TargetDescriptor::for_atlas("volume.atlas", &self.layout));
        self.contexts.push(key, target);
    }

    /// Releases this image's targets on `key`. When `key` holds the only copy
    /// of unsynchronized GPU edits they are pulled back first.
    pub fn detach_context(&mut self, contexts: &mut ContextSet, key: ContextKey) {
        let Some(index) = self.contexts.position(key) else {
            return;
        };
        if self.has_gpu_updates {
            let other_current = (0..self.contexts.len())
                .any(|other| other != index && !self.contexts.has_cpu_updates(other));
            if !other_current {
                self.pull_back(contexts);
            }
        }
        let (key, target) = self.contexts.swap_remove(index);
        let scratch = self.take_scratch_for(key);
        if let Some(context) = contexts.get_mut(key) {
            context.destroy_target(target);
            for scratch_target in scratch {
                context.destroy_target(scratch_target);
            }
        }
    }

    /// Brings the per-context table in line with the registered contexts.
    pub fn sync_contexts(&mut self, contexts: &mut ContextSet) {
        let stale: Vec<ContextKey> = self
            .contexts
            .keys()
            .iter()
            .copied()
            .filter(|key| !contexts.contains(*key))
            .collect();
        for key in stale {
            if let Some(index) = self.contexts.position(key) {
                if self.has_gpu_updates && !self.contexts.has_cpu_updates(index) {
                    log::warn!("context {key:?} vanished before its image was detached");
                }
                self.contexts.swap_remove(index);
                self.take_scratch_for(key);
            }
        }
        if self.has_gpu_updates && self.contexts.first_current().is_none() {
            log::warn!("GPU edits lost with their last context; keeping the CPU atlas");
            self.has_gpu_updates = false;
            self.contexts.mark_all_cpu_updates();
            self.slice_cache.clear();
        }
        for key in contexts.keys() {
            self.attach_context(contexts, key);
        }
    }

    /// Copies the GPU atlas back into the CPU buffer if the CPU is behind.
    /// Returns whether a read-back happened.
    pub fn pull_back(&mut self, contexts: &mut ContextSet) -> bool {
        if !self.has_gpu_updates {
            return false;
        }
        let Some(index) = self.contexts.first_current() else {
            panic!("GPU edits pending but no rendering context holds a current atlas");
        };
        let key = self.contexts.key(index);
        let target = self.contexts.target(index);
        let mut bytes = contexts.expect_mut(key).read_pixels(target);
        bytes.truncate(self.layout.byte_len());
        check_len(self.layout.byte_len(), bytes.len())
            .unwrap_or_else(|error| panic!("atlas read-back returned a short buffer: {error}"));
        self.data = bytes;
        self.has_gpu_updates = false;
        self.stats.pull_backs += 1;
        log::debug!("atlas pulled back from context {key:?}");
        true
    }

    /// Makes context `index` hold the current atlas.
    pub(crate) fn ensure_current(&mut self, contexts: &mut ContextSet, index: usize) {
        if self.contexts.has_cpu_updates(index) {
            // The CPU copy must be complete before it is pushed.
            self.pull_back(contexts);
            let key = self.contexts.key(index);
            let target = self.contexts.target(index);
            contexts.expect_mut(key).upload(target, 0, &self.data);
            self.contexts.set_has_cpu_updates(index, false);
            self.contexts.set_voxels_rendered(index, true);
            self.stats.full_uploads += 1;
        } else if !self.contexts.voxels_rendered(index) {
            self.render_pending_for(contexts, index);
        }
        self.retire_pending_if_done();
    }

    /// Brings every context current ahead of a GPU-side edit.
    pub(crate) fn prepare_gpu_edit(&mut self, contexts: &mut ContextSet) {
        for index in 0..self.contexts.len() {
            self.ensure_current(contexts, index);
        }
    }

    /// Records that every context received the same GPU-side edit.
    pub(crate) fn finish_gpu_edit(&mut self) {
        self.has_gpu_updates = true;
        self.slice_cache.clear();
    }

    /// Atlas target of `key` as it stands, possibly stale.
    pub fn atlas_target(&self, key: ContextKey) -> Option<TargetKey> {
        self.contexts.position(key).map(|index| self.contexts.target(index))
    }

    /// Atlas target of `key`, made current first.
    pub fn current_target(&mut self, contexts: &mut ContextSet, key: ContextKey) -> Option<TargetKey> {
        let index = self.contexts.position(key)?;
        self.ensure_current(contexts, index);
        Some(self.contexts.target(index))
    }

    /// The CPU atlas buffer, pulled back first if GPU edits are pending.
    pub fn get_atlas(&mut self, contexts: &mut ContextSet) -> &[u8] {
        self.pull_back(contexts);
        &self.data
    }

    /// Replaces the whole atlas from the CPU side.
    pub fn set_atlas(&mut self, data: Vec<u8>) -> Result<(), VolumeError> {
        check_len(self.layout.byte_len(), data.len())?;
        self.data = data;
        self.has_gpu_updates = false;
        self.pending_voxels.clear();
        self.contexts.mark_all_cpu_updates();
        for index in 0..self.contexts.len() {
            self.contexts.set_voxels_rendered(index, true);
        }
        self.slice_cache.clear();
        Ok(())
    }

    pub fn get_voxel(
        &mut self,
        contexts: &mut ContextSet,
        voxel: VoxelIndex,
        component: u8,
    ) -> Result<u8, VolumeError> {
        self.layout.check_voxel(voxel)?;
        if component >= self.layout.components() {
            return Err(VolumeError::ComponentOutOfRange {
                component,
                components: self.layout.components(),
            });
        }
        self.pull_back(contexts);
        Ok(self.data[self.layout.byte_offset(voxel, component)])
    }

    /// Writes a batch of voxels on the CPU side and queues it for every
    /// context.
    pub fn set_voxels(
        &mut self,
        contexts: &mut ContextSet,
        batch: &[VoxelWrite],
    ) -> Result<(), VolumeError> {
        for write in batch {
            self.layout.check_voxel(write.voxel)?;
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.pull_back(contexts);
        let components = self.layout.components() as usize;
        for write in batch {
            let offset = self.layout.byte_offset(write.voxel, 0);
            self.data[offset..offset + components].fill(write.value);
        }
        if !self.contexts.is_empty() {
            self.pending_voxels.push(batch.to_vec());
            self.contexts.mark_all_voxels_pending();
        }
        self.slice_cache.clear();
        Ok(())
    }

    /// Applies the pending edit queue to every context that has not seen it.
    pub fn render_pending(&mut self, contexts: &mut ContextSet) -> usize {
        let mut rendered = 0;
        for index in 0..self.contexts.len() {
            if self.contexts.has_cpu_updates(index) || self.contexts.voxels_rendered(index) {
                continue;
            }
            self.render_pending_for(contexts, index);
            rendered += 1;
        }
        self.retire_pending_if_done();
        rendered
    }

    fn render_pending_for(&mut self, contexts: &mut ContextSet, index: usize) {
        debug_assert!(
            !self.has_gpu_updates,
            "pending CPU edits coexist with unsynchronized GPU edits"
        );
        let key = self.contexts.key(index);
        let target = self.contexts.target(index);
        let context = contexts.expect_mut(key);
        for range in self.pending_word_ranges() {
            context.upload(target, range.start, &self.data[range]);
        }
        self.contexts.set_voxels_rendered(index, true);
        self.stats.partial_uploads += 1;
    }

    /// Coalesced, upload-aligned byte ranges covering every pending voxel.
    fn pending_word_ranges(&self) -> Vec<std::ops::Range<usize>> {
        let components = self.layout.components() as usize;
        let mut words = BTreeSet::new();
        for write in self.pending_voxels.iter().flatten() {
            let start = self.layout.byte_offset(write.voxel, 0);
            let end = start + components;
            for word in start / UPLOAD_ALIGNMENT..end.div_ceil(UPLOAD_ALIGNMENT) {
                words.insert(word);
            }
        }
        let mut ranges: Vec<std::ops::Range<usize>> = Vec::new();
        for word in words {
            let range = aligned_upload_range(
                word * UPLOAD_ALIGNMENT,
                (word + 1) * UPLOAD_ALIGNMENT,
                self.data.len(),
            );
            match ranges.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => ranges.push(range),
            }
        }
        ranges
    }

    fn retire_pending_if_done(&mut self) {
        if !self.pending_voxels.is_empty() && self.contexts.all_voxels_rendered() {
            self.pending_voxels.clear();
        }
    }

    /// CPU buffer for a CPU-side edit made while no context exists.
    pub(crate) fn cpu_data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.contexts.is_empty());
        debug_assert!(!self.has_gpu_updates);
        self.slice_cache.clear();
        &mut self.data
    }

    /// CPU buffer for reads that already resolved `has_gpu_updates`.
    pub(crate) fn cpu_data(&self) -> &[u8] {
        debug_assert!(!self.has_gpu_updates);
        &self.data
    }

    fn take_scratch_for(&mut self, key: ContextKey) -> Vec<TargetKey> {
        let slots: Vec<(ContextKey, ScratchSlot)> = self
            .scratch
            .keys()
            .filter(|(context, _)| *context == key)
            .copied()
            .collect();
        slots
            .into_iter()
            .filter_map(|slot| self.scratch.remove(&slot))
            .collect()
    }

    /// Destroys every per-context target along with the CPU buffer.
    pub fn release(mut self, contexts: &mut ContextSet) {
        for (key, target) in self.contexts.drain() {
            let scratch = self.take_scratch_for(key);
            if let Some(context) = contexts.get_mut(key) {
                context.destroy_target(target);
                for scratch_target in scratch {
                    context.destroy_target(scratch_target);
                }
            }
        }
        log::debug!("volume released: {:?}", self.layout.voxel_count());
    }
}

pub(crate) fn check_len(expected: usize, actual: usize) -> Result<(), VolumeError> {
    if expected == actual {
        Ok(())
    } else {
        Err(VolumeError::LengthMismatch { expected, actual })
    }
}
