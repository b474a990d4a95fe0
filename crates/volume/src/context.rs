//! Rendering contexts and the registry the document keeps them in.

use model::{AtlasLayout, AtlasRegion};
use render_protocol::{ContextKey, MergeParams, StrokeGeometry, TargetKey};
use slotmap::SlotMap;

use crate::kernels::GrowStep;

/// Offsets and lengths of partial uploads are aligned to this many bytes,
/// except for a range ending at the end of the target.
pub const UPLOAD_ALIGNMENT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub components: u8,
}

impl TargetDescriptor {
    pub fn for_atlas(label: &'static str, layout: &AtlasLayout) -> Self {
        Self {
            label,
            width: layout.atlas_width(),
            height: layout.atlas_height(),
            components: layout.components(),
        }
    }

    pub fn for_region(label: &'static str, layout: &AtlasLayout, region: AtlasRegion) -> Self {
        let (width, height) = region.source_dims(layout);
        Self {
            label,
            width,
            height,
            components: layout.components(),
        }
    }

    pub const fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.components as usize
    }
}

/// One rendering context (a viewport's GPU device, or its software stand-in).
///
/// Targets are flat byte images laid out like the CPU atlas buffer. Every pass
/// has the semantics of the matching function in [`crate::kernels`].
pub trait RenderContext {
    fn label(&self) -> &str;

    fn create_target(&mut self, descriptor: TargetDescriptor) -> TargetKey;

    fn destroy_target(&mut self, target: TargetKey);

    fn target_descriptor(&self, target: TargetKey) -> Option<TargetDescriptor>;

    /// Zeroes the whole target.
    fn clear_target(&mut self, target: TargetKey);

    /// Writes `bytes` at `byte_offset`; see [`UPLOAD_ALIGNMENT`].
    fn upload(&mut self, target: TargetKey, byte_offset: usize, bytes: &[u8]);

    /// Blocking read-back of the whole target. Stalls until queued passes
    /// complete.
    fn read_pixels(&mut self, target: TargetKey) -> Vec<u8>;

    /// Copies `region` of the atlas target into the region-shaped `destination`.
    fn extract_region(
        &mut self,
        atlas: TargetKey,
        layout: &AtlasLayout,
        region: AtlasRegion,
        destination: TargetKey,
    );

    /// Merges the region-shaped `source` into `region` of the atlas target.
    fn merge_region(
        &mut self,
        atlas: TargetKey,
        layout: &AtlasLayout,
        region: AtlasRegion,
        source: TargetKey,
        params: MergeParams,
    );

    /// One flood-fill step from mask `from` into mask `to` over `source`.
    fn grow_region(
        &mut self,
        source: TargetKey,
        layout: &AtlasLayout,
        step: GrowStep,
        from: TargetKey,
        to: TargetKey,
    );

    /// Stamps geometry into `target`, keeping the per-byte maximum.
    fn stamp_geometry(&mut self, target: TargetKey, geometry: &[StrokeGeometry]);
}

/// The rendering contexts currently alive. Contexts appear and disappear at
/// runtime as viewports mount and unmount.
#[derive(Default)]
pub struct ContextSet {
    contexts: SlotMap<ContextKey, Box<dyn RenderContext>>,
}

impl ContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, context: Box<dyn RenderContext>) -> ContextKey {
        let key = self.contexts.insert(context);
        log::debug!("rendering context registered: {key:?}");
        key
    }

    pub fn remove(&mut self, key: ContextKey) -> Option<Box<dyn RenderContext>> {
        let removed = self.contexts.remove(key);
        if removed.is_some() {
            log::debug!("rendering context unregistered: {key:?}");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contains(&self, key: ContextKey) -> bool {
        self.contexts.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ContextKey> {
        self.contexts.keys().collect()
    }

    pub fn get(&self, key: ContextKey) -> Option<&(dyn RenderContext + 'static)> {
        self.contexts.get(key).map(|context| context.as_ref())
    }

    pub fn get_mut(&mut self, key: ContextKey) -> Option<&mut (dyn RenderContext + 'static)> {
        self.contexts.get_mut(key).map(|context| context.as_mut())
    }

    /// Looks up a context the caller knows to be alive.
    pub(crate) fn expect_mut(&mut self, key: ContextKey) -> &mut (dyn RenderContext + 'static) {
        self.get_mut(key)
            .unwrap_or_else(|| panic!("rendering context {key:?} is not registered"))
    }
}

/// Aligns `start..end` outwards to [`UPLOAD_ALIGNMENT`], clamped to `len`.
pub(crate) fn aligned_upload_range(start: usize, end: usize, len: usize) -> std::ops::Range<usize> {
    let aligned_start = start - start % UPLOAD_ALIGNMENT;
    let aligned_end = end.div_ceil(UPLOAD_ALIGNMENT) * UPLOAD_ALIGNMENT;
    aligned_start..aligned_end.min(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_ranges_align_outwards_and_clamp() {
        assert_eq!(aligned_upload_range(5, 6, 100), 4..8);
        assert_eq!(aligned_upload_range(8, 12, 100), 8..12);
        assert_eq!(aligned_upload_range(97, 99, 99), 96..99);
    }
}
