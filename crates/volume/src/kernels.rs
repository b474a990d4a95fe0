//! Byte-level passes over packed atlas buffers.
//!
//! These are the reference semantics of every pass a rendering context runs.
//! The software context calls them directly on its targets, the CPU fallback
//! calls them on the image buffer, and the WGSL passes mirror them texel for
//! texel.

use model::{AtlasLayout, AtlasRegion, VoxelIndex};
use render_protocol::{MergeParams, StrokeGeometry};

pub const MASK_INSIDE: u8 = u8::MAX;

/// Copies the voxels of `region` out of `atlas` into the region-shaped `out`.
pub fn extract_region(atlas: &[u8], layout: &AtlasLayout, region: AtlasRegion, out: &mut [u8]) {
    let components = layout.components() as usize;
    let (width, height) = region.source_dims(layout);
    assert_eq!(atlas.len(), layout.byte_len(), "atlas length mismatch");
    assert_eq!(
        out.len(),
        region.source_byte_len(layout),
        "extract target length mismatch"
    );
    if region == AtlasRegion::Volume {
        out.copy_from_slice(atlas);
        return;
    }
    for v in 0..height {
        for u in 0..width {
            let dst = (v as usize * width as usize + u as usize) * components;
            match region.voxel_at(layout, u, v) {
                Some(voxel) => {
                    let src = layout.byte_offset(voxel, 0);
                    out[dst..dst + components].copy_from_slice(&atlas[src..src + components]);
                }
                None => out[dst..dst + components].fill(0),
            }
        }
    }
}

/// Merges the region-shaped `source` into the voxels of `region`.
pub fn merge_region(
    atlas: &mut [u8],
    layout: &AtlasLayout,
    region: AtlasRegion,
    source: &[u8],
    params: MergeParams,
) {
    let components = layout.components() as usize;
    let (width, height) = region.source_dims(layout);
    assert_eq!(atlas.len(), layout.byte_len(), "atlas length mismatch");
    assert_eq!(
        source.len(),
        region.source_byte_len(layout),
        "merge source length mismatch"
    );
    for v in 0..height {
        for u in 0..width {
            let Some(voxel) = region.voxel_at(layout, u, v) else {
                continue;
            };
            let src = (v as usize * width as usize + u as usize) * components;
            let dst = layout.byte_offset(voxel, 0);
            for component in 0..components {
                atlas[dst + component] = params.apply(atlas[dst + component], source[src + component]);
            }
        }
    }
}

/// Parameters of one flood-fill step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowStep {
    pub seed_value: u8,
    pub threshold: u8,
}

impl GrowStep {
    #[inline]
    pub fn accepts(&self, value: u8) -> bool {
        value.abs_diff(self.seed_value) <= self.threshold
    }
}

/// One flood-fill step over the whole volume. `from` and `to` are one-component
/// masks in the atlas layout of `source`.
pub fn grow_region(source: &[u8], layout: &AtlasLayout, step: GrowStep, from: &[u8], to: &mut [u8]) {
    assert_eq!(source.len(), layout.byte_len(), "grow source length mismatch");
    assert_eq!(from.len(), layout.texel_count(), "grow mask length mismatch");
    assert_eq!(to.len(), layout.texel_count(), "grow mask length mismatch");
    let voxel_count = layout.voxel_count();
    let mask_at = |voxel: VoxelIndex| from[layout.texel_index(voxel)] != 0;
    for y in 0..layout.atlas_height() {
        for x in 0..layout.atlas_width() {
            let texel = y as usize * layout.atlas_width() as usize + x as usize;
            let Some(voxel) = layout.texel_to_voxel(x, y) else {
                to[texel] = 0;
                continue;
            };
            let value = source[layout.byte_offset(voxel, 0)];
            if !step.accepts(value) {
                to[texel] = 0;
                continue;
            }
            let reached = from[texel] != 0
                || (voxel.x > 0 && mask_at(VoxelIndex { x: voxel.x - 1, ..voxel }))
                || (voxel.x + 1 < voxel_count.x && mask_at(VoxelIndex { x: voxel.x + 1, ..voxel }))
                || (voxel.y > 0 && mask_at(VoxelIndex { y: voxel.y - 1, ..voxel }))
                || (voxel.y + 1 < voxel_count.y && mask_at(VoxelIndex { y: voxel.y + 1, ..voxel }))
                || (voxel.z > 0 && mask_at(VoxelIndex { z: voxel.z - 1, ..voxel }))
                || (voxel.z + 1 < voxel_count.z && mask_at(VoxelIndex { z: voxel.z + 1, ..voxel }));
            to[texel] = if reached { MASK_INSIDE } else { 0 };
        }
    }
}

/// Stamps geometry into a `width` x `height` target, sampling at texel
/// centers and keeping the maximum of existing and stamped values.
pub fn stamp_geometry(
    target: &mut [u8],
    width: u32,
    height: u32,
    components: u8,
    geometry: &[StrokeGeometry],
) {
    let components = components as usize;
    assert_eq!(
        target.len(),
        width as usize * height as usize * components,
        "stamp target length mismatch"
    );
    for v in 0..height {
        for u in 0..width {
            let x = u as f32 + 0.5;
            let y = v as f32 + 0.5;
            let value = geometry
                .iter()
                .filter(|shape| shape.covers(x, y))
                .map(StrokeGeometry::value)
                .max();
            let Some(value) = value else {
                continue;
            };
            let offset = (v as usize * width as usize + u as usize) * components;
            for byte in &mut target[offset..offset + components] {
                *byte = (*byte).max(value);
            }
        }
    }
}
