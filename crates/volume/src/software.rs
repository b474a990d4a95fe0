use model::{AtlasLayout, AtlasRegion};
use render_protocol::{MergeParams, StrokeGeometry, TargetKey};
use slotmap::SlotMap;

use crate::context::{RenderContext, TargetDescriptor};
use crate::kernels::{self, GrowStep};

#[derive(Debug)]
struct SoftwareTarget {
    descriptor: TargetDescriptor,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareContextStats {
    pub passes: u64,
    pub uploads: u64,
    pub read_backs: u64,
}

/// A rendering context whose targets live in host memory. Passes run the
/// reference kernels synchronously, so it doubles as a deterministic stand-in
/// for a GPU viewport.
#[derive(Debug)]
pub struct SoftwareContext {
    label: String,
    targets: SlotMap<TargetKey, SoftwareTarget>,
    stats: SoftwareContextStats,
}

impl SoftwareContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            targets: SlotMap::with_key(),
            stats: SoftwareContextStats::default(),
        }
    }

    pub fn stats(&self) -> SoftwareContextStats {
        self.stats
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn target(&self, key: TargetKey) -> &SoftwareTarget {
        self.targets
            .get(key)
            .unwrap_or_else(|| panic!("software context {}: unknown target {key:?}", self.label))
    }

    fn take_bytes(&mut self, key: TargetKey) -> Vec<u8> {
        let label = &self.label;
        let target = self
            .targets
            .get_mut(key)
            .unwrap_or_else(|| panic!("software context {label}: unknown target {key:?}"));
        std::mem::take(&mut target.bytes)
    }

    fn put_bytes(&mut self, key: TargetKey, bytes: Vec<u8>) {
        if let Some(target) = self.targets.get_mut(key) {
            target.bytes = bytes;
        }
    }
}

impl RenderContext for SoftwareContext {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_target(&mut self, descriptor: TargetDescriptor) -> TargetKey {
        self.targets.insert(SoftwareTarget {
            descriptor,
            bytes: vec![0; descriptor.byte_len()],
        })
    }

    fn destroy_target(&mut self, target: TargetKey) {
        self.targets.remove(target);
    }

    fn target_descriptor(&self, target: TargetKey) -> Option<TargetDescriptor> {
        self.targets.get(target).map(|target| target.descriptor)
    }

    fn clear_target(&mut self, target: TargetKey) {
        let mut bytes = self.take_bytes(target);
        bytes.fill(0);
        self.put_bytes(target, bytes);
    }

    fn upload(&mut self, target: TargetKey, byte_offset: usize, data: &[u8]) {
        let mut bytes = self.take_bytes(target);
        let end = byte_offset + data.len();
        assert!(
            end <= bytes.len(),
            "upload of {} bytes at {byte_offset} overruns target of {} bytes",
            data.len(),
            bytes.len()
        );
        bytes[byte_offset..end].copy_from_slice(data);
        self.put_bytes(target, bytes);
        self.stats.uploads += 1;
    }

    fn read_pixels(&mut self, target: TargetKey) -> Vec<u8> {
        self.stats.read_backs += 1;
        self.target(target).bytes.clone()
    }

    fn extract_region(
        &mut self,
        atlas: TargetKey,
        layout: &AtlasLayout,
        region: AtlasRegion,
        destination: TargetKey,
    ) {
        let mut out = self.take_bytes(destination);
        kernels::extract_region(&self.target(atlas).bytes, layout, region, &mut out);
        self.put_bytes(destination, out);
        self.stats.passes += 1;
    }

    fn merge_region(
        &mut self,
        atlas: TargetKey,
        layout: &AtlasLayout,
        region: AtlasRegion,
        source: TargetKey,
        params: MergeParams,
    ) {
        let mut atlas_bytes = self.take_bytes(atlas);
        kernels::merge_region(
            &mut atlas_bytes,
            layout,
            region,
            &self.target(source).bytes,
            params,
        );
        self.put_bytes(atlas, atlas_bytes);
        self.stats.passes += 1;
    }

    fn grow_region(
        &mut self,
        source: TargetKey,
        layout: &AtlasLayout,
        step: GrowStep,
        from: TargetKey,
        to: TargetKey,
    ) {
        let mut out = self.take_bytes(to);
        kernels::grow_region(
            &self.target(source).bytes,
            layout,
            step,
            &self.target(from).bytes,
            &mut out,
        );
        self.put_bytes(to, out);
        self.stats.passes += 1;
    }

    fn stamp_geometry(&mut self, target: TargetKey, geometry: &[StrokeGeometry]) {
        let descriptor = self.target(target).descriptor;
        let mut bytes = self.take_bytes(target);
        kernels::stamp_geometry(
            &mut bytes,
            descriptor.width,
            descriptor.height,
            descriptor.components,
            geometry,
        );
        self.put_bytes(target, bytes);
        self.stats.passes += 1;
    }
}
