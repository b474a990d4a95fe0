//! Paint strokes: geometry is stamped into a slice-shaped scratch target per
//! context and merged into the layer's atlas only when the stroke ends.

use std::collections::HashMap;

use model::{AtlasRegion, ViewPlane, VoxelCount};
use render_protocol::{
    Circle, ContextKey, LayerId, MergeFunction, MergeParams, ShapeMaterial, StrokeGeometry,
    TargetKey,
};
use volume::{ContextSet, SliceSource, TargetDescriptor, VolumeError, VolumetricImage, kernels};

/// What the scratch targets were sized for. Any change drops their contents.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScratchShape {
    layer: LayerId,
    voxel_count: VoxelCount,
    components: u8,
    plane: ViewPlane,
    contexts: Vec<ContextKey>,
}

/// The layer a stroke draws into, and where.
#[derive(Debug)]
pub struct StrokeTarget<'a> {
    pub layer: LayerId,
    pub image: &'a mut VolumetricImage,
    pub plane: ViewPlane,
    pub slice_index: u32,
}

#[derive(Debug, Default)]
pub struct ToolRenderer {
    queued: Vec<StrokeGeometry>,
    merge_function: MergeFunction,
    shape: Option<ScratchShape>,
    scratch: HashMap<ContextKey, TargetKey>,
    cpu_scratch: Vec<u8>,
    has_stroke: bool,
}

impl ToolRenderer {
    pub fn new() -> Self {
        Self {
            merge_function: MergeFunction::Add,
            ..Self::default()
        }
    }

    pub fn merge_function(&self) -> MergeFunction {
        self.merge_function
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// True once geometry has been stamped and not yet flushed or discarded.
    pub fn has_stroke(&self) -> bool {
        self.has_stroke
    }

    pub fn render_circles(&mut self, is_additive: bool, circles: &[Circle]) {
        let value = ShapeMaterial::default().value;
        self.merge_function = MergeFunction::for_additive(is_additive);
        self.queued.extend(
            circles
                .iter()
                .map(|circle| StrokeGeometry::Circle { circle: *circle, value }),
        );
    }

    pub fn render_shape(&mut self, vertices: Vec<[f32; 2]>, material: ShapeMaterial, is_additive: bool) {
        self.merge_function = MergeFunction::for_additive(is_additive);
        self.queued.push(StrokeGeometry::Polygon {
            vertices,
            value: material.value,
        });
    }

    /// Resizes the scratch targets for `target`; a no-op when the shape is
    /// unchanged. Returns whether unflushed contents were dropped.
    pub fn resize(
        &mut self,
        contexts: &mut ContextSet,
        layer: LayerId,
        image: &VolumetricImage,
        plane: ViewPlane,
    ) -> bool {
        let shape = ScratchShape {
            layer,
            voxel_count: image.voxel_count(),
            components: image.components(),
            plane,
            contexts: contexts.keys(),
        };
        if self.shape.as_ref() == Some(&shape) {
            return false;
        }
        let dropped = self.has_stroke;
        if dropped {
            log::debug!("stroke scratch resized, unflushed stroke dropped");
        }
        self.destroy_scratch(contexts);
        let region = AtlasRegion::Slice { plane, index: 0 };
        let descriptor = TargetDescriptor::for_region("tool.scratch", image.layout(), region);
        for key in &shape.contexts {
            if let Some(context) = contexts.get_mut(*key) {
                self.scratch.insert(*key, context.create_target(descriptor));
            }
        }
        self.cpu_scratch = vec![0; descriptor.byte_len()];
        self.shape = Some(shape);
        self.has_stroke = false;
        dropped
    }

    /// Stamps every queued shape into the scratch targets, one pass per
    /// context.
    pub fn render(&mut self, contexts: &mut ContextSet, target: Option<StrokeTarget<'_>>) {
        if self.queued.is_empty() {
            return;
        }
        let Some(target) = target else {
            log::debug!("stroke render skipped: no active layer");
            return;
        };
        self.resize(contexts, target.layer, target.image, target.plane);
        let geometry = std::mem::take(&mut self.queued);
        if self.scratch.is_empty() {
            let (width, height) = target.plane.slice_dims(target.image.voxel_count());
            kernels::stamp_geometry(
                &mut self.cpu_scratch,
                width,
                height,
                target.image.components(),
                &geometry,
            );
        } else {
            for (key, scratch) in &self.scratch {
                if let Some(context) = contexts.get_mut(*key) {
                    context.stamp_geometry(*scratch, &geometry);
                }
            }
        }
        self.has_stroke = true;
    }

    /// Merges the stroke into the target slice and clears the scratch.
    /// Returns whether anything was written.
    pub fn end_stroke(
        &mut self,
        contexts: &mut ContextSet,
        target: Option<StrokeTarget<'_>>,
    ) -> Result<bool, VolumeError> {
        let Some(target) = target else {
            log::debug!("end_stroke skipped: no active layer");
            self.discard_stroke(contexts);
            return Ok(false);
        };
        let layer = target.layer;
        let plane = target.plane;
        let slice_index = target.slice_index;
        let image = target.image;
        self.render(
            contexts,
            Some(StrokeTarget {
                layer,
                image: &mut *image,
                plane,
                slice_index,
            }),
        );
        self.resize(contexts, layer, image, plane);
        if !self.has_stroke {
            return Ok(false);
        }
        let source = if self.scratch.is_empty() {
            SliceSource::Bytes(&self.cpu_scratch)
        } else {
            SliceSource::Targets(&self.scratch)
        };
        image.write_slice(
            contexts,
            slice_index,
            plane,
            source,
            MergeParams::new(self.merge_function),
        )?;
        self.discard_stroke(contexts);
        Ok(true)
    }

    pub fn discard_stroke(&mut self, contexts: &mut ContextSet) {
        self.queued.clear();
        for (key, scratch) in &self.scratch {
            if let Some(context) = contexts.get_mut(*key) {
                context.clear_target(*scratch);
            }
        }
        self.cpu_scratch.fill(0);
        self.has_stroke = false;
    }

    /// Current stroke contents, read back from the first context.
    pub fn preview(&self, contexts: &mut ContextSet) -> Vec<u8> {
        let first = self
            .shape
            .as_ref()
            .and_then(|shape| shape.contexts.first())
            .and_then(|key| Some((*key, *self.scratch.get(key)?)));
        match first {
            Some((key, scratch)) => contexts
                .get_mut(key)
                .map(|context| context.read_pixels(scratch))
                .unwrap_or_default(),
            None => self.cpu_scratch.clone(),
        }
    }

    pub fn release(&mut self, contexts: &mut ContextSet) {
        self.queued.clear();
        self.destroy_scratch(contexts);
        self.cpu_scratch.clear();
        self.shape = None;
        self.has_stroke = false;
    }

    fn destroy_scratch(&mut self, contexts: &mut ContextSet) {
        for (key, scratch) in self.scratch.drain() {
            if let Some(context) = contexts.get_mut(key) {
                context.destroy_target(scratch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::VoxelIndex;
    use slotmap::SlotMap;
    use volume::SoftwareContext;

    fn layer_id() -> LayerId {
        SlotMap::<LayerId, ()>::with_key().insert(())
    }

    fn setup(context_count: usize) -> (ContextSet, VolumetricImage) {
        let mut contexts = ContextSet::new();
        for index in 0..context_count {
            contexts.insert(Box::new(SoftwareContext::new(format!("viewport-{index}"))));
        }
        let mut image = VolumetricImage::new(VoxelCount::new(8, 8, 3), 1).expect("image");
        image.sync_contexts(&mut contexts);
        (contexts, image)
    }

    fn stroke_target(layer: LayerId, image: &mut VolumetricImage) -> Option<StrokeTarget<'_>> {
        Some(StrokeTarget {
            layer,
            image,
            plane: ViewPlane::Transverse,
            slice_index: 1,
        })
    }

    #[test]
    fn stroke_reaches_atlas_only_on_end_stroke() {
        for context_count in [0, 2] {
            let (mut contexts, mut image) = setup(context_count);
            let layer = layer_id();
            let mut tool = ToolRenderer::new();
            tool.render_circles(true, &[Circle::new(4.0, 4.0, 1.5)]);
            tool.render(&mut contexts, stroke_target(layer, &mut image));
            assert!(tool.has_stroke());
            assert_eq!(
                image
                    .get_voxel(&mut contexts, VoxelIndex::new(4, 4, 1), 0)
                    .expect("voxel"),
                0
            );

            assert!(
                tool.end_stroke(&mut contexts, stroke_target(layer, &mut image))
                    .expect("end stroke")
            );
            assert_eq!(
                image
                    .get_voxel(&mut contexts, VoxelIndex::new(4, 4, 1), 0)
                    .expect("voxel"),
                255
            );
            assert_eq!(
                image
                    .get_voxel(&mut contexts, VoxelIndex::new(0, 0, 1), 0)
                    .expect("voxel"),
                0
            );
            assert!(!tool.has_stroke());
        }
    }

    #[test]
    fn subtractive_stroke_erases() {
        let (mut contexts, mut image) = setup(1);
        image
            .set_atlas(vec![100; image.layout().byte_len()])
            .expect("set atlas");
        let layer = layer_id();
        let mut tool = ToolRenderer::new();
        tool.render_shape(
            vec![[0.0, 0.0], [8.0, 0.0], [8.0, 8.0], [0.0, 8.0]],
            ShapeMaterial::default(),
            false,
        );
        tool.end_stroke(&mut contexts, stroke_target(layer, &mut image))
            .expect("end stroke");
        assert_eq!(
            image
                .get_voxel(&mut contexts, VoxelIndex::new(7, 7, 1), 0)
                .expect("voxel"),
            0
        );
        assert_eq!(
            image
                .get_voxel(&mut contexts, VoxelIndex::new(7, 7, 0), 0)
                .expect("voxel"),
            100
        );
    }

    #[test]
    fn discard_leaves_atlas_untouched() {
        let (mut contexts, mut image) = setup(1);
        let before = image.get_atlas(&mut contexts).to_vec();
        let layer = layer_id();
        let mut tool = ToolRenderer::new();
        tool.render_circles(true, &[Circle::new(2.0, 2.0, 3.0)]);
        tool.render(&mut contexts, stroke_target(layer, &mut image));
        tool.discard_stroke(&mut contexts);
        assert!(tool.preview(&mut contexts).iter().all(|byte| *byte == 0));
        assert!(
            !tool
                .end_stroke(&mut contexts, stroke_target(layer, &mut image))
                .expect("end stroke")
        );
        assert_eq!(image.get_atlas(&mut contexts), before.as_slice());
    }

    #[test]
    fn plane_change_drops_unflushed_scratch() {
        let (mut contexts, mut image) = setup(1);
        let layer = layer_id();
        let mut tool = ToolRenderer::new();
        tool.render_circles(true, &[Circle::new(2.0, 2.0, 3.0)]);
        tool.render(&mut contexts, stroke_target(layer, &mut image));
        assert!(tool.resize(&mut contexts, layer, &image, ViewPlane::Sagittal));
        assert!(!tool.has_stroke());
        assert_eq!(tool.preview(&mut contexts).len(), 8 * 3);
    }

    #[test]
    fn render_without_layer_keeps_queue() {
        let (mut contexts, _) = setup(1);
        let mut tool = ToolRenderer::new();
        tool.render_circles(false, &[Circle::new(1.0, 1.0, 1.0)]);
        tool.render(&mut contexts, None);
        assert_eq!(tool.queued_len(), 1);
        assert_eq!(tool.merge_function(), MergeFunction::Subtract);
    }
}
