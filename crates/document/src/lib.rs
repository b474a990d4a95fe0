//! The viewer document: volumetric image layers, the view onto them, and the
//! renderers that edit and display them.

use std::fmt;

use frame_scheduler::{FrameAccumulator, FrameDecision, PerformanceMode, ProgressiveScheduler};
use model::{ViewPlane, VoxelCount, VoxelIndex};
use render_protocol::{Circle, ContextKey, LayerId, MergeParams, ShapeMaterial, VoxelWrite};
use renderer::{
    MipVolumePass, RegionGrowingRenderer, RegionGrowingState, StrokeTarget, ToolRenderer,
};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use volume::{
    ContextSet, RenderContext, SliceSource, VolumeError, VolumeSnapshot, VolumetricImage,
};

mod config;
mod subscriptions;

#[cfg(test)]
mod tests;

pub use config::{Backend, ConfigError, PerformanceSetting, ViewerConfig};
pub use subscriptions::{StateChange, Subscriber, Subscriptions};

pub const DOCUMENT_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// The scanned volume. A document holds at most one.
    Image,
    /// A single-component label volume with the image's voxel count.
    Annotation,
}

#[derive(Debug)]
pub struct Layer {
    kind: LayerKind,
    name: String,
    image: VolumetricImage,
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &VolumetricImage {
        &self.image
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewState {
    pub plane: ViewPlane,
    pub slice_index: u32,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            plane: ViewPlane::NATIVE,
            slice_index: 0,
        }
    }
}

pub struct Document {
    contexts: ContextSet,
    layers: SlotMap<LayerId, Layer>,
    layer_order: Vec<LayerId>,
    source_layer: Option<LayerId>,
    active_layer: Option<LayerId>,
    view: ViewState,
    tool: ToolRenderer,
    region: RegionGrowingRenderer,
    scheduler: ProgressiveScheduler,
    volume_pass: MipVolumePass,
    subscriptions: Subscriptions,
    revision: u64,
    displayed_revision: Option<u64>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new(&ViewerConfig::default())
    }
}

impl Document {
    pub fn new(config: &ViewerConfig) -> Self {
        Self {
            contexts: ContextSet::new(),
            layers: SlotMap::with_key(),
            layer_order: Vec::new(),
            source_layer: None,
            active_layer: None,
            view: ViewState::default(),
            tool: ToolRenderer::new(),
            region: RegionGrowingRenderer::new(),
            scheduler: ProgressiveScheduler::new(config.scheduler_config()),
            volume_pass: MipVolumePass::new(config.viewport()),
            subscriptions: Subscriptions::document_defaults(),
            revision: 0,
            displayed_revision: None,
        }
    }

    /// Bumped on every edit of the source image.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn attach_context(&mut self, context: Box<dyn RenderContext>) -> ContextKey {
        let key = self.contexts.insert(context);
        for layer in self.layers.values_mut() {
            layer.image.attach_context(&mut self.contexts, key);
        }
        log::info!(
            "rendering context {key:?} attached ({} total)",
            self.contexts.len()
        );
        self.publish(&[StateChange::Contexts]);
        key
    }

    /// Detaches a context, pulling back edits only it holds. Returns false for
    /// an unknown key.
    pub fn detach_context(&mut self, key: ContextKey) -> bool {
        if !self.contexts.contains(key) {
            log::debug!("detach skipped: context {key:?} is not registered");
            return false;
        }
        for layer in self.layers.values_mut() {
            layer.image.detach_context(&mut self.contexts, key);
        }
        self.tool.release(&mut self.contexts);
        self.region.release(&mut self.contexts);
        self.contexts.remove(key);
        log::info!(
            "rendering context {key:?} detached ({} left)",
            self.contexts.len()
        );
        self.publish(&[StateChange::Contexts]);
        true
    }

    pub fn layer_ids(&self) -> &[LayerId] {
        &self.layer_order
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn active_layer(&self) -> Option<LayerId> {
        self.active_layer
    }

    pub fn source_layer(&self) -> Option<LayerId> {
        self.source_layer
    }

    /// Adds the source image. `voxels` are x-fastest, then y, then z; `None`
    /// starts from zeros.
    pub fn add_image_layer(
        &mut self,
        name: impl Into<String>,
        voxel_count: VoxelCount,
        components: u8,
        voxels: Option<&[u8]>,
    ) -> Result<LayerId, DocumentError> {
        if self.source_layer.is_some() {
            return Err(DocumentError::ImageLayerExists);
        }
        let image = match voxels {
            Some(voxels) => VolumetricImage::from_voxels(voxel_count, components, voxels)?,
            None => VolumetricImage::new(voxel_count, components)?,
        };
        let id = self.insert_layer(LayerKind::Image, name.into(), image);
        self.source_layer = Some(id);
        self.revision += 1;
        let mut changes = vec![StateChange::VoxelCount, StateChange::VolumeData];
        if self.active_layer.is_none() {
            self.active_layer = Some(id);
            changes.push(StateChange::ActiveLayer);
        }
        self.clamp_slice_index();
        self.publish(&changes);
        Ok(id)
    }

    /// Adds an empty annotation shaped like the source image and makes it
    /// active.
    pub fn add_annotation_layer(
        &mut self,
        name: impl Into<String>,
    ) -> Result<LayerId, DocumentError> {
        let voxel_count = self
            .source_layer
            .and_then(|id| self.layers.get(id))
            .map(|layer| layer.image.voxel_count())
            .ok_or(DocumentError::NoSourceImage)?;
        let image = VolumetricImage::new(voxel_count, 1)?;
        let id = self.insert_layer(LayerKind::Annotation, name.into(), image);
        self.active_layer = Some(id);
        self.publish(&[StateChange::ActiveLayer]);
        Ok(id)
    }

    /// Removes a layer and releases its image. An unflushed stroke or region
    /// session aimed at it is dropped.
    /// Deletes `id`. Annotations are sized by the source image, so deleting
    /// the source deletes every annotation layer with it.
    pub fn delete_layer(&mut self, id: LayerId) -> Result<(), DocumentError> {
        if !self.layers.contains_key(id) {
            return Err(DocumentError::UnknownLayer(id));
        }
        let deleting_source = self.source_layer == Some(id);
        let doomed: Vec<LayerId> = if deleting_source {
            self.layer_order.clone()
        } else {
            vec![id]
        };
        let mut changes = Vec::new();
        if self.active_layer.is_some_and(|active| doomed.contains(&active)) {
            self.tool.release(&mut self.contexts);
        }
        if deleting_source {
            self.region.release(&mut self.contexts);
            self.source_layer = None;
            self.revision += 1;
            changes.push(StateChange::VoxelCount);
            changes.push(StateChange::VolumeData);
        }
        self.layer_order.retain(|existing| !doomed.contains(existing));
        for doomed_id in doomed {
            if let Some(layer) = self.layers.remove(doomed_id) {
                layer.image.release(&mut self.contexts);
                log::info!("layer {doomed_id:?} ({}) deleted", layer.name);
            }
        }
        let active = self
            .active_layer
            .filter(|active| self.layers.contains_key(*active))
            .or_else(|| self.layer_order.last().copied());
        if active != self.active_layer {
            self.active_layer = active;
            changes.push(StateChange::ActiveLayer);
        }
        self.publish(&changes);
        Ok(())
    }

    pub fn set_active_layer(&mut self, id: LayerId) -> Result<(), DocumentError> {
        if !self.layers.contains_key(id) {
            return Err(DocumentError::UnknownLayer(id));
        }
        if self.active_layer != Some(id) {
            self.active_layer = Some(id);
            self.publish(&[StateChange::ActiveLayer]);
        }
        Ok(())
    }

    pub fn view(&self) -> ViewState {
        self.view
    }

    pub fn set_view_plane(&mut self, plane: ViewPlane) {
        if self.view.plane == plane {
            return;
        }
        self.view.plane = plane;
        self.volume_pass.set_view_plane(plane);
        let mut changes = vec![StateChange::ViewPlane];
        if self.clamp_slice_index() {
            changes.push(StateChange::SliceIndex);
        }
        self.publish(&changes);
    }

    /// Moves to `index`, clamped to the plane's slice count. Returns the
    /// index actually selected.
    pub fn set_slice_index(&mut self, index: u32) -> u32 {
        let clamped = match self.reference_voxel_count() {
            Some(voxel_count) => index.min(self.view.plane.slice_count(voxel_count) - 1),
            None => index,
        };
        if clamped != self.view.slice_index {
            self.view.slice_index = clamped;
            self.publish(&[StateChange::SliceIndex]);
        }
        clamped
    }

    pub fn get_slice(
        &mut self,
        layer: LayerId,
        index: u32,
        plane: ViewPlane,
    ) -> Result<Vec<u8>, DocumentError> {
        let image = &mut layer_entry(&mut self.layers, Some(layer))
            .ok_or(DocumentError::UnknownLayer(layer))?
            .image;
        Ok(image.read_slice(&mut self.contexts, index, plane)?)
    }

    pub fn set_slice(
        &mut self,
        layer: LayerId,
        index: u32,
        plane: ViewPlane,
        data: &[u8],
        params: MergeParams,
    ) -> Result<(), DocumentError> {
        let image = &mut layer_entry(&mut self.layers, Some(layer))
            .ok_or(DocumentError::UnknownLayer(layer))?
            .image;
        image.write_slice(
            &mut self.contexts,
            index,
            plane,
            SliceSource::Bytes(data),
            params,
        )?;
        self.mark_edited(layer);
        Ok(())
    }

    pub fn get_atlas(&mut self, layer: LayerId) -> Result<Vec<u8>, DocumentError> {
        let image = &mut layer_entry(&mut self.layers, Some(layer))
            .ok_or(DocumentError::UnknownLayer(layer))?
            .image;
        Ok(image.get_atlas(&mut self.contexts).to_vec())
    }

    pub fn set_atlas(&mut self, layer: LayerId, data: Vec<u8>) -> Result<(), DocumentError> {
        self.layer_mut(layer)?.image.set_atlas(data)?;
        self.mark_edited(layer);
        Ok(())
    }

    pub fn get_voxel(
        &mut self,
        layer: LayerId,
        voxel: VoxelIndex,
        component: u8,
    ) -> Result<u8, DocumentError> {
        let image = &mut layer_entry(&mut self.layers, Some(layer))
            .ok_or(DocumentError::UnknownLayer(layer))?
            .image;
        Ok(image.get_voxel(&mut self.contexts, voxel, component)?)
    }

    pub fn set_voxels(&mut self, layer: LayerId, batch: &[VoxelWrite]) -> Result<(), DocumentError> {
        let image = &mut layer_entry(&mut self.layers, Some(layer))
            .ok_or(DocumentError::UnknownLayer(layer))?
            .image;
        image.set_voxels(&mut self.contexts, batch)?;
        self.mark_edited(layer);
        Ok(())
    }

    pub fn region_state(&self) -> RegionGrowingState {
        self.region.state()
    }

    pub fn region_steps(&self) -> u32 {
        self.region.steps()
    }

    /// Places a region-growing seed in the source image.
    pub fn set_seed(&mut self, voxel: VoxelIndex) -> Result<(), DocumentError> {
        let Some(layer) = self.source_layer.and_then(|id| self.layers.get(id)) else {
            log::debug!("set_seed skipped: no source image");
            return Ok(());
        };
        self.region.set_seed(&mut self.contexts, &layer.image, voxel)?;
        Ok(())
    }

    pub fn do_region_growing(&mut self, threshold: u8) -> Result<(), DocumentError> {
        let Some(layer) = layer_entry(&mut self.layers, self.source_layer) else {
            log::debug!("region growing skipped: no source image");
            return Ok(());
        };
        self.region
            .do_region_growing(&mut self.contexts, &mut layer.image, threshold)?;
        Ok(())
    }

    pub fn set_steps(&mut self, value: i64) {
        self.region.set_steps(value);
    }

    /// The region preview mask, one byte per atlas texel.
    pub fn region_preview(&mut self) -> Option<Vec<u8>> {
        self.region.preview_mask(&mut self.contexts)
    }

    /// Commits the region preview into the active annotation layer.
    pub fn flush_to_annotation(&mut self) -> Result<bool, DocumentError> {
        let annotation = layer_entry(&mut self.layers, self.active_layer).filter(|layer| layer.kind == LayerKind::Annotation);
        let Some(layer) = annotation else {
            log::debug!("flush skipped: active layer is not an annotation");
            return Ok(false);
        };
        Ok(self
            .region
            .flush_to_annotation(&mut self.contexts, &mut layer.image)?)
    }

    /// Drops the region-growing preview and seed.
    pub fn discard(&mut self) {
        self.region.discard(&mut self.contexts);
    }

    pub fn render_circles(&mut self, is_additive: bool, circles: &[Circle]) {
        self.tool.render_circles(is_additive, circles);
    }

    pub fn render_shape(
        &mut self,
        vertices: Vec<[f32; 2]>,
        material: ShapeMaterial,
        is_additive: bool,
    ) {
        self.tool.render_shape(vertices, material, is_additive);
    }

    pub fn has_stroke(&self) -> bool {
        self.tool.has_stroke()
    }

    pub fn discard_stroke(&mut self) {
        self.tool.discard_stroke(&mut self.contexts);
    }

    /// Merges the current stroke into the active layer at the current slice.
    pub fn end_stroke(&mut self) -> Result<bool, DocumentError> {
        let active = self.active_layer;
        let target = stroke_target(&mut self.layers, active, self.view);
        let written = self.tool.end_stroke(&mut self.contexts, target)?;
        if let (true, Some(layer)) = (written, active) {
            self.mark_edited(layer);
        }
        Ok(written)
    }

    /// Uploads queued voxel edits and stamps queued stroke geometry. Returns
    /// the number of contexts that received pending edits.
    pub fn lazy_render(&mut self) -> usize {
        let mut rendered = 0;
        for layer in self.layers.values_mut() {
            rendered += layer.image.render_pending(&mut self.contexts);
        }
        let target = stroke_target(&mut self.layers, self.active_layer, self.view);
        self.tool.render(&mut self.contexts, target);
        rendered
    }

    /// Advances progressive rendering of the source image by one frame.
    pub fn tick(&mut self) -> FrameDecision {
        self.refresh_volume_pass();
        self.scheduler.tick(&mut self.volume_pass)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.volume_pass.resize(width, height);
    }

    pub fn set_performance_mode(&mut self, mode: PerformanceMode) {
        self.scheduler.set_performance_mode(mode);
    }

    pub fn scheduler(&self) -> &ProgressiveScheduler {
        &self.scheduler
    }

    pub fn frame(&self) -> &FrameAccumulator {
        self.volume_pass.frame()
    }

    /// Captures every layer, pulling GPU edits back first.
    pub fn snapshot(&mut self) -> DocumentSnapshot {
        let mut layers = Vec::with_capacity(self.layer_order.len());
        for id in &self.layer_order {
            let layer = self
                .layers
                .get_mut(*id)
                .unwrap_or_else(|| panic!("layer order references missing layer {id:?}"));
            layers.push(LayerSnapshot {
                kind: layer.kind,
                name: layer.name.clone(),
                volume: layer.image.snapshot(&mut self.contexts),
            });
        }
        DocumentSnapshot {
            schema_version: DOCUMENT_SCHEMA_VERSION,
            layers,
            active_layer: self
                .active_layer
                .and_then(|active| self.layer_order.iter().position(|id| *id == active)),
            view_plane: self.view.plane.code(),
            slice_index: self.view.slice_index,
        }
    }

    pub fn to_json(&mut self) -> Result<String, DocumentError> {
        serde_json::to_string(&self.snapshot()).map_err(DocumentError::Json)
    }

    /// Rebuilds a document without rendering contexts; attach them afterwards.
    pub fn from_snapshot(
        snapshot: DocumentSnapshot,
        config: &ViewerConfig,
    ) -> Result<Self, DocumentError> {
        if snapshot.schema_version != DOCUMENT_SCHEMA_VERSION {
            return Err(DocumentError::UnsupportedSnapshot {
                schema_version: snapshot.schema_version,
            });
        }
        let plane = ViewPlane::from_code(snapshot.view_plane)
            .ok_or(DocumentError::InvalidSnapshot("unknown view plane"))?;
        let mut document = Self::new(config);
        let mut source_voxel_count = None;
        for layer in snapshot.layers {
            let image = VolumetricImage::from_snapshot(layer.volume)?;
            match layer.kind {
                LayerKind::Image => {
                    if source_voxel_count.is_some() {
                        return Err(DocumentError::InvalidSnapshot("more than one image layer"));
                    }
                    source_voxel_count = Some(image.voxel_count());
                }
                LayerKind::Annotation => {
                    if source_voxel_count != Some(image.voxel_count()) || image.components() != 1 {
                        return Err(DocumentError::InvalidSnapshot(
                            "annotation does not match the image layer",
                        ));
                    }
                }
            }
            let id = document.insert_layer(layer.kind, layer.name, image);
            if layer.kind == LayerKind::Image {
                document.source_layer = Some(id);
            }
        }
        document.active_layer = match snapshot.active_layer {
            Some(index) => Some(
                *document
                    .layer_order
                    .get(index)
                    .ok_or(DocumentError::InvalidSnapshot("active layer out of range"))?,
            ),
            None => None,
        };
        document.view.plane = plane;
        document.volume_pass.set_view_plane(plane);
        document.set_slice_index(snapshot.slice_index);
        Ok(document)
    }

    pub fn from_json(json: &str, config: &ViewerConfig) -> Result<Self, DocumentError> {
        let snapshot: DocumentSnapshot = serde_json::from_str(json).map_err(DocumentError::Json)?;
        Self::from_snapshot(snapshot, config)
    }

    fn insert_layer(&mut self, kind: LayerKind, name: String, mut image: VolumetricImage) -> LayerId {
        image.sync_contexts(&mut self.contexts);
        log::info!(
            "{kind:?} layer {name} added: {:?} x {}",
            image.voxel_count(),
            image.components()
        );
        let id = self.layers.insert(Layer { kind, name, image });
        self.layer_order.push(id);
        id
    }

    fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer, DocumentError> {
        self.layers.get_mut(id).ok_or(DocumentError::UnknownLayer(id))
    }

    fn reference_voxel_count(&self) -> Option<VoxelCount> {
        self.source_layer
            .or(self.active_layer)
            .and_then(|id| self.layers.get(id))
            .map(|layer| layer.image.voxel_count())
    }

    /// Returns whether the slice index moved.
    fn clamp_slice_index(&mut self) -> bool {
        let Some(voxel_count) = self.reference_voxel_count() else {
            return false;
        };
        let last = self.view.plane.slice_count(voxel_count) - 1;
        if self.view.slice_index > last {
            self.view.slice_index = last;
            return true;
        }
        false
    }

    fn mark_edited(&mut self, layer: LayerId) {
        if self.source_layer == Some(layer) {
            self.revision += 1;
            self.publish(&[StateChange::VolumeData]);
        }
    }

    fn publish(&mut self, changes: &[StateChange]) {
        for change in changes {
            self.subscriptions.notify(*change);
        }
        for subscriber in self.subscriptions.take_notifications() {
            match subscriber {
                Subscriber::ToolScratch => self.refresh_tool_scratch(),
                Subscriber::RegionSession => self.region.discard(&mut self.contexts),
                Subscriber::ProgressiveRender => {
                    self.displayed_revision = None;
                    self.scheduler.invalidate();
                }
            }
        }
    }

    fn refresh_tool_scratch(&mut self) {
        self.tool.discard_stroke(&mut self.contexts);
        let plane = self.view.plane;
        match self
            .active_layer
            .and_then(|id| Some((id, self.layers.get(id)?)))
        {
            Some((id, layer)) => {
                self.tool.resize(&mut self.contexts, id, &layer.image, plane);
            }
            None => self.tool.release(&mut self.contexts),
        }
    }

    fn refresh_volume_pass(&mut self) {
        if self.displayed_revision == Some(self.revision) {
            return;
        }
        match layer_entry(&mut self.layers, self.source_layer) {
            Some(layer) => {
                let layout = *layer.image.layout();
                let atlas = layer.image.get_atlas(&mut self.contexts).to_vec();
                self.volume_pass.set_volume(layout, atlas);
            }
            None => self.volume_pass.clear_volume(),
        }
        self.displayed_revision = Some(self.revision);
    }
}

fn layer_entry(
    layers: &mut SlotMap<LayerId, Layer>,
    id: Option<LayerId>,
) -> Option<&mut Layer> {
    layers.get_mut(id?)
}

fn stroke_target(
    layers: &mut SlotMap<LayerId, Layer>,
    layer: Option<LayerId>,
    view: ViewState,
) -> Option<StrokeTarget<'_>> {
    let layer = layer?;
    Some(StrokeTarget {
        layer,
        image: &mut layers.get_mut(layer)?.image,
        plane: view.plane,
        slice_index: view.slice_index,
    })
}

/// Serialized document: CPU buffers of every layer plus the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub schema_version: u16,
    pub layers: Vec<LayerSnapshot>,
    pub active_layer: Option<usize>,
    pub view_plane: u32,
    pub slice_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub kind: LayerKind,
    pub name: String,
    pub volume: VolumeSnapshot,
}

#[derive(Debug)]
pub enum DocumentError {
    UnknownLayer(LayerId),
    ImageLayerExists,
    NoSourceImage,
    Volume(VolumeError),
    Json(serde_json::Error),
    UnsupportedSnapshot { schema_version: u16 },
    InvalidSnapshot(&'static str),
}

impl fmt::Display for DocumentError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::UnknownLayer(id) => write!(formatter, "unknown layer {id:?}"),
            DocumentError::ImageLayerExists => {
                write!(formatter, "document already has an image layer")
            }
            DocumentError::NoSourceImage => write!(formatter, "document has no image layer"),
            DocumentError::Volume(error) => write!(formatter, "{error}"),
            DocumentError::Json(error) => write!(formatter, "document json: {error}"),
            DocumentError::UnsupportedSnapshot { schema_version } => {
                write!(formatter, "unsupported document snapshot (schema {schema_version})")
            }
            DocumentError::InvalidSnapshot(reason) => {
                write!(formatter, "invalid document snapshot: {reason}")
            }
        }
    }
}

impl std::error::Error for DocumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DocumentError::Volume(error) => Some(error),
            DocumentError::Json(error) => Some(error),
            _ => None,
        }
    }
}

impl From<VolumeError> for DocumentError {
    fn from(error: VolumeError) -> Self {
        DocumentError::Volume(error)
    }
}
