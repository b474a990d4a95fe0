use super::*;
use volume::{MASK_INSIDE, SoftwareContext};

fn document_with_contexts(context_count: usize) -> Document {
    let mut document = Document::default();
    for index in 0..context_count {
        document.attach_context(Box::new(SoftwareContext::new(format!("viewport-{index}"))));
    }
    document
}

fn sequential_slice() -> Vec<u8> {
    (1..=16).collect()
}

#[test]
fn slice_round_trip_then_region_grows_from_seed() {
    for context_count in [0, 1, 2] {
        let mut document = document_with_contexts(context_count);
        let image = document
            .add_image_layer("scan", VoxelCount::new(4, 4, 2), 1, None)
            .expect("add image");
        document
            .set_slice(
                image,
                0,
                ViewPlane::Transverse,
                &sequential_slice(),
                MergeParams::default(),
            )
            .expect("set slice");
        assert_eq!(
            document
                .get_slice(image, 0, ViewPlane::Transverse)
                .expect("get slice"),
            sequential_slice()
        );

        document.set_seed(VoxelIndex::new(0, 0, 0)).expect("seed");
        document.do_region_growing(0).expect("grow");
        let mask = document.region_preview().expect("preview");
        let layout = *document.layer(image).expect("image").image().layout();
        for z in 0..2 {
            for y in 0..4 {
                for x in 0..4 {
                    let voxel = VoxelIndex::new(x, y, z);
                    let expected = if (x, y, z) == (0, 0, 0) { MASK_INSIDE } else { 0 };
                    assert_eq!(
                        mask[layout.texel_index(voxel)],
                        expected,
                        "voxel {voxel:?} with {context_count} contexts"
                    );
                }
            }
        }
    }
}

#[test]
fn stroke_then_layer_deletion_leaves_atlases_unchanged() {
    let mut document = document_with_contexts(1);
    let image = document
        .add_image_layer("scan", VoxelCount::new(8, 8, 2), 1, None)
        .expect("add image");
    let kept = document.add_annotation_layer("kept").expect("annotation");
    let doomed = document.add_annotation_layer("doomed").expect("annotation");
    let image_before = document.get_atlas(image).expect("atlas");
    let kept_before = document.get_atlas(kept).expect("atlas");

    document.render_circles(true, &[Circle::new(4.0, 4.0, 3.0)]);
    document.lazy_render();
    assert!(document.has_stroke());
    document.delete_layer(doomed).expect("delete");

    assert!(!document.has_stroke());
    assert_eq!(document.active_layer(), Some(kept));
    assert!(!document.end_stroke().expect("end stroke"));
    assert_eq!(document.get_atlas(image).expect("atlas"), image_before);
    assert_eq!(document.get_atlas(kept).expect("atlas"), kept_before);
    assert!(matches!(
        document.get_atlas(doomed),
        Err(DocumentError::UnknownLayer(_))
    ));
}

#[test]
fn stroke_lands_in_active_layer_at_current_slice() {
    let mut document = document_with_contexts(2);
    document
        .add_image_layer("scan", VoxelCount::new(8, 8, 4), 1, None)
        .expect("add image");
    let annotation = document.add_annotation_layer("labels").expect("annotation");
    assert_eq!(document.set_slice_index(2), 2);
    document.render_circles(true, &[Circle::new(4.0, 4.0, 1.0)]);
    assert!(document.end_stroke().expect("end stroke"));

    let slice = document
        .get_slice(annotation, 2, ViewPlane::Transverse)
        .expect("slice");
    assert_eq!(slice[4 * 8 + 4], 255);
    let other = document
        .get_slice(annotation, 1, ViewPlane::Transverse)
        .expect("slice");
    assert!(other.iter().all(|value| *value == 0));
}

#[test]
fn view_changes_drop_unflushed_strokes() {
    let mut document = document_with_contexts(1);
    document
        .add_image_layer("scan", VoxelCount::new(8, 8, 4), 1, None)
        .expect("add image");
    let annotation = document.add_annotation_layer("labels").expect("annotation");
    document.render_circles(true, &[Circle::new(4.0, 4.0, 2.0)]);
    document.lazy_render();
    document.set_view_plane(ViewPlane::Coronal);
    assert!(!document.has_stroke());
    assert!(!document.end_stroke().expect("end stroke"));
    assert!(
        document
            .get_atlas(annotation)
            .expect("atlas")
            .iter()
            .all(|value| *value == 0)
    );
}

#[test]
fn slice_index_is_clamped_to_plane() {
    let mut document = Document::default();
    document
        .add_image_layer("scan", VoxelCount::new(6, 5, 3), 1, None)
        .expect("add image");
    assert_eq!(document.set_slice_index(10), 2);
    document.set_view_plane(ViewPlane::Sagittal);
    assert_eq!(document.view().slice_index, 2);
    assert_eq!(document.set_slice_index(10), 5);
    document.set_view_plane(ViewPlane::Transverse);
    assert_eq!(document.view().slice_index, 2);
}

#[test]
fn region_preview_flushes_into_annotation_only() {
    let mut document = document_with_contexts(1);
    let voxels: Vec<u8> = (0..4 * 4 * 2).map(|index| if index % 4 < 2 { 9 } else { 200 }).collect();
    let image = document
        .add_image_layer("scan", VoxelCount::new(4, 4, 2), 1, Some(&voxels))
        .expect("add image");

    document.set_seed(VoxelIndex::new(0, 0, 0)).expect("seed");
    document.do_region_growing(0).expect("grow");
    assert!(
        !document.flush_to_annotation().expect("flush"),
        "the image layer is not an annotation"
    );

    let annotation = document.add_annotation_layer("labels").expect("annotation");
    document.set_seed(VoxelIndex::new(0, 0, 0)).expect("seed");
    document.do_region_growing(0).expect("grow");
    assert_eq!(document.region_steps(), 0);
    assert!(document.flush_to_annotation().expect("flush"));
    assert_eq!(document.region_state(), RegionGrowingState::Idle);

    let labels = document
        .get_slice(annotation, 1, ViewPlane::Transverse)
        .expect("slice");
    for (index, value) in labels.iter().enumerate() {
        let expected = if index % 4 < 2 { MASK_INSIDE } else { 0 };
        assert_eq!(*value, expected, "texel {index}");
    }
    assert_eq!(
        document
            .get_voxel(image, VoxelIndex::new(0, 0, 0), 0)
            .expect("voxel"),
        9
    );
}

#[test]
fn active_layer_change_discards_region_session() {
    let mut document = document_with_contexts(1);
    document
        .add_image_layer("scan", VoxelCount::new(4, 4, 2), 1, None)
        .expect("add image");
    document.set_seed(VoxelIndex::new(1, 1, 1)).expect("seed");
    assert_eq!(document.region_state(), RegionGrowingState::SeedPlaced);
    document.add_annotation_layer("labels").expect("annotation");
    assert_eq!(document.region_state(), RegionGrowingState::Idle);
    assert!(document.region_preview().is_none());
}

#[test]
fn missing_source_image_is_a_no_op() {
    let mut document = Document::default();
    document.set_seed(VoxelIndex::new(0, 0, 0)).expect("seed");
    document.do_region_growing(10).expect("grow");
    assert!(!document.flush_to_annotation().expect("flush"));
    document.render_circles(true, &[Circle::new(1.0, 1.0, 1.0)]);
    assert!(!document.end_stroke().expect("end stroke"));
    assert!(matches!(
        document.add_annotation_layer("labels"),
        Err(DocumentError::NoSourceImage)
    ));
}

#[test]
fn second_image_layer_is_rejected() {
    let mut document = Document::default();
    document
        .add_image_layer("scan", VoxelCount::new(2, 2, 2), 1, None)
        .expect("add image");
    assert!(matches!(
        document.add_image_layer("other", VoxelCount::new(2, 2, 2), 1, None),
        Err(DocumentError::ImageLayerExists)
    ));
}

#[test]
fn detaching_last_context_keeps_gpu_edits() {
    let mut document = document_with_contexts(1);
    let image = document
        .add_image_layer("scan", VoxelCount::new(4, 4, 2), 1, None)
        .expect("add image");
    let annotation = document.add_annotation_layer("labels").expect("annotation");
    document.render_circles(true, &[Circle::new(2.0, 2.0, 1.0)]);
    assert!(document.end_stroke().expect("end stroke"));
    let key = document.contexts().keys()[0];
    assert!(document.detach_context(key));
    assert!(!document.detach_context(key));
    assert_eq!(document.context_count(), 0);
    assert_eq!(
        document
            .get_voxel(annotation, VoxelIndex::new(2, 2, 0), 0)
            .expect("voxel"),
        255
    );
    assert_eq!(
        document
            .get_voxel(image, VoxelIndex::new(2, 2, 0), 0)
            .expect("voxel"),
        0
    );
}

#[test]
fn edits_restart_progressive_rendering() {
    let config = ViewerConfig {
        viewport: [16, 16],
        max_tile_edge: 16,
        ..ViewerConfig::default()
    };
    let mut document = Document::new(&config);
    let image = document
        .add_image_layer("scan", VoxelCount::new(4, 4, 2), 1, None)
        .expect("add image");
    while !document.scheduler().is_finished() {
        document.tick();
    }
    assert_eq!(document.frame().pixel(0, 0)[0], 0.0);

    document
        .set_voxels(
            image,
            &[VoxelWrite {
                voxel: VoxelIndex::new(0, 0, 1),
                value: 255,
            }],
        )
        .expect("set voxels");
    assert!(!document.scheduler().is_finished());
    let decision = document.tick();
    assert_eq!(
        decision.phase,
        frame_scheduler::RenderPhase::Resolution { factor: 4 }
    );
    while !document.scheduler().is_finished() {
        document.tick();
    }
    assert!(document.frame().pixel(0, 0)[0] > 0.99);
}

#[test]
fn json_round_trip_restores_layers_and_view() {
    let mut document = document_with_contexts(1);
    let voxels: Vec<u8> = (0..4 * 4 * 3).map(|value| value as u8).collect();
    document
        .add_image_layer("scan", VoxelCount::new(4, 4, 3), 1, Some(&voxels))
        .expect("add image");
    let annotation = document.add_annotation_layer("labels").expect("annotation");
    document.set_slice_index(1);
    document.render_circles(true, &[Circle::new(1.0, 1.0, 1.0)]);
    document.end_stroke().expect("end stroke");
    let expected = document.get_atlas(annotation).expect("atlas");

    let json = document.to_json().expect("to json");
    let mut restored = Document::from_json(&json, &ViewerConfig::default()).expect("from json");
    assert_eq!(restored.layer_ids().len(), 2);
    assert_eq!(restored.view().slice_index, 1);
    let restored_annotation = restored.active_layer().expect("active layer");
    assert_eq!(
        restored.layer(restored_annotation).map(Layer::kind),
        Some(LayerKind::Annotation)
    );
    assert_eq!(
        restored.get_atlas(restored_annotation).expect("atlas"),
        expected
    );
    let source = restored.source_layer().expect("source");
    assert_eq!(
        restored
            .get_voxel(source, VoxelIndex::new(3, 3, 2), 0)
            .expect("voxel"),
        47
    );
}

#[test]
fn snapshot_with_two_images_is_rejected() {
    let mut document = Document::default();
    document
        .add_image_layer("scan", VoxelCount::new(2, 2, 1), 1, None)
        .expect("add image");
    let mut snapshot = document.snapshot();
    snapshot.layers.push(snapshot.layers[0].clone());
    assert!(matches!(
        Document::from_snapshot(snapshot, &ViewerConfig::default()),
        Err(DocumentError::InvalidSnapshot(_))
    ));
}

#[test]
fn deleting_source_image_takes_its_annotations_along() {
    let mut document = document_with_contexts(1);
    let image = document
        .add_image_layer("scan", VoxelCount::new(4, 4, 2), 1, None)
        .expect("add image");
    let labels = document.add_annotation_layer("labels").expect("annotation");
    document.render_circles(true, &[Circle::new(2.0, 2.0, 1.0)]);
    document.set_seed(VoxelIndex::new(0, 0, 0)).expect("seed");
    document.delete_layer(image).expect("delete");

    assert!(document.layer_ids().is_empty());
    assert_eq!(document.source_layer(), None);
    assert_eq!(document.active_layer(), None);
    assert!(!document.has_stroke());
    assert_eq!(document.region_state(), RegionGrowingState::Idle);
    assert!(matches!(
        document.get_atlas(labels),
        Err(DocumentError::UnknownLayer(_))
    ));

    let larger = document
        .add_image_layer("larger", VoxelCount::new(8, 6, 3), 1, None)
        .expect("add image");
    let fresh = document.add_annotation_layer("fresh").expect("annotation");
    assert_eq!(
        document.get_atlas(fresh).expect("atlas").len(),
        document.get_atlas(larger).expect("atlas").len()
    );
    document.render_circles(true, &[Circle::new(6.0, 4.0, 1.0)]);
    assert!(document.end_stroke().expect("end stroke"));
    assert_eq!(
        document
            .get_voxel(fresh, VoxelIndex::new(6, 4, 0), 0)
            .expect("voxel"),
        255
    );
}
