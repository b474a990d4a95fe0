use model::VoxelCount;
use serde::{Deserialize, Serialize};

use crate::context::ContextSet;
use crate::image::VolumetricImage;
use crate::VolumeError;

pub const SNAPSHOT_SCHEMA_VERSION: u16 = 1;

/// Serialized form of one volume: its shape and the atlas-packed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub schema_version: u16,
    pub voxel_count: [u32; 3],
    pub voxel_components: u8,
    pub atlas_width: u32,
    pub atlas_height: u32,
    pub data: Vec<u8>,
}

impl VolumetricImage {
    /// Captures the image, pulling GPU edits back first.
    pub fn snapshot(&mut self, contexts: &mut ContextSet) -> VolumeSnapshot {
        let layout = *self.layout();
        let count = layout.voxel_count();
        VolumeSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            voxel_count: [count.x, count.y, count.z],
            voxel_components: layout.components(),
            atlas_width: layout.atlas_width(),
            atlas_height: layout.atlas_height(),
            data: self.get_atlas(contexts).to_vec(),
        }
    }

    pub fn from_snapshot(snapshot: VolumeSnapshot) -> Result<Self, VolumeError> {
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(VolumeError::UnsupportedSnapshot {
                schema_version: snapshot.schema_version,
            });
        }
        let [x, y, z] = snapshot.voxel_count;
        let image = Self::from_atlas(
            VoxelCount::new(x, y, z),
            snapshot.voxel_components,
            snapshot.data,
        )?;
        let layout = image.layout();
        if (layout.atlas_width(), layout.atlas_height())
            != (snapshot.atlas_width, snapshot.atlas_height)
        {
            return Err(VolumeError::UnsupportedSnapshot {
                schema_version: snapshot.schema_version,
            });
        }
        Ok(image)
    }

    pub fn to_json(&mut self, contexts: &mut ContextSet) -> Result<String, VolumeError> {
        serde_json::to_string(&self.snapshot(contexts)).map_err(VolumeError::Json)
    }

    pub fn from_json(json: &str) -> Result<Self, VolumeError> {
        let snapshot: VolumeSnapshot = serde_json::from_str(json).map_err(VolumeError::Json)?;
        Self::from_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::VoxelIndex;
    use render_protocol::VoxelWrite;

    #[test]
    fn json_restores_voxels_and_shape() {
        let mut contexts = ContextSet::new();
        let mut image = VolumetricImage::new(VoxelCount::new(3, 2, 5), 1).expect("image");
        image
            .set_voxels(
                &mut contexts,
                &[VoxelWrite {
                    voxel: VoxelIndex::new(2, 1, 4),
                    value: 99,
                }],
            )
            .expect("set voxels");

        let json = image.to_json(&mut contexts).expect("encode");
        let mut restored = VolumetricImage::from_json(&json).expect("decode");
        assert_eq!(restored.voxel_count(), VoxelCount::new(3, 2, 5));
        assert_eq!(
            restored
                .get_voxel(&mut contexts, VoxelIndex::new(2, 1, 4), 0)
                .expect("voxel"),
            99
        );
    }

    #[test]
    fn rejects_future_schema_versions() {
        let mut contexts = ContextSet::new();
        let mut image = VolumetricImage::new(VoxelCount::new(1, 1, 1), 1).expect("image");
        let mut snapshot = image.snapshot(&mut contexts);
        snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION + 1;
        assert!(matches!(
            VolumetricImage::from_snapshot(snapshot),
            Err(VolumeError::UnsupportedSnapshot { .. })
        ));
    }
}
