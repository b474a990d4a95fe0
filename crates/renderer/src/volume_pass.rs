use frame_scheduler::{FrameAccumulator, ProgressivePass, TileRequest};
use model::{AtlasLayout, ViewPlane, VoxelIndex};

/// Orthographic maximum intensity projection of component 0 along the slice
/// axis of a view plane, written into a running-average frame.
#[derive(Debug, Clone)]
pub struct MipVolumePass {
    viewport: (u32, u32),
    plane: ViewPlane,
    volume: Option<(AtlasLayout, Vec<u8>)>,
    accumulator: FrameAccumulator,
    tiles_rendered: u64,
}

impl MipVolumePass {
    pub fn new(viewport: (u32, u32)) -> Self {
        Self {
            viewport,
            plane: ViewPlane::NATIVE,
            volume: None,
            accumulator: FrameAccumulator::new(viewport.0, viewport.1),
            tiles_rendered: 0,
        }
    }

    /// Replaces the projected volume with a copy of an atlas buffer.
    pub fn set_volume(&mut self, layout: AtlasLayout, atlas: Vec<u8>) {
        debug_assert_eq!(atlas.len(), layout.byte_len());
        self.volume = Some((layout, atlas));
    }

    pub fn clear_volume(&mut self) {
        self.volume = None;
    }

    pub fn has_volume(&self) -> bool {
        self.volume.is_some()
    }

    pub fn set_view_plane(&mut self, plane: ViewPlane) {
        self.plane = plane;
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        self.accumulator.resize(width, height);
    }

    pub fn frame(&self) -> &FrameAccumulator {
        &self.accumulator
    }

    pub fn tiles_rendered(&self) -> u64 {
        self.tiles_rendered
    }

    /// Projected intensity in `[0, 1]` at full-resolution position `(x, y)`.
    pub fn sample(&self, x: f32, y: f32) -> Option<f32> {
        let (layout, atlas) = self.volume.as_ref()?;
        let voxel_count = layout.voxel_count();
        let (width, height) = self.plane.slice_dims(voxel_count);
        let u = to_slice_coordinate(x, self.viewport.0, width);
        let v = to_slice_coordinate(y, self.viewport.1, height);
        let depth = self.plane.slice_count(voxel_count);
        let maximum = (0..depth)
            .map(|slice| {
                let voxel: VoxelIndex = self.plane.voxel_at(slice, u, v);
                atlas[layout.byte_offset(voxel, 0)]
            })
            .max()
            .unwrap_or(0);
        Some(f32::from(maximum) / 255.0)
    }
}

fn to_slice_coordinate(position: f32, extent: u32, slice_extent: u32) -> u32 {
    let scaled = (position / extent.max(1) as f32 * slice_extent as f32).floor();
    (scaled.max(0.0) as u32).min(slice_extent - 1)
}

impl ProgressivePass for MipVolumePass {
    fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    fn render_tile(&mut self, request: TileRequest) {
        let factor = request.factor;
        let tile = request.tile;
        for ty in tile.y..tile.y + tile.height {
            for tx in tile.x..tile.x + tile.width {
                // Center of the downsampled texel, in full-resolution pixels.
                let x = (tx * factor) as f32 + factor as f32 * 0.5 + request.jitter[0];
                let y = (ty * factor) as f32 + factor as f32 * 0.5 + request.jitter[1];
                let value = match self.sample(x, y) {
                    Some(intensity) => [intensity, intensity, intensity, 1.0],
                    None => [0.0; 4],
                };
                self.accumulator
                    .blend_block(tx, ty, factor, value, request.blend_weight);
            }
        }
        self.tiles_rendered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_scheduler::{PerformanceMode, ProgressiveScheduler, ProgressiveSchedulerConfig};
    use model::VoxelCount;

    fn bright_column_pass() -> MipVolumePass {
        let layout = AtlasLayout::new(VoxelCount::new(4, 4, 3), 1).expect("layout");
        let mut atlas = vec![0; layout.byte_len()];
        atlas[layout.byte_offset(VoxelIndex::new(1, 2, 2), 0)] = 255;
        atlas[layout.byte_offset(VoxelIndex::new(1, 2, 0), 0)] = 51;
        let mut pass = MipVolumePass::new((8, 8));
        pass.set_volume(layout, atlas);
        pass
    }

    #[test]
    fn projection_takes_the_maximum_along_the_axis() {
        let pass = bright_column_pass();
        assert_eq!(pass.sample(3.0, 5.0), Some(1.0));
        assert_eq!(pass.sample(0.5, 0.5), Some(0.0));
    }

    #[test]
    fn sagittal_projection_uses_x_as_depth() {
        let mut pass = bright_column_pass();
        pass.set_view_plane(ViewPlane::Sagittal);
        // slice dims (y, z) = (4, 3): u = y = 2, v = z = 2
        assert_eq!(pass.sample(5.0, 7.0), Some(1.0));
        assert_eq!(pass.sample(5.0, 1.0), Some(0.2));
    }

    #[test]
    fn converged_frame_shows_the_projection() {
        let mut pass = bright_column_pass();
        let mut scheduler = ProgressiveScheduler::new(ProgressiveSchedulerConfig {
            performance_mode: PerformanceMode::High,
            max_tile_edge: 4,
        });
        while !scheduler.is_finished() {
            scheduler.tick(&mut pass);
        }
        let bright = pass.frame().pixel(2, 4);
        let dark = pass.frame().pixel(7, 0);
        assert!(bright[0] > 0.5, "bright pixel {bright:?}");
        assert_eq!(dark[0], 0.0);
        assert!((dark[3] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn coarse_tiles_fill_whole_blocks() {
        let mut pass = bright_column_pass();
        let mut scheduler = ProgressiveScheduler::default();
        scheduler.tick(&mut pass);
        // factor 4: texel (0, 1) covers pixels 0..4 x 4..8 and samples (2, 6).
        let expected = pass.sample(2.0, 6.0).expect("volume");
        assert_eq!(pass.frame().pixel(0, 7), pass.frame().pixel(3, 4));
        assert_eq!(pass.frame().pixel(0, 7), [expected, expected, expected, 1.0]);
    }
}
