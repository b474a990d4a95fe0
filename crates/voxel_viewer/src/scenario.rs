use model::{VoxelCount, VoxelIndex};

/// A bright ball in a dim, slightly textured background.
pub struct Phantom {
    pub voxel_count: VoxelCount,
    pub radius: f32,
    pub inside: u8,
    pub background: u8,
}

impl Phantom {
    pub fn new(voxel_count: VoxelCount) -> Self {
        let shortest = voxel_count.x.min(voxel_count.y).min(voxel_count.z);
        Self {
            voxel_count,
            radius: shortest as f32 * 0.35,
            inside: 200,
            background: 12,
        }
    }

    pub fn center(&self) -> VoxelIndex {
        VoxelIndex::new(
            self.voxel_count.x / 2,
            self.voxel_count.y / 2,
            self.voxel_count.z / 2,
        )
    }

    pub fn value_at(&self, voxel: VoxelIndex) -> u8 {
        let center = self.center();
        let dx = voxel.x as f32 - center.x as f32;
        let dy = voxel.y as f32 - center.y as f32;
        let dz = voxel.z as f32 - center.z as f32;
        if (dx * dx + dy * dy + dz * dz).sqrt() <= self.radius {
            self.inside
        } else {
            // Background texture stays well below the ball's value.
            self.background + ((voxel.x * 7 + voxel.y * 13 + voxel.z * 3) % 5) as u8
        }
    }

    /// Voxels in x-fastest, then y, then z order.
    pub fn voxels(&self) -> Vec<u8> {
        let count = self.voxel_count;
        let mut voxels = Vec::with_capacity(count.voxels() as usize);
        for z in 0..count.z {
            for y in 0..count.y {
                for x in 0..count.x {
                    voxels.push(self.value_at(VoxelIndex::new(x, y, z)));
                }
            }
        }
        voxels
    }

    pub fn inside_count(&self) -> usize {
        self.voxels()
            .iter()
            .filter(|value| **value == self.inside)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ball_is_centered_and_brighter_than_background() {
        let phantom = Phantom::new(VoxelCount::new(16, 16, 8));
        assert_eq!(phantom.value_at(phantom.center()), 200);
        assert!(phantom.value_at(VoxelIndex::new(0, 0, 0)) < 20);
        assert_eq!(phantom.voxels().len(), 16 * 16 * 8);
        assert!(phantom.inside_count() > 1);
    }
}
