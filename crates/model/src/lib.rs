use std::fmt;

pub const MAX_VOXEL_COMPONENTS: u8 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VoxelCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl VoxelCount {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn is_planar(self) -> bool {
        self.z == 1
    }

    pub const fn sum(self) -> u64 {
        self.x as u64 + self.y as u64 + self.z as u64
    }

    pub const fn voxels(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VoxelIndex {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl VoxelIndex {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

/// Number of slice columns (`x`) and rows (`y`) packed into an atlas.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AtlasGrid {
    pub x: u32,
    pub y: u32,
}

impl AtlasGrid {
    pub const fn cells(self) -> u32 {
        self.x * self.y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    ZeroVoxelCount,
    InvalidComponents { components: u8 },
    SizeOverflow,
    SliceIndexOutOfRange { index: u32, count: u32 },
    GridCellOutOfRange { col: u32, row: u32 },
    VoxelOutOfRange { voxel: VoxelIndex },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::ZeroVoxelCount => {
                write!(formatter, "voxel count must be at least 1 on every axis")
            }
            LayoutError::InvalidComponents { components } => write!(
                formatter,
                "voxel components must be within 1..={MAX_VOXEL_COMPONENTS}, got {components}"
            ),
            LayoutError::SizeOverflow => write!(formatter, "atlas byte size overflows usize"),
            LayoutError::SliceIndexOutOfRange { index, count } => {
                write!(formatter, "slice index {index} out of range 0..{count}")
            }
            LayoutError::GridCellOutOfRange { col, row } => {
                write!(formatter, "atlas grid cell ({col}, {row}) out of range")
            }
            LayoutError::VoxelOutOfRange { voxel } => write!(
                formatter,
                "voxel ({}, {}, {}) out of range",
                voxel.x, voxel.y, voxel.z
            ),
        }
    }
}

impl std::error::Error for LayoutError {}

/// Derives the slice grid: as many columns as `ceil(sqrt(depth))`, then
/// enough rows to hold every slice.
pub fn atlas_grid_for(voxel_count: VoxelCount) -> AtlasGrid {
    // Squares are taken in u64: ceil(sqrt(u32::MAX))^2 does not fit in u32.
    let depth = u64::from(voxel_count.z.max(1));
    let mut columns = (depth as f64).sqrt().ceil() as u64;
    // Guard float rounding on perfect squares.
    while columns > 1 && (columns - 1) * (columns - 1) >= depth {
        columns -= 1;
    }
    while columns * columns < depth {
        columns += 1;
    }
    // columns <= 65536 and rows <= columns, so both fit in u32.
    AtlasGrid {
        x: columns as u32,
        y: depth.div_ceil(columns) as u32,
    }
}

pub fn slice_position(grid: AtlasGrid, slice_index: u32) -> Result<(u32, u32), LayoutError> {
    if slice_index >= grid.cells() {
        return Err(LayoutError::SliceIndexOutOfRange {
            index: slice_index,
            count: grid.cells(),
        });
    }
    Ok((slice_index % grid.x, slice_index / grid.x))
}

pub fn slice_index_at(grid: AtlasGrid, col: u32, row: u32) -> Result<u32, LayoutError> {
    if col >= grid.x || row >= grid.y {
        return Err(LayoutError::GridCellOutOfRange { col, row });
    }
    Ok(row * grid.x + col)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AtlasLayout {
    // atlas_width == grid.x * voxel_count.x, atlas_height == grid.y * voxel_count.y
    voxel_count: VoxelCount,
    components: u8,
    grid: AtlasGrid,
    atlas_width: u32,
    atlas_height: u32,
}

impl AtlasLayout {
    pub fn new(voxel_count: VoxelCount, components: u8) -> Result<Self, LayoutError> {
        if voxel_count.x == 0 || voxel_count.y == 0 || voxel_count.z == 0 {
            return Err(LayoutError::ZeroVoxelCount);
        }
        if components == 0 || components > MAX_VOXEL_COMPONENTS {
            return Err(LayoutError::InvalidComponents { components });
        }
        let grid = atlas_grid_for(voxel_count);
        let atlas_width = grid
            .x
            .checked_mul(voxel_count.x)
            .ok_or(LayoutError::SizeOverflow)?;
        let atlas_height = grid
            .y
            .checked_mul(voxel_count.y)
            .ok_or(LayoutError::SizeOverflow)?;
        (atlas_width as usize)
            .checked_mul(atlas_height as usize)
            .and_then(|texels| texels.checked_mul(components as usize))
            .ok_or(LayoutError::SizeOverflow)?;
        Ok(Self {
            voxel_count,
            components,
            grid,
            atlas_width,
            atlas_height,
        })
    }

    /// Same grid and size with a different component count, used for masks.
    pub fn with_components(self, components: u8) -> Result<Self, LayoutError> {
        Self::new(self.voxel_count, components)
    }

    pub const fn voxel_count(&self) -> VoxelCount {
        self.voxel_count
    }

    pub const fn components(&self) -> u8 {
        self.components
    }

    pub const fn grid(&self) -> AtlasGrid {
        self.grid
    }

    pub const fn atlas_width(&self) -> u32 {
        self.atlas_width
    }

    pub const fn atlas_height(&self) -> u32 {
        self.atlas_height
    }

    pub const fn texel_count(&self) -> usize {
        self.atlas_width as usize * self.atlas_height as usize
    }

    pub const fn byte_len(&self) -> usize {
        self.texel_count() * self.components as usize
    }

    pub const fn contains(&self, voxel: VoxelIndex) -> bool {
        voxel.x < self.voxel_count.x && voxel.y < self.voxel_count.y && voxel.z < self.voxel_count.z
    }

    pub fn check_voxel(&self, voxel: VoxelIndex) -> Result<(), LayoutError> {
        if self.contains(voxel) {
            Ok(())
        } else {
            Err(LayoutError::VoxelOutOfRange { voxel })
        }
    }

    /// Atlas texel holding `voxel`. The voxel must be in range.
    pub fn voxel_to_texel(&self, voxel: VoxelIndex) -> (u32, u32) {
        debug_assert!(self.contains(voxel), "voxel out of range: {voxel:?}");
        let col = voxel.z % self.grid.x;
        let row = voxel.z / self.grid.x;
        (
            col * self.voxel_count.x + voxel.x,
            row * self.voxel_count.y + voxel.y,
        )
    }

    /// Inverse of [`Self::voxel_to_texel`]; `None` for texels in unused grid cells.
    pub fn texel_to_voxel(&self, x: u32, y: u32) -> Option<VoxelIndex> {
        if x >= self.atlas_width || y >= self.atlas_height {
            return None;
        }
        let col = x / self.voxel_count.x;
        let row = y / self.voxel_count.y;
        let z = row * self.grid.x + col;
        if z >= self.voxel_count.z {
            return None;
        }
        Some(VoxelIndex {
            x: x % self.voxel_count.x,
            y: y % self.voxel_count.y,
            z,
        })
    }

    pub fn texel_index(&self, voxel: VoxelIndex) -> usize {
        let (x, y) = self.voxel_to_texel(voxel);
        y as usize * self.atlas_width as usize + x as usize
    }

    pub fn byte_offset(&self, voxel: VoxelIndex, component: u8) -> usize {
        debug_assert!(component < self.components);
        self.texel_index(voxel) * self.components as usize + component as usize
    }

    /// Byte range of the atlas rows covering transverse slice `z`.
    pub fn slice_row_byte_range(&self, z: u32) -> std::ops::Range<usize> {
        let row = z / self.grid.x;
        let row_bytes = self.atlas_width as usize * self.components as usize;
        let first_row = row as usize * self.voxel_count.y as usize;
        let start = first_row * row_bytes;
        start..start + self.voxel_count.y as usize * row_bytes
    }
}

/// The three orthogonal cross-section planes. `Transverse` is the plane the
/// atlas is packed along.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewPlane {
    /// Slices along z, slice texel (u, v) = voxel (u, v).
    Transverse,
    /// Slices along x, slice texel (u, v) = voxel (_, u, v).
    Sagittal,
    /// Slices along y, slice texel (u, v) = voxel (u, _, v).
    Coronal,
}

impl ViewPlane {
    pub const NATIVE: Self = ViewPlane::Transverse;
    pub const ALL: [Self; 3] = [
        ViewPlane::Transverse,
        ViewPlane::Sagittal,
        ViewPlane::Coronal,
    ];

    pub const fn is_native(self) -> bool {
        matches!(self, ViewPlane::Transverse)
    }

    pub const fn code(self) -> u32 {
        match self {
            ViewPlane::Transverse => 0,
            ViewPlane::Sagittal => 1,
            ViewPlane::Coronal => 2,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ViewPlane::Transverse),
            1 => Some(ViewPlane::Sagittal),
            2 => Some(ViewPlane::Coronal),
            _ => None,
        }
    }

    pub const fn slice_dims(self, voxel_count: VoxelCount) -> (u32, u32) {
        match self {
            ViewPlane::Transverse => (voxel_count.x, voxel_count.y),
            ViewPlane::Sagittal => (voxel_count.y, voxel_count.z),
            ViewPlane::Coronal => (voxel_count.x, voxel_count.z),
        }
    }

    pub const fn slice_count(self, voxel_count: VoxelCount) -> u32 {
        match self {
            ViewPlane::Transverse => voxel_count.z,
            ViewPlane::Sagittal => voxel_count.x,
            ViewPlane::Coronal => voxel_count.y,
        }
    }

    pub const fn voxel_at(self, slice_index: u32, u: u32, v: u32) -> VoxelIndex {
        match self {
            ViewPlane::Transverse => VoxelIndex::new(u, v, slice_index),
            ViewPlane::Sagittal => VoxelIndex::new(slice_index, u, v),
            ViewPlane::Coronal => VoxelIndex::new(u, slice_index, v),
        }
    }

    pub const fn slice_of(self, voxel: VoxelIndex) -> (u32, u32, u32) {
        match self {
            ViewPlane::Transverse => (voxel.z, voxel.x, voxel.y),
            ViewPlane::Sagittal => (voxel.x, voxel.y, voxel.z),
            ViewPlane::Coronal => (voxel.y, voxel.x, voxel.z),
        }
    }
}

/// The voxels a write touches, addressed through a 2-D source image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AtlasRegion {
    Slice { plane: ViewPlane, index: u32 },
    /// The whole atlas; the source is atlas-shaped.
    Volume,
}

impl AtlasRegion {
    pub fn validate(self, voxel_count: VoxelCount) -> Result<(), LayoutError> {
        match self {
            AtlasRegion::Slice { plane, index } => {
                let count = plane.slice_count(voxel_count);
                if index >= count {
                    return Err(LayoutError::SliceIndexOutOfRange { index, count });
                }
                Ok(())
            }
            AtlasRegion::Volume => Ok(()),
        }
    }

    pub fn source_dims(self, layout: &AtlasLayout) -> (u32, u32) {
        match self {
            AtlasRegion::Slice { plane, .. } => plane.slice_dims(layout.voxel_count()),
            AtlasRegion::Volume => (layout.atlas_width(), layout.atlas_height()),
        }
    }

    pub fn source_byte_len(self, layout: &AtlasLayout) -> usize {
        let (width, height) = self.source_dims(layout);
        width as usize * height as usize * layout.components() as usize
    }

    /// Voxel fed by source texel `(u, v)`, or `None` for unused atlas cells.
    pub fn voxel_at(self, layout: &AtlasLayout, u: u32, v: u32) -> Option<VoxelIndex> {
        match self {
            AtlasRegion::Slice { plane, index } => Some(plane.voxel_at(index, u, v)),
            AtlasRegion::Volume => layout.texel_to_voxel(u, v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_square_enough_for_depth() {
        assert_eq!(atlas_grid_for(VoxelCount::new(4, 4, 1)), AtlasGrid { x: 1, y: 1 });
        assert_eq!(atlas_grid_for(VoxelCount::new(4, 4, 2)), AtlasGrid { x: 2, y: 1 });
        assert_eq!(atlas_grid_for(VoxelCount::new(4, 4, 9)), AtlasGrid { x: 3, y: 3 });
        assert_eq!(atlas_grid_for(VoxelCount::new(4, 4, 10)), AtlasGrid { x: 4, y: 3 });
        assert_eq!(atlas_grid_for(VoxelCount::new(4, 4, 256)), AtlasGrid { x: 16, y: 16 });
    }

    #[test]
    fn slice_position_round_trips_over_whole_grid() {
        for depth in 1..70 {
            let grid = atlas_grid_for(VoxelCount::new(3, 5, depth));
            for slice_index in 0..grid.cells() {
                let (col, row) = slice_position(grid, slice_index).expect("in range");
                assert_eq!(slice_index_at(grid, col, row), Ok(slice_index));
            }
            assert!(slice_position(grid, grid.cells()).is_err());
        }
    }

    #[test]
    fn atlas_size_matches_grid_times_slice_dims() {
        let layout = AtlasLayout::new(VoxelCount::new(7, 3, 5), 2).expect("layout");
        assert_eq!(layout.grid(), AtlasGrid { x: 3, y: 2 });
        assert_eq!(layout.atlas_width(), 21);
        assert_eq!(layout.atlas_height(), 6);
        assert_eq!(layout.byte_len(), 21 * 6 * 2);
    }

    #[test]
    fn voxel_texel_mapping_is_bijective_on_used_cells() {
        let layout = AtlasLayout::new(VoxelCount::new(5, 4, 7), 1).expect("layout");
        let mut used = 0;
        for y in 0..layout.atlas_height() {
            for x in 0..layout.atlas_width() {
                if let Some(voxel) = layout.texel_to_voxel(x, y) {
                    used += 1;
                    assert_eq!(layout.voxel_to_texel(voxel), (x, y));
                }
            }
        }
        assert_eq!(used as u64, layout.voxel_count().voxels());
    }

    #[test]
    fn rejects_invalid_layouts() {
        assert_eq!(
            AtlasLayout::new(VoxelCount::new(0, 4, 4), 1),
            Err(LayoutError::ZeroVoxelCount)
        );
        assert_eq!(
            AtlasLayout::new(VoxelCount::new(4, 4, 4), 5),
            Err(LayoutError::InvalidComponents { components: 5 })
        );
    }

    #[test]
    fn planes_map_slice_texels_back_to_their_slice() {
        let voxel_count = VoxelCount::new(3, 4, 5);
        for plane in ViewPlane::ALL {
            let (width, height) = plane.slice_dims(voxel_count);
            for index in 0..plane.slice_count(voxel_count) {
                for v in 0..height {
                    for u in 0..width {
                        let voxel = plane.voxel_at(index, u, v);
                        assert!(voxel.x < 3 && voxel.y < 4 && voxel.z < 5);
                        assert_eq!(plane.slice_of(voxel), (index, u, v));
                    }
                }
            }
        }
    }

    #[test]
    fn region_validation_uses_plane_slice_count() {
        let voxel_count = VoxelCount::new(3, 4, 5);
        let sagittal = AtlasRegion::Slice {
            plane: ViewPlane::Sagittal,
            index: 3,
        };
        assert_eq!(
            sagittal.validate(voxel_count),
            Err(LayoutError::SliceIndexOutOfRange { index: 3, count: 3 })
        );
        assert!(AtlasRegion::Volume.validate(voxel_count).is_ok());
    }

    #[test]
    fn slice_row_range_covers_the_slice_row() {
        let layout = AtlasLayout::new(VoxelCount::new(2, 3, 4), 1).expect("layout");
        // grid 2x2, atlas 4x6
        assert_eq!(layout.slice_row_byte_range(0), 0..12);
        assert_eq!(layout.slice_row_byte_range(1), 0..12);
        assert_eq!(layout.slice_row_byte_range(2), 12..24);
    }

    #[test]
    fn plane_codes_round_trip() {
        for plane in ViewPlane::ALL {
            assert_eq!(ViewPlane::from_code(plane.code()), Some(plane));
        }
        assert_eq!(ViewPlane::from_code(3), None);
    }

    #[test]
    fn deepest_volume_sizes_its_grid_without_overflow() {
        assert_eq!(
            atlas_grid_for(VoxelCount::new(1, 1, u32::MAX)),
            AtlasGrid { x: 65536, y: 65536 }
        );
        assert_eq!(
            AtlasLayout::new(VoxelCount::new(u32::MAX, 1, u32::MAX), 1),
            Err(LayoutError::SizeOverflow)
        );
        assert_eq!(
            AtlasLayout::new(VoxelCount::new(1, u32::MAX, u32::MAX), 1),
            Err(LayoutError::SizeOverflow)
        );
    }
}
