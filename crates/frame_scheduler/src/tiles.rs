/// Tile rectangle in downsampled texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Splits a `ceil(w / factor) x ceil(h / factor)` target into tiles no larger
/// than `max_tile_edge`, visited row-major.
#[derive(Debug, Clone)]
pub struct TiledRenderer {
    width: u32,
    height: u32,
    max_tile_edge: u32,
    tiles_x: u32,
    tiles_y: u32,
    next_tile: u32,
}

impl TiledRenderer {
    pub fn new(viewport: (u32, u32), factor: u32, max_tile_edge: u32) -> Self {
        assert!(factor > 0, "downsample factor must be positive");
        assert!(max_tile_edge > 0, "max_tile_edge must be positive");
        let width = viewport.0.div_ceil(factor);
        let height = viewport.1.div_ceil(factor);
        Self {
            width,
            height,
            max_tile_edge,
            tiles_x: width.div_ceil(max_tile_edge),
            tiles_y: height.div_ceil(max_tile_edge),
            next_tile: 0,
        }
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn tile_count(&self) -> u32 {
        self.tiles_x * self.tiles_y
    }

    pub fn is_frame_complete(&self) -> bool {
        self.next_tile >= self.tile_count()
    }

    pub fn restart(&mut self) {
        self.next_tile = 0;
    }

    pub fn next_tile(&mut self) -> Option<TileRect> {
        if self.is_frame_complete() {
            return None;
        }
        let column = self.next_tile % self.tiles_x;
        let row = self.next_tile / self.tiles_x;
        self.next_tile += 1;
        let x = column * self.max_tile_edge;
        let y = row * self.max_tile_edge;
        Some(TileRect {
            x,
            y,
            width: self.max_tile_edge.min(self.width - x),
            height: self.max_tile_edge.min(self.height - y),
        })
    }
}
