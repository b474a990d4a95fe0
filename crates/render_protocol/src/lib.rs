use model::VoxelIndex;

slotmap::new_key_type! {
    /// A rendering context (one GPU viewport).
    pub struct ContextKey;
    /// A render target owned by one rendering context.
    pub struct TargetKey;
    pub struct LayerId;
}

/// Blend rule applied when writing new data over existing atlas content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MergeFunction {
    #[default]
    Replace,
    Add,
    Subtract,
}

impl MergeFunction {
    pub const fn code(self) -> u32 {
        match self {
            MergeFunction::Replace => 0,
            MergeFunction::Add => 1,
            MergeFunction::Subtract => 2,
        }
    }

    pub const fn for_additive(is_additive: bool) -> Self {
        if is_additive {
            MergeFunction::Add
        } else {
            MergeFunction::Subtract
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeParams {
    pub function: MergeFunction,
    /// Only source values strictly above the threshold are written.
    pub threshold: Option<u8>,
    /// Scales source values before merging.
    pub weight: f32,
}

impl MergeParams {
    pub const fn new(function: MergeFunction) -> Self {
        Self {
            function,
            threshold: None,
            weight: 1.0,
        }
    }

    pub const fn with_threshold(mut self, threshold: Option<u8>) -> Self {
        self.threshold = threshold;
        self
    }

    pub const fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// Per-byte merge rule shared by every backend.
    #[inline]
    pub fn apply(&self, destination: u8, source: u8) -> u8 {
        if matches!(self.threshold, Some(threshold) if source <= threshold) {
            return destination;
        }
        let scaled = if self.weight == 1.0 {
            source
        } else {
            (source as f32 * self.weight + 0.5).floor().clamp(0.0, 255.0) as u8
        };
        match self.function {
            MergeFunction::Replace => scaled,
            MergeFunction::Add => destination.saturating_add(scaled),
            MergeFunction::Subtract => destination.saturating_sub(scaled),
        }
    }
}

impl Default for MergeParams {
    fn default() -> Self {
        Self::new(MergeFunction::Replace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub center_x: f32,
    pub center_y: f32,
    pub radius: f32,
}

impl Circle {
    pub const fn new(center_x: f32, center_y: f32, radius: f32) -> Self {
        Self {
            center_x,
            center_y,
            radius,
        }
    }

    pub fn covers(&self, x: f32, y: f32) -> bool {
        let dx = x - self.center_x;
        let dy = y - self.center_y;
        dx * dx + dy * dy <= self.radius * self.radius
    }
}

/// Geometry stamped into a stroke scratch target, in slice texel units.
#[derive(Debug, Clone, PartialEq)]
pub enum StrokeGeometry {
    Circle { circle: Circle, value: u8 },
    Polygon { vertices: Vec<[f32; 2]>, value: u8 },
}

impl StrokeGeometry {
    pub fn value(&self) -> u8 {
        match self {
            StrokeGeometry::Circle { value, .. } | StrokeGeometry::Polygon { value, .. } => *value,
        }
    }

    /// Coverage of the point `(x, y)`; polygons use the even-odd rule.
    pub fn covers(&self, x: f32, y: f32) -> bool {
        match self {
            StrokeGeometry::Circle { circle, .. } => circle.covers(x, y),
            StrokeGeometry::Polygon { vertices, .. } => polygon_covers(vertices, x, y),
        }
    }
}

pub fn polygon_covers(vertices: &[[f32; 2]], x: f32, y: f32) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut previous = vertices[vertices.len() - 1];
    for &current in vertices {
        let crosses = (current[1] > y) != (previous[1] > y);
        if crosses {
            let t = (y - current[1]) / (previous[1] - current[1]);
            let intersection_x = current[0] + t * (previous[0] - current[0]);
            if x < intersection_x {
                inside = !inside;
            }
        }
        previous = current;
    }
    inside
}

/// Material of a shape-tool stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeMaterial {
    pub value: u8,
}

impl Default for ShapeMaterial {
    fn default() -> Self {
        Self { value: u8::MAX }
    }
}

/// One voxel of a pending edit batch; `value` is written to every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelWrite {
    pub voxel: VoxelIndex,
    pub value: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_ignores_destination() {
        let params = MergeParams::new(MergeFunction::Replace);
        assert_eq!(params.apply(200, 7), 7);
    }

    #[test]
    fn add_and_subtract_saturate() {
        assert_eq!(MergeParams::new(MergeFunction::Add).apply(250, 10), 255);
        assert_eq!(MergeParams::new(MergeFunction::Subtract).apply(5, 10), 0);
        assert_eq!(MergeParams::new(MergeFunction::Add).apply(5, 10), 15);
    }

    #[test]
    fn subtract_undoes_unsaturated_add() {
        let add = MergeParams::new(MergeFunction::Add).with_weight(0.6);
        let subtract = MergeParams::new(MergeFunction::Subtract).with_weight(0.6);
        for destination in (0..=150).step_by(10) {
            for source in (0..=160).step_by(7) {
                let added = add.apply(destination, source);
                assert_eq!(subtract.apply(added, source), destination, "{destination} + {source}");
            }
        }
    }

    #[test]
    fn threshold_gates_source_values_at_or_below_it() {
        let params = MergeParams::new(MergeFunction::Replace).with_threshold(Some(10));
        assert_eq!(params.apply(3, 10), 3);
        assert_eq!(params.apply(3, 11), 11);
    }

    #[test]
    fn weight_scales_and_rounds_source() {
        let params = MergeParams::new(MergeFunction::Add).with_weight(0.5);
        assert_eq!(params.apply(0, 255), 128);
        assert_eq!(params.apply(0, 3), 2);
    }

    #[test]
    fn polygon_coverage_uses_even_odd_rule() {
        let square = vec![[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]];
        assert!(polygon_covers(&square, 2.0, 2.0));
        assert!(!polygon_covers(&square, 5.0, 2.0));
        assert!(!polygon_covers(&square[..2], 1.0, 0.5));
    }

    #[test]
    fn circle_covers_its_disk() {
        let circle = Circle::new(2.0, 2.0, 1.0);
        assert!(circle.covers(2.5, 2.5));
        assert!(!circle.covers(3.5, 3.5));
    }
}
