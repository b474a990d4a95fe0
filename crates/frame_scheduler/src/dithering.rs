pub const DITHER_TABLE_LEN: usize = 40;

/// Jitter of sample `index`, in pixels. Entry 0 is the pixel center and
/// belongs to the resolution phase; the rest follow the (2, 3) Halton sequence.
pub fn dither_offset(index: usize) -> [f32; 2] {
    assert!(index < DITHER_TABLE_LEN, "dither index {index} out of range");
    if index == 0 {
        return [0.0, 0.0];
    }
    [halton(index as u32, 2) - 0.5, halton(index as u32, 3) - 0.5]
}

fn halton(mut index: u32, base: u32) -> f32 {
    let mut fraction = 1.0;
    let mut result = 0.0;
    while index > 0 {
        fraction /= base as f32;
        result += fraction * (index % base) as f32;
        index /= base;
    }
    result
}

/// Hands out the jittered samples after the first, one per tick.
#[derive(Debug, Clone, Default)]
pub struct DitheringRenderer {
    samples_taken: u32,
}

impl DitheringRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.samples_taken = 0;
    }

    /// Index into the dither table of the next sample, or `None` once the
    /// table is exhausted.
    pub fn next_sample(&mut self) -> Option<u32> {
        if self.is_finished() {
            return None;
        }
        self.samples_taken += 1;
        Some(self.samples_taken)
    }

    pub fn samples_taken(&self) -> u32 {
        self.samples_taken
    }

    pub fn is_finished(&self) -> bool {
        self.samples_taken as usize >= DITHER_TABLE_LEN - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_stay_within_half_a_pixel_and_are_distinct() {
        let offsets: Vec<[f32; 2]> = (0..DITHER_TABLE_LEN).map(dither_offset).collect();
        for offset in &offsets {
            assert!(offset[0] >= -0.5 && offset[0] < 0.5);
            assert!(offset[1] >= -0.5 && offset[1] < 0.5);
        }
        for (index, offset) in offsets.iter().enumerate() {
            assert!(!offsets[index + 1..].contains(offset), "duplicate offset {index}");
        }
    }

    #[test]
    fn leading_offsets_follow_halton_two_three() {
        let expected = [
            [0.0, 0.0],
            [0.0, 1.0 / 3.0 - 0.5],
            [-0.25, 2.0 / 3.0 - 0.5],
            [0.25, 1.0 / 9.0 - 0.5],
            [-0.375, 4.0 / 9.0 - 0.5],
            [0.125, 7.0 / 9.0 - 0.5],
        ];
        for (index, [x, y]) in expected.into_iter().enumerate() {
            let [actual_x, actual_y] = dither_offset(index);
            assert!(
                (actual_x - x).abs() < 1e-6 && (actual_y - y).abs() < 1e-6,
                "entry {index}: {actual_x}, {actual_y}"
            );
        }
        let [x, y] = dither_offset(DITHER_TABLE_LEN - 1);
        assert!((x - (0.890625 - 0.5)).abs() < 1e-6);
        assert!((y - (13.0 / 81.0 - 0.5)).abs() < 1e-6);
    }

    #[test]
    fn table_yields_thirty_nine_samples() {
        let mut dithering = DitheringRenderer::new();
        let samples: Vec<u32> = std::iter::from_fn(|| dithering.next_sample()).collect();
        assert_eq!(samples.len(), 39);
        assert_eq!(samples.first(), Some(&1));
        assert_eq!(samples.last(), Some(&39));
        assert!(dithering.is_finished());
    }
}
