//! Progressive refinement of an expensive per-pixel render.
//!
//! After every invalidation the target is first rendered tile by tile at
//! decreasing downsample factors, one tile per tick. Once a full-resolution
//! frame is flushed, each tick renders one jittered full frame and blends it
//! into the running average until the jitter table is exhausted.

mod dithering;
mod tiles;

pub use dithering::{DITHER_TABLE_LEN, DitheringRenderer, dither_offset};
pub use tiles::{TileRect, TiledRenderer};

pub const DEFAULT_MAX_TILE_EDGE: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerformanceMode {
    Low,
    #[default]
    High,
}

impl PerformanceMode {
    /// Number of downsample factors walked after an invalidation.
    pub const fn resolution_steps(self) -> u32 {
        match self {
            PerformanceMode::High => 3,
            PerformanceMode::Low => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressiveSchedulerConfig {
    pub performance_mode: PerformanceMode,
    pub max_tile_edge: u32,
}

impl Default for ProgressiveSchedulerConfig {
    fn default() -> Self {
        Self {
            performance_mode: PerformanceMode::default(),
            max_tile_edge: DEFAULT_MAX_TILE_EDGE,
        }
    }
}

/// Walks the downsample factor from `2^(steps - 1)` down to 1.
#[derive(Debug, Clone)]
pub struct ResolutionComputer {
    resolution_steps: u32,
    factor: u32,
    full_resolution_flushed: bool,
}

impl ResolutionComputer {
    pub fn new(mode: PerformanceMode) -> Self {
        let mut computer = Self {
            resolution_steps: mode.resolution_steps(),
            factor: 1,
            full_resolution_flushed: false,
        };
        computer.reset();
        computer
    }

    pub fn set_performance_mode(&mut self, mode: PerformanceMode) {
        self.resolution_steps = mode.resolution_steps();
        self.reset();
    }

    pub fn reset(&mut self) {
        self.factor = 1 << (self.resolution_steps - 1);
        self.full_resolution_flushed = false;
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn is_full_resolution_flushed(&self) -> bool {
        self.full_resolution_flushed
    }

    /// Advances after a frame at the current factor completed.
    pub fn on_frame_complete(&mut self) {
        if self.factor == 1 {
            self.full_resolution_flushed = true;
        } else {
            self.factor /= 2;
        }
    }
}

/// One unit of work handed to a [`ProgressivePass`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRequest {
    /// Tile in downsampled texels.
    pub tile: TileRect,
    pub factor: u32,
    /// Sub-pixel offset in full-resolution pixels, within `[-0.5, 0.5)`.
    pub jitter: [f32; 2],
    /// Weight of the new samples against the accumulated frame; 1 replaces.
    pub blend_weight: f32,
}

pub trait ProgressivePass {
    /// Full-resolution target size in pixels.
    fn viewport(&self) -> (u32, u32);

    fn render_tile(&mut self, request: TileRequest);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Idle,
    Resolution { factor: u32 },
    Dithering { sample_index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerUpdateReason {
    ResolutionRefined,
    FullResolutionFlushed,
    DitheringFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecision {
    pub frame_sequence_id: u64,
    pub phase: RenderPhase,
    pub tiles_rendered: u32,
    pub frame_complete: bool,
    pub is_finished: bool,
    pub update_reason: Option<SchedulerUpdateReason>,
}

#[derive(Debug, Clone)]
pub struct ProgressiveScheduler {
    config: ProgressiveSchedulerConfig,
    resolution: ResolutionComputer,
    dithering: DitheringRenderer,
    tiler: Option<TiledRenderer>,
    viewport: Option<(u32, u32)>,
    frame_sequence_id: u64,
}

impl ProgressiveScheduler {
    pub fn new(config: ProgressiveSchedulerConfig) -> Self {
        assert!(config.max_tile_edge > 0, "max_tile_edge must be positive");
        Self {
            config,
            resolution: ResolutionComputer::new(config.performance_mode),
            dithering: DitheringRenderer::new(),
            tiler: None,
            viewport: None,
            frame_sequence_id: 0,
        }
    }

    pub fn config(&self) -> ProgressiveSchedulerConfig {
        self.config
    }

    pub fn set_performance_mode(&mut self, mode: PerformanceMode) {
        if self.config.performance_mode == mode {
            return;
        }
        self.config.performance_mode = mode;
        self.resolution.set_performance_mode(mode);
        self.invalidate();
    }

    /// Restarts refinement from the coarsest factor.
    pub fn invalidate(&mut self) {
        self.resolution.reset();
        self.dithering.reset();
        self.tiler = None;
        log::debug!("progressive render invalidated");
    }

    pub fn factor(&self) -> u32 {
        self.resolution.factor()
    }

    pub fn is_full_resolution_flushed(&self) -> bool {
        self.resolution.is_full_resolution_flushed()
    }

    pub fn is_finished(&self) -> bool {
        self.dithering.is_finished()
    }

    pub fn tick(&mut self, pass: &mut dyn ProgressivePass) -> FrameDecision {
        self.frame_sequence_id += 1;
        let viewport = pass.viewport();
        if self.viewport != Some(viewport) {
            self.viewport = Some(viewport);
            self.invalidate();
        }
        if viewport.0 == 0 || viewport.1 == 0 || self.dithering.is_finished() {
            return self.idle_decision();
        }
        if self.resolution.is_full_resolution_flushed() {
            self.tick_dithering(pass, viewport)
        } else {
            self.tick_resolution(pass, viewport)
        }
    }

    fn tick_resolution(&mut self, pass: &mut dyn ProgressivePass, viewport: (u32, u32)) -> FrameDecision {
        let factor = self.resolution.factor();
        let max_tile_edge = self.config.max_tile_edge;
        let tiler = self
            .tiler
            .get_or_insert_with(|| TiledRenderer::new(viewport, factor, max_tile_edge));
        let Some(tile) = tiler.next_tile() else {
            panic!("tiled renderer exhausted before reporting frame completion");
        };
        pass.render_tile(TileRequest {
            tile,
            factor,
            jitter: dither_offset(0),
            blend_weight: 1.0,
        });
        let frame_complete = tiler.is_frame_complete();
        let mut update_reason = None;
        if frame_complete {
            self.tiler = None;
            self.resolution.on_frame_complete();
            update_reason = Some(if self.resolution.is_full_resolution_flushed() {
                SchedulerUpdateReason::FullResolutionFlushed
            } else {
                SchedulerUpdateReason::ResolutionRefined
            });
        }
        FrameDecision {
            frame_sequence_id: self.frame_sequence_id,
            phase: RenderPhase::Resolution { factor },
            tiles_rendered: 1,
            frame_complete,
            is_finished: false,
            update_reason,
        }
    }

    fn tick_dithering(&mut self, pass: &mut dyn ProgressivePass, viewport: (u32, u32)) -> FrameDecision {
        let Some(sample_index) = self.dithering.next_sample() else {
            return self.idle_decision();
        };
        let jitter = dither_offset(sample_index as usize);
        let blend_weight = 1.0 / (sample_index as f32 + 1.0);
        let mut tiler = TiledRenderer::new(viewport, 1, self.config.max_tile_edge);
        let mut tiles_rendered = 0;
        while let Some(tile) = tiler.next_tile() {
            pass.render_tile(TileRequest {
                tile,
                factor: 1,
                jitter,
                blend_weight,
            });
            tiles_rendered += 1;
        }
        let is_finished = self.dithering.is_finished();
        FrameDecision {
            frame_sequence_id: self.frame_sequence_id,
            phase: RenderPhase::Dithering { sample_index },
            tiles_rendered,
            frame_complete: true,
            is_finished,
            update_reason: is_finished.then_some(SchedulerUpdateReason::DitheringFinished),
        }
    }

    fn idle_decision(&self) -> FrameDecision {
        FrameDecision {
            frame_sequence_id: self.frame_sequence_id,
            phase: RenderPhase::Idle,
            tiles_rendered: 0,
            frame_complete: false,
            is_finished: self.dithering.is_finished(),
            update_reason: None,
        }
    }
}

impl Default for ProgressiveScheduler {
    fn default() -> Self {
        Self::new(ProgressiveSchedulerConfig::default())
    }
}

/// Running average of full-resolution RGBA frames.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAccumulator {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl FrameAccumulator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0.0; 4]; width as usize * height as usize],
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if (self.width, self.height) != (width, height) {
            *self = Self::new(width, height);
        }
    }

    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Blends `value` into the full-resolution block covered by downsampled
    /// texel `(x, y)` at `factor`.
    pub fn blend_block(&mut self, x: u32, y: u32, factor: u32, value: [f32; 4], weight: f32) {
        let x_end = ((x + 1) * factor).min(self.width);
        let y_end = ((y + 1) * factor).min(self.height);
        for py in (y * factor).min(self.height)..y_end {
            for px in (x * factor).min(self.width)..x_end {
                let pixel = &mut self.pixels[py as usize * self.width as usize + px as usize];
                for channel in 0..4 {
                    pixel[channel] += (value[channel] - pixel[channel]) * weight;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
