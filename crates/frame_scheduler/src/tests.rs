use super::*;

#[derive(Default)]
struct RecordingPass {
    viewport: (u32, u32),
    requests: Vec<TileRequest>,
}

impl RecordingPass {
    fn new(width: u32, height: u32) -> Self {
        Self {
            viewport: (width, height),
            requests: Vec::new(),
        }
    }
}

impl ProgressivePass for RecordingPass {
    fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    fn render_tile(&mut self, request: TileRequest) {
        self.requests.push(request);
    }
}

fn resolution_factors(mode: PerformanceMode) -> Vec<u32> {
    let mut scheduler = ProgressiveScheduler::new(ProgressiveSchedulerConfig {
        performance_mode: mode,
        max_tile_edge: 16,
    });
    let mut pass = RecordingPass::new(64, 48);
    let mut factors = Vec::new();
    while !scheduler.is_full_resolution_flushed() {
        let decision = scheduler.tick(&mut pass);
        match decision.phase {
            RenderPhase::Resolution { factor } if decision.frame_complete => factors.push(factor),
            _ => {}
        }
    }
    factors
}

#[test]
fn high_performance_refines_four_two_one() {
    assert_eq!(resolution_factors(PerformanceMode::High), vec![4, 2, 1]);
}

#[test]
fn low_performance_refines_eight_four_two_one() {
    assert_eq!(resolution_factors(PerformanceMode::Low), vec![8, 4, 2, 1]);
}

#[test]
fn resolution_phase_renders_one_tile_per_tick() {
    let mut scheduler = ProgressiveScheduler::new(ProgressiveSchedulerConfig {
        performance_mode: PerformanceMode::High,
        max_tile_edge: 16,
    });
    let mut pass = RecordingPass::new(64, 48);
    let mut ticks = 0;
    while !scheduler.is_full_resolution_flushed() {
        let decision = scheduler.tick(&mut pass);
        assert_eq!(decision.tiles_rendered, 1);
        ticks += 1;
    }
    // factor 4: 16x12 -> 1 tile, factor 2: 32x24 -> 4 tiles, factor 1: 64x48 -> 12 tiles
    assert_eq!(ticks, 1 + 4 + 12);
    assert_eq!(pass.requests.len(), ticks);
    assert!(pass.requests.iter().all(|request| request.blend_weight == 1.0));
}

#[test]
fn dithering_finishes_after_thirty_nine_ticks() {
    let mut scheduler = ProgressiveScheduler::default();
    let mut pass = RecordingPass::new(40, 30);
    while !scheduler.is_full_resolution_flushed() {
        scheduler.tick(&mut pass);
    }
    let mut dithering_ticks = 0;
    loop {
        let decision = scheduler.tick(&mut pass);
        let RenderPhase::Dithering { sample_index } = decision.phase else {
            break;
        };
        dithering_ticks += 1;
        assert_eq!(sample_index, dithering_ticks);
        assert!(decision.frame_complete);
        if decision.is_finished {
            assert_eq!(
                decision.update_reason,
                Some(SchedulerUpdateReason::DitheringFinished)
            );
        }
    }
    assert_eq!(dithering_ticks, 39);
    assert!(scheduler.is_finished());
    assert_eq!(scheduler.tick(&mut pass).phase, RenderPhase::Idle);
}

#[test]
fn dithering_frames_cover_every_tile_with_decreasing_weight() {
    let mut scheduler = ProgressiveScheduler::new(ProgressiveSchedulerConfig {
        performance_mode: PerformanceMode::High,
        max_tile_edge: 16,
    });
    let mut pass = RecordingPass::new(40, 20);
    while !scheduler.is_full_resolution_flushed() {
        scheduler.tick(&mut pass);
    }
    pass.requests.clear();
    let decision = scheduler.tick(&mut pass);
    assert_eq!(decision.tiles_rendered, 3 * 2);
    assert!(pass.requests.iter().all(|request| request.blend_weight == 0.5));
    assert!(pass.requests.iter().all(|request| request.jitter == dither_offset(1)));
}

#[test]
fn invalidate_restarts_from_coarsest_factor() {
    let mut scheduler = ProgressiveScheduler::default();
    let mut pass = RecordingPass::new(32, 32);
    for _ in 0..60 {
        scheduler.tick(&mut pass);
    }
    assert!(scheduler.is_finished());
    scheduler.invalidate();
    let decision = scheduler.tick(&mut pass);
    assert_eq!(decision.phase, RenderPhase::Resolution { factor: 4 });
    assert!(!scheduler.is_finished());
}

#[test]
fn viewport_change_invalidates() {
    let mut scheduler = ProgressiveScheduler::default();
    let mut pass = RecordingPass::new(32, 32);
    scheduler.tick(&mut pass);
    scheduler.tick(&mut pass);
    pass.viewport = (64, 64);
    let decision = scheduler.tick(&mut pass);
    assert_eq!(decision.phase, RenderPhase::Resolution { factor: 4 });
}

#[test]
fn empty_viewport_is_idle() {
    let mut scheduler = ProgressiveScheduler::default();
    let mut pass = RecordingPass::default();
    assert_eq!(scheduler.tick(&mut pass).phase, RenderPhase::Idle);
    assert!(pass.requests.is_empty());
}

#[test]
fn tiles_cover_the_downsampled_target_row_major() {
    let mut tiler = TiledRenderer::new((70, 33), 2, 16);
    assert_eq!(tiler.target_size(), (35, 17));
    let tiles: Vec<TileRect> = std::iter::from_fn(|| tiler.next_tile()).collect();
    assert_eq!(tiles.len(), 3 * 2);
    assert_eq!(
        tiles[2],
        TileRect {
            x: 32,
            y: 0,
            width: 3,
            height: 16
        }
    );
    assert_eq!(tiles[5].height, 1);
    let covered: u32 = tiles.iter().map(|tile| tile.width * tile.height).sum();
    assert_eq!(covered, 35 * 17);
    assert!(tiler.is_frame_complete());
}

#[test]
fn accumulator_averages_blended_samples() {
    let mut accumulator = FrameAccumulator::new(4, 4);
    accumulator.blend_block(0, 0, 2, [1.0, 1.0, 1.0, 1.0], 1.0);
    assert_eq!(accumulator.pixel(1, 1), [1.0; 4]);
    assert_eq!(accumulator.pixel(2, 2), [0.0; 4]);
    accumulator.blend_block(0, 0, 1, [0.0, 0.0, 0.0, 0.0], 0.5);
    assert_eq!(accumulator.pixel(0, 0), [0.5; 4]);
    assert_eq!(accumulator.pixel(1, 0), [1.0; 4]);
}
