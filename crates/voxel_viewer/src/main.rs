use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use document::{Backend, Document, PerformanceSetting, ViewerConfig};
use frame_scheduler::RenderPhase;
use model::{ViewPlane, VoxelCount};
use render_protocol::Circle;
use volume::SoftwareContext;
use volume::gpu::WgpuContext;

mod scenario;

use scenario::Phantom;

#[derive(Parser)]
#[command(author, version, about = "Segment a synthetic volume headlessly")]
struct Arguments {
    /// JSON viewer configuration.
    #[arg(long, short = 'c', value_parser)]
    config: Option<PathBuf>,
    /// Voxel count as x,y,z.
    #[arg(long, value_delimiter = ',', num_args = 3, default_values_t = [32, 32, 16])]
    voxel_count: Vec<u32>,
    /// Overrides the configured backend.
    #[arg(long, value_enum)]
    backend: Option<BackendArgument>,
    /// Overrides the configured performance mode.
    #[arg(long, value_enum)]
    performance: Option<PerformanceArgument>,
    /// Region-growing threshold.
    #[arg(long, default_value_t = 40)]
    threshold: u8,
    /// Region-growing step setting.
    #[arg(long, default_value_t = 0)]
    steps: i64,
    /// Upper bound on progressive render ticks.
    #[arg(long, default_value_t = 500)]
    max_ticks: u32,
    /// Writes the document snapshot here.
    #[arg(long, short = 'o', value_parser)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum BackendArgument {
    Software,
    Wgpu,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum PerformanceArgument {
    Low,
    High,
}

fn load_config(arguments: &Arguments) -> Result<ViewerConfig> {
    let mut config = match &arguments.config {
        Some(path) => ViewerConfig::load(path)
            .with_context(|| format!("load viewer config {}", path.display()))?,
        None => ViewerConfig::default(),
    };
    if let Some(backend) = arguments.backend {
        config.backend = match backend {
            BackendArgument::Software => Backend::Software,
            BackendArgument::Wgpu => Backend::Wgpu,
        };
    }
    if let Some(performance) = arguments.performance {
        config.performance_mode = match performance {
            PerformanceArgument::Low => PerformanceSetting::Low,
            PerformanceArgument::High => PerformanceSetting::High,
        };
    }
    config.validate().context("validate viewer config")?;
    Ok(config)
}

fn attach_contexts(document: &mut Document, config: &ViewerConfig) {
    for index in 0..config.context_count {
        let label = format!("viewport-{index}");
        match config.backend {
            Backend::Software => {
                document.attach_context(Box::new(SoftwareContext::new(label)));
            }
            Backend::Wgpu => match WgpuContext::request_headless(label.clone()) {
                Ok(context) => {
                    document.attach_context(Box::new(context));
                }
                Err(error) => {
                    log::warn!("{error}; falling back to the software context for {label}");
                    document.attach_context(Box::new(SoftwareContext::new(label)));
                }
            },
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let arguments = Arguments::parse();
    let config = load_config(&arguments)?;
    let [x, y, z] = <[u32; 3]>::try_from(arguments.voxel_count.as_slice())
        .map_err(|_| anyhow::anyhow!("voxel count needs exactly three values"))?;
    let voxel_count = VoxelCount::new(x, y, z);

    let mut document = Document::new(&config);
    attach_contexts(&mut document, &config);

    let phantom = Phantom::new(voxel_count);
    let image = document
        .add_image_layer("phantom", voxel_count, 1, Some(&phantom.voxels()))
        .context("add phantom image")?;
    let annotation = document
        .add_annotation_layer("segmentation")
        .context("add annotation layer")?;

    document.set_seed(phantom.center()).context("place seed")?;
    document
        .do_region_growing(arguments.threshold)
        .context("grow region")?;
    document.set_steps(arguments.steps);
    let flushed = document.flush_to_annotation().context("flush region")?;
    log::info!("region flushed into annotation: {flushed}");

    let center = phantom.center();
    document.set_view_plane(ViewPlane::Transverse);
    document.set_slice_index(center.z);
    document.render_circles(
        false,
        &[Circle::new(center.x as f32 + 0.5, center.y as f32 + 0.5, 2.0)],
    );
    document.lazy_render();
    document.end_stroke().context("erase stroke")?;

    let mut ticks = 0;
    while !document.scheduler().is_finished() && ticks < arguments.max_ticks {
        let decision = document.tick();
        if decision.phase == RenderPhase::Idle {
            break;
        }
        ticks += 1;
    }
    log::info!(
        "progressive render: {ticks} ticks, finished {}",
        document.scheduler().is_finished()
    );

    let labelled = document
        .get_atlas(annotation)
        .context("read annotation")?
        .iter()
        .filter(|value| **value > 0)
        .count();
    let slice = document
        .get_slice(image, center.z, ViewPlane::Transverse)
        .context("read center slice")?;
    log::info!(
        "{labelled} labelled voxels ({} inside the ball), center slice peak {}",
        phantom.inside_count(),
        slice.iter().copied().max().unwrap_or(0)
    );

    if let Some(path) = &arguments.output {
        let json = document.to_json().context("serialize document")?;
        fs::write(path, json).with_context(|| format!("write snapshot {}", path.display()))?;
        log::info!("snapshot written to {}", path.display());
    }
    Ok(())
}
