//! wgpu rendering context. Targets are storage buffers holding the same byte
//! image as the software targets, so uploads and read-backs are plain copies.

use std::fmt;
use std::sync::mpsc;

use model::{AtlasLayout, AtlasRegion, ViewPlane};
use render_protocol::{MergeParams, StrokeGeometry, TargetKey};
use slotmap::SlotMap;
use wgpu::util::DeviceExt;

use crate::context::{RenderContext, TargetDescriptor};
use crate::kernels::GrowStep;

pub(crate) const EXTRACT_REGION_WGSL: &str = concat!(
    include_str!("common.wgsl"),
    include_str!("extract_region.wgsl")
);
pub(crate) const MERGE_REGION_WGSL: &str = concat!(
    include_str!("common.wgsl"),
    include_str!("merge_region.wgsl")
);
pub(crate) const GROW_REGION_WGSL: &str = concat!(
    include_str!("common.wgsl"),
    include_str!("grow_region.wgsl")
);
pub(crate) const STAMP_GEOMETRY_WGSL: &str = concat!(
    include_str!("common.wgsl"),
    include_str!("stamp_geometry.wgsl")
);

const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;
const SHAPE_CIRCLE: u32 = 0;
const SHAPE_POLYGON: u32 = 1;

#[derive(Debug)]
pub enum GpuInitError {
    NoAdapter(String),
    RequestDevice(String),
}

impl fmt::Display for GpuInitError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuInitError::NoAdapter(message) => write!(formatter, "no wgpu adapter: {message}"),
            GpuInitError::RequestDevice(message) => {
                write!(formatter, "wgpu device request failed: {message}")
            }
        }
    }
}

impl std::error::Error for GpuInitError {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct PassParamsGpu {
    atlas_width: u32,
    atlas_height: u32,
    voxel_x: u32,
    voxel_y: u32,
    voxel_z: u32,
    grid_cols: u32,
    components: u32,
    region_kind: u32,
    plane: u32,
    slice_index: u32,
    region_width: u32,
    region_height: u32,
    word_count: u32,
    merge_function: u32,
    has_threshold: u32,
    threshold: u32,
    weight: f32,
    seed_value: u32,
    grow_threshold: u32,
    shape_words: u32,
    target_width: u32,
    target_height: u32,
    word_offset: u32,
    _pad1: u32,
}

// Uniform buffers are laid out in 16-byte rows.
static_assertions::const_assert_eq!(std::mem::size_of::<PassParamsGpu>() % 16, 0);

impl PassParamsGpu {
    fn for_layout(layout: &AtlasLayout, word_count: u32) -> Self {
        let voxel_count = layout.voxel_count();
        Self {
            atlas_width: layout.atlas_width(),
            atlas_height: layout.atlas_height(),
            voxel_x: voxel_count.x,
            voxel_y: voxel_count.y,
            voxel_z: voxel_count.z,
            grid_cols: layout.grid().x,
            components: u32::from(layout.components()),
            word_count,
            weight: 1.0,
            ..Self::default()
        }
    }

    fn with_region(mut self, layout: &AtlasLayout, region: AtlasRegion) -> Self {
        let (width, height) = region.source_dims(layout);
        self.region_width = width;
        self.region_height = height;
        match region {
            AtlasRegion::Slice { plane, index } => {
                self.region_kind = 0;
                self.plane = plane.code();
                self.slice_index = index;
            }
            AtlasRegion::Volume => self.region_kind = 1,
        }
        self
    }
}

struct GpuTarget {
    descriptor: TargetDescriptor,
    buffer: wgpu::Buffer,
    word_count: u32,
}

struct PassPipelines {
    extract_region: wgpu::ComputePipeline,
    merge_region: wgpu::ComputePipeline,
    grow_region: wgpu::ComputePipeline,
    stamp_geometry: wgpu::ComputePipeline,
}

pub struct WgpuContext {
    label: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: PassPipelines,
    /// Bound wherever a pass leaves a read-only slot unused.
    placeholder: wgpu::Buffer,
    targets: SlotMap<TargetKey, GpuTarget>,
}

impl WgpuContext {
    pub fn new(label: impl Into<String>, device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("volume.pass.bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("volume.pass.pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });
        let pipelines = PassPipelines {
            extract_region: create_pass_pipeline(
                &device,
                &pipeline_layout,
                "volume.extract_region",
                EXTRACT_REGION_WGSL,
            ),
            merge_region: create_pass_pipeline(
                &device,
                &pipeline_layout,
                "volume.merge_region",
                MERGE_REGION_WGSL,
            ),
            grow_region: create_pass_pipeline(
                &device,
                &pipeline_layout,
                "volume.grow_region",
                GROW_REGION_WGSL,
            ),
            stamp_geometry: create_pass_pipeline(
                &device,
                &pipeline_layout,
                "volume.stamp_geometry",
                STAMP_GEOMETRY_WGSL,
            ),
        };
        let placeholder = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("volume.placeholder"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        Self {
            label: label.into(),
            device,
            queue,
            bind_group_layout,
            pipelines,
            placeholder,
            targets: SlotMap::with_key(),
        }
    }

    /// Opens a device with no surface, for offscreen viewers and tests.
    pub fn request_headless(label: impl Into<String>) -> Result<Self, GpuInitError> {
        let label = label.into();
        let (device, queue) = pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .map_err(|error| GpuInitError::NoAdapter(error.to_string()))?;
            log::info!("wgpu adapter: {:?}", adapter.get_info());
            let limits = adapter.limits();
            adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("volume.device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    experimental_features: wgpu::ExperimentalFeatures::disabled(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                })
                .await
                .map_err(|error| GpuInitError::RequestDevice(error.to_string()))
        })?;
        Ok(Self::new(label, device, queue))
    }

    fn target(&self, key: TargetKey) -> &GpuTarget {
        self.targets
            .get(key)
            .unwrap_or_else(|| panic!("wgpu context {}: unknown target {key:?}", self.label))
    }

    fn dispatch(
        &self,
        label: &'static str,
        pipeline: &wgpu::ComputePipeline,
        params: PassParamsGpu,
        sources: [&wgpu::Buffer; 2],
        destination: &wgpu::Buffer,
    ) {
        let uniform = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("volume.pass.params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("volume.pass.bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: sources[0].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: sources[1].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: destination.as_entire_binding(),
                },
            ],
        });
        let (groups_x, groups_y) = workgroup_grid(params.word_count - params.word_offset);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl RenderContext for WgpuContext {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_target(&mut self, descriptor: TargetDescriptor) -> TargetKey {
        let word_count = u32::try_from(descriptor.byte_len().div_ceil(4))
            .unwrap_or_else(|_| panic!("target {} exceeds u32 words", descriptor.label));
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(descriptor.label),
            size: u64::from(word_count.max(1)) * 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        self.targets.insert(GpuTarget {
            descriptor,
            buffer,
            word_count,
        })
    }

    fn destroy_target(&mut self, target: TargetKey) {
        if let Some(target) = self.targets.remove(target) {
            target.buffer.destroy();
        }
    }

    fn target_descriptor(&self, target: TargetKey) -> Option<TargetDescriptor> {
        self.targets.get(target).map(|target| target.descriptor)
    }

    fn clear_target(&mut self, target: TargetKey) {
        let target = self.target(target);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("volume.clear_target"),
            });
        encoder.clear_buffer(&target.buffer, 0, None);
        self.queue.submit(Some(encoder.finish()));
    }

    fn upload(&mut self, target: TargetKey, byte_offset: usize, bytes: &[u8]) {
        let target = self.target(target);
        let byte_len = target.descriptor.byte_len();
        let end = byte_offset + bytes.len();
        assert!(
            byte_offset % 4 == 0 && (end % 4 == 0 || end == byte_len),
            "unaligned upload {byte_offset}..{end} into target of {byte_len} bytes"
        );
        assert!(end <= byte_len, "upload overruns target");
        if bytes.len() % 4 == 0 {
            self.queue
                .write_buffer(&target.buffer, byte_offset as u64, bytes);
        } else {
            let mut padded = bytes.to_vec();
            padded.resize(bytes.len().div_ceil(4) * 4, 0);
            self.queue
                .write_buffer(&target.buffer, byte_offset as u64, &padded);
        }
    }

    fn read_pixels(&mut self, target: TargetKey) -> Vec<u8> {
        let target = self.target(target);
        let size = target.buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("volume.read_pixels"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("volume.read_pixels"),
            });
        encoder.copy_buffer_to_buffer(&target.buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        if let Err(error) = self.device.poll(wgpu::PollType::wait_indefinitely()) {
            panic!("wgpu context {}: device poll failed: {error}", self.label);
        }
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => panic!("wgpu context {}: map failed: {error}", self.label),
            Err(error) => panic!("wgpu context {}: map callback dropped: {error}", self.label),
        }
        let mut bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        bytes.truncate(target.descriptor.byte_len());
        bytes
    }

    fn extract_region(
        &mut self,
        atlas: TargetKey,
        layout: &AtlasLayout,
        region: AtlasRegion,
        destination: TargetKey,
    ) {
        let destination = self.target(destination);
        let params = PassParamsGpu::for_layout(layout, destination.word_count)
            .with_region(layout, region);
        self.dispatch(
            "volume.extract_region",
            &self.pipelines.extract_region,
            params,
            [&self.target(atlas).buffer, &self.placeholder],
            &destination.buffer,
        );
    }

    fn merge_region(
        &mut self,
        atlas: TargetKey,
        layout: &AtlasLayout,
        region: AtlasRegion,
        source: TargetKey,
        params: MergeParams,
    ) {
        let atlas = self.target(atlas);
        let mut pass = PassParamsGpu::for_layout(layout, atlas.word_count).with_region(layout, region);
        if let AtlasRegion::Slice {
            plane: ViewPlane::Transverse,
            index,
        } = region
        {
            // Native slices only touch their own grid row.
            let rows = layout.slice_row_byte_range(index);
            pass.word_offset = (rows.start / 4) as u32;
            pass.word_count = rows.end.div_ceil(4) as u32;
        }
        pass.merge_function = params.function.code();
        pass.has_threshold = u32::from(params.threshold.is_some());
        pass.threshold = u32::from(params.threshold.unwrap_or(0));
        pass.weight = params.weight;
        self.dispatch(
            "volume.merge_region",
            &self.pipelines.merge_region,
            pass,
            [&self.target(source).buffer, &self.placeholder],
            &atlas.buffer,
        );
    }

    fn grow_region(
        &mut self,
        source: TargetKey,
        layout: &AtlasLayout,
        step: GrowStep,
        from: TargetKey,
        to: TargetKey,
    ) {
        let to = self.target(to);
        let mut params = PassParamsGpu::for_layout(layout, to.word_count);
        params.seed_value = u32::from(step.seed_value);
        params.grow_threshold = u32::from(step.threshold);
        self.dispatch(
            "volume.grow_region",
            &self.pipelines.grow_region,
            params,
            [&self.target(source).buffer, &self.target(from).buffer],
            &to.buffer,
        );
    }

    fn stamp_geometry(&mut self, target: TargetKey, geometry: &[StrokeGeometry]) {
        let shapes = encode_shapes(geometry);
        if shapes.is_empty() {
            return;
        }
        let target = self.target(target);
        let shape_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("volume.stamp_geometry.shapes"),
                contents: bytemuck::cast_slice(&shapes),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let params = PassParamsGpu {
            components: u32::from(target.descriptor.components),
            word_count: target.word_count,
            shape_words: shapes.len() as u32,
            target_width: target.descriptor.width,
            target_height: target.descriptor.height,
            weight: 1.0,
            ..PassParamsGpu::default()
        };
        self.dispatch(
            "volume.stamp_geometry",
            &self.pipelines.stamp_geometry,
            params,
            [&shape_buffer, &self.placeholder],
            &target.buffer,
        );
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn create_pass_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    label: &'static str,
    source: &'static str,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        module: &module,
        entry_point: Some("main"),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    })
}

/// Splits the invocations for `word_count` words over a 2-D grid so large
/// atlases stay under the per-dimension workgroup limit.
fn workgroup_grid(word_count: u32) -> (u32, u32) {
    let groups = word_count.div_ceil(WORKGROUP_SIZE).max(1);
    let x = groups.min(MAX_WORKGROUPS_PER_DIMENSION);
    (x, groups.div_ceil(x))
}

fn encode_shapes(geometry: &[StrokeGeometry]) -> Vec<u32> {
    let mut words = Vec::new();
    for shape in geometry {
        match shape {
            StrokeGeometry::Circle { circle, value } => {
                words.extend([SHAPE_CIRCLE, u32::from(*value), 0]);
                words.extend([circle.center_x, circle.center_y, circle.radius].map(f32::to_bits));
            }
            StrokeGeometry::Polygon { vertices, value } => {
                words.extend([SHAPE_POLYGON, u32::from(*value), vertices.len() as u32]);
                for vertex in vertices {
                    words.extend(vertex.map(f32::to_bits));
                }
            }
        }
    }
    words
}
