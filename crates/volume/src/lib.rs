//! GPU-resident volumetric images.
//!
//! A volume is packed slice by slice into a 2-D atlas. The CPU keeps one copy
//! of the atlas and every rendering context keeps another; per-context dirty
//! flags decide when data has to move between them.

use std::fmt;

use model::LayoutError;
use render_protocol::ContextKey;

mod adapter;
mod context;
mod context_table;
mod image;
pub mod kernels;
mod snapshot;
mod software;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use adapter::SliceSource;
pub use context::{ContextSet, RenderContext, TargetDescriptor, UPLOAD_ALIGNMENT};
pub use image::{VolumeStats, VolumetricImage};
pub use kernels::{GrowStep, MASK_INSIDE};
pub use snapshot::{SNAPSHOT_SCHEMA_VERSION, VolumeSnapshot};
pub use software::{SoftwareContext, SoftwareContextStats};

#[derive(Debug)]
pub enum VolumeError {
    Layout(LayoutError),
    LengthMismatch { expected: usize, actual: usize },
    ComponentOutOfRange { component: u8, components: u8 },
    /// A target write did not supply a source target for an attached context.
    MissingSourceTarget { context: ContextKey },
    SourceTargetMismatch { context: ContextKey },
    UnsupportedSnapshot { schema_version: u16 },
    Json(serde_json::Error),
}

impl fmt::Display for VolumeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeError::Layout(error) => write!(formatter, "{error}"),
            VolumeError::LengthMismatch { expected, actual } => {
                write!(formatter, "expected {expected} bytes, got {actual}")
            }
            VolumeError::ComponentOutOfRange {
                component,
                components,
            } => write!(
                formatter,
                "component {component} out of range for {components}-component voxels"
            ),
            VolumeError::MissingSourceTarget { context } => {
                write!(formatter, "no source target for context {context:?}")
            }
            VolumeError::SourceTargetMismatch { context } => write!(
                formatter,
                "source target on context {context:?} does not match the region shape"
            ),
            VolumeError::UnsupportedSnapshot { schema_version } => {
                write!(formatter, "unsupported volume snapshot (schema {schema_version})")
            }
            VolumeError::Json(error) => write!(formatter, "volume snapshot json: {error}"),
        }
    }
}

impl std::error::Error for VolumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VolumeError::Layout(error) => Some(error),
            VolumeError::Json(error) => Some(error),
            _ => None,
        }
    }
}

impl From<LayoutError> for VolumeError {
    fn from(error: LayoutError) -> Self {
        VolumeError::Layout(error)
    }
}
