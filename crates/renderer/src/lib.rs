//! Render-pass drivers that edit or display a volumetric image.

pub mod region_growing;
pub mod tool;
pub mod volume_pass;

pub use region_growing::{
    MAX_REGION_GROWING_STEPS, RegionGrowingRenderer, RegionGrowingState, blip_steps_for,
};
pub use tool::{StrokeTarget, ToolRenderer};
pub use volume_pass::MipVolumePass;
