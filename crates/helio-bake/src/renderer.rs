//! The seam between the scheduler and the code that issues draw calls.

use crate::context::BakeTargets;
use crate::light_cache::LightCache;
use crate::settings::BakeSettings;
use crate::Result;
use glam::Vec3;
use helio_core::{GpuDevice, Scene};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewContent {
    /// Only the world background.
    WorldOnly,
    /// The whole scene, probes and world.
    Scene,
}

/// Camera placement for one six-face render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeView {
    pub position: Vec3,
    pub clip_start: f32,
    pub clip_end: f32,
    pub content: ViewContent,
}

impl ProbeView {
    pub fn world() -> Self {
        Self {
            position: Vec3::ZERO,
            clip_start: 0.1,
            clip_end: 100.0,
            content: ViewContent::WorldOnly,
        }
    }
}

/// What a renderer sees while executing one unit. The rendering context is
/// current and `cache` is locked for reading.
pub struct UnitContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub scene: &'a Scene,
    pub settings: &'a BakeSettings,
    pub targets: &'a BakeTargets,
    pub cache: &'a LightCache,
}

/// Renders probe views and filters them into the cache atlases.
///
/// Renders land in `targets`; filters read `targets` and write the atlas
/// region they are given. While a grid sample renders, `cache.grid_atlas()`
/// holds the previous bounce so indirect light can be read from it.
pub trait ProbeRenderer {
    fn render_cube(&mut self, unit: &UnitContext<'_>, view: &ProbeView) -> Result<()>;

    /// Prefiltered specular into cube atlas `layer`, every mip.
    fn filter_glossy(&mut self, unit: &UnitContext<'_>, layer: u32, intensity: f32) -> Result<()>;

    /// Irradiance into grid atlas sample `sample_offset`.
    fn filter_diffuse(
        &mut self,
        unit: &UnitContext<'_>,
        sample_offset: u32,
        intensity: f32,
    ) -> Result<()>;

    /// Depth moments into the visibility tile of `sample_offset`.
    fn filter_visibility(
        &mut self,
        unit: &UnitContext<'_>,
        sample_offset: u32,
        visibility_range: f32,
        blur: f32,
    ) -> Result<()>;
}
