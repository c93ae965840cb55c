//! Bake configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on grid atlas layers (one irradiance layer plus visibility layers).
pub const MAX_ATLAS_LAYERS: u32 = 256;
/// Upper bound on grid atlas width and height, in texels.
pub const MAX_ATLAS_SIZE: u32 = 1024;
/// Smallest cube atlas mip kept, as a power of two (2^3 = 8 texels).
pub const MIN_CUBE_LOD_LEVEL: u32 = 3;

/// Storage scheme for irradiance samples. Only the texel footprint of one
/// sample matters to atlas sizing; the encoding is applied by the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrradianceEncoding {
    /// Half-life 2 ambient cube, 3x2 texels rounded to 4x2.
    Hl2,
    /// L2 spherical harmonics, 3x3 texels rounded to 4x4.
    ShL2,
    /// Small octahedral cubemap, 8x8 texels.
    Cubemap,
}

impl IrradianceEncoding {
    /// Texels (width, height) used by one irradiance sample.
    pub fn sample_footprint(self) -> (u32, u32) {
        match self {
            IrradianceEncoding::Hl2 => (4, 2),
            IrradianceEncoding::ShL2 => (4, 4),
            IrradianceEncoding::Cubemap => (8, 8),
        }
    }
}

impl Default for IrradianceEncoding {
    fn default() -> Self {
        IrradianceEncoding::Hl2
    }
}

/// Which parts of the cache a bake recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BakeSubset {
    /// Everything, regardless of what is currently valid.
    All,
    /// Only the channels whose dirty bit is set.
    Dirty,
    /// Only the reflection cubemaps.
    Cubemaps,
}

impl Default for BakeSubset {
    fn default() -> Self {
        BakeSubset::All
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeSettings {
    /// Light bounces computed for irradiance grids.
    pub diffuse_bounces: u32,
    /// Resolution of the six-face render target and of each cube atlas layer.
    pub cubemap_resolution: u32,
    /// Side of one visibility tile in the grid atlas.
    pub visibility_resolution: u32,
    pub visibility_blur: f32,
    /// Clamp applied to glossy samples to limit fireflies. 0 disables it.
    pub glossy_clamp: f32,
    /// Sample count multiplier of the filters.
    pub filter_quality: f32,
    pub irradiance_encoding: IrradianceEncoding,
    pub subset: BakeSubset,
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            diffuse_bounces: 3,
            cubemap_resolution: 512,
            visibility_resolution: 32,
            visibility_blur: 0.2,
            glossy_clamp: 0.0,
            filter_quality: 1.0,
            irradiance_encoding: IrradianceEncoding::Hl2,
            subset: BakeSubset::All,
        }
    }
}

impl BakeSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.cubemap_resolution.is_power_of_two() {
            return Err(Error::config(format!(
                "cubemap resolution {} is not a power of two",
                self.cubemap_resolution
            )));
        }
        if self.cubemap_resolution < (1 << MIN_CUBE_LOD_LEVEL) {
            return Err(Error::config(format!(
                "cubemap resolution {} is below the minimum of {}",
                self.cubemap_resolution,
                1 << MIN_CUBE_LOD_LEVEL
            )));
        }
        if !self.visibility_resolution.is_power_of_two()
            || self.visibility_resolution > MAX_ATLAS_SIZE
        {
            return Err(Error::config(format!(
                "visibility resolution {} must be a power of two no larger than {}",
                self.visibility_resolution, MAX_ATLAS_SIZE
            )));
        }
        let (sample_w, sample_h) = self.irradiance_encoding.sample_footprint();
        if self.visibility_resolution < sample_w || self.visibility_resolution < sample_h {
            return Err(Error::config(format!(
                "visibility resolution {} cannot hold a {}x{} irradiance sample",
                self.visibility_resolution, sample_w, sample_h
            )));
        }
        if self.filter_quality <= 0.0 {
            return Err(Error::config("filter quality must be positive"));
        }
        Ok(())
    }
}
