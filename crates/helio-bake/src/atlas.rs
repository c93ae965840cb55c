//! Sizing of the probe atlases.
//!
//! The grid atlas stores every irradiance sample of every grid in layer 0 and
//! one visibility tile per sample in the remaining layers. Its footprint is
//! bounded by [`MAX_ATLAS_SIZE`] and [`MAX_ATLAS_LAYERS`]; growing sample counts
//! first widen, then heighten the atlas.

use crate::settings::{BakeSettings, MAX_ATLAS_LAYERS, MAX_ATLAS_SIZE, MIN_CUBE_LOD_LEVEL};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridAtlasSize {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl GridAtlasSize {
    /// Samples the atlas can hold with visibility tiles of `tile_size` texels.
    pub fn sample_capacity(&self, tile_size: u32) -> u64 {
        let tiles = (self.width / tile_size) as u64 * (self.height / tile_size) as u64;
        self.layers.saturating_sub(1) as u64 * tiles
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CubeAtlasSize {
    pub resolution: u32,
    pub layers: u32,
    pub mip_level_count: u32,
}

/// Grid atlas extent for `total_samples` irradiance samples.
///
/// `tile_size` is the visibility resolution; `sample_footprint` the texel
/// size of one irradiance sample. The height rounds up so that the atlas
/// always holds every sample.
pub fn grid_atlas_size(
    tile_size: u32,
    sample_footprint: (u32, u32),
    total_samples: u32,
) -> GridAtlasSize {
    let (sample_w, sample_h) = sample_footprint;
    // Irradiance samples sharing the texel area of one visibility tile.
    let samples_per_tile = (tile_size / sample_w.max(1)) * (tile_size / sample_h.max(1));
    // Layer 0 holds irradiance, hence the +1.
    let layers = (samples_per_tile + 1).min(MAX_ATLAS_LAYERS).max(2);

    let texels = total_samples.div_ceil(layers - 1);
    let tiles_per_row = (MAX_ATLAS_SIZE / tile_size).max(1);
    GridAtlasSize {
        width: tile_size * texels.min(tiles_per_row).max(1),
        height: tile_size * texels.div_ceil(tiles_per_row).max(1),
        layers,
    }
}

/// Mip levels kept in the cube atlas; the smallest mip is `2^MIN_CUBE_LOD_LEVEL` texels.
pub fn cube_mip_count(resolution: u32) -> u32 {
    let max_level = 31 - resolution.max(1).leading_zeros();
    max_level.saturating_sub(MIN_CUBE_LOD_LEVEL) + 1
}

pub fn cube_atlas_size(resolution: u32, cube_count: u32) -> CubeAtlasSize {
    CubeAtlasSize {
        resolution,
        layers: cube_count.max(1),
        mip_level_count: cube_mip_count(resolution),
    }
}

/// Everything an existing light cache must match exactly to be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtlasRequirements {
    /// Grid records, the world included.
    pub grid_count: u32,
    /// Cube records, the world included.
    pub cube_count: u32,
    pub total_irradiance_samples: u32,
    pub visibility_resolution: u32,
    pub grid: GridAtlasSize,
    pub cube: CubeAtlasSize,
}

impl AtlasRequirements {
    /// Fails with [`Error::Capacity`] when the samples do not fit in a full
    /// size grid atlas.
    pub fn compute(
        settings: &BakeSettings,
        grid_count: u32,
        cube_count: u32,
        total_irradiance_samples: u64,
    ) -> Result<Self> {
        let capacity = grid_atlas_capacity(settings);
        let samples = match u32::try_from(total_irradiance_samples) {
            Ok(samples) if total_irradiance_samples <= capacity => samples,
            _ => {
                return Err(Error::Capacity {
                    samples: total_irradiance_samples,
                    capacity,
                })
            }
        };
        let grid = grid_atlas_size(
            settings.visibility_resolution,
            settings.irradiance_encoding.sample_footprint(),
            samples,
        );
        debug_assert!(grid.height <= MAX_ATLAS_SIZE);
        Ok(Self {
            grid_count,
            cube_count,
            total_irradiance_samples: samples,
            visibility_resolution: settings.visibility_resolution,
            grid,
            cube: cube_atlas_size(settings.cubemap_resolution, cube_count),
        })
    }

    /// Requirements of a cache holding only the world probe.
    pub fn world_only(settings: &BakeSettings) -> Result<Self> {
        Self::compute(settings, 1, 1, 1)
    }
}

/// Largest number of irradiance samples that fit in a full size atlas.
pub fn grid_atlas_capacity(settings: &BakeSettings) -> u64 {
    let tile = settings.visibility_resolution;
    let full = GridAtlasSize {
        width: MAX_ATLAS_SIZE,
        height: MAX_ATLAS_SIZE,
        layers: grid_atlas_size(tile, settings.irradiance_encoding.sample_footprint(), 1).layers,
    };
    full.sample_capacity(tile)
}
