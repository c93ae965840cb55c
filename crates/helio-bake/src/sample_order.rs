//! Progressive (coarse to fine) traversal of the cells of an irradiance grid.
//!
//! Cells are visited by decreasing power-of-two stride. At stride `s` every
//! cell whose coordinates are all multiples of `s` but not all multiples of
//! `2s` is emitted, in row-major order with z varying fastest. The first cell
//! of the coarsest level is always emitted first. Whatever prefix of the
//! sequence has been baked covers the grid uniformly at some stride, so the
//! renderer can interpolate a usable approximation mid-bake.

use glam::UVec3;

/// One step of the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSample {
    /// Logical position in the traversal.
    pub index: u32,
    /// Cell coordinate inside the grid.
    pub cell: UVec3,
    /// Linear cell index, `x * ry * rz + y * rz + z`.
    pub cell_index: u32,
    /// Stride of the level this cell belongs to.
    pub stride: u32,
}

impl GridSample {
    /// Mip bias the renderer should use while this level is the finest one baked.
    pub fn level_bias(&self) -> f32 {
        (self.stride << 1) as f32
    }
}

/// Coarsest level of a grid: `floor(log2(max(rx, ry, rz)))`.
pub fn max_level(resolution: [u32; 3]) -> u32 {
    let largest = resolution.iter().copied().max().unwrap_or(1).max(1);
    31 - largest.leading_zeros()
}

/// Cells of a grid, saturating at `u32::MAX` for resolutions no atlas can hold.
pub fn cell_count(resolution: [u32; 3]) -> u32 {
    resolution
        .iter()
        .try_fold(1u32, |count, &r| count.checked_mul(r))
        .unwrap_or(u32::MAX)
}

/// Coordinate of the cell at `cell_index` (z fastest, then y, then x).
pub fn cell_coords(resolution: [u32; 3], cell_index: u32) -> UVec3 {
    let [_, ry, rz] = resolution;
    UVec3::new(cell_index / (rz * ry), (cell_index / rz) % ry, cell_index % rz)
}

pub fn cell_index(resolution: [u32; 3], cell: UVec3) -> u32 {
    let [_, ry, rz] = resolution;
    cell.x * ry * rz + cell.y * rz + cell.z
}

/// Streaming traversal. Costs amortized O(1) per emitted sample.
#[derive(Debug, Clone)]
pub struct SampleOrder {
    resolution: [u32; 3],
    max_level: u32,
    level: u32,
    cursor: [u32; 3],
    emitted: u32,
    total: u32,
}

impl SampleOrder {
    pub fn new(resolution: [u32; 3]) -> Self {
        let max_level = max_level(resolution);
        Self {
            resolution,
            max_level,
            level: max_level,
            cursor: [0; 3],
            emitted: 0,
            total: cell_count(resolution),
        }
    }

    pub fn resolution(&self) -> [u32; 3] {
        self.resolution
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Step the lattice cursor of the current level, z fastest.
    fn advance(&mut self, stride: u32) {
        let [rx, ry, rz] = self.resolution;
        let [x, y, z] = &mut self.cursor;
        *z += stride;
        if *z < rz {
            return;
        }
        *z = 0;
        *y += stride;
        if *y < ry {
            return;
        }
        *y = 0;
        *x += stride;
        if *x < rx {
            return;
        }
        *x = 0;
        // Wraps to u32::MAX after level 0; `emitted == total` stops first.
        self.level = self.level.wrapping_sub(1);
    }
}

impl Iterator for SampleOrder {
    type Item = GridSample;

    fn next(&mut self) -> Option<GridSample> {
        while self.emitted < self.total {
            let stride = 1u32 << self.level;
            let coarser = stride << 1;
            let [x, y, z] = self.cursor;
            let level = self.level;
            self.advance(stride);

            let on_coarser = x % coarser == 0 && y % coarser == 0 && z % coarser == 0;
            let is_root = level == self.max_level && x == 0 && y == 0 && z == 0;
            if on_coarser && !is_root {
                continue;
            }

            let cell = UVec3::new(x, y, z);
            let sample = GridSample {
                index: self.emitted,
                cell,
                cell_index: cell_index(self.resolution, cell),
                stride,
            };
            self.emitted += 1;
            return Some(sample);
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.emitted) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SampleOrder {}

/// Sample at logical position `index`, or `None` past the end.
pub fn grid_sample(resolution: [u32; 3], index: u32) -> Option<GridSample> {
    SampleOrder::new(resolution).nth(index as usize)
}
