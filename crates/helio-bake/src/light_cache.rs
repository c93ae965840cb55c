//! The persistent bake result: probe records, the two atlases and status flags.

use crate::atlas::AtlasRequirements;
use crate::Result;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{UVec3, Vec3};
use helio_core::{GpuDevice, LightProbe, TextureDesc, TextureFormat, TextureId, Transform};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LightCacheFlags: u32 {
        const WORLD_DIRTY = 1 << 0;
        const CUBE_DIRTY  = 1 << 1;
        const GRID_DIRTY  = 1 << 2;
        const BAKING      = 1 << 3;
        const CUBE_READY  = 1 << 4;
        const GRID_READY  = 1 << 5;
        const BAKED       = 1 << 6;

        const DIRTY = Self::WORLD_DIRTY.bits() | Self::CUBE_DIRTY.bits() | Self::GRID_DIRTY.bits();
    }
}

/// GPU-facing data of one reflection probe. Record 0 is the world.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct CubeRecord {
    pub position: [f32; 3],
    pub intensity: f32,
    pub clip_start: f32,
    pub clip_end: f32,
    pub attenuation_scale: f32,
    pub attenuation_bias: f32,
    pub parallax_distance: f32,
    pub _pad: [f32; 3],
}

impl CubeRecord {
    pub fn world() -> Self {
        Self {
            intensity: 1.0,
            ..Zeroable::zeroed()
        }
    }

    /// Influence fades linearly over the last `falloff` fraction of the
    /// influence distance: `attenuation = bias - distance * scale`.
    pub fn from_probe(transform: &Transform, probe: &LightProbe) -> Self {
        let fade = (probe.falloff * probe.distance_influence).max(1e-8);
        let attenuation_scale = 1.0 / fade;
        Self {
            position: transform.position.to_array(),
            intensity: probe.intensity,
            clip_start: probe.clip_start,
            clip_end: probe.clip_end,
            attenuation_scale,
            attenuation_bias: probe.distance_influence * attenuation_scale,
            parallax_distance: probe.distance_parallax,
            _pad: [0.0; 3],
        }
    }
}

/// GPU-facing data of one irradiance grid. Record 0 is the world, a single
/// cell at offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct GridRecord {
    /// World position of cell (0, 0, 0).
    pub corner: [f32; 3],
    /// First sample of this grid in the atlas.
    pub offset: u32,
    pub increment_x: [f32; 3],
    /// Mip bias used while only coarse cells are baked.
    pub level_bias: f32,
    pub increment_y: [f32; 3],
    pub visibility_range: f32,
    pub increment_z: [f32; 3],
    pub visibility_bias: f32,
    pub resolution: [u32; 3],
    pub visibility_bleed: f32,
    pub attenuation_scale: f32,
    pub attenuation_bias: f32,
    pub visibility_blur: f32,
    pub _pad: f32,
}

impl GridRecord {
    pub fn world() -> Self {
        Self {
            resolution: [1; 3],
            level_bias: 1.0,
            visibility_range: 1.0,
            ..Zeroable::zeroed()
        }
    }

    /// Cells sit at the centers of a `resolution` subdivision of the
    /// transformed unit cube.
    pub fn from_probe(
        transform: &Transform,
        probe: &LightProbe,
        resolution: [u32; 3],
        offset: u32,
    ) -> Self {
        let matrix = transform.to_matrix();
        let cell_dim = Vec3::splat(2.0) / UVec3::from_array(resolution).as_vec3();
        let half_cell = cell_dim * 0.5;

        let corner = matrix.transform_point3(Vec3::splat(-1.0) + half_cell);
        let increment = |axis: Vec3| {
            matrix.transform_point3(axis * cell_dim + half_cell - Vec3::ONE) - corner
        };
        let increment_x = increment(Vec3::X);
        let increment_y = increment(Vec3::Y);
        let increment_z = increment(Vec3::Z);

        let longest = increment_x
            .length_squared()
            .max(increment_y.length_squared())
            .max(increment_z.length_squared());

        let fac = 1.0 / probe.falloff.max(1e-8);
        Self {
            corner: corner.to_array(),
            offset,
            increment_x: increment_x.to_array(),
            level_bias: 1.0,
            increment_y: increment_y.to_array(),
            visibility_range: 1.0 + longest.sqrt(),
            increment_z: increment_z.to_array(),
            visibility_bias: 0.05 * probe.visibility_bias,
            resolution,
            visibility_bleed: probe.visibility_bleed_bias,
            attenuation_scale: fac / probe.distance_influence.max(1e-8),
            attenuation_bias: fac,
            visibility_blur: probe.visibility_blur,
            _pad: 0.0,
        }
    }

    /// World position of `cell`.
    pub fn sample_position(&self, cell: UVec3) -> Vec3 {
        let cell = cell.as_vec3();
        Vec3::from_array(self.corner)
            + Vec3::from_array(self.increment_x) * cell.x
            + Vec3::from_array(self.increment_y) * cell.y
            + Vec3::from_array(self.increment_z) * cell.z
    }
}

/// Serializable snapshot of a cache, without the GPU-resident atlases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightCacheInfo {
    pub flags: LightCacheFlags,
    pub requirements: AtlasRequirements,
    pub cube_ready_count: u32,
    pub cube_records: Vec<CubeRecord>,
    pub grid_records: Vec<GridRecord>,
}

impl LightCacheInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub struct LightCache {
    device: Arc<dyn GpuDevice>,
    requirements: AtlasRequirements,
    cube_records: Vec<CubeRecord>,
    grid_records: Vec<GridRecord>,
    cube_atlas: TextureId,
    grid_atlas: TextureId,
    flags: LightCacheFlags,
    cube_ready_count: u32,
}

impl LightCache {
    /// Allocate both atlases under the rendering context current on this
    /// thread. Every channel starts dirty.
    pub fn create(device: Arc<dyn GpuDevice>, requirements: &AtlasRequirements) -> Result<Self> {
        let cube = requirements.cube;
        let cube_atlas = device.create_texture(
            &TextureDesc::array_2d(
                "light_cache_cube_atlas",
                cube.resolution,
                cube.resolution,
                cube.layers,
                TextureFormat::Rg11b10Float,
            )
            .with_mips(cube.mip_level_count),
        )?;
        let grid_desc = Self::grid_atlas_desc(requirements, "light_cache_grid_atlas");
        let grid_atlas = match device.create_texture(&grid_desc) {
            Ok(texture) => texture,
            Err(e) => {
                device.destroy_texture(cube_atlas);
                return Err(e.into());
            }
        };

        let mut cube_records = vec![CubeRecord::zeroed(); requirements.cube_count.max(1) as usize];
        cube_records[0] = CubeRecord::world();
        let mut grid_records = vec![GridRecord::zeroed(); requirements.grid_count.max(1) as usize];
        grid_records[0] = GridRecord::world();

        log::debug!(
            "Created light cache: {} grids, {} cubes, grid atlas {}x{}x{}, cube atlas {}px x{}",
            requirements.grid_count,
            requirements.cube_count,
            requirements.grid.width,
            requirements.grid.height,
            requirements.grid.layers,
            cube.resolution,
            cube.layers
        );

        Ok(Self {
            device,
            requirements: *requirements,
            cube_records,
            grid_records,
            cube_atlas,
            grid_atlas,
            flags: LightCacheFlags::DIRTY,
            cube_ready_count: 0,
        })
    }

    pub fn grid_atlas_desc(requirements: &AtlasRequirements, label: &str) -> TextureDesc {
        let grid = requirements.grid;
        TextureDesc::array_2d(
            label,
            grid.width,
            grid.height,
            grid.layers,
            TextureFormat::Rgba8Unorm,
        )
    }

    /// Whether this cache can hold a bake with `requirements` as is.
    pub fn validate(&self, requirements: &AtlasRequirements) -> bool {
        let own = &self.requirements;
        own.grid_count == requirements.grid_count
            && own.cube_count == requirements.cube_count
            && own.visibility_resolution == requirements.visibility_resolution
            && own.grid == requirements.grid
            && own.cube == requirements.cube
    }

    pub fn requirements(&self) -> &AtlasRequirements {
        &self.requirements
    }

    pub fn flags(&self) -> LightCacheFlags {
        self.flags
    }

    pub fn cube_records(&self) -> &[CubeRecord] {
        &self.cube_records
    }

    pub fn grid_records(&self) -> &[GridRecord] {
        &self.grid_records
    }

    pub fn cube_atlas(&self) -> TextureId {
        self.cube_atlas
    }

    pub fn grid_atlas(&self) -> TextureId {
        self.grid_atlas
    }

    /// Cube layers, the world included, that hold a finished reflection.
    pub fn cube_ready_count(&self) -> u32 {
        self.cube_ready_count
    }

    /// Mark channels as needing a rebake. Only dirty bits are accepted.
    pub fn tag_dirty(&mut self, channels: LightCacheFlags) {
        self.flags.insert(channels & LightCacheFlags::DIRTY);
        if self.flags.intersects(LightCacheFlags::DIRTY) {
            self.flags.remove(LightCacheFlags::BAKED);
        }
    }

    /// Replace the records with freshly gathered ones. Counts must match the
    /// cache layout.
    pub(crate) fn set_records(&mut self, cube_records: &[CubeRecord], grid_records: &[GridRecord]) {
        debug_assert_eq!(cube_records.len(), self.cube_records.len());
        debug_assert_eq!(grid_records.len(), self.grid_records.len());
        self.cube_records.copy_from_slice(cube_records);
        self.grid_records.copy_from_slice(grid_records);
    }

    pub(crate) fn set_level_bias(&mut self, grid: usize, level_bias: f32) {
        self.grid_records[grid].level_bias = level_bias;
    }

    pub(crate) fn set_cube_ready_count(&mut self, count: u32) {
        self.cube_ready_count = count.min(self.cube_records.len() as u32);
    }

    /// Exchange the grid atlas with `other`, used to read the previous
    /// bounce while rendering the current one.
    pub(crate) fn swap_grid_atlas(&mut self, other: &mut TextureId) {
        std::mem::swap(&mut self.grid_atlas, other);
    }

    pub(crate) fn begin_bake(&mut self, rebake: LightCacheFlags) {
        self.tag_dirty(rebake);
        if rebake.contains(LightCacheFlags::CUBE_DIRTY) {
            self.cube_ready_count = self.cube_ready_count.min(1);
        }
        self.flags.insert(LightCacheFlags::BAKING);
        self.flags.remove(LightCacheFlags::BAKED);
    }

    pub(crate) fn finish_world(&mut self) {
        self.flags.remove(LightCacheFlags::WORLD_DIRTY);
        self.flags.insert(LightCacheFlags::CUBE_READY | LightCacheFlags::GRID_READY);
        self.cube_ready_count = self.cube_ready_count.max(1);
    }

    pub(crate) fn finish_grid(&mut self) {
        self.flags.remove(LightCacheFlags::GRID_DIRTY);
        self.flags.insert(LightCacheFlags::GRID_READY);
    }

    /// Cube layers are only usable together with the world layer.
    pub(crate) fn finish_cubes(&mut self) {
        self.flags.remove(LightCacheFlags::CUBE_DIRTY);
        if !self.flags.contains(LightCacheFlags::WORLD_DIRTY) {
            self.flags.insert(LightCacheFlags::CUBE_READY);
        }
    }

    pub(crate) fn finish_bake(&mut self) {
        self.flags.remove(LightCacheFlags::BAKING);
        if !self.flags.intersects(LightCacheFlags::DIRTY) {
            self.flags.insert(LightCacheFlags::BAKED);
        }
    }

    /// Stop baking and keep whatever the finished phases produced.
    pub(crate) fn abort_bake(&mut self) {
        self.flags.remove(LightCacheFlags::BAKING);
    }

    pub fn info(&self) -> LightCacheInfo {
        LightCacheInfo {
            flags: self.flags,
            requirements: self.requirements,
            cube_ready_count: self.cube_ready_count,
            cube_records: self.cube_records.clone(),
            grid_records: self.grid_records.clone(),
        }
    }
}

/// The atlases are destroyed right away when a context is current on the
/// dropping thread. Otherwise they are queued and freed the next time a bake
/// context is entered.
impl Drop for LightCache {
    fn drop(&mut self) {
        if self.device.current_context().is_some() {
            log::debug!("Freeing light cache atlases on '{}'", self.device.name());
            self.device.destroy_texture(self.cube_atlas);
            self.device.destroy_texture(self.grid_atlas);
        } else {
            log::debug!("Deferring light cache atlases on '{}'", self.device.name());
            self.device.destroy_texture_deferred(self.cube_atlas);
            self.device.destroy_texture_deferred(self.grid_atlas);
        }
    }
}

/// Counted reference to a [`LightCache`].
///
/// References are handed out explicitly with [`acquire`](Self::acquire) and
/// returned with [`release`](Self::release); the cache and its GPU resources
/// are freed when the last reference goes.
pub struct LightCacheRef(Arc<RwLock<LightCache>>);

impl LightCacheRef {
    pub fn new(cache: LightCache) -> Self {
        Self(Arc::new(RwLock::new(cache)))
    }

    pub fn acquire(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    /// Drop this reference. Returns true if it was the last one and the cache
    /// was freed.
    pub fn release(self) -> bool {
        match Arc::into_inner(self.0) {
            Some(cache) => {
                drop(cache);
                true
            }
            None => false,
        }
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, LightCache> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, LightCache> {
        self.0.write()
    }

    pub fn ptr_eq(&self, other: &LightCacheRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for LightCacheRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightCacheRef")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Scene-attached cache pointer shared by the original scene and its
/// evaluated copies. Swapping the cache here is seen by every holder.
#[derive(Clone, Default)]
pub struct LightCacheSlot(Arc<RwLock<Option<LightCacheRef>>>);

impl LightCacheSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new reference to the current cache.
    pub fn get(&self) -> Option<LightCacheRef> {
        self.0.read().as_ref().map(LightCacheRef::acquire)
    }

    /// Install `cache`, returning the reference previously held by the slot.
    pub fn replace(&self, cache: LightCacheRef) -> Option<LightCacheRef> {
        self.0.write().replace(cache)
    }

    pub fn take(&self) -> Option<LightCacheRef> {
        self.0.write().take()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_none()
    }
}
