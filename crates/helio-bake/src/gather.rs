//! Collects the probes of an evaluated scene into cache records.
//!
//! Two passes over the scene: [`count_probes`] sizes everything, then
//! [`gather_probes`] fills arrays allocated once at their final length.

use crate::light_cache::{CubeRecord, GridRecord};
use crate::sample_order::cell_count;
use helio_core::{EntityId, LightProbe, LightProbeKind, Scene, Transform};

/// Probe totals of one scene. Both counts include the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCounts {
    pub grid_count: u32,
    pub cube_count: u32,
    /// Irradiance samples across all grids, the world's single sample included.
    pub total_irradiance_samples: u64,
}

/// What a cache record was built from.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeSource {
    World,
    Object {
        entity: EntityId,
        transform: Transform,
        probe: LightProbe,
    },
}

impl ProbeSource {
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            ProbeSource::World => None,
            ProbeSource::Object { entity, .. } => Some(*entity),
        }
    }

    /// Clip range used when rendering from this probe.
    pub fn clip_range(&self) -> (f32, f32) {
        match self {
            ProbeSource::World => (0.1, 100.0),
            ProbeSource::Object { probe, .. } => (probe.clip_start, probe.clip_end),
        }
    }

    pub fn intensity(&self) -> f32 {
        match self {
            ProbeSource::World => 1.0,
            ProbeSource::Object { probe, .. } => probe.intensity,
        }
    }
}

/// Probe records of one bake, indexed like the cache records.
#[derive(Debug, Clone)]
pub struct GatheredProbes {
    pub counts: ProbeCounts,
    pub grid_records: Vec<GridRecord>,
    pub cube_records: Vec<CubeRecord>,
    pub grid_sources: Vec<ProbeSource>,
    pub cube_sources: Vec<ProbeSource>,
}

impl GatheredProbes {
    /// Irradiance samples rendered per bounce, the world excluded.
    pub fn grid_samples_per_bounce(&self) -> u32 {
        u32::try_from(self.counts.total_irradiance_samples - 1).unwrap_or(u32::MAX)
    }
}

fn grid_resolution(probe: &LightProbe) -> [u32; 3] {
    probe.grid_resolution.map(|r| r.max(1))
}

fn for_each_baked_probe(scene: &Scene, mut f: impl FnMut(EntityId, &Transform, &LightProbe)) {
    scene.for_each_render_entity(|entity| {
        if let Some(probe) = &entity.light_probe {
            if probe.kind != LightProbeKind::Planar {
                f(entity.id, &entity.transform, probe);
            }
        }
    });
}

pub fn count_probes(scene: &Scene) -> ProbeCounts {
    let mut counts = ProbeCounts {
        grid_count: 1,
        cube_count: 1,
        total_irradiance_samples: 1,
    };
    for_each_baked_probe(scene, |_, _, probe| match probe.kind {
        LightProbeKind::Grid => {
            counts.grid_count += 1;
            counts.total_irradiance_samples += u64::from(cell_count(grid_resolution(probe)));
        }
        LightProbeKind::Cube => counts.cube_count += 1,
        LightProbeKind::Planar => {}
    });
    counts
}

/// Fill records for the probes `counts` was computed from. The scene must
/// not change between the two passes; an evaluated copy guarantees that.
/// Sample offsets are only meaningful once `counts` has been accepted by
/// [`AtlasRequirements::compute`](crate::AtlasRequirements::compute).
pub fn gather_probes(scene: &Scene, counts: ProbeCounts) -> GatheredProbes {
    let grids = counts.grid_count as usize;
    let cubes = counts.cube_count as usize;
    let mut gathered = GatheredProbes {
        counts,
        grid_records: Vec::with_capacity(grids),
        cube_records: Vec::with_capacity(cubes),
        grid_sources: Vec::with_capacity(grids),
        cube_sources: Vec::with_capacity(cubes),
    };
    gathered.grid_records.push(GridRecord::world());
    gathered.grid_sources.push(ProbeSource::World);
    gathered.cube_records.push(CubeRecord::world());
    gathered.cube_sources.push(ProbeSource::World);

    // The world owns sample 0.
    let mut offset: u32 = 1;
    for_each_baked_probe(scene, |entity, transform, probe| {
        let source = ProbeSource::Object {
            entity,
            transform: *transform,
            probe: probe.clone(),
        };
        match probe.kind {
            LightProbeKind::Grid => {
                let resolution = grid_resolution(probe);
                gathered
                    .grid_records
                    .push(GridRecord::from_probe(transform, probe, resolution, offset));
                gathered.grid_sources.push(source);
                offset = offset.saturating_add(cell_count(resolution));
            }
            LightProbeKind::Cube => {
                gathered.cube_records.push(CubeRecord::from_probe(transform, probe));
                gathered.cube_sources.push(source);
            }
            LightProbeKind::Planar => {}
        }
    });

    debug_assert_eq!(gathered.grid_records.len(), grids);
    debug_assert_eq!(gathered.cube_records.len(), cubes);
    debug_assert_eq!(
        u64::from(offset),
        counts.total_irradiance_samples.min(u64::from(u32::MAX))
    );
    log::debug!(
        "Gathered {} grid probes ({} samples) and {} cube probes",
        grids - 1,
        offset - 1,
        cubes - 1
    );
    gathered
}
