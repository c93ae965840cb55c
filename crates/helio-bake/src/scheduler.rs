//! The bake state machine: world, then every grid bounce, then cubemaps.
//!
//! Work is cut into units (one six-face render plus its filters). Between
//! units the scheduler checks for cancellation and publishes progress. A
//! phase is marked complete on the cache only once its last unit is done, so
//! the READY flags never cover partially written data.

use crate::context::{BakeContext, BakeTargets};
use crate::gather::GatheredProbes;
use crate::job::{BakeOutcome, JobSignals};
use crate::light_cache::{LightCache, LightCacheFlags, LightCacheRef};
use crate::renderer::{ProbeRenderer, ProbeView, UnitContext, ViewContent};
use crate::sample_order::{GridSample, SampleOrder};
use crate::settings::{BakeSettings, BakeSubset};
use crate::Result;
use glam::Vec3;
use helio_core::{Scene, TextureId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakePhase {
    World,
    Grid,
    Cubes,
    Done,
}

/// Phases a bake will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan {
    pub world: bool,
    pub grid: bool,
    pub cubes: bool,
}

impl PhasePlan {
    /// Channels `subset` forces dirty before planning.
    pub fn rebake_channels(subset: BakeSubset) -> LightCacheFlags {
        match subset {
            BakeSubset::All => LightCacheFlags::DIRTY,
            BakeSubset::Dirty => LightCacheFlags::empty(),
            BakeSubset::Cubemaps => LightCacheFlags::CUBE_DIRTY,
        }
    }

    /// Plan from the cache flags, after [`rebake_channels`](Self::rebake_channels)
    /// has been applied to them. A dirty world is baked for every subset since
    /// cube layer 0 and grid record 0 depend on it.
    pub fn from_flags(subset: BakeSubset, flags: LightCacheFlags) -> Self {
        let cubes_only = subset == BakeSubset::Cubemaps;
        Self {
            world: flags.contains(LightCacheFlags::WORLD_DIRTY),
            grid: !cubes_only && flags.contains(LightCacheFlags::GRID_DIRTY),
            cubes: flags.contains(LightCacheFlags::CUBE_DIRTY),
        }
    }

    /// Saturates at `u32::MAX`.
    pub fn total_units(&self, bounces: u32, probes: &GatheredProbes) -> u32 {
        let mut total: u32 = 0;
        if self.world {
            total += 1;
        }
        if self.grid {
            total = total.saturating_add(bounces.saturating_mul(probes.grid_samples_per_bounce()));
        }
        if self.cubes {
            total = total.saturating_add(probes.counts.cube_count - 1);
        }
        total
    }
}

/// Read-only inputs of a bake.
#[derive(Clone, Copy)]
pub struct BakeInput<'a> {
    pub scene: &'a Scene,
    pub settings: &'a BakeSettings,
    pub probes: &'a GatheredProbes,
}

enum Cursor {
    World { issued: bool },
    Grid { bounce: u32, grid: usize, order: SampleOrder },
    Cubes { next: usize },
    Done,
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    World,
    GridSample {
        bounce: u32,
        grid: usize,
        sample: GridSample,
        /// Last sample of this grid in the current bounce.
        last: bool,
    },
    Cube {
        index: usize,
    },
}

pub struct Scheduler<'a> {
    input: BakeInput<'a>,
    context: &'a BakeContext,
    cache: &'a LightCacheRef,
    targets: &'a BakeTargets,
    /// Previous bounce of the grid atlas.
    grid_prev: TextureId,
    /// Whether `grid_prev` holds what the next bounce has to read.
    prev_synced: bool,
    plan: PhasePlan,
    cursor: Cursor,
    done: u32,
    total: u32,
}

impl<'a> Scheduler<'a> {
    /// `grid_prev` must match the grid atlas description.
    pub fn new(
        input: BakeInput<'a>,
        context: &'a BakeContext,
        cache: &'a LightCacheRef,
        targets: &'a BakeTargets,
        grid_prev: TextureId,
        plan: PhasePlan,
    ) -> Self {
        let total = plan.total_units(input.settings.diffuse_bounces, input.probes);
        Self {
            input,
            context,
            cache,
            targets,
            grid_prev,
            prev_synced: false,
            plan,
            cursor: Cursor::World { issued: false },
            done: 0,
            total,
        }
    }

    pub fn phase(&self) -> BakePhase {
        match self.cursor {
            Cursor::World { .. } => BakePhase::World,
            Cursor::Grid { .. } => BakePhase::Grid,
            Cursor::Cubes { .. } => BakePhase::Cubes,
            Cursor::Done => BakePhase::Done,
        }
    }

    pub fn done(&self) -> u32 {
        self.done
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Run units until every planned phase is complete, `signals` asks to
    /// stop, or a unit fails. The cache keeps whatever finished.
    pub fn run(
        &mut self,
        renderer: &mut dyn ProbeRenderer,
        signals: &JobSignals,
    ) -> Result<BakeOutcome> {
        log::info!("Baking {} units ({:?})", self.total, self.plan);
        let result = self.run_units(renderer, signals);
        let mut cache = self.cache.write();
        match result {
            Ok(BakeOutcome::Completed { .. }) => {
                cache.finish_bake();
                log::info!("Bake finished, cache flags {:?}", cache.flags());
            }
            Ok(BakeOutcome::Canceled { done, total }) => {
                cache.abort_bake();
                log::info!("Bake canceled after {}/{} units", done, total);
            }
            Err(ref e) => {
                cache.abort_bake();
                log::warn!("Bake failed after {}/{} units: {}", self.done, self.total, e);
            }
        }
        result
    }

    fn run_units(
        &mut self,
        renderer: &mut dyn ProbeRenderer,
        signals: &JobSignals,
    ) -> Result<BakeOutcome> {
        while let Some(unit) = self.next_unit() {
            if signals.stop_requested() {
                return Ok(BakeOutcome::Canceled {
                    done: self.done,
                    total: self.total,
                });
            }
            {
                let _guard = self.context.enter();
                log::trace!("Unit {}/{}: {:?}", self.done + 1, self.total, unit);
                self.execute(renderer, unit)?;
            }
            self.done += 1;
            signals.publish_progress(self.done, self.total);
        }
        Ok(BakeOutcome::Completed {
            done: self.done,
            total: self.total,
        })
    }

    fn next_unit(&mut self) -> Option<Unit> {
        let probes = self.input.probes;
        let bounces = self.input.settings.diffuse_bounces;
        loop {
            match &mut self.cursor {
                Cursor::World { issued } => {
                    if self.plan.world && !*issued {
                        *issued = true;
                        return Some(Unit::World);
                    }
                    if self.plan.world {
                        self.complete(BakePhase::World);
                    }
                    if self.plan.grid && bounces > 0 && probes.grid_records.len() > 1 {
                        self.cursor = self.grid_cursor(0, 1);
                    } else {
                        if self.plan.grid {
                            self.complete(BakePhase::Grid);
                        }
                        self.start_cubes();
                    }
                }
                Cursor::Grid { bounce, grid, order } => {
                    if let Some(sample) = order.next() {
                        return Some(Unit::GridSample {
                            bounce: *bounce,
                            grid: *grid,
                            sample,
                            last: sample.index + 1 == order.total(),
                        });
                    }
                    let (bounce, grid) = (*bounce, *grid);
                    if grid + 1 < probes.grid_records.len() {
                        self.cursor = self.grid_cursor(bounce, grid + 1);
                    } else if bounce + 1 < bounces {
                        log::debug!("Bounce {}/{} done", bounce + 1, bounces);
                        self.cursor = self.grid_cursor(bounce + 1, 1);
                    } else {
                        self.complete(BakePhase::Grid);
                        self.start_cubes();
                    }
                }
                Cursor::Cubes { next } => {
                    if *next < probes.cube_records.len() {
                        let index = *next;
                        *next += 1;
                        return Some(Unit::Cube { index });
                    }
                    self.complete(BakePhase::Cubes);
                    self.cursor = Cursor::Done;
                }
                Cursor::Done => return None,
            }
        }
    }

    fn grid_cursor(&self, bounce: u32, grid: usize) -> Cursor {
        let resolution = self.input.probes.grid_records[grid].resolution;
        log::debug!("Bounce {} grid {} ({:?})", bounce, grid, resolution);
        Cursor::Grid {
            bounce,
            grid,
            order: SampleOrder::new(resolution),
        }
    }

    fn start_cubes(&mut self) {
        if self.plan.cubes && self.input.probes.cube_records.len() > 1 {
            self.cursor = Cursor::Cubes { next: 1 };
        } else {
            if self.plan.cubes {
                self.complete(BakePhase::Cubes);
            }
            self.cursor = Cursor::Done;
        }
    }

    fn complete(&mut self, phase: BakePhase) {
        let mut cache = self.cache.write();
        match phase {
            BakePhase::World => cache.finish_world(),
            BakePhase::Grid => cache.finish_grid(),
            BakePhase::Cubes => cache.finish_cubes(),
            BakePhase::Done => {}
        }
        log::info!("{:?} phase complete ({}/{} units)", phase, self.done, self.total);
    }

    fn unit_context<'c>(&'c self, cache: &'c LightCache) -> UnitContext<'c> {
        UnitContext {
            device: self.context.device().as_ref(),
            scene: self.input.scene,
            settings: self.input.settings,
            targets: self.targets,
            cache,
        }
    }

    fn execute(&mut self, renderer: &mut dyn ProbeRenderer, unit: Unit) -> Result<()> {
        match unit {
            Unit::World => self.bake_world(renderer),
            Unit::GridSample {
                bounce,
                grid,
                sample,
                last,
            } => self.bake_grid_sample(renderer, bounce, grid, sample, last),
            Unit::Cube { index } => self.bake_cube(renderer, index),
        }
    }

    fn bake_world(&mut self, renderer: &mut dyn ProbeRenderer) -> Result<()> {
        {
            let cache = self.cache.read();
            let unit = self.unit_context(&cache);
            renderer.render_cube(&unit, &ProbeView::world())?;
            renderer.filter_glossy(&unit, 0, 1.0)?;
            renderer.filter_diffuse(&unit, 0, 1.0)?;
        }
        self.prev_synced = false;
        Ok(())
    }

    fn bake_grid_sample(
        &mut self,
        renderer: &mut dyn ProbeRenderer,
        bounce: u32,
        grid: usize,
        sample: GridSample,
        last: bool,
    ) -> Result<()> {
        let probes = self.input.probes;
        let record = &probes.grid_records[grid];
        let source = &probes.grid_sources[grid];
        let (clip_start, clip_end) = source.clip_range();
        let view = ProbeView {
            position: record.sample_position(sample.cell),
            clip_start,
            clip_end,
            content: ViewContent::Scene,
        };
        let sample_offset = record.offset + sample.cell_index;

        if !self.prev_synced {
            let atlas = self.cache.read().grid_atlas();
            self.context.device().copy_texture(atlas, self.grid_prev)?;
            self.prev_synced = true;
        }

        // Render with the previous bounce bound as the grid atlas.
        self.cache.write().swap_grid_atlas(&mut self.grid_prev);
        let rendered = {
            let cache = self.cache.read();
            renderer.render_cube(&self.unit_context(&cache), &view)
        };
        self.cache.write().swap_grid_atlas(&mut self.grid_prev);
        rendered?;

        {
            let cache = self.cache.read();
            let unit = self.unit_context(&cache);
            renderer.filter_diffuse(&unit, sample_offset, source.intensity())?;
            if bounce == 0 {
                renderer.filter_visibility(
                    &unit,
                    sample_offset,
                    record.visibility_range,
                    record.visibility_blur,
                )?;
            }
        }

        if last {
            self.cache.write().set_level_bias(grid, 1.0);
            // The next bounce reads everything this one wrote.
            if grid + 1 == probes.grid_records.len() {
                self.prev_synced = false;
            }
        } else if bounce == 0 {
            self.cache.write().set_level_bias(grid, sample.level_bias());
        }
        Ok(())
    }

    fn bake_cube(&mut self, renderer: &mut dyn ProbeRenderer, index: usize) -> Result<()> {
        let probes = self.input.probes;
        let record = &probes.cube_records[index];
        let source = &probes.cube_sources[index];
        let (clip_start, clip_end) = source.clip_range();
        let view = ProbeView {
            position: Vec3::from_array(record.position),
            clip_start,
            clip_end,
            content: ViewContent::Scene,
        };
        {
            let cache = self.cache.read();
            let unit = self.unit_context(&cache);
            renderer.render_cube(&unit, &view)?;
            renderer.filter_glossy(&unit, index as u32, source.intensity())?;
        }
        self.cache.write().set_cube_ready_count(index as u32 + 1);
        Ok(())
    }
}
