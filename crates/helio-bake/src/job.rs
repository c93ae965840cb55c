//! Bake job lifecycle: allocate on the main thread, run anywhere, free.

use crate::atlas::AtlasRequirements;
use crate::context::{BakeContext, BakeTargets};
use crate::gather::{count_probes, gather_probes, GatheredProbes};
use crate::light_cache::{LightCache, LightCacheRef, LightCacheSlot};
use crate::renderer::{ProbeRenderer, ProbeView, UnitContext};
use crate::scheduler::{BakeInput, PhasePlan, Scheduler};
use crate::settings::BakeSettings;
use crate::{Error, Result};
use helio_core::{GpuDevice, Scene, TextureId};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct SignalState {
    stop: AtomicBool,
    do_update: AtomicBool,
    /// f32 bits.
    progress: AtomicU32,
}

/// Flags shared between the host and a running bake.
#[derive(Clone, Default)]
pub struct JobSignals(Arc<SignalState>);

impl JobSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the bake to stop before its next unit.
    pub fn request_stop(&self) {
        self.0.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.0.stop.load(Ordering::Acquire)
    }

    /// Whether the cache changed since the last call, clearing the flag.
    pub fn take_update(&self) -> bool {
        self.0.do_update.swap(false, Ordering::AcqRel)
    }

    /// Fraction of units done, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.0.progress.load(Ordering::Acquire))
    }

    pub(crate) fn publish_progress(&self, done: u32, total: u32) {
        let progress = if total == 0 { 1.0 } else { done as f32 / total as f32 };
        self.0.progress.store(progress.to_bits(), Ordering::Release);
        self.0.do_update.store(true, Ordering::Release);
    }
}

/// How a run ended. Cancellation is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeOutcome {
    Completed { done: u32, total: u32 },
    Canceled { done: u32, total: u32 },
}

impl BakeOutcome {
    pub fn done(&self) -> u32 {
        match *self {
            BakeOutcome::Completed { done, .. } | BakeOutcome::Canceled { done, .. } => done,
        }
    }

    pub fn total(&self) -> u32 {
        match *self {
            BakeOutcome::Completed { total, .. } | BakeOutcome::Canceled { total, .. } => total,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, BakeOutcome::Completed { .. })
    }
}

/// One bake invocation.
pub struct LightBake {
    scene: Scene,
    slot: LightCacheSlot,
    settings: BakeSettings,
    probes: GatheredProbes,
    requirements: AtlasRequirements,
    context: BakeContext,
    cache: Option<LightCacheRef>,
    needs_recreate: bool,
    ran: bool,
}

impl LightBake {
    /// Snapshot `scene`, gather its probes and size the cache. With
    /// `run_as_job` a dedicated rendering context is created for the worker
    /// thread that will call [`run`](Self::run). Must be called on the main
    /// thread.
    pub fn allocate(
        scene: &Scene,
        slot: &LightCacheSlot,
        device: Arc<dyn GpuDevice>,
        settings: BakeSettings,
        run_as_job: bool,
    ) -> Result<Self> {
        settings.validate()?;
        let scene = scene.evaluate();
        let counts = count_probes(&scene);
        let requirements = AtlasRequirements::compute(
            &settings,
            counts.grid_count,
            counts.cube_count,
            counts.total_irradiance_samples,
        )?;
        let probes = gather_probes(&scene, counts);

        let cache = slot.get();
        let needs_recreate = match &cache {
            Some(cache) => !cache.read().validate(&requirements),
            None => true,
        };
        let context = BakeContext::new(device, run_as_job)?;

        log::info!(
            "Allocated light bake: {} grids, {} cubes, {} samples, {} bounces{}{}",
            counts.grid_count - 1,
            counts.cube_count - 1,
            counts.total_irradiance_samples - 1,
            settings.diffuse_bounces,
            if run_as_job { ", background job" } else { "" },
            if needs_recreate { ", cache will be recreated" } else { "" }
        );

        Ok(Self {
            scene,
            slot: slot.clone(),
            settings,
            probes,
            requirements,
            context,
            cache,
            needs_recreate,
            ran: false,
        })
    }

    pub fn requirements(&self) -> &AtlasRequirements {
        &self.requirements
    }

    pub fn probes(&self) -> &GatheredProbes {
        &self.probes
    }

    pub fn runs_as_job(&self) -> bool {
        self.context.is_dedicated()
    }

    /// Bake everything the settings ask for. Runs at most once.
    pub fn run(
        &mut self,
        renderer: &mut dyn ProbeRenderer,
        signals: &JobSignals,
    ) -> Result<BakeOutcome> {
        if self.ran {
            return Err(Error::AlreadyRan);
        }
        self.ran = true;

        let (cache, targets, grid_prev, plan) = {
            let _guard = self.context.enter();
            let cache = match self.cache.take() {
                Some(cache) if !self.needs_recreate => cache,
                previous => {
                    let cache =
                        recreate_cache(&self.context, &self.slot, &self.requirements, previous)?;
                    self.needs_recreate = false;
                    cache
                }
            };
            let (targets, grid_prev) = self.create_transients(&cache)?;

            let subset = self.settings.subset;
            let mut locked = cache.write();
            locked.set_records(&self.probes.cube_records, &self.probes.grid_records);
            locked.begin_bake(PhasePlan::rebake_channels(subset));
            let plan = PhasePlan::from_flags(subset, locked.flags());
            drop(locked);
            (cache, targets, grid_prev, plan)
        };

        let input = BakeInput {
            scene: &self.scene,
            settings: &self.settings,
            probes: &self.probes,
        };
        let result = Scheduler::new(input, &self.context, &cache, &targets, grid_prev, plan)
            .run(renderer, signals);

        {
            let _guard = self.context.enter();
            self.context.destroy_texture(grid_prev);
            self.context.destroy_render_targets(targets);
        }
        self.cache = Some(cache);
        if let Ok(BakeOutcome::Completed { .. }) = result {
            signals.publish_progress(1, 1);
        }
        result
    }

    fn create_transients(&self, cache: &LightCacheRef) -> Result<(BakeTargets, TextureId)> {
        let targets = self.context.create_render_targets(self.settings.cubemap_resolution)?;
        let grid_prev = match self
            .context
            .create_texture(&LightCache::grid_atlas_desc(&self.requirements, "bake_grid_prev"))
        {
            Ok(texture) => texture,
            Err(e) => {
                self.context.destroy_render_targets(targets);
                return Err(e);
            }
        };
        debug_assert!(cache.read().validate(&self.requirements));
        Ok((targets, grid_prev))
    }

    /// Release the scene snapshot and the job's cache reference. The cache
    /// itself lives on in the slot.
    pub fn free(mut self) {
        if let Some(cache) = self.cache.take() {
            cache.release();
        }
        log::debug!("Freed light bake");
    }
}

/// Allocate a cache for `requirements` under the current context and swap it
/// into `slot`, dropping the slot's and the job's references to the old one.
fn recreate_cache(
    context: &BakeContext,
    slot: &LightCacheSlot,
    requirements: &AtlasRequirements,
    previous: Option<LightCacheRef>,
) -> Result<LightCacheRef> {
    context.assert_current();
    let created = LightCacheRef::new(LightCache::create(
        Arc::clone(context.device()),
        requirements,
    )?);
    if let Some(replaced) = slot.replace(created.acquire()) {
        replaced.release();
    }
    if let Some(previous) = previous {
        previous.release();
    }
    log::info!(
        "Recreated light cache: grid atlas {}x{}x{}",
        requirements.grid.width,
        requirements.grid.height,
        requirements.grid.layers
    );
    Ok(created)
}

/// Re-render only the world probe, inline on the main context. Creates a
/// world-only cache when the slot is empty.
pub fn quick_world_update(
    scene: &Scene,
    slot: &LightCacheSlot,
    device: Arc<dyn GpuDevice>,
    renderer: &mut dyn ProbeRenderer,
    settings: &BakeSettings,
) -> Result<()> {
    settings.validate()?;
    let context = BakeContext::main(device);
    let _guard = context.enter();

    let cache = match slot.get() {
        Some(cache) => cache,
        None => {
            let requirements = AtlasRequirements::world_only(settings)?;
            let cache = LightCacheRef::new(LightCache::create(
                Arc::clone(context.device()),
                &requirements,
            )?);
            if let Some(previous) = slot.replace(cache.acquire()) {
                previous.release();
            }
            log::info!("Created world-only light cache");
            cache
        }
    };

    let resolution = cache.read().requirements().cube.resolution;
    let targets = context.create_render_targets(resolution)?;
    let rendered = {
        let locked = cache.read();
        let unit = UnitContext {
            device: context.device().as_ref(),
            scene,
            settings,
            targets: &targets,
            cache: &locked,
        };
        renderer
            .render_cube(&unit, &ProbeView::world())
            .and_then(|_| renderer.filter_glossy(&unit, 0, 1.0))
            .and_then(|_| renderer.filter_diffuse(&unit, 0, 1.0))
    };
    context.destroy_render_targets(targets);
    rendered?;

    cache.write().finish_world();
    cache.release();
    log::debug!("World lighting updated");
    Ok(())
}
