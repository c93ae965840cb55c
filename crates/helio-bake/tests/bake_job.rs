use glam::Vec3;
use helio_bake::{
    quick_world_update, BakeContext, BakeOutcome, BakeSettings, BakeSubset, Error, JobSignals,
    LightBake, LightCacheFlags, LightCacheSlot, ProbeRenderer, ProbeView, UnitContext,
    ViewContent,
};
use helio_core::{
    ContextId, Entity, GpuDevice, HeadlessDevice, HelioError, LightProbe, Scene, TextureId,
    Transform,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Call {
    Render(ViewContent),
    Glossy(u32),
    Diffuse(u32),
    Visibility(u32),
}

/// Records what the scheduler asks for instead of drawing.
#[derive(Default)]
struct RecordingRenderer {
    calls: Vec<Call>,
    renders: usize,
    stop_after: Option<(usize, JobSignals)>,
    /// Level bias of grid record 1 seen by each scene render.
    level_biases: Vec<f32>,
    /// Grid atlas bound while rendering / while filtering irradiance.
    render_atlases: Vec<TextureId>,
    diffuse_atlases: Vec<TextureId>,
    contexts: Vec<ContextId>,
}

impl RecordingRenderer {
    fn stopping_after(units: usize, signals: &JobSignals) -> Self {
        Self {
            stop_after: Some((units, signals.clone())),
            ..Default::default()
        }
    }

    fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| f(c)).count()
    }
}

impl ProbeRenderer for RecordingRenderer {
    fn render_cube(&mut self, unit: &UnitContext<'_>, view: &ProbeView) -> helio_bake::Result<()> {
        let context = unit
            .device
            .current_context()
            .expect("units run with a current context");
        self.contexts.push(context);
        self.calls.push(Call::Render(view.content));
        if view.content == ViewContent::Scene {
            if let Some(record) = unit.cache.grid_records().get(1) {
                self.level_biases.push(record.level_bias);
            }
        }
        self.render_atlases.push(unit.cache.grid_atlas());
        self.renders += 1;
        if let Some((units, signals)) = &self.stop_after {
            if self.renders == *units {
                signals.request_stop();
            }
        }
        Ok(())
    }

    fn filter_glossy(
        &mut self,
        _unit: &UnitContext<'_>,
        layer: u32,
        _intensity: f32,
    ) -> helio_bake::Result<()> {
        self.calls.push(Call::Glossy(layer));
        Ok(())
    }

    fn filter_diffuse(
        &mut self,
        unit: &UnitContext<'_>,
        sample_offset: u32,
        _intensity: f32,
    ) -> helio_bake::Result<()> {
        self.diffuse_atlases.push(unit.cache.grid_atlas());
        self.calls.push(Call::Diffuse(sample_offset));
        Ok(())
    }

    fn filter_visibility(
        &mut self,
        _unit: &UnitContext<'_>,
        sample_offset: u32,
        _visibility_range: f32,
        _blur: f32,
    ) -> helio_bake::Result<()> {
        self.calls.push(Call::Visibility(sample_offset));
        Ok(())
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings(bounces: u32) -> BakeSettings {
    BakeSettings {
        diffuse_bounces: bounces,
        cubemap_resolution: 16,
        visibility_resolution: 8,
        ..Default::default()
    }
}

fn device() -> (Arc<HeadlessDevice>, Arc<dyn GpuDevice>) {
    let device = Arc::new(HeadlessDevice::new());
    let gpu: Arc<dyn GpuDevice> = device.clone();
    (device, gpu)
}

fn grid_scene(resolutions: &[[u32; 3]]) -> Scene {
    let mut scene = Scene::new();
    for (i, &[x, y, z]) in resolutions.iter().enumerate() {
        scene.add_entity(Entity::light_probe(
            &format!("grid_{}", i),
            Transform::from_position(Vec3::new(i as f32 * 4.0, 0.0, 0.0)),
            LightProbe::grid(x, y, z),
        ));
    }
    scene
}

fn assert_no_transients(device: &HeadlessDevice) {
    // Only the two cache atlases survive a bake.
    assert_eq!(device.live_textures(), 2);
    assert_eq!(device.live_framebuffers(), 0);
    assert_eq!(device.current_context(), None);
    assert_eq!(device.stats().double_frees, 0);
}

#[test]
fn empty_scene_bakes_only_the_world() {
    init_logging();
    let (device, gpu) = device();
    let scene = Scene::new();
    let slot = LightCacheSlot::new();
    let signals = JobSignals::new();

    let mut job = LightBake::allocate(&scene, &slot, gpu, settings(3), false).unwrap();
    assert_eq!(job.requirements().grid_count, 1);
    assert_eq!(job.requirements().cube_count, 1);

    let mut renderer = RecordingRenderer::default();
    let outcome = job.run(&mut renderer, &signals).unwrap();
    assert_eq!(outcome, BakeOutcome::Completed { done: 1, total: 1 });
    assert_eq!(
        renderer.calls,
        vec![Call::Render(ViewContent::WorldOnly), Call::Glossy(0), Call::Diffuse(0)]
    );
    assert_eq!(renderer.contexts, vec![ContextId::MAIN]);
    assert_eq!(signals.progress(), 1.0);
    assert!(signals.take_update());
    job.free();

    let cache = slot.get().unwrap();
    let flags = cache.read().flags();
    assert!(flags.contains(
        LightCacheFlags::BAKED | LightCacheFlags::GRID_READY | LightCacheFlags::CUBE_READY
    ));
    assert!(!flags.intersects(LightCacheFlags::DIRTY | LightCacheFlags::BAKING));
    assert_eq!(cache.read().cube_ready_count(), 1);
    assert_no_transients(&device);
}

#[test]
fn one_grid_two_bounces_runs_seventeen_units() {
    init_logging();
    let (device, gpu) = device();
    let scene = grid_scene(&[[2, 2, 2]]);
    let slot = LightCacheSlot::new();
    let signals = JobSignals::new();

    let mut job = LightBake::allocate(&scene, &slot, gpu, settings(2), false).unwrap();
    let mut renderer = RecordingRenderer::default();
    let outcome = job.run(&mut renderer, &signals).unwrap();
    job.free();

    assert_eq!(outcome, BakeOutcome::Completed { done: 17, total: 17 });
    assert_eq!(renderer.count(|c| matches!(c, Call::Render(_))), 17);
    assert_eq!(renderer.count(|c| matches!(c, Call::Render(ViewContent::Scene))), 16);
    // Visibility is only filtered on the first bounce.
    assert_eq!(renderer.count(|c| matches!(c, Call::Visibility(_))), 8);

    let mut offsets: Vec<u32> = renderer
        .calls
        .iter()
        .filter_map(|c| match c {
            Call::Diffuse(offset) if *offset > 0 => Some(*offset),
            _ => None,
        })
        .take(8)
        .collect();
    offsets.sort_unstable();
    assert_eq!(offsets, (1..=8).collect::<Vec<_>>());

    // Grid samples render against the previous bounce and filter into the live atlas.
    let cache = slot.get().unwrap();
    let atlas = cache.read().grid_atlas();
    assert!(renderer.render_atlases[1..].iter().all(|&t| t != atlas));
    assert!(renderer.diffuse_atlases.iter().all(|&t| t == atlas));
    // One snapshot per bounce.
    assert_eq!(device.stats().copies, 2);

    let cache = cache.read();
    assert_eq!(cache.grid_records()[1].level_bias, 1.0);
    assert!(cache.flags().contains(LightCacheFlags::BAKED));
    drop(cache);
    assert_no_transients(&device);
}

#[test]
fn level_bias_follows_the_sample_stride() {
    let (_device, gpu) = device();
    let scene = grid_scene(&[[4, 4, 4]]);
    let slot = LightCacheSlot::new();

    let mut job = LightBake::allocate(&scene, &slot, gpu, settings(1), false).unwrap();
    let mut renderer = RecordingRenderer::default();
    job.run(&mut renderer, &JobSignals::new()).unwrap();
    job.free();

    let biases = &renderer.level_biases;
    assert_eq!(biases.len(), 64);
    // Each render sees the bias written by the previous sample.
    assert_eq!(biases[1], 8.0);
    assert_eq!(biases[8], 4.0);
    assert_eq!(biases[63], 2.0);
    assert_eq!(slot.get().unwrap().read().grid_records()[1].level_bias, 1.0);
}

#[test]
fn cancel_keeps_finished_phases() {
    init_logging();
    let (device, gpu) = device();
    let scene = grid_scene(&[[2, 2, 2]]);
    let slot = LightCacheSlot::new();
    let signals = JobSignals::new();

    let mut job = LightBake::allocate(&scene, &slot, gpu, settings(2), false).unwrap();
    let mut renderer = RecordingRenderer::stopping_after(3, &signals);
    let outcome = job.run(&mut renderer, &signals).unwrap();
    job.free();

    assert_eq!(outcome, BakeOutcome::Canceled { done: 3, total: 17 });
    assert!((signals.progress() - 3.0 / 17.0).abs() < 1e-6);

    let cache = slot.get().unwrap();
    let flags = cache.read().flags();
    assert!(!flags.contains(LightCacheFlags::BAKED));
    assert!(!flags.contains(LightCacheFlags::BAKING));
    assert!(flags.contains(LightCacheFlags::GRID_READY | LightCacheFlags::CUBE_READY));
    assert!(!flags.contains(LightCacheFlags::WORLD_DIRTY));
    assert!(flags.contains(LightCacheFlags::GRID_DIRTY | LightCacheFlags::CUBE_DIRTY));
    assert_no_transients(&device);
}

#[test]
fn cancel_before_the_world_finishes_leaves_nothing_ready() {
    let (_device, gpu) = device();
    let scene = grid_scene(&[[2, 2, 2]]);
    let slot = LightCacheSlot::new();
    let signals = JobSignals::new();
    signals.request_stop();

    let mut job = LightBake::allocate(&scene, &slot, gpu, settings(2), false).unwrap();
    let mut renderer = RecordingRenderer::default();
    let outcome = job.run(&mut renderer, &signals).unwrap();
    job.free();

    assert_eq!(outcome, BakeOutcome::Canceled { done: 0, total: 17 });
    assert!(renderer.calls.is_empty());
    let flags = slot.get().unwrap().read().flags();
    assert!(!flags.intersects(LightCacheFlags::GRID_READY | LightCacheFlags::CUBE_READY));
}

#[test]
fn background_job_uses_a_dedicated_context() {
    init_logging();
    let (device, gpu) = device();
    let mut scene = grid_scene(&[[2, 1, 1]]);
    scene.add_entity(Entity::light_probe(
        "cube",
        Transform::from_position(Vec3::new(0.0, 2.0, 0.0)),
        LightProbe::cube(),
    ));
    let slot = LightCacheSlot::new();
    let signals = JobSignals::new();

    let job = LightBake::allocate(&scene, &slot, gpu, settings(1), true).unwrap();
    assert!(job.runs_as_job());
    assert_eq!(device.live_dedicated_contexts(), 1);

    let worker_signals = signals.clone();
    let handle = std::thread::spawn(move || {
        let mut job = job;
        let mut renderer = RecordingRenderer::default();
        let outcome = job.run(&mut renderer, &worker_signals);
        (job, renderer, outcome)
    });
    let (job, renderer, outcome) = handle.join().unwrap();
    let outcome = outcome.unwrap();
    assert_eq!(outcome, BakeOutcome::Completed { done: 4, total: 4 });
    assert!(renderer.contexts.iter().all(|c| !c.is_main()));
    assert_eq!(
        &renderer.calls[renderer.calls.len() - 2..],
        &[Call::Render(ViewContent::Scene), Call::Glossy(1)]
    );

    job.free();
    assert_eq!(device.live_dedicated_contexts(), 0);

    let cache = slot.get().unwrap();
    assert_eq!(cache.read().cube_ready_count(), 2);
    assert_ne!(device.texture(cache.read().grid_atlas()).unwrap().context, ContextId::MAIN);
    assert_no_transients(&device);
}

#[test]
fn cache_is_reused_or_recreated_for_both_layers() {
    init_logging();
    let (device, gpu) = device();
    let mut scene = grid_scene(&[[2, 2, 2]]);
    let slot = LightCacheSlot::new();
    let signals = JobSignals::new();

    let mut job = LightBake::allocate(&scene, &slot, gpu.clone(), settings(1), false).unwrap();
    job.run(&mut RecordingRenderer::default(), &signals).unwrap();
    job.free();
    let first = slot.get().unwrap();

    // Same probes: the cache is reused.
    let mut job = LightBake::allocate(&scene, &slot, gpu.clone(), settings(1), false).unwrap();
    job.run(&mut RecordingRenderer::default(), &signals).unwrap();
    job.free();
    assert!(slot.get().unwrap().ptr_eq(&first));

    // A new grid changes the layout: the slot gets a fresh, fully dirty cache.
    scene.add_entity(Entity::light_probe("more", Transform::default(), LightProbe::grid(2, 2, 2)));
    let mut job = LightBake::allocate(&scene, &slot, gpu.clone(), settings(1), false).unwrap();
    job.run(&mut RecordingRenderer::stopping_after(1, &signals), &signals).unwrap();
    job.free();

    let second = slot.get().unwrap();
    assert!(!second.ptr_eq(&first));
    assert_eq!(second.read().requirements().grid_count, 3);
    assert!(second.read().flags().contains(LightCacheFlags::GRID_DIRTY));

    // The old cache dies with its last holder. Released off-context, its
    // atlases wait for the next time a context is entered.
    assert!(first.release());
    assert_eq!(device.pending_destroys(), 2);
    let main = BakeContext::main(gpu);
    drop(main.enter());
    assert_eq!(device.pending_destroys(), 0);
    assert_no_transients(&device);
}

#[test]
fn subsets_limit_the_work() {
    let (_device, gpu) = device();
    let mut scene = grid_scene(&[[2, 2, 2]]);
    for i in 0..2 {
        scene.add_entity(Entity::light_probe(
            "cube",
            Transform::from_position(Vec3::splat(i as f32)),
            LightProbe::cube(),
        ));
    }
    let slot = LightCacheSlot::new();
    let signals = JobSignals::new();

    let mut job = LightBake::allocate(&scene, &slot, gpu.clone(), settings(1), false).unwrap();
    assert_eq!(job.run(&mut RecordingRenderer::default(), &signals).unwrap().total(), 1 + 8 + 2);
    job.free();

    let cubemaps = BakeSettings {
        subset: BakeSubset::Cubemaps,
        ..settings(1)
    };
    let mut job = LightBake::allocate(&scene, &slot, gpu.clone(), cubemaps, false).unwrap();
    let mut renderer = RecordingRenderer::default();
    assert_eq!(
        job.run(&mut renderer, &signals).unwrap(),
        BakeOutcome::Completed { done: 2, total: 2 }
    );
    job.free();
    assert_eq!(renderer.count(|c| matches!(c, Call::Diffuse(_))), 0);
    assert_eq!(renderer.count(|c| matches!(c, Call::Glossy(_))), 2);

    let dirty = BakeSettings {
        subset: BakeSubset::Dirty,
        ..settings(1)
    };
    let mut job = LightBake::allocate(&scene, &slot, gpu.clone(), dirty.clone(), false).unwrap();
    assert_eq!(
        job.run(&mut RecordingRenderer::default(), &signals).unwrap(),
        BakeOutcome::Completed { done: 0, total: 0 }
    );
    job.free();

    slot.get().unwrap().write().tag_dirty(LightCacheFlags::WORLD_DIRTY);
    let mut job = LightBake::allocate(&scene, &slot, gpu, dirty, false).unwrap();
    let mut renderer = RecordingRenderer::default();
    assert_eq!(job.run(&mut renderer, &signals).unwrap().total(), 1);
    job.free();
    assert_eq!(renderer.calls[0], Call::Render(ViewContent::WorldOnly));
    assert!(slot.get().unwrap().read().flags().contains(LightCacheFlags::BAKED));
}

#[test]
fn cubemap_subset_on_a_new_cache_renders_the_world_first() {
    let (device, gpu) = device();
    let mut scene = Scene::new();
    scene.add_entity(Entity::light_probe(
        "cube",
        Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
        LightProbe::cube(),
    ));
    let slot = LightCacheSlot::new();
    let cubemaps = BakeSettings {
        subset: BakeSubset::Cubemaps,
        ..settings(1)
    };

    let mut job = LightBake::allocate(&scene, &slot, gpu, cubemaps, false).unwrap();
    let mut renderer = RecordingRenderer::default();
    let outcome = job.run(&mut renderer, &JobSignals::new()).unwrap();
    job.free();

    assert_eq!(outcome, BakeOutcome::Completed { done: 2, total: 2 });
    assert_eq!(
        renderer.calls,
        vec![
            Call::Render(ViewContent::WorldOnly),
            Call::Glossy(0),
            Call::Diffuse(0),
            Call::Render(ViewContent::Scene),
            Call::Glossy(1),
        ]
    );

    let cache = slot.get().unwrap();
    let flags = cache.read().flags();
    assert!(flags.contains(LightCacheFlags::CUBE_READY));
    assert!(!flags.intersects(LightCacheFlags::WORLD_DIRTY | LightCacheFlags::CUBE_DIRTY));
    // Grids were not part of the subset.
    assert!(flags.contains(LightCacheFlags::GRID_DIRTY));
    assert!(!flags.contains(LightCacheFlags::BAKED));
    assert_eq!(cache.read().cube_ready_count(), 2);
    drop(cache);
    assert_no_transients(&device);
}

#[test]
fn allocation_failure_is_reported_and_cleaned_up() {
    init_logging();
    let (device, gpu) = device();
    let scene = grid_scene(&[[2, 2, 2]]);
    let slot = LightCacheSlot::new();

    let mut job = LightBake::allocate(&scene, &slot, gpu, settings(1), true).unwrap();
    // The cache atlases fit, the render targets do not.
    device.set_allocation_budget(Some(3));
    let err = job.run(&mut RecordingRenderer::default(), &JobSignals::new()).unwrap_err();
    assert!(matches!(err, Error::Device(HelioError::OutOfMemory(_))));
    job.free();

    assert_eq!(device.live_dedicated_contexts(), 0);
    assert_no_transients(&device);
    let flags = slot.get().unwrap().read().flags();
    assert!(!flags.contains(LightCacheFlags::BAKING));
}

#[test]
fn a_job_runs_once() {
    let (_device, gpu) = device();
    let slot = LightCacheSlot::new();
    let mut job = LightBake::allocate(&Scene::new(), &slot, gpu, settings(1), false).unwrap();
    job.run(&mut RecordingRenderer::default(), &JobSignals::new()).unwrap();
    let err = job.run(&mut RecordingRenderer::default(), &JobSignals::new()).unwrap_err();
    assert!(matches!(err, Error::AlreadyRan));
}

#[test]
fn invalid_settings_are_rejected_at_allocation() {
    let (_device, gpu) = device();
    let bad = BakeSettings {
        cubemap_resolution: 100,
        ..settings(1)
    };
    let result = LightBake::allocate(&Scene::new(), &LightCacheSlot::new(), gpu, bad, false);
    assert!(matches!(
        result,
        Err(Error::Device(HelioError::InvalidConfiguration(_)))
    ));
}

#[test]
fn oversized_grids_are_rejected_at_allocation() {
    let (device, gpu) = device();
    let scene = grid_scene(&[[65536, 65536, 1]]);
    let slot = LightCacheSlot::new();

    let result = LightBake::allocate(&scene, &slot, gpu, settings(1), false);
    match result {
        Err(Error::Capacity { samples, capacity }) => {
            assert_eq!(samples, 1 + u64::from(u32::MAX));
            assert!(capacity < samples);
        }
        other => panic!("expected a capacity error, got {:?}", other.map(|_| ())),
    }
    assert!(slot.is_empty());
    assert_eq!(device.live_textures(), 0);
}

#[test]
fn quick_world_update_creates_a_world_cache() {
    init_logging();
    let (device, gpu) = device();
    let scene = grid_scene(&[[2, 2, 2]]);
    let slot = LightCacheSlot::new();
    let mut renderer = RecordingRenderer::default();

    quick_world_update(&scene, &slot, gpu.clone(), &mut renderer, &settings(1)).unwrap();
    assert_eq!(
        renderer.calls,
        vec![Call::Render(ViewContent::WorldOnly), Call::Glossy(0), Call::Diffuse(0)]
    );

    let cache = slot.get().unwrap();
    assert_eq!(cache.read().requirements().grid_count, 1);
    let flags = cache.read().flags();
    assert!(flags.contains(LightCacheFlags::GRID_READY | LightCacheFlags::CUBE_READY));
    assert!(!flags.contains(LightCacheFlags::WORLD_DIRTY));
    assert_no_transients(&device);

    // A later update reuses the existing cache.
    quick_world_update(&scene, &slot, gpu, &mut renderer, &settings(1)).unwrap();
    assert!(slot.get().unwrap().ptr_eq(&cache));
    assert_no_transients(&device);
}
