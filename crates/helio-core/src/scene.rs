use crate::Transform;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type EntityId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightProbeKind {
    /// Volume of diffuse irradiance samples.
    Grid,
    /// Point specular reflection.
    Cube,
    /// Planar reflection, rendered at display time and never baked.
    Planar,
}

/// Light probe parameters attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightProbe {
    pub kind: LightProbeKind,
    /// Cells per axis (grid probes only).
    pub grid_resolution: [u32; 3],
    pub clip_start: f32,
    pub clip_end: f32,
    pub intensity: f32,
    /// Fraction of the influence distance over which the probe fades out.
    pub falloff: f32,
    pub distance_influence: f32,
    pub distance_parallax: f32,
    pub visibility_bias: f32,
    pub visibility_bleed_bias: f32,
    pub visibility_blur: f32,
}

impl LightProbe {
    pub fn new(kind: LightProbeKind) -> Self {
        Self {
            kind,
            grid_resolution: [4, 4, 4],
            clip_start: 0.8,
            clip_end: 40.0,
            intensity: 1.0,
            falloff: 0.2,
            distance_influence: 2.5,
            distance_parallax: 2.5,
            visibility_bias: 1.0,
            visibility_bleed_bias: 0.0,
            visibility_blur: 0.2,
        }
    }

    pub fn grid(x: u32, y: u32, z: u32) -> Self {
        Self {
            grid_resolution: [x, y, z],
            ..Self::new(LightProbeKind::Grid)
        }
    }

    pub fn cube() -> Self {
        Self::new(LightProbeKind::Cube)
    }

    pub fn with_clip(mut self, clip_start: f32, clip_end: f32) -> Self {
        self.clip_start = clip_start;
        self.clip_end = clip_end;
        self
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub transform: Transform,
    pub visible: bool,
    pub light_probe: Option<LightProbe>,
}

impl Entity {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            name: String::new(),
            transform: Transform::default(),
            visible: true,
            light_probe: None,
        }
    }

    pub fn light_probe(name: &str, transform: Transform, probe: LightProbe) -> Self {
        Self {
            name: name.to_string(),
            transform,
            light_probe: Some(probe),
            ..Self::new(0)
        }
    }
}

/// Scene graph shared between the main thread and background jobs.
///
/// Entities iterate in id order so that anything derived from a scan (probe
/// record order, atlas offsets) is stable between scans.
pub struct Scene {
    entities: Arc<RwLock<BTreeMap<EntityId, Entity>>>,
    next_entity_id: Arc<RwLock<EntityId>>,
    pub ambient_light: glam::Vec3,
    pub environment_intensity: f32,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            entities: Arc::new(RwLock::new(BTreeMap::new())),
            next_entity_id: Arc::new(RwLock::new(0)),
            ambient_light: glam::Vec3::splat(0.03),
            environment_intensity: 1.0,
        }
    }

    pub fn add_entity(&mut self, mut entity: Entity) -> EntityId {
        let mut next_id = self.next_entity_id.write();
        entity.id = *next_id;
        *next_id += 1;

        let id = entity.id;
        self.entities.write().insert(id, entity);
        id
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.write().remove(&id)
    }

    pub fn get_entity(&self, id: EntityId) -> Option<Entity> {
        self.entities.read().get(&id).cloned()
    }

    pub fn get_entity_mut<F, R>(&self, id: EntityId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Entity) -> R,
    {
        let mut entities = self.entities.write();
        entities.get_mut(&id).map(f)
    }

    pub fn for_each_entity<F>(&self, mut f: F)
    where
        F: FnMut(&Entity),
    {
        let entities = self.entities.read();
        for entity in entities.values() {
            f(entity);
        }
    }

    /// Visit every entity that takes part in rendering.
    pub fn for_each_render_entity<F>(&self, mut f: F)
    where
        F: FnMut(&Entity),
    {
        self.for_each_entity(|entity| {
            if entity.visible {
                f(entity);
            }
        });
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    /// Point-in-time copy that no longer observes edits made to `self`.
    pub fn evaluate(&self) -> Scene {
        Scene {
            entities: Arc::new(RwLock::new(self.entities.read().clone())),
            next_entity_id: Arc::new(RwLock::new(*self.next_entity_id.read())),
            ambient_light: self.ambient_light,
            environment_intensity: self.environment_intensity,
        }
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}
