//! Light cache baking.
//!
//! Precomputes indirect lighting for a scene: diffuse irradiance in volume
//! grids and specular reflections in filtered cubemaps, both packed into the
//! atlases of a shared [`LightCache`]. A bake is a [`LightBake`] job that is
//! allocated on the main thread, run unit by unit (optionally on a worker
//! thread with a dedicated rendering context) and freed afterwards.

pub mod atlas;
pub mod context;
pub mod gather;
pub mod job;
pub mod light_cache;
pub mod renderer;
pub mod sample_order;
pub mod scheduler;
pub mod settings;

pub use atlas::{AtlasRequirements, CubeAtlasSize, GridAtlasSize};
pub use context::{BakeContext, BakeTargets, ContextGuard};
pub use gather::{count_probes, gather_probes, GatheredProbes, ProbeCounts, ProbeSource};
pub use job::{quick_world_update, BakeOutcome, JobSignals, LightBake};
pub use light_cache::{
    CubeRecord, GridRecord, LightCache, LightCacheFlags, LightCacheInfo, LightCacheRef,
    LightCacheSlot,
};
pub use renderer::{ProbeRenderer, ProbeView, UnitContext, ViewContent};
pub use sample_order::{grid_sample, GridSample, SampleOrder};
pub use scheduler::{BakeInput, BakePhase, PhasePlan, Scheduler};
pub use settings::{BakeSettings, BakeSubset, IrradianceEncoding};

use helio_core::HelioError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] HelioError),

    #[error("{samples} irradiance samples exceed the grid atlas capacity of {capacity}")]
    Capacity { samples: u64, capacity: u64 },

    #[error("light cache metadata could not be encoded: {0}")]
    Persist(#[from] bincode::Error),

    #[error("bake job has already run")]
    AlreadyRan,
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Device(HelioError::InvalidConfiguration(message.into()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
