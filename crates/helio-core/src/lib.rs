//! Core types shared by Helio crates: errors, GPU resource handles and the
//! device capability, rendering contexts, transforms and the scene model.

pub mod error;
pub mod gpu_resources;
pub mod headless;
pub mod render_context;
pub mod scene;
pub mod transform;
#[cfg(feature = "wgpu")]
pub mod wgpu_device;

pub use error::{HelioError, Result};
pub use gpu_resources::{
    Attachment, FramebufferDesc, FramebufferId, GpuDevice, ResourceHandle, TextureDesc,
    TextureFormat, TextureId, TextureKind,
};
pub use headless::{HeadlessDevice, HeadlessStats};
pub use render_context::{ContextId, ContextRegistry};
pub use scene::{Entity, EntityId, LightProbe, LightProbeKind, Scene};
pub use transform::Transform;
#[cfg(feature = "wgpu")]
pub use wgpu_device::WgpuDevice;
