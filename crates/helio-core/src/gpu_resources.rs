//! GPU resource handles, descriptors and the device capability used by
//! systems that allocate and fill textures without owning a renderer.

use crate::render_context::ContextId;
use crate::Result;

pub type ResourceHandle = u64;

/// Opaque handle to a texture owned by a [`GpuDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(ResourceHandle);

impl TextureId {
    pub fn from_raw(handle: ResourceHandle) -> Self {
        Self(handle)
    }

    pub fn raw(self) -> ResourceHandle {
        self.0
    }
}

/// Opaque handle to a framebuffer (a set of attachments) owned by a [`GpuDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(ResourceHandle);

impl FramebufferId {
    pub fn from_raw(handle: ResourceHandle) -> Self {
        Self(handle)
    }

    pub fn raw(self) -> ResourceHandle {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rg11b10Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    /// Six faces; `layers` is always 6.
    Cube,
    /// 2D texture array.
    D2Array,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub label: String,
    pub kind: TextureKind,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_level_count: u32,
}

impl TextureDesc {
    pub fn cube(label: &str, resolution: u32, format: TextureFormat, mip_level_count: u32) -> Self {
        Self {
            label: label.to_string(),
            kind: TextureKind::Cube,
            format,
            width: resolution,
            height: resolution,
            layers: 6,
            mip_level_count,
        }
    }

    pub fn array_2d(
        label: &str,
        width: u32,
        height: u32,
        layers: u32,
        format: TextureFormat,
    ) -> Self {
        Self {
            label: label.to_string(),
            kind: TextureKind::D2Array,
            format,
            width,
            height,
            layers,
            mip_level_count: 1,
        }
    }

    pub fn with_mips(mut self, mip_level_count: u32) -> Self {
        self.mip_level_count = mip_level_count.max(1);
        self
    }
}

/// One texture layer/mip bound as a render attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub texture: TextureId,
    pub layer: u32,
    pub mip: u32,
}

impl Attachment {
    pub fn layer(texture: TextureId, layer: u32) -> Self {
        Self { texture, layer, mip: 0 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FramebufferDesc {
    pub label: String,
    pub color: Option<Attachment>,
    pub depth: Option<Attachment>,
}

/// The graphics-resource capability: context management, texture and
/// framebuffer lifetime, and texture copies.
///
/// Creation, destruction and copies must happen while a context is current
/// on the calling thread. A framebuffer belongs to the context it was created
/// under; textures are shared between contexts.
pub trait GpuDevice: Send + Sync {
    /// Short backend name for logging.
    fn name(&self) -> &str;

    /// Create a context exclusive to one worker thread.
    fn create_context(&self) -> Result<ContextId>;

    fn destroy_context(&self, context: ContextId);

    /// Bind `context` to the calling thread.
    fn make_current(&self, context: ContextId);

    /// Unbind `context` from the calling thread.
    fn release_current(&self, context: ContextId);

    /// Context bound to the calling thread.
    fn current_context(&self) -> Option<ContextId>;

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId>;

    fn destroy_texture(&self, texture: TextureId);

    /// Queue `texture` for destruction by the next [`collect_garbage`]. Can be
    /// called from any thread, with or without a current context.
    ///
    /// [`collect_garbage`]: GpuDevice::collect_garbage
    fn destroy_texture_deferred(&self, texture: TextureId);

    /// Destroy every queued texture under the current context. Returns how
    /// many were freed.
    fn collect_garbage(&self) -> usize;

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferId>;

    fn destroy_framebuffer(&self, framebuffer: FramebufferId);

    /// Copy every layer of mip 0 from `src` into `dst`. Both textures must
    /// share the same description.
    fn copy_texture(&self, src: TextureId, dst: TextureId) -> Result<()>;
}
