//! Rendering context ownership for a bake, and its transient render targets.

use crate::Result;
use helio_core::{
    Attachment, ContextId, FramebufferDesc, FramebufferId, GpuDevice, TextureDesc, TextureFormat,
    TextureId,
};
use std::sync::Arc;

/// The context a bake renders under: the shared main context, or a dedicated
/// one created for a worker thread and destroyed with this value.
pub struct BakeContext {
    device: Arc<dyn GpuDevice>,
    context: ContextId,
    dedicated: bool,
}

impl BakeContext {
    pub fn main(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            context: ContextId::MAIN,
            dedicated: false,
        }
    }

    pub fn dedicated(device: Arc<dyn GpuDevice>) -> Result<Self> {
        let context = device.create_context()?;
        log::debug!("Created dedicated bake context {:?} on '{}'", context, device.name());
        Ok(Self {
            device,
            context,
            dedicated: true,
        })
    }

    pub fn new(device: Arc<dyn GpuDevice>, dedicated: bool) -> Result<Self> {
        if dedicated {
            Self::dedicated(device)
        } else {
            Ok(Self::main(device))
        }
    }

    pub fn id(&self) -> ContextId {
        self.context
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Make the context current on this thread until the guard drops, and
    /// free textures whose release was deferred. Entering a context that is
    /// already current here is a no-op.
    pub fn enter(&self) -> ContextGuard<'_> {
        let owned = self.device.current_context() != Some(self.context);
        if owned {
            self.device.make_current(self.context);
            let collected = self.device.collect_garbage();
            if collected > 0 {
                log::debug!("Freed {} deferred textures", collected);
            }
        }
        ContextGuard { bake: self, owned }
    }

    /// Panics unless this context is current on the calling thread.
    pub fn assert_current(&self) {
        let current = self.device.current_context();
        assert!(
            current == Some(self.context),
            "bake context {:?} is not current on this thread (current: {:?})",
            self.context,
            current
        );
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        self.assert_current();
        Ok(self.device.create_texture(desc)?)
    }

    pub fn destroy_texture(&self, texture: TextureId) {
        self.assert_current();
        self.device.destroy_texture(texture);
    }

    /// Six-face color and depth targets with one framebuffer per face, and
    /// the framebuffer filters write through.
    pub fn create_render_targets(&self, resolution: u32) -> Result<BakeTargets> {
        self.assert_current();
        let mut textures = Vec::new();
        let mut framebuffers = Vec::new();
        match self.build_targets(resolution, &mut textures, &mut framebuffers) {
            Ok(targets) => {
                log::debug!("Created {}px bake render targets", resolution);
                Ok(targets)
            }
            Err(e) => {
                for framebuffer in framebuffers {
                    self.device.destroy_framebuffer(framebuffer);
                }
                for texture in textures {
                    self.device.destroy_texture(texture);
                }
                Err(e)
            }
        }
    }

    fn build_targets(
        &self,
        resolution: u32,
        textures: &mut Vec<TextureId>,
        framebuffers: &mut Vec<FramebufferId>,
    ) -> Result<BakeTargets> {
        // Full mip chain for the glossy filter.
        let mips = resolution.max(1).ilog2() + 1;
        let color = self.device.create_texture(&TextureDesc::cube(
            "bake_rt_color",
            resolution,
            TextureFormat::Rgba16Float,
            mips,
        ))?;
        textures.push(color);
        let depth = self.device.create_texture(&TextureDesc::cube(
            "bake_rt_depth",
            resolution,
            TextureFormat::Depth32Float,
            1,
        ))?;
        textures.push(depth);

        for face in 0..6 {
            let framebuffer = self.device.create_framebuffer(&FramebufferDesc {
                label: format!("bake_rt_face_{}", face),
                color: Some(Attachment::layer(color, face)),
                depth: Some(Attachment::layer(depth, face)),
            })?;
            framebuffers.push(framebuffer);
        }
        let store_framebuffer = self.device.create_framebuffer(&FramebufferDesc {
            label: "bake_store".to_string(),
            ..Default::default()
        })?;
        framebuffers.push(store_framebuffer);

        Ok(BakeTargets {
            resolution,
            color,
            depth,
            face_framebuffers: std::array::from_fn(|face| framebuffers[face]),
            store_framebuffer,
        })
    }

    pub fn destroy_render_targets(&self, targets: BakeTargets) {
        self.assert_current();
        for framebuffer in targets.face_framebuffers {
            self.device.destroy_framebuffer(framebuffer);
        }
        self.device.destroy_framebuffer(targets.store_framebuffer);
        self.device.destroy_texture(targets.color);
        self.device.destroy_texture(targets.depth);
        log::debug!("Destroyed {}px bake render targets", targets.resolution);
    }
}

impl Drop for BakeContext {
    fn drop(&mut self) {
        if self.dedicated {
            self.device.destroy_context(self.context);
            log::debug!("Destroyed dedicated bake context {:?}", self.context);
        }
    }
}

/// Releases the context on drop, including on early returns.
pub struct ContextGuard<'a> {
    bake: &'a BakeContext,
    owned: bool,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.bake.device.release_current(self.bake.context);
        }
    }
}

/// Transient targets every probe renders into.
#[derive(Debug)]
pub struct BakeTargets {
    pub resolution: u32,
    pub color: TextureId,
    pub depth: TextureId,
    pub face_framebuffers: [FramebufferId; 6],
    /// Target of the filter passes; attachments are bound per pass.
    pub store_framebuffer: FramebufferId,
}
