//! [`GpuDevice`] backed by wgpu.
//!
//! wgpu has no thread-bound contexts, so contexts are logical: they are
//! tracked per thread with the same rules as a native context pair, which
//! keeps resource ownership explicit when baking from a worker thread.

use crate::gpu_resources::{
    FramebufferDesc, FramebufferId, GpuDevice, TextureDesc, TextureFormat, TextureId, TextureKind,
};
use crate::render_context::{ContextId, ContextRegistry};
use crate::{HelioError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Texture views bound by a framebuffer.
pub struct WgpuFramebuffer {
    pub color: Option<wgpu::TextureView>,
    pub depth: Option<wgpu::TextureView>,
}

pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    contexts: ContextRegistry,
    next_handle: AtomicU64,
    textures: Mutex<HashMap<TextureId, wgpu::Texture>>,
    framebuffers: Mutex<HashMap<FramebufferId, WgpuFramebuffer>>,
    deferred: Mutex<Vec<TextureId>>,
    /// `Rg11b10Ufloat` can only be rendered to with
    /// `Features::RG11B10UFLOAT_RENDERABLE`.
    rg11b10_renderable: bool,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let rg11b10_renderable = device
            .features()
            .contains(wgpu::Features::RG11B10UFLOAT_RENDERABLE);
        if !rg11b10_renderable {
            log::info!("Rg11b10Ufloat is not renderable on this device, using Rgba16Float");
        }
        Self {
            device,
            queue,
            contexts: ContextRegistry::new(),
            next_handle: AtomicU64::new(1),
            textures: Mutex::new(HashMap::new()),
            framebuffers: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            rg11b10_renderable,
        }
    }

    /// Storage format used for `format` on this device.
    pub fn wgpu_format(&self, format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rg11b10Float if self.rg11b10_renderable => {
                wgpu::TextureFormat::Rg11b10Ufloat
            }
            TextureFormat::Rg11b10Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Run `f` with the wgpu texture behind `texture`.
    pub fn with_texture<R>(
        &self,
        texture: TextureId,
        f: impl FnOnce(&wgpu::Texture) -> R,
    ) -> Option<R> {
        self.textures.lock().get(&texture).map(f)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.lock().len()
    }

    /// Run `f` with the views bound by `framebuffer`.
    pub fn with_framebuffer<R>(
        &self,
        framebuffer: FramebufferId,
        f: impl FnOnce(&WgpuFramebuffer) -> R,
    ) -> Option<R> {
        self.framebuffers.lock().get(&framebuffer).map(f)
    }

    fn require_context(&self, action: impl std::fmt::Display) {
        if self.contexts.current().is_none() {
            panic!("{} without a current rendering context", action);
        }
    }

    fn attachment_view(
        textures: &HashMap<TextureId, wgpu::Texture>,
        label: &str,
        attachment: &crate::gpu_resources::Attachment,
    ) -> Result<wgpu::TextureView> {
        let texture = textures.get(&attachment.texture).ok_or_else(|| {
            HelioError::ResourceNotFound(format!(
                "framebuffer '{}' attaches unknown texture {:?}",
                label, attachment.texture
            ))
        })?;
        Ok(texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(label),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: attachment.mip,
            mip_level_count: Some(1),
            base_array_layer: attachment.layer,
            array_layer_count: Some(1),
            ..Default::default()
        }))
    }
}

impl GpuDevice for WgpuDevice {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_context(&self) -> Result<ContextId> {
        Ok(self.contexts.create())
    }

    fn destroy_context(&self, context: ContextId) {
        self.contexts.destroy(context);
    }

    fn make_current(&self, context: ContextId) {
        self.contexts.make_current(context);
    }

    fn release_current(&self, context: ContextId) {
        self.contexts.release_current(context);
    }

    fn current_context(&self) -> Option<ContextId> {
        self.contexts.current()
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        self.require_context(format_args!("texture '{}' created", desc.label));
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(HelioError::InvalidConfiguration(format!(
                "texture '{}' has an empty extent",
                desc.label
            )));
        }
        let layers = match desc.kind {
            TextureKind::Cube => 6,
            TextureKind::D2Array => desc.layers,
        };
        let usage = if desc.format.is_depth() {
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
        } else {
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: layers,
            },
            mip_level_count: desc.mip_level_count.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.wgpu_format(desc.format),
            usage,
            view_formats: &[],
        });
        let id = TextureId::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.textures.lock().insert(id, texture);
        log::debug!(
            "Created texture '{}' ({}x{}x{}) as {:?}",
            desc.label,
            desc.width,
            desc.height,
            layers,
            id
        );
        Ok(id)
    }

    fn destroy_texture(&self, texture: TextureId) {
        self.require_context(format_args!("texture {:?} destroyed", texture));
        match self.textures.lock().remove(&texture) {
            Some(texture) => texture.destroy(),
            None => log::warn!("Texture {:?} destroyed but not alive", texture),
        }
    }

    fn destroy_texture_deferred(&self, texture: TextureId) {
        self.deferred.lock().push(texture);
    }

    fn collect_garbage(&self) -> usize {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for &texture in &deferred {
            self.destroy_texture(texture);
        }
        deferred.len()
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferId> {
        self.require_context(format_args!("framebuffer '{}' created", desc.label));
        let textures = self.textures.lock();
        let color = desc
            .color
            .as_ref()
            .map(|a| Self::attachment_view(&textures, &desc.label, a))
            .transpose()?;
        let depth = desc
            .depth
            .as_ref()
            .map(|a| Self::attachment_view(&textures, &desc.label, a))
            .transpose()?;
        drop(textures);

        let id = FramebufferId::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.framebuffers.lock().insert(id, WgpuFramebuffer { color, depth });
        Ok(id)
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        self.require_context(format_args!("framebuffer {:?} destroyed", framebuffer));
        if self.framebuffers.lock().remove(&framebuffer).is_none() {
            log::warn!("Framebuffer {:?} destroyed but not alive", framebuffer);
        }
    }

    fn copy_texture(&self, src: TextureId, dst: TextureId) -> Result<()> {
        self.require_context(format_args!("texture {:?} copied into {:?}", src, dst));
        let textures = self.textures.lock();
        let (Some(from), Some(to)) = (textures.get(&src), textures.get(&dst)) else {
            return Err(HelioError::ResourceNotFound(format!(
                "copy between {:?} and {:?}",
                src, dst
            )));
        };
        if from.size() != to.size() || from.format() != to.format() {
            return Err(HelioError::InvalidConfiguration(format!(
                "copy between {:?} and {:?} with mismatched extents",
                src, dst
            )));
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Texture Copy"),
            });
        encoder.copy_texture_to_texture(from.as_image_copy(), to.as_image_copy(), from.size());
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}
