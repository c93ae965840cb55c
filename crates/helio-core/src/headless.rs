//! A [`GpuDevice`] without a GPU.
//!
//! Keeps full book-keeping of every object it hands out so that resource
//! lifetime and context discipline can be checked by tests and by tools that
//! run without a display.

use crate::gpu_resources::{
    FramebufferDesc, FramebufferId, GpuDevice, ResourceHandle, TextureDesc, TextureId,
};
use crate::render_context::{ContextId, ContextRegistry};
use crate::{HelioError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Counters of everything the device did since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub textures_created: usize,
    pub textures_destroyed: usize,
    pub framebuffers_created: usize,
    pub framebuffers_destroyed: usize,
    pub contexts_created: usize,
    pub contexts_destroyed: usize,
    pub copies: usize,
    /// Destroy calls for handles that were not alive.
    pub double_frees: usize,
    pub deferred_destroys: usize,
}

#[derive(Debug, Clone)]
pub struct TextureRecord {
    pub desc: TextureDesc,
    /// Context that was current when the texture was created.
    pub context: ContextId,
}

#[derive(Debug, Clone)]
pub struct FramebufferRecord {
    pub desc: FramebufferDesc,
    pub context: ContextId,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: ResourceHandle,
    textures: HashMap<TextureId, TextureRecord>,
    framebuffers: HashMap<FramebufferId, FramebufferRecord>,
    /// Waiting for the next `collect_garbage`.
    deferred: Vec<TextureId>,
    stats: HeadlessStats,
    /// Remaining successful allocations before creation starts failing.
    allocation_budget: Option<usize>,
}

pub struct HeadlessDevice {
    contexts: ContextRegistry,
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            contexts: ContextRegistry::new(),
            state: Mutex::new(HeadlessState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    /// Contexts alive besides the main one.
    pub fn live_dedicated_contexts(&self) -> usize {
        self.contexts.live_count() - 1
    }

    pub fn texture(&self, texture: TextureId) -> Option<TextureRecord> {
        self.state.lock().textures.get(&texture).cloned()
    }

    pub fn framebuffer(&self, framebuffer: FramebufferId) -> Option<FramebufferRecord> {
        self.state.lock().framebuffers.get(&framebuffer).cloned()
    }

    /// Textures queued with `destroy_texture_deferred` and not collected yet.
    pub fn pending_destroys(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Make texture/framebuffer creation fail once `successes` more objects
    /// have been created. `None` removes the limit.
    pub fn set_allocation_budget(&self, successes: Option<usize>) {
        self.state.lock().allocation_budget = successes;
    }

    fn require_context(&self, action: impl std::fmt::Display) -> ContextId {
        match self.contexts.current() {
            Some(context) => context,
            None => panic!("{} without a current rendering context", action),
        }
    }

    fn remove_texture(state: &mut HeadlessState, texture: TextureId) {
        if state.textures.remove(&texture).is_some() {
            state.stats.textures_destroyed += 1;
        } else {
            log::warn!("headless: texture {:?} destroyed but not alive", texture);
            state.stats.double_frees += 1;
        }
    }

    fn next_handle(state: &mut HeadlessState, label: &str) -> Result<ResourceHandle> {
        if let Some(budget) = state.allocation_budget.as_mut() {
            if *budget == 0 {
                return Err(HelioError::OutOfMemory(format!(
                    "headless allocation budget exhausted creating '{}'",
                    label
                )));
            }
            *budget -= 1;
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(handle)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_context(&self) -> Result<ContextId> {
        let context = self.contexts.create();
        self.state.lock().stats.contexts_created += 1;
        Ok(context)
    }

    fn destroy_context(&self, context: ContextId) {
        self.contexts.destroy(context);
        self.state.lock().stats.contexts_destroyed += 1;
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
        let context = self.require_context(format_args!("texture '{}' created", desc.label));
        let mut state = self.state.lock();
        let id = TextureId::from_raw(Self::next_handle(&mut state, &desc.label)?);
        state.textures.insert(
            id,
            TextureRecord {
                desc: desc.clone(),
                context,
            },
        );
        state.stats.textures_created += 1;
        log::trace!("headless: created texture '{}' {:?}", desc.label, id);
        Ok(id)
    }

    fn destroy_texture(&self, texture: TextureId) {
        self.require_context(format_args!("texture {:?} destroyed", texture));
        Self::remove_texture(&mut self.state.lock(), texture);
    }

    fn destroy_texture_deferred(&self, texture: TextureId) {
        let mut state = self.state.lock();
        state.deferred.push(texture);
        state.stats.deferred_destroys += 1;
    }

    fn collect_garbage(&self) -> usize {
        let mut state = self.state.lock();
        if state.deferred.is_empty() {
            return 0;
        }
        drop(state);
        self.require_context("deferred textures collected");
        let mut state = self.state.lock();
        let deferred = std::mem::take(&mut state.deferred);
        for &texture in &deferred {
            Self::remove_texture(&mut state, texture);
        }
        log::trace!("headless: collected {} deferred textures", deferred.len());
        deferred.len()
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferId> {
        let context = self.require_context(format_args!("framebuffer '{}' created", desc.label));
        let mut state = self.state.lock();
        for attachment in desc.color.iter().chain(desc.depth.iter()) {
            let Some(record) = state.textures.get(&attachment.texture) else {
                return Err(HelioError::ResourceNotFound(format!(
                    "framebuffer '{}' attaches unknown texture {:?}",
                    desc.label, attachment.texture
                )));
            };
            if attachment.layer >= record.desc.layers
                || attachment.mip >= record.desc.mip_level_count
            {
                return Err(HelioError::InvalidConfiguration(format!(
                    "framebuffer '{}' attaches layer {} mip {} of '{}'",
                    desc.label, attachment.layer, attachment.mip, record.desc.label
                )));
            }
        }
        let id = FramebufferId::from_raw(Self::next_handle(&mut state, &desc.label)?);
        state.framebuffers.insert(
            id,
            FramebufferRecord {
                desc: desc.clone(),
                context,
            },
        );
        state.stats.framebuffers_created += 1;
        Ok(id)
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        let context = self.require_context(format_args!("framebuffer {:?} destroyed", framebuffer));
        let mut state = self.state.lock();
        if let Some(record) = state.framebuffers.remove(&framebuffer) {
            assert!(
                record.context == context,
                "framebuffer '{}' belongs to context {:?} but was destroyed under {:?}",
                record.desc.label,
                record.context,
                context
            );
            state.stats.framebuffers_destroyed += 1;
        } else {
            log::warn!("headless: framebuffer {:?} destroyed but not alive", framebuffer);
            state.stats.double_frees += 1;
        }
    }

    fn copy_texture(&self, src: TextureId, dst: TextureId) -> Result<()> {
        self.require_context(format_args!("texture {:?} copied into {:?}", src, dst));
        let mut state = self.state.lock();
        let (Some(from), Some(to)) = (state.textures.get(&src), state.textures.get(&dst)) else {
            return Err(HelioError::ResourceNotFound(format!(
                "copy between {:?} and {:?}",
                src, dst
            )));
        };
        if from.desc.width != to.desc.width
            || from.desc.height != to.desc.height
            || from.desc.layers != to.desc.layers
            || from.desc.format != to.desc.format
        {
            return Err(HelioError::InvalidConfiguration(format!(
                "copy from '{}' to '{}' with mismatched extents",
                from.desc.label, to.desc.label
            )));
        }
        state.stats.copies += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_resources::{Attachment, TextureFormat};

    #[test]
    fn tracks_creation_context_and_frees() {
        let device = HeadlessDevice::new();
        device.make_current(ContextId::MAIN);

        let tex = device
            .create_texture(&TextureDesc::array_2d("atlas", 64, 64, 4, TextureFormat::Rgba8Unorm))
            .unwrap();
        assert_eq!(device.texture(tex).unwrap().context, ContextId::MAIN);

        device.destroy_texture(tex);
        device.destroy_texture(tex);
        device.release_current(ContextId::MAIN);

        let stats = device.stats();
        assert_eq!(stats.textures_created, 1);
        assert_eq!(stats.textures_destroyed, 1);
        assert_eq!(stats.double_frees, 1);
    }

    #[test]
    #[should_panic(expected = "without a current rendering context")]
    fn creation_outside_context_panics() {
        let device = HeadlessDevice::new();
        let _ = device.create_texture(&TextureDesc::cube("rt", 16, TextureFormat::Rgba16Float, 1));
    }

    #[test]
    fn budget_turns_into_out_of_memory() {
        let device = HeadlessDevice::new();
        device.make_current(ContextId::MAIN);
        device.set_allocation_budget(Some(1));

        let cube = device
            .create_texture(&TextureDesc::cube("rt", 16, TextureFormat::Rgba16Float, 1))
            .unwrap();
        let err = device
            .create_framebuffer(&FramebufferDesc {
                label: "face".into(),
                color: Some(Attachment::layer(cube, 0)),
                depth: None,
            })
            .unwrap_err();
        assert!(matches!(err, HelioError::OutOfMemory(_)));
        device.release_current(ContextId::MAIN);
    }

    #[test]
    fn copy_requires_matching_extents() {
        let device = HeadlessDevice::new();
        device.make_current(ContextId::MAIN);
        let a = device
            .create_texture(&TextureDesc::array_2d("a", 8, 8, 2, TextureFormat::Rgba8Unorm))
            .unwrap();
        let b = device
            .create_texture(&TextureDesc::array_2d("b", 8, 8, 2, TextureFormat::Rgba8Unorm))
            .unwrap();
        let c = device
            .create_texture(&TextureDesc::array_2d("c", 16, 8, 2, TextureFormat::Rgba8Unorm))
            .unwrap();

        assert!(device.copy_texture(a, b).is_ok());
        assert!(device.copy_texture(a, c).is_err());
        assert_eq!(device.stats().copies, 1);
        device.release_current(ContextId::MAIN);
    }

    #[test]
    #[should_panic(expected = "destroyed without a current rendering context")]
    fn destruction_outside_context_panics() {
        let device = HeadlessDevice::new();
        device.make_current(ContextId::MAIN);
        let tex = device
            .create_texture(&TextureDesc::array_2d("atlas", 8, 8, 2, TextureFormat::Rgba8Unorm))
            .unwrap();
        device.release_current(ContextId::MAIN);
        device.destroy_texture(tex);
    }

    #[test]
    #[should_panic(expected = "copied into")]
    fn copy_outside_context_panics() {
        let device = HeadlessDevice::new();
        device.make_current(ContextId::MAIN);
        let desc = TextureDesc::array_2d("grid", 8, 8, 2, TextureFormat::Rgba8Unorm);
        let a = device.create_texture(&desc).unwrap();
        let b = device.create_texture(&desc).unwrap();
        device.release_current(ContextId::MAIN);
        let _ = device.copy_texture(a, b);
    }

    #[test]
    #[should_panic(expected = "belongs to context")]
    fn framebuffers_are_destroyed_by_their_context() {
        let device = HeadlessDevice::new();
        let worker = device.create_context().unwrap();
        device.make_current(worker);
        let framebuffer = device
            .create_framebuffer(&FramebufferDesc {
                label: "store".into(),
                ..Default::default()
            })
            .unwrap();
        device.release_current(worker);

        device.make_current(ContextId::MAIN);
        device.destroy_framebuffer(framebuffer);
    }

    #[test]
    fn deferred_textures_wait_for_a_context() {
        let device = HeadlessDevice::new();
        device.make_current(ContextId::MAIN);
        let tex = device
            .create_texture(&TextureDesc::array_2d("atlas", 8, 8, 2, TextureFormat::Rgba8Unorm))
            .unwrap();
        device.release_current(ContextId::MAIN);

        device.destroy_texture_deferred(tex);
        assert_eq!(device.pending_destroys(), 1);
        assert_eq!(device.live_textures(), 1);
        // Nothing queued needs no context.
        assert_eq!(HeadlessDevice::new().collect_garbage(), 0);

        device.make_current(ContextId::MAIN);
        assert_eq!(device.collect_garbage(), 1);
        device.release_current(ContextId::MAIN);
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.pending_destroys(), 0);
        assert_eq!(device.stats().deferred_destroys, 1);
    }
}
