//! Rendering context identity and per-thread binding.
//!
//! GPU objects are scoped to the context they were created under. The main
//! context is shared with the interactive viewport; additional contexts are
//! created for work that runs on a worker thread and are exclusive to it.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::thread::{self, ThreadId};

/// Opaque handle to a rendering context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// The shared context owned by the main (display) thread.
    pub const MAIN: ContextId = ContextId(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_main(self) -> bool {
        self == Self::MAIN
    }
}

#[derive(Default)]
struct Bindings {
    live: HashSet<ContextId>,
    by_thread: HashMap<ThreadId, ContextId>,
    by_context: HashMap<ContextId, ThreadId>,
    next_id: u64,
}

/// Book-keeping of which context is current on which thread.
///
/// Misuse (binding a context that is current elsewhere, releasing a context
/// that is not current, destroying a bound context) is a programming error
/// and panics.
pub struct ContextRegistry {
    bindings: Mutex<Bindings>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        let mut bindings = Bindings {
            next_id: 1,
            ..Default::default()
        };
        bindings.live.insert(ContextId::MAIN);
        Self {
            bindings: Mutex::new(bindings),
        }
    }

    /// Register a new dedicated context.
    pub fn create(&self) -> ContextId {
        let mut bindings = self.bindings.lock();
        let id = ContextId(bindings.next_id);
        bindings.next_id += 1;
        bindings.live.insert(id);
        log::debug!("Created rendering context {:?}", id);
        id
    }

    pub fn destroy(&self, context: ContextId) {
        assert!(
            !context.is_main(),
            "the main rendering context cannot be destroyed"
        );
        let mut bindings = self.bindings.lock();
        assert!(
            !bindings.by_context.contains_key(&context),
            "rendering context {:?} destroyed while still current",
            context
        );
        if !bindings.live.remove(&context) {
            panic!("rendering context {:?} destroyed twice", context);
        }
        log::debug!("Destroyed rendering context {:?}", context);
    }

    pub fn make_current(&self, context: ContextId) {
        let thread = thread::current().id();
        let mut bindings = self.bindings.lock();
        assert!(
            bindings.live.contains(&context),
            "rendering context {:?} is not alive",
            context
        );
        if let Some(owner) = bindings.by_context.get(&context) {
            panic!(
                "rendering context {:?} is already current on thread {:?}",
                context, owner
            );
        }
        if let Some(active) = bindings.by_thread.get(&thread) {
            panic!(
                "thread {:?} already has rendering context {:?} current",
                thread, active
            );
        }
        bindings.by_thread.insert(thread, context);
        bindings.by_context.insert(context, thread);
    }

    pub fn release_current(&self, context: ContextId) {
        let thread = thread::current().id();
        let mut bindings = self.bindings.lock();
        match bindings.by_thread.get(&thread) {
            Some(&active) if active == context => {
                bindings.by_thread.remove(&thread);
                bindings.by_context.remove(&context);
            }
            other => panic!(
                "releasing rendering context {:?} but {:?} is current on this thread",
                context, other
            ),
        }
    }

    /// Context current on the calling thread, if any.
    pub fn current(&self) -> Option<ContextId> {
        let thread = thread::current().id();
        self.bindings.lock().by_thread.get(&thread).copied()
    }

    pub fn live_count(&self) -> usize {
        self.bindings.lock().live.len()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}
