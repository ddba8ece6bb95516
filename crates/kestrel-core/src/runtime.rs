//! The engine root: one collector shared by every space and context it
//! creates.
//!
//! A [`Runtime`] hands out module spaces and execution contexts wired to
//! its collector, and drives collections with the registered spaces as
//! implicit roots. Contexts are passed in explicitly at collection time;
//! the runtime never retains them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::gc::{CollectStats, Collector, GcRoot};
use crate::module::loader::ModLoader;
use crate::module::space::ModSpace;
use crate::vm::VmContext;

pub struct Runtime {
    gc: Arc<Collector>,
    spaces: Mutex<Vec<Weak<ModSpace>>>,
    next_context: AtomicU32,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Runtime {
            gc: Arc::new(Collector::new()),
            spaces: Mutex::new(Vec::new()),
            next_context: AtomicU32::new(1),
        })
    }

    #[must_use]
    pub fn collector(&self) -> &Arc<Collector> {
        &self.gc
    }

    /// Creates a space backed by this runtime's collector and registers it
    /// as a collection root for as long as it stays alive.
    pub fn new_space(
        &self,
        parent: Option<Arc<ModSpace>>,
        loader: Arc<ModLoader>,
    ) -> Arc<ModSpace> {
        let space = ModSpace::new(Arc::clone(&self.gc), parent, loader);
        self.spaces.lock().unwrap().push(Arc::downgrade(&space));
        space
    }

    /// Creates an execution context with a fresh id.
    #[must_use]
    pub fn new_context(&self, space: Option<Arc<ModSpace>>) -> VmContext {
        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        VmContext::new(id, Arc::clone(&self.gc), space)
    }

    /// Runs a collection with the live spaces and the given contexts as
    /// roots. Dead space registrations are pruned on the way.
    pub fn collect(&self, contexts: &[&VmContext]) -> CollectStats {
        let live: Vec<Arc<ModSpace>> = {
            let mut spaces = self.spaces.lock().unwrap();
            spaces.retain(|w| w.strong_count() > 0);
            spaces.iter().filter_map(Weak::upgrade).collect()
        };
        let mut roots: Vec<&dyn GcRoot> = Vec::with_capacity(contexts.len() + live.len());
        for ctx in contexts {
            roots.push(*ctx);
        }
        for space in &live {
            roots.push(space.as_ref());
        }
        self.gc.collect(&roots)
    }
}
