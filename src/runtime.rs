//! The runtime instance: operation pool, contexts, and collaborators.
//!
//! A [`Runtime`] owns the dispatcher every event and stage runs through,
//! the arena of live operations (generation-stamped slots, so a retired
//! id can never observe a reused slot), the context table, the trace
//! cache, and handles to the region-forest and mapper collaborators.
//! There is no hidden process-wide singleton; tests build as many
//! runtimes as they like.

use crate::context::InnerContext;
use crate::dispatch::Dispatcher;
use crate::forest::{InMemoryForest, RegionForest};
use crate::mapper::{DefaultMapper, Mapper};
use crate::op::memo::TraceCache;
use crate::op::Operation;
use crate::types::{OpId, UniqueOpId};
use crate::util::Arena;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The engine instance wiring everything together.
pub struct Runtime {
    dispatcher: Dispatcher,
    forest: Arc<dyn RegionForest>,
    mapper: Arc<dyn Mapper>,
    pool: Mutex<Arena<Arc<dyn Operation>>>,
    contexts: Mutex<Vec<Arc<InnerContext>>>,
    trace_cache: Mutex<TraceCache>,
    next_unique: AtomicU64,
}

impl Runtime {
    /// Creates a runtime with the in-memory forest and the default mapper.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_collaborators(
            Arc::new(InMemoryForest::default()),
            Arc::new(DefaultMapper),
        )
    }

    /// Creates a runtime with explicit collaborators.
    #[must_use]
    pub fn with_collaborators(
        forest: Arc<dyn RegionForest>,
        mapper: Arc<dyn Mapper>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Dispatcher::new(),
            forest,
            mapper,
            pool: Mutex::new(Arena::new()),
            contexts: Mutex::new(Vec::new()),
            trace_cache: Mutex::new(TraceCache::default()),
            // Unique id 0 is reserved for "not yet initialized".
            next_unique: AtomicU64::new(1),
        })
    }

    /// The dispatcher all stage work runs through.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The region-tree collaborator.
    #[must_use]
    pub fn forest(&self) -> &Arc<dyn RegionForest> {
        &self.forest
    }

    /// The mapper collaborator.
    #[must_use]
    pub fn mapper(&self) -> &Arc<dyn Mapper> {
        &self.mapper
    }

    /// The table of captured physical templates.
    #[must_use]
    pub fn trace_cache(&self) -> &Mutex<TraceCache> {
        &self.trace_cache
    }

    /// Allocates the next process-unique operation id.
    #[must_use]
    pub fn next_unique_id(&self) -> UniqueOpId {
        UniqueOpId(self.next_unique.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds an operation to the live pool and stamps it with its pool id.
    pub fn register_operation(&self, op: &Arc<dyn Operation>) -> OpId {
        let index = self.pool.lock().insert(op.clone());
        let op_id = OpId::from_arena(index);
        op.base().assign_op_id(op_id);
        op_id
    }

    /// Removes a retired operation from the live pool. The slot's
    /// generation advances, so the old id goes stale.
    pub fn release_operation(&self, op_id: OpId) {
        self.pool.lock().remove(op_id.arena_index());
    }

    /// Looks up a live operation; stale ids return `None`.
    #[must_use]
    pub fn find_operation(&self, op_id: OpId) -> Option<Arc<dyn Operation>> {
        self.pool.lock().get(op_id.arena_index()).cloned()
    }

    /// Number of operations currently live.
    #[must_use]
    pub fn live_operations(&self) -> usize {
        self.pool.lock().len()
    }

    /// Creates a new issuing context.
    pub fn create_context(&self) -> Arc<InnerContext> {
        let mut contexts = self.contexts.lock();
        let context = Arc::new(InnerContext::new(contexts.len(), &self.dispatcher));
        contexts.push(context.clone());
        context
    }

    /// Looks up a context by index.
    #[must_use]
    pub fn context(&self, index: usize) -> Option<Arc<InnerContext>> {
        self.contexts.lock().get(index).cloned()
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Runtime(live_ops={}, contexts={})",
            self.live_operations(),
            self.contexts.lock().len()
        )
    }
}
