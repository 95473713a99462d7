//! Physical-trace memoization state for operations that can be replayed.
//!
//! The first time a trace shape is seen, physical analysis runs normally
//! but is captured into a reusable template. Subsequent occurrences skip
//! analysis entirely: the mapping stage short-circuits into a replay of the
//! captured template.

use crate::event::Event;
use crate::op::{self, Operation};
use crate::runtime::Runtime;
use crate::tracing_compat::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Memoization progress of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoStatus {
    /// The mapper has not opted in.
    NoMemo,
    /// Opted in; record-or-replay not yet decided.
    MemoReq,
    /// First occurrence of this trace shape: capture while mapping.
    Record,
    /// Template exists: skip analysis and replay it.
    Replay,
}

/// A captured physical-analysis template keyed by trace shape.
#[derive(Debug)]
pub struct PhysicalTemplate {
    shape: u64,
    replays: AtomicUsize,
}

impl PhysicalTemplate {
    fn new(shape: u64) -> Self {
        Self {
            shape,
            replays: AtomicUsize::new(0),
        }
    }

    /// The trace shape this template was captured for.
    #[must_use]
    pub const fn shape(&self) -> u64 {
        self.shape
    }

    /// Number of replays of this template so far.
    #[must_use]
    pub fn replay_count(&self) -> usize {
        self.replays.load(Ordering::Relaxed)
    }
}

/// Runtime-wide table of captured templates.
#[derive(Debug, Default)]
pub struct TraceCache {
    templates: HashMap<u64, Arc<PhysicalTemplate>>,
}

impl TraceCache {
    /// Looks up the template for `shape`, creating one if absent.
    /// Returns the template and whether it already existed.
    pub fn find_or_record(&mut self, shape: u64) -> (Arc<PhysicalTemplate>, bool) {
        if let Some(existing) = self.templates.get(&shape) {
            (Arc::clone(existing), true)
        } else {
            let template = Arc::new(PhysicalTemplate::new(shape));
            self.templates.insert(shape, Arc::clone(&template));
            (template, false)
        }
    }

    /// Number of captured templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// True if no template has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Per-operation memoization capability state.
#[derive(Debug, Default)]
pub struct MemoState {
    inner: Mutex<MemoInner>,
}

#[derive(Debug)]
struct MemoInner {
    status: MemoStatus,
    template: Option<Arc<PhysicalTemplate>>,
}

impl Default for MemoInner {
    fn default() -> Self {
        Self {
            status: MemoStatus::NoMemo,
            template: None,
        }
    }
}

impl MemoState {
    /// Current memoization status.
    #[must_use]
    pub fn status(&self) -> MemoStatus {
        self.inner.lock().status
    }

    /// The template being recorded or replayed, if any.
    #[must_use]
    pub fn template(&self) -> Option<Arc<PhysicalTemplate>> {
        self.inner.lock().template.clone()
    }

    /// True if the mapping stage should route into a replay.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.status() == MemoStatus::Replay
    }
}

/// Asks the mapper whether to memoize `op`, and if so decides between
/// recording and replaying based on whether `shape` was seen before.
pub fn invoke_memoize_operation(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>, shape: u64) {
    let Some(memo) = op.memo() else {
        return;
    };
    {
        let inner = memo.inner.lock();
        if inner.status != MemoStatus::NoMemo {
            return;
        }
    }
    if !runtime.mapper().memoize_operation(op) {
        return;
    }
    let (template, existing) = runtime.trace_cache().lock().find_or_record(shape);
    let status = if existing {
        MemoStatus::Replay
    } else {
        MemoStatus::Record
    };
    debug!(op = %op.base().unique_id(), shape, ?status, "memoizing");
    let mut inner = memo.inner.lock();
    // MemoReq is transient: decided in the same call.
    inner.status = status;
    inner.template = Some(template);
}

/// Computes the synchronization precondition for a replay. Side-effect
/// free; callable any number of times.
#[must_use]
pub fn compute_sync_precondition(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) -> Event {
    op.base()
        .execution_fence_event()
        .unwrap_or_else(|| Event::triggered(runtime.dispatcher()))
}

/// Finishes a replayed operation: the supplied event stands in for the
/// completion the skipped analysis would have produced.
pub fn complete_replay(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>, completion: Event) {
    let Some(memo) = op.memo() else {
        debug_assert!(false, "replay completion on non-memoizable operation");
        return;
    };
    let template = memo.inner.lock().template.clone();
    if let Some(template) = template {
        template.replays.fetch_add(1, Ordering::Relaxed);
    }
    op::complete_mapping(op, runtime, None);
    op::complete_execution(op, runtime, Some(completion));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_shape_records_second_replays() {
        let mut cache = TraceCache::default();
        let (first, existing) = cache.find_or_record(42);
        assert!(!existing);
        let (second, existing) = cache.find_or_record(42);
        assert!(existing);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_shapes_get_distinct_templates() {
        let mut cache = TraceCache::default();
        let (a, _) = cache.find_or_record(1);
        let (b, _) = cache.find_or_record(2);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.shape(), 1);
        assert_eq!(b.shape(), 2);
    }

    #[test]
    fn memo_state_defaults_to_no_memo() {
        let state = MemoState::default();
        assert_eq!(state.status(), MemoStatus::NoMemo);
        assert!(state.template().is_none());
        assert!(!state.is_replaying());
    }
}
