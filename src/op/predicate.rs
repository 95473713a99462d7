//! Boolean-valued deferred operations other operations wait on.
//!
//! A [`PredicateOp`] resolves to true or false exactly once. Operations
//! that depend on the value either register as waiters (notified through
//! their predication state after resolution) or proceed directly against
//! the precomputed true/false guard events. Resolution order among waiters
//! is unspecified; waiters must not assume ordering among themselves.

use crate::dispatch::Priority;
use crate::event::{Event, UserEvent};
use crate::op::{
    self, predicated, OpBase, OpKind, Operation,
};
use crate::runtime::Runtime;
use crate::tracing_compat::trace;
use crate::types::{GenerationId, Provenance};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

struct PredicateState {
    resolved: Option<bool>,
    waiters: Vec<(Weak<dyn Operation>, GenerationId)>,
    /// External holders; execution does not finish while any remain.
    references: usize,
    execution_done: bool,
    true_guard: UserEvent,
    false_guard: UserEvent,
}

/// A deferred boolean value gating speculative operations.
pub struct PredicateOp {
    base: OpBase,
    state: Mutex<PredicateState>,
}

impl PredicateOp {
    /// Creates and initializes a predicate operation.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: Option<usize>,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let dispatcher = runtime.dispatcher();
        let this = Arc::new(Self {
            base: OpBase::new(dispatcher),
            state: Mutex::new(PredicateState {
                resolved: None,
                waiters: Vec::new(),
                references: 0,
                execution_done: false,
                true_guard: UserEvent::new(dispatcher),
                false_guard: UserEvent::new(dispatcher),
            }),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, context, provenance);
        runtime.register_operation(&op);
        this
    }

    /// The resolved value, if resolution has happened.
    #[must_use]
    pub fn peek_value(&self) -> Option<bool> {
        self.state.lock().resolved
    }

    /// Guard event that triggers only if the predicate resolves true.
    #[must_use]
    pub fn get_true_guard(&self) -> Event {
        self.state.lock().true_guard.event()
    }

    /// Guard event that triggers only if the predicate resolves false.
    #[must_use]
    pub fn get_false_guard(&self) -> Event {
        self.state.lock().false_guard.event()
    }

    /// Both guards, true first.
    #[must_use]
    pub fn get_predicate_guards(&self) -> (Event, Event) {
        let state = self.state.lock();
        (state.true_guard.event(), state.false_guard.event())
    }

    /// Registers `waiter` (at its current generation) for notification.
    ///
    /// Returns the value synchronously if already resolved; the waiter is
    /// then never added to the waiter set. Returns `None` if the waiter was
    /// recorded and will be notified asynchronously.
    pub fn register_waiter(
        &self,
        waiter: &Arc<dyn Operation>,
        gen: GenerationId,
    ) -> Option<bool> {
        let mut state = self.state.lock();
        if let Some(value) = state.resolved {
            return Some(value);
        }
        state.waiters.push((Arc::downgrade(waiter), gen));
        None
    }

    /// Adds an external holder reference.
    pub fn add_predicate_reference(&self) {
        self.state.lock().references += 1;
    }

    /// Drops an external holder reference; the predicate's execution stage
    /// finishes once resolved and unreferenced.
    pub fn remove_predicate_reference(self: &Arc<Self>, runtime: &Arc<Runtime>) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.references > 0);
            state.references -= 1;
        }
        self.check_execution_done(runtime);
    }

    /// Resolves the predicate, notifying every registered waiter exactly
    /// once. Double resolution is a caller bug.
    pub fn set_resolved_value(self: &Arc<Self>, runtime: &Arc<Runtime>, value: bool) {
        let (waiters, guard) = {
            let mut state = self.state.lock();
            assert!(state.resolved.is_none(), "predicate resolved twice");
            state.resolved = Some(value);
            let guard = if value {
                state.true_guard.clone()
            } else {
                state.false_guard.clone()
            };
            (core::mem::take(&mut state.waiters), guard)
        };
        trace!(op = %self.base.unique_id(), value, waiters = waiters.len(), "predicate resolved");
        guard.trigger();
        for (weak, gen) in waiters {
            let Some(waiter) = weak.upgrade() else {
                continue;
            };
            if waiter.base().generation() != gen {
                continue;
            }
            let weak_rt = Arc::downgrade(runtime);
            runtime.dispatcher().enqueue(Priority::Work, move || {
                if let Some(runtime) = weak_rt.upgrade() {
                    predicated::notify_predicate_value(&waiter, &runtime, value);
                }
            });
        }
        self.check_execution_done(runtime);
    }

    fn check_execution_done(self: &Arc<Self>, runtime: &Arc<Runtime>) {
        let finish = {
            let mut state = self.state.lock();
            if state.execution_done || state.resolved.is_none() || state.references > 0 {
                false
            } else {
                state.execution_done = true;
                true
            }
        };
        if finish {
            let op = self.clone().as_op();
            op::complete_execution(&op, runtime, None);
        }
    }
}

impl fmt::Debug for PredicateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PredicateOp")
            .field("unique_id", &self.base.unique_id())
            .field("resolved", &state.resolved)
            .field("references", &state.references)
            .finish()
    }
}

impl Operation for PredicateOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Predicate
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    // Mapping finishes immediately; execution waits for resolution and the
    // release of every external reference.
    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let this = self.clone();
        let op = self.as_op();
        op::complete_mapping(&op, runtime, None);
        this.check_execution_done(runtime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiter_after_resolution_gets_value_synchronously() {
        let runtime = Runtime::new();
        let predicate = PredicateOp::new(&runtime, None, None);
        predicate.set_resolved_value(&runtime, true);

        let other = PredicateOp::new(&runtime, None, None);
        let waiter = other.as_op();
        assert_eq!(predicate.register_waiter(&waiter, 0), Some(true));
    }

    #[test]
    #[should_panic(expected = "predicate resolved twice")]
    fn double_resolution_panics() {
        let runtime = Runtime::new();
        let predicate = PredicateOp::new(&runtime, None, None);
        predicate.set_resolved_value(&runtime, true);
        predicate.set_resolved_value(&runtime, false);
    }

    #[test]
    fn guards_reflect_resolution() {
        let runtime = Runtime::new();
        let predicate = PredicateOp::new(&runtime, None, None);
        let (true_guard, false_guard) = predicate.get_predicate_guards();
        assert!(!true_guard.has_triggered());
        assert!(!false_guard.has_triggered());

        predicate.set_resolved_value(&runtime, false);
        assert!(!true_guard.has_triggered());
        assert!(false_guard.has_triggered());
    }

    #[test]
    fn references_gate_execution() {
        let runtime = Runtime::new();
        let predicate = PredicateOp::new(&runtime, None, None);
        predicate.add_predicate_reference();
        predicate.set_resolved_value(&runtime, true);
        runtime.dispatcher().run_until_quiescent();
        assert!(!predicate.base().is_completed());

        predicate.remove_predicate_reference(&runtime);
        // Drive the rest of the pipeline.
        let op = predicate.clone().as_op();
        op::begin_dependence_analysis(&op);
        op::end_dependence_analysis(&op, &runtime);
        runtime.dispatcher().run_until_quiescent();
        assert!(predicate.base().generation() > 0);
    }
}
