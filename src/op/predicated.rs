//! Predication and speculation state for operations gated on a predicate.
//!
//! A predicated operation may begin mapping before its predicate resolves
//! if the mapper guesses a value (`query_speculate`). Once the predicate
//! resolves, exactly one of `resolve_true`/`resolve_false` runs, carrying
//! whether the operation had speculated and whether it had already entered
//! the execution pipeline, so it can reconcile outcome against guess.

use crate::op::predicate::PredicateOp;
use crate::op::{self, Operation};
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;

/// Speculation progress of one predicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecState {
    /// Dependence analysis has not consulted the predicate yet.
    PendingAnalysis,
    /// Predicate unresolved; mapping is held back.
    WaitingMapping,
    /// Mapping proceeds on a mapper-guessed value.
    SpeculativeMapping,
    /// Predicate resolved true.
    ResolveTrue,
    /// Predicate resolved false.
    ResolveFalse,
}

#[derive(Debug)]
struct PredicatedInner {
    state: SpecState,
    predicate: Option<Arc<PredicateOp>>,
    guess: Option<bool>,
    speculated: bool,
    launched: bool,
    resolution_delivered: bool,
}

/// Per-operation predication capability state.
pub struct PredicatedState {
    inner: Mutex<PredicatedInner>,
}

impl Default for PredicatedState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PredicatedInner {
                state: SpecState::PendingAnalysis,
                predicate: None,
                guess: None,
                speculated: false,
                launched: false,
                resolution_delivered: false,
            }),
        }
    }
}

impl PredicatedState {
    /// Current speculation state.
    #[must_use]
    pub fn state(&self) -> SpecState {
        self.inner.lock().state
    }

    /// True once the operation began mapping on a guessed value.
    #[must_use]
    pub fn speculated(&self) -> bool {
        self.inner.lock().speculated
    }

    /// Marks entry into the execution pipeline.
    pub fn set_launched(&self) {
        self.inner.lock().launched = true;
    }

    /// The predicate this operation waits on, if any.
    #[must_use]
    pub fn predicate(&self) -> Option<Arc<PredicateOp>> {
        self.inner.lock().predicate.clone()
    }
}

/// Attaches a predicate (or none) to `op` during initialization.
///
/// With no predicate the operation resolves true immediately. With one, a
/// waiter is registered; if the predicate already resolved, the transition
/// happens synchronously here.
pub fn initialize_predication(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    predicate: Option<Arc<PredicateOp>>,
) {
    let Some(capability) = op.predicated() else {
        debug_assert!(predicate.is_none(), "predicate on unpredicated operation");
        return;
    };
    let Some(predicate) = predicate else {
        capability.inner.lock().state = SpecState::ResolveTrue;
        return;
    };
    predicate.add_predicate_reference();
    let gen = op.base().generation();
    {
        let mut inner = capability.inner.lock();
        inner.predicate = Some(predicate.clone());
        inner.state = SpecState::WaitingMapping;
    }
    if let Some(value) = predicate.register_waiter(op, gen) {
        notify_predicate_value(op, runtime, value);
    }
}

/// Asks the mapper whether to map speculatively before resolution.
///
/// Returns the guessed value if speculation begins, `None` if mapping must
/// wait for the predicate.
pub fn query_speculate(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) -> Option<bool> {
    let capability = op.predicated()?;
    {
        let inner = capability.inner.lock();
        match inner.state {
            SpecState::WaitingMapping => {}
            // Already resolved or already speculating.
            _ => return None,
        }
    }
    let guess = runtime.mapper().speculate(op)?;
    let mut inner = capability.inner.lock();
    if inner.state != SpecState::WaitingMapping {
        return None;
    }
    inner.state = SpecState::SpeculativeMapping;
    inner.speculated = true;
    inner.guess = Some(guess);
    trace!(op = %op.base().unique_id(), guess, "speculating");
    Some(guess)
}

/// Predicate-resolution callback. Drives the operation into exactly one of
/// `resolve_true`/`resolve_false`; safe to invoke from a different
/// asynchronous completion than the one that created the operation.
pub fn notify_predicate_value(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>, value: bool) {
    let Some(capability) = op.predicated() else {
        debug_assert!(false, "predicate value on unpredicated operation");
        return;
    };
    let (speculated, launched, predicate) = {
        let mut inner = capability.inner.lock();
        if inner.resolution_delivered {
            return;
        }
        inner.resolution_delivered = true;
        inner.state = if value {
            SpecState::ResolveTrue
        } else {
            SpecState::ResolveFalse
        };
        (inner.speculated, inner.launched, inner.predicate.take())
    };
    debug!(
        op = %op.base().unique_id(),
        value,
        speculated,
        launched,
        "predicate resolved for operation"
    );
    if let Some(predicate) = predicate {
        predicate.remove_predicate_reference(runtime);
    }
    if value {
        op.clone().resolve_true(runtime, speculated, launched);
    } else {
        op.clone().resolve_false(runtime, speculated, launched);
    }
}

/// Default true-resolution behavior: unblock the resolution stage.
pub fn default_resolve_true(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    op::resolve_speculation(op, runtime, None);
}

/// Default false-resolution behavior: a launched operation finishes as a
/// no-op, an unlaunched one is quashed outright.
pub fn default_resolve_false(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>, launched: bool) {
    if launched {
        op::resolve_speculation(op, runtime, None);
    } else {
        op::quash_operation(op, runtime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{OpBase, OpKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct GuessTrueMapper;

    impl crate::mapper::Mapper for GuessTrueMapper {
        fn speculate(&self, _op: &Arc<dyn Operation>) -> Option<bool> {
            Some(true)
        }
    }

    fn speculating_runtime() -> Arc<Runtime> {
        Runtime::with_collaborators(
            Arc::new(crate::forest::InMemoryForest::default()),
            Arc::new(GuessTrueMapper),
        )
    }

    struct SpecOp {
        base: OpBase,
        predicated: PredicatedState,
        true_resolutions: AtomicUsize,
        false_resolutions: AtomicUsize,
    }

    impl SpecOp {
        fn create(runtime: &Arc<Runtime>) -> Arc<Self> {
            let this = Arc::new(Self {
                base: OpBase::new(runtime.dispatcher()),
                predicated: PredicatedState::default(),
                true_resolutions: AtomicUsize::new(0),
                false_resolutions: AtomicUsize::new(0),
            });
            let op = this.clone().as_op();
            op::initialize_operation(&op, runtime, None, None);
            runtime.register_operation(&op);
            this
        }
    }

    impl Operation for SpecOp {
        fn base(&self) -> &OpBase {
            &self.base
        }

        fn kind(&self) -> OpKind {
            OpKind::Copy
        }

        fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
            self
        }

        fn predicated(&self) -> Option<&PredicatedState> {
            Some(&self.predicated)
        }

        fn resolve_true(self: Arc<Self>, runtime: &Arc<Runtime>, _speculated: bool, _launched: bool) {
            self.true_resolutions.fetch_add(1, Ordering::SeqCst);
            let op = self.as_op();
            default_resolve_true(&op, runtime);
        }

        fn resolve_false(self: Arc<Self>, runtime: &Arc<Runtime>, _speculated: bool, launched: bool) {
            self.false_resolutions.fetch_add(1, Ordering::SeqCst);
            let op = self.as_op();
            default_resolve_false(&op, runtime, launched);
        }
    }

    #[test]
    fn no_predicate_resolves_true_immediately() {
        let runtime = Runtime::new();
        let spec = SpecOp::create(&runtime);
        let op = spec.clone().as_op();
        initialize_predication(&op, &runtime, None);
        assert_eq!(spec.predicated.state(), SpecState::ResolveTrue);
    }

    #[test]
    fn false_resolution_after_speculation_runs_exactly_once() {
        let runtime = speculating_runtime();
        let predicate = PredicateOp::new(&runtime, None, None);
        let spec = SpecOp::create(&runtime);
        let op = spec.clone().as_op();
        initialize_predication(&op, &runtime, Some(predicate.clone()));
        assert_eq!(spec.predicated.state(), SpecState::WaitingMapping);

        // Mapper guesses, speculation begins.
        assert_eq!(query_speculate(&op, &runtime), Some(true));
        assert_eq!(spec.predicated.state(), SpecState::SpeculativeMapping);
        spec.predicated.set_launched();

        predicate.set_resolved_value(&runtime, false);
        runtime.dispatcher().run_until_quiescent();
        assert_eq!(spec.predicated.state(), SpecState::ResolveFalse);
        assert_eq!(spec.false_resolutions.load(Ordering::SeqCst), 1);
        assert_eq!(spec.true_resolutions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn already_resolved_predicate_transitions_synchronously() {
        let runtime = Runtime::new();
        let predicate = PredicateOp::new(&runtime, None, None);
        predicate.set_resolved_value(&runtime, true);

        let spec = SpecOp::create(&runtime);
        let op = spec.clone().as_op();
        initialize_predication(&op, &runtime, Some(predicate));
        assert_eq!(spec.predicated.state(), SpecState::ResolveTrue);
        assert_eq!(spec.true_resolutions.load(Ordering::SeqCst), 1);
    }
}
