//! Concrete operation kinds built on the pipeline substrate.
//!
//! Each kind populates its region requirements at initialization, then
//! overrides a strict subset of the pipeline triggers. Index-space kinds
//! fan out into per-point operations that run the full pipeline
//! independently and report completion/commit back to the owning index
//! operation, which aggregates with remaining-count-reaches-zero logic.

pub mod acquire;
pub mod copy;
pub mod deletion;
pub mod fence;
pub mod fill;
pub mod must_epoch;
pub mod partition;
pub mod release;

use crate::op::{self, OpBase, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::Provenance;
use parking_lot::Mutex;
use std::sync::Arc;

/// Remaining-count aggregation of child operations into an owner.
#[derive(Debug)]
pub(crate) struct SubOpTracker {
    remaining_completes: usize,
    remaining_commits: usize,
}

impl SubOpTracker {
    pub(crate) const fn new(subops: usize) -> Self {
        Self {
            remaining_completes: subops,
            remaining_commits: subops,
        }
    }

    /// Returns true when the last child completed.
    pub(crate) fn subop_completed(&mut self) -> bool {
        debug_assert!(self.remaining_completes > 0);
        self.remaining_completes -= 1;
        self.remaining_completes == 0
    }

    /// Returns true when the last child committed.
    pub(crate) fn subop_committed(&mut self) -> bool {
        debug_assert!(self.remaining_commits > 0);
        self.remaining_commits -= 1;
        self.remaining_commits == 0
    }

    pub(crate) const fn all_committed(&self) -> bool {
        self.remaining_commits == 0
    }
}

/// Runs the whole pipeline of an internally created operation that has no
/// context-window dependences of its own.
pub(crate) fn launch_internal(runtime: &Arc<Runtime>, op: &Arc<dyn Operation>) {
    op::enqueue_stage(runtime, op.clone(), Operation::trigger_dependence_analysis);
}

/// Region dependence analysis against the issuing context's window, or a
/// bare begin/end pair when the context is gone.
pub(crate) fn analyze_in_context(runtime: &Arc<Runtime>, context: usize, op: &Arc<dyn Operation>) {
    match runtime.context(context) {
        Some(ctx) => ctx.analyze(runtime, op),
        None => {
            op::begin_dependence_analysis(op);
            op::end_dependence_analysis(op, runtime);
        }
    }
}

/// Measures when the runtime reached this point of the program; carries no
/// region requirements, so it orders only against fences.
pub struct TimingOp {
    base: OpBase,
    context: usize,
    measured: Mutex<Option<std::time::Instant>>,
}

impl TimingOp {
    /// Creates and initializes a timing operation.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            measured: Mutex::new(None),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    /// The measured instant, once executed.
    #[must_use]
    pub fn measurement(&self) -> Option<std::time::Instant> {
        *self.measured.lock()
    }
}

impl Operation for TimingOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Timing
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let context = self.context;
        let op = self.as_op();
        analyze_in_context(runtime, context, &op);
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let this = self.clone();
        let op = self.as_op();
        let fence = op.base().execution_fence_event();
        op::complete_mapping(&op, runtime, None);
        *this.measured.lock() = Some(std::time::Instant::now());
        op::complete_execution(&op, runtime, fence);
    }
}
