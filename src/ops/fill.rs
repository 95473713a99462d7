//! Fill operations: single, index-space, and per-point.
//!
//! A fill writes one value into the fields of a region; here only its
//! ordering matters, so a [`FillOp`] is a predicable, memoizable writer
//! with a single discard requirement. Index fills fan out like index
//! copies but need no collective rendezvous.

use crate::op::memo::{self, MemoState};
use crate::op::predicate::PredicateOp;
use crate::op::predicated::{self, PredicatedState, SpecState};
use crate::op::{self, OpBase, OpKind, Operation};
use crate::ops::{analyze_in_context, launch_internal, SubOpTracker};
use crate::runtime::Runtime;
use crate::types::{Provenance, RegionRequirement};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A single deferred fill.
pub struct FillOp {
    base: OpBase,
    context: usize,
    requirement: RegionRequirement,
    predicated: PredicatedState,
    memo: MemoState,
}

impl FillOp {
    /// Creates and initializes a fill of `requirement`.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        requirement: RegionRequirement,
        predicate: Option<Arc<PredicateOp>>,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            requirement,
            predicated: PredicatedState::default(),
            memo: MemoState::default(),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        predicated::initialize_predication(&op, runtime, predicate);
        this
    }

    fn perform_mapping(self: &Arc<Self>, runtime: &Arc<Runtime>) {
        self.predicated.set_launched();
        let op = self.clone().as_op();
        let fence = op.base().execution_fence_event();
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, fence);
    }
}

impl Operation for FillOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Fill
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        vec![self.requirement.clone()]
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let context = self.context;
        let op = self.as_op();
        analyze_in_context(runtime, context, &op);
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.clone().as_op();
        let _guess = predicated::query_speculate(&op, runtime);
        if self.predicated.state() == SpecState::WaitingMapping {
            let resolved = self.base.resolved_event();
            let weak = Arc::downgrade(&self);
            let weak_rt = Arc::downgrade(runtime);
            resolved.attach(crate::dispatch::Priority::Work, move || {
                if let (Some(this), Some(runtime)) = (weak.upgrade(), weak_rt.upgrade()) {
                    this.perform_mapping(&runtime);
                }
            });
            return;
        }
        self.perform_mapping(runtime);
    }

    fn trigger_resolution(self: Arc<Self>, runtime: &Arc<Runtime>) {
        match self.predicated.state() {
            SpecState::ResolveTrue | SpecState::ResolveFalse => {
                let op = self.as_op();
                op::resolve_speculation(&op, runtime, None);
            }
            _ => {}
        }
    }

    fn trigger_replay(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        let precondition = memo::compute_sync_precondition(&op, runtime);
        memo::complete_replay(&op, runtime, precondition);
    }

    fn resolve_false(self: Arc<Self>, runtime: &Arc<Runtime>, _speculated: bool, _launched: bool) {
        let op = self.as_op();
        op::resolve_speculation(&op, runtime, None);
    }

    fn predicated(&self) -> Option<&PredicatedState> {
        Some(&self.predicated)
    }

    fn memo(&self) -> Option<&MemoState> {
        Some(&self.memo)
    }
}

struct IndexFillInner {
    tracker: SubOpTracker,
    commit_requested: bool,
}

/// An index-space fill fanning out into per-point fills.
pub struct IndexFillOp {
    base: OpBase,
    context: usize,
    requirement: RegionRequirement,
    points: usize,
    inner: Mutex<IndexFillInner>,
}

impl IndexFillOp {
    /// Creates an index fill with `points` point fills.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        requirement: RegionRequirement,
        points: usize,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        debug_assert!(points > 0);
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            requirement,
            points,
            inner: Mutex::new(IndexFillInner {
                tracker: SubOpTracker::new(points),
                commit_requested: false,
            }),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    fn notify_subop_complete(&self) {
        let _ = self.inner.lock().tracker.subop_completed();
    }

    fn notify_subop_commit(self: &Arc<Self>, runtime: &Arc<Runtime>) {
        let commit_now = {
            let mut inner = self.inner.lock();
            inner.tracker.subop_committed() && inner.commit_requested
        };
        if commit_now {
            let op = self.clone().as_op();
            op::commit_operation(&op, runtime, None);
        }
    }
}

impl Operation for IndexFillOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::IndexFill
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        vec![self.requirement.clone()]
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let context = self.context;
        let op = self.as_op();
        analyze_in_context(runtime, context, &op);
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.clone().as_op();
        let fence = op.base().execution_fence_event();
        for point in 0..self.points {
            let point_op = PointFillOp::new(runtime, &self, point);
            let as_op = point_op.clone().as_op();
            op::record_completion_effect(&op, as_op.base().completion_event());
            launch_internal(runtime, &as_op);
        }
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, fence);
    }

    fn trigger_commit(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let commit_now = {
            let mut inner = self.inner.lock();
            inner.commit_requested = true;
            inner.tracker.all_committed()
        };
        if commit_now {
            let op = self.as_op();
            op::commit_operation(&op, runtime, None);
        }
    }
}

/// One point of an index fill.
pub struct PointFillOp {
    base: OpBase,
    owner: Weak<IndexFillOp>,
    point: usize,
    requirement: RegionRequirement,
}

impl PointFillOp {
    fn new(runtime: &Arc<Runtime>, owner: &Arc<IndexFillOp>, point: usize) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            owner: Arc::downgrade(owner),
            point,
            requirement: owner.requirement.clone(),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(owner.context), owner.base.provenance());
        runtime.register_operation(&op);
        this
    }

    /// The point index within the launch.
    #[must_use]
    pub const fn point(&self) -> usize {
        self.point
    }
}

impl Operation for PointFillOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::PointFill
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        vec![self.requirement.clone()]
    }

    fn trigger_complete(self: Arc<Self>, runtime: &Arc<Runtime>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.notify_subop_complete();
        }
        let op = self.as_op();
        op::complete_operation(&op, runtime, None);
    }

    fn trigger_commit(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let owner = self.owner.upgrade();
        let op = self.as_op();
        op::commit_operation(&op, runtime, None);
        if let Some(owner) = owner {
            owner.notify_subop_commit(runtime);
        }
    }
}
