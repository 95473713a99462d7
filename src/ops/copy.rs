//! Copy operations: single, index-space, and per-point.
//!
//! A [`CopyOp`] orders one deferred copy between two region requirements.
//! An [`IndexCopyOp`] fans out into [`PointCopyOp`]s that each run the
//! full pipeline independently; the points rendezvous on a shared
//! collective view for the destination region and report completion and
//! commit back to the index op. What a copy actually moves is the
//! physical layer's business; only lifecycle and ordering live here.

use crate::op::collective::{CollectiveState, PendingRendezvousKey, ResultSlot};
use crate::op::memo::{self, MemoState};
use crate::op::predicate::PredicateOp;
use crate::op::predicated::{self, PredicatedState, SpecState};
use crate::op::{self, OpBase, OpKind, Operation};
use crate::ops::{analyze_in_context, launch_internal, SubOpTracker};
use crate::runtime::Runtime;
use crate::types::{
    AddressSpaceId, DistributedId, FieldMask, Provenance, RegionRequirement, UniqueOpId,
};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

fn trace_shape(kind: OpKind, requirements: &[RegionRequirement]) -> u64 {
    let mut hasher = DefaultHasher::new();
    kind.name().hash(&mut hasher);
    for req in requirements {
        req.region.0.hash(&mut hasher);
        req.privilege.is_write().hash(&mut hasher);
        for field in req.fields.iter() {
            field.0.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// A single deferred copy, predicable and memoizable.
pub struct CopyOp {
    base: OpBase,
    context: usize,
    requirements: Vec<RegionRequirement>,
    sources: Vec<DistributedId>,
    predicated: PredicatedState,
    memo: MemoState,
}

impl CopyOp {
    /// Creates and initializes a copy from `src` to `dst`.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        src: RegionRequirement,
        dst: RegionRequirement,
        predicate: Option<Arc<PredicateOp>>,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            requirements: vec![src, dst],
            sources: Vec::new(),
            predicated: PredicatedState::default(),
            memo: MemoState::default(),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        predicated::initialize_predication(&op, runtime, predicate);
        this
    }

    /// Creates a copy with candidate source instances for mapper ranking.
    #[must_use]
    pub fn with_sources(
        runtime: &Arc<Runtime>,
        context: usize,
        src: RegionRequirement,
        dst: RegionRequirement,
        sources: Vec<DistributedId>,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            requirements: vec![src, dst],
            sources,
            predicated: PredicatedState::default(),
            memo: MemoState::default(),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        predicated::initialize_predication(&op, runtime, None);
        this
    }

    fn perform_mapping(self: &Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.clone().as_op();
        self.predicated.set_launched();
        if self.predicated.state() != SpecState::ResolveFalse && !self.sources.is_empty() {
            // Ranking only; the physical layer consumes the order.
            let _ranked = runtime.mapper().select_sources(&op, &self.sources);
        }
        let fence = op.base().execution_fence_event();
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, fence);
    }
}

impl Operation for CopyOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Copy
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        self.requirements.clone()
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let context = self.context;
        let shape = trace_shape(OpKind::Copy, &self.requirements);
        let op = self.as_op();
        memo::invoke_memoize_operation(&op, runtime, shape);
        analyze_in_context(runtime, context, &op);
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        if self.memo.is_replaying() {
            return self.trigger_replay(runtime);
        }
        let op = self.clone().as_op();
        let _guess = predicated::query_speculate(&op, runtime);
        if self.predicated.state() == SpecState::WaitingMapping {
            // No speculation: hold mapping until the predicate resolves.
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
            // Resolution arrives through the predicate callback.
            _ => {}
        }
    }

    fn trigger_replay(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        let precondition = memo::compute_sync_precondition(&op, runtime);
        memo::complete_replay(&op, runtime, precondition);
    }

    // A predicated copy already in the pipeline finishes as a no-op on
    // false rather than quashing.
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

struct IndexCopyInner {
    tracker: SubOpTracker,
    commit_requested: bool,
}

/// An index-space copy that fans out into per-point copies.
pub struct IndexCopyOp {
    base: OpBase,
    context: usize,
    requirements: Vec<RegionRequirement>,
    points: usize,
    instances: Vec<(DistributedId, FieldMask)>,
    collective: CollectiveState,
    inner: Mutex<IndexCopyInner>,
}

impl IndexCopyOp {
    /// Creates an index copy with `points` point copies, all presenting
    /// the same instance set at the collective rendezvous.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        src: RegionRequirement,
        dst: RegionRequirement,
        points: usize,
        instances: Vec<(DistributedId, FieldMask)>,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        debug_assert!(points > 0);
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            requirements: vec![src, dst],
            points,
            instances,
            collective: CollectiveState::default(),
            inner: Mutex::new(IndexCopyInner {
                tracker: SubOpTracker::new(points),
                commit_requested: false,
            }),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    /// The number of point copies this launch fans out into.
    #[must_use]
    pub const fn point_count(&self) -> usize {
        self.points
    }

    /// The rendezvous tables the points agree through.
    #[must_use]
    pub fn collective_state(&self) -> &CollectiveState {
        &self.collective
    }

    fn notify_subop_complete(&self) {
        let mut inner = self.inner.lock();
        let _ = inner.tracker.subop_completed();
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

impl Operation for IndexCopyOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::IndexCopy
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        self.requirements.clone()
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let context = self.context;
        let op = self.as_op();
        analyze_in_context(runtime, context, &op);
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.clone().as_op();
        let fence = op.base().execution_fence_event();
        // Fan out. Points inherit this op's satisfied dependences by
        // construction: they are created only after mapping dependences
        // cleared.
        for point in 0..self.points {
            let point_op = PointCopyOp::new(runtime, &self, point);
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

/// One point of an index copy.
pub struct PointCopyOp {
    base: OpBase,
    owner: Weak<IndexCopyOp>,
    point: usize,
    requirements: Vec<RegionRequirement>,
    slot: ResultSlot,
}

impl PointCopyOp {
    fn new(runtime: &Arc<Runtime>, owner: &Arc<IndexCopyOp>, point: usize) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            owner: Arc::downgrade(owner),
            point,
            requirements: owner.requirements.clone(),
            slot: ResultSlot::default(),
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

    /// The collective view identity, once the rendezvous finalized.
    #[must_use]
    pub fn collective_view(&self) -> Option<crate::op::collective::CollectiveResult> {
        *self.slot.lock()
    }

    fn arrival_key(&self) -> PendingRendezvousKey {
        // The destination requirement is the collectively written one.
        PendingRendezvousKey {
            region_index: 1,
            analysis_index: 0,
            region: self.requirements[1].region,
        }
    }
}

impl Operation for PointCopyOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::PointCopy
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        self.requirements.clone()
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.collective.find_or_create_rendezvous(
                UniqueOpId(self.base.unique_id().0),
                self.arrival_key(),
                AddressSpaceId(0),
                owner.instances.clone(),
                owner.points,
                self.slot.clone(),
            );
        }
        let op = self.as_op();
        let fence = op.base().execution_fence_event();
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, fence);
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
