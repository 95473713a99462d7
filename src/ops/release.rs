//! Release operations.
//!
//! A release gives back coherence claimed by a prior acquire, so the
//! runtime may again treat the restricted instance as the authoritative
//! copy. Structurally it is the dual of [`AcquireOp`]: one read-write
//! requirement, predicable, no memoization.
//!
//! [`AcquireOp`]: crate::ops::acquire::AcquireOp

use crate::op::predicate::PredicateOp;
use crate::op::predicated::{self, PredicatedState, SpecState};
use crate::op::{self, OpBase, OpKind, Operation};
use crate::ops::analyze_in_context;
use crate::runtime::Runtime;
use crate::types::{Provenance, RegionRequirement};
use std::sync::Arc;

/// A deferred release of a previously acquired region.
pub struct ReleaseOp {
    base: OpBase,
    context: usize,
    requirement: RegionRequirement,
    predicated: PredicatedState,
}

impl ReleaseOp {
    /// Creates and initializes a release of `requirement`.
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

impl Operation for ReleaseOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Release
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

    fn resolve_false(self: Arc<Self>, runtime: &Arc<Runtime>, _speculated: bool, _launched: bool) {
        let op = self.as_op();
        op::resolve_speculation(&op, runtime, None);
    }

    fn predicated(&self) -> Option<&PredicatedState> {
        Some(&self.predicated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::acquire::AcquireOp;
    use crate::types::{FieldId, FieldMask, LogicalRegion, PrivilegeMode};

    fn req(region: u64, field: u32) -> RegionRequirement {
        RegionRequirement::new(
            LogicalRegion(region),
            PrivilegeMode::ReadWrite,
            FieldMask::single(FieldId(field)),
        )
    }

    #[test]
    fn release_follows_matching_acquire() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let acquire = AcquireOp::new(&runtime, context.index(), req(4, 1), None, None);
        let release = ReleaseOp::new(&runtime, context.index(), req(4, 1), None, None);
        let acquire_op = acquire.clone().as_op();
        let release_op = release.clone().as_op();
        context.issue(&runtime, &acquire_op);
        context.issue(&runtime, &release_op);
        runtime.dispatcher().run_until_quiescent();
        assert!(acquire.base().generation() > 0);
        assert!(release.base().generation() > 0);
    }

    #[test]
    fn releases_on_disjoint_fields_share_no_edges() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let first = ReleaseOp::new(&runtime, context.index(), req(5, 0), None, None);
        let second = ReleaseOp::new(&runtime, context.index(), req(5, 1), None, None);
        let first_op = first.clone().as_op();
        let second_op = second.clone().as_op();
        context.issue(&runtime, &first_op);
        context.issue(&runtime, &second_op);
        runtime.dispatcher().run_until_quiescent();
        assert!(first.base().generation() > 0);
        assert!(second.base().generation() > 0);
    }
}