//! Acquire operations.
//!
//! An acquire claims coherence over a restricted region so later
//! operations in the context may access it directly. Only its ordering
//! behavior lives here: a predicable operation with a single read-write
//! requirement that must serialize against every prior user of the
//! fields it claims.

use crate::op::predicate::PredicateOp;
use crate::op::predicated::{self, PredicatedState, SpecState};
use crate::op::{self, OpBase, OpKind, Operation};
use crate::ops::analyze_in_context;
use crate::runtime::Runtime;
use crate::types::{Provenance, RegionRequirement};
use std::sync::Arc;

/// A deferred acquire of a restricted region.
pub struct AcquireOp {
    base: OpBase,
    context: usize,
    requirement: RegionRequirement,
    predicated: PredicatedState,
}

impl AcquireOp {
    /// Creates and initializes an acquire of `requirement`.
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

impl Operation for AcquireOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Acquire
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
        // An unlaunched acquire still resolves rather than quashing so
        // dependents in the window see its edges satisfied.
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
    use crate::types::{FieldId, FieldMask, LogicalRegion, PrivilegeMode};

    fn req(region: u64, field: u32) -> RegionRequirement {
        RegionRequirement::new(
            LogicalRegion(region),
            PrivilegeMode::ReadWrite,
            FieldMask::single(FieldId(field)),
        )
    }

    #[test]
    fn acquire_serializes_behind_prior_writer() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let writer = crate::ops::fill::FillOp::new(&runtime, context.index(), req(7, 3), None, None);
        let acquire = AcquireOp::new(&runtime, context.index(), req(7, 3), None, None);
        let writer_op = writer.clone().as_op();
        let acquire_op = acquire.clone().as_op();
        context.issue(&runtime, &writer_op);
        context.issue(&runtime, &acquire_op);
        runtime.dispatcher().run_until_quiescent();
        assert!(writer.base().generation() > 0);
        assert!(acquire.base().generation() > 0);
    }

    #[test]
    fn false_predicate_resolves_acquire_without_quash() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let predicate = PredicateOp::new(&runtime, Some(context.index()), None);
        let acquire = AcquireOp::new(
            &runtime,
            context.index(),
            req(1, 0),
            Some(predicate.clone()),
            None,
        );
        let op = acquire.clone().as_op();
        context.issue(&runtime, &op);
        predicate.set_resolved_value(&runtime, false);
        runtime.dispatcher().run_until_quiescent();
        assert!(!acquire.base().is_quashed());
        assert!(acquire.base().generation() > 0);
    }
}
