//! Partition construction operations.
//!
//! A pending partition builds an index partition from set-algebra thunks
//! with no region access of its own; its execution is the forest's
//! deferred construction. A dependent partition derives one from region
//! data (by field, by image), so it carries a read requirement and runs
//! full dependence analysis first.

use crate::forest::PartitionThunk;
use crate::op::{self, OpBase, OpKind, Operation};
use crate::ops::analyze_in_context;
use crate::runtime::Runtime;
use crate::types::{IndexPartition, IndexSpace, Provenance, RegionRequirement};
use std::sync::Arc;

/// Builds a partition from precomputed thunks.
pub struct PendingPartitionOp {
    base: OpBase,
    context: usize,
    parent: IndexSpace,
    partition: IndexPartition,
    thunk: PartitionThunk,
}

impl PendingPartitionOp {
    /// Creates and initializes a pending partition of `parent`.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        parent: IndexSpace,
        partition: IndexPartition,
        thunk: PartitionThunk,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            parent,
            partition,
            thunk,
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    /// The partition being constructed.
    #[must_use]
    pub const fn partition(&self) -> IndexPartition {
        self.partition
    }
}

impl Operation for PendingPartitionOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::PendingPartition
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
        let ready = runtime.forest().create_partition(
            runtime.dispatcher(),
            self.parent,
            self.partition,
            self.thunk,
        );
        let op = self.as_op();
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, Some(ready));
    }
}

/// Builds a partition from region data.
pub struct DependentPartitionOp {
    base: OpBase,
    context: usize,
    parent: IndexSpace,
    partition: IndexPartition,
    thunk: PartitionThunk,
    requirement: RegionRequirement,
}

impl DependentPartitionOp {
    /// Creates and initializes a dependent partition reading `requirement`.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        parent: IndexSpace,
        partition: IndexPartition,
        thunk: PartitionThunk,
        requirement: RegionRequirement,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        debug_assert!(matches!(
            thunk,
            PartitionThunk::ByField(_) | PartitionThunk::ByImage(_)
        ));
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            parent,
            partition,
            thunk,
            requirement,
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    /// The partition being constructed.
    #[must_use]
    pub const fn partition(&self) -> IndexPartition {
        self.partition
    }
}

impl Operation for DependentPartitionOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::DependentPartition
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
        let ready = runtime.forest().create_partition(
            runtime.dispatcher(),
            self.parent,
            self.partition,
            self.thunk,
        );
        let op = self.as_op();
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, Some(ready));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::fill::FillOp;
    use crate::types::{FieldId, FieldMask, LogicalRegion, PrivilegeMode};

    #[test]
    fn pending_partition_materializes_in_forest() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let pending = PendingPartitionOp::new(
            &runtime,
            context.index(),
            IndexSpace(1),
            IndexPartition(7),
            PartitionThunk::Equal { granularity: 4 },
            None,
        );
        let op = pending.clone().as_op();
        context.issue(&runtime, &op);
        runtime.dispatcher().run_until_quiescent();
        assert!(pending.base().generation() > 0);
        assert!(runtime.forest().has_partition(IndexPartition(7)));
    }

    #[test]
    fn dependent_partition_waits_for_field_writer() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let requirement = RegionRequirement::new(
            LogicalRegion(6),
            PrivilegeMode::ReadOnly,
            FieldMask::single(FieldId(5)),
        );
        let writer = FillOp::new(
            &runtime,
            context.index(),
            RegionRequirement::new(
                LogicalRegion(6),
                PrivilegeMode::ReadWrite,
                FieldMask::single(FieldId(5)),
            ),
            None,
            None,
        );
        let dependent = DependentPartitionOp::new(
            &runtime,
            context.index(),
            IndexSpace(2),
            IndexPartition(9),
            PartitionThunk::ByField(FieldId(5)),
            requirement,
            None,
        );
        let writer_op = writer.clone().as_op();
        let dependent_op = dependent.clone().as_op();
        context.issue(&runtime, &writer_op);
        context.issue(&runtime, &dependent_op);
        runtime.dispatcher().run_until_quiescent();
        assert!(writer.base().generation() > 0);
        assert!(dependent.base().generation() > 0);
        assert!(runtime.forest().has_partition(IndexPartition(9)));
    }
}