//! Deferred deletions of regions, fields, and index structures.
//!
//! A deletion is ordered behind every prior user of what it deletes, then
//! records the deletion into its context's resource tracker so the change
//! flows to the parent when the context returns resources. Deletions
//! request early commit: once a deletion completes there is nothing left
//! for a consumer to validate.

use crate::op::{self, OpBase, OpKind, Operation};
use crate::ops::analyze_in_context;
use crate::resource::{
    DeletedField, DeletedFieldSpace, DeletedIndexSpace, DeletedPartition, DeletedRegion,
};
use crate::runtime::Runtime;
use crate::types::{
    FieldId, FieldMask, FieldSpace, IndexPartition, IndexSpace, LogicalRegion, PrivilegeMode,
    Provenance, RegionRequirement,
};
use std::sync::Arc;

/// What a deletion removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionKind {
    /// A logical region.
    Region(LogicalRegion),
    /// Individual fields of a field space.
    Fields {
        /// The field space the fields belong to.
        space: FieldSpace,
        /// The fields being removed.
        fields: Vec<FieldId>,
    },
    /// A whole field space. Regions still using it defer the deletion
    /// until they are deleted themselves.
    FieldSpace {
        /// The field space being removed.
        space: FieldSpace,
        /// Regions still built on the space.
        consumers: Vec<LogicalRegion>,
    },
    /// An index space, optionally with all its subspaces.
    IndexSpace {
        /// The index space being removed.
        space: IndexSpace,
        /// Whether subspaces are removed too.
        recurse: bool,
    },
    /// An index partition, optionally with all its subpartitions.
    Partition {
        /// The partition being removed.
        partition: IndexPartition,
        /// Whether subpartitions are removed too.
        recurse: bool,
    },
}

/// A deferred deletion in one context.
pub struct DeletionOp {
    base: OpBase,
    context: usize,
    deletion: DeletionKind,
    provenance: Option<Arc<Provenance>>,
}

impl DeletionOp {
    /// Creates and initializes a deletion in `context`.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        deletion: DeletionKind,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            deletion,
            provenance: provenance.clone(),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    /// What this deletion removes.
    #[must_use]
    pub fn deletion(&self) -> &DeletionKind {
        &self.deletion
    }

    fn record(&self, runtime: &Arc<Runtime>) {
        let Some(ctx) = runtime.context(self.context) else {
            return;
        };
        let mut resources = ctx.resources().lock();
        match &self.deletion {
            DeletionKind::Region(region) => resources.record_deleted_region(DeletedRegion {
                region: *region,
                provenance: self.provenance.clone(),
            }),
            DeletionKind::Fields { space, fields } => {
                for field in fields {
                    resources.record_deleted_field(DeletedField {
                        space: *space,
                        field: *field,
                        provenance: self.provenance.clone(),
                    });
                }
            }
            DeletionKind::FieldSpace { space, consumers } => {
                if consumers.is_empty() {
                    resources.record_deleted_field_space(DeletedFieldSpace {
                        space: *space,
                        provenance: self.provenance.clone(),
                    });
                } else {
                    resources.record_latent_field_space(
                        *space,
                        consumers.iter().copied(),
                        self.provenance.clone(),
                    );
                }
            }
            DeletionKind::IndexSpace { space, recurse } => {
                resources.record_deleted_index_space(DeletedIndexSpace {
                    space: *space,
                    recurse: *recurse,
                    provenance: self.provenance.clone(),
                });
            }
            DeletionKind::Partition { partition, recurse } => {
                resources.record_deleted_partition(DeletedPartition {
                    partition: *partition,
                    recurse: *recurse,
                    provenance: self.provenance.clone(),
                });
            }
        }
    }
}

impl Operation for DeletionOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Deletion
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        // A region deletion serializes behind every prior user of any of
        // the region's fields. Index-structure deletions have no region
        // requirement and order only through fences.
        match &self.deletion {
            DeletionKind::Region(region) => vec![RegionRequirement::new(
                *region,
                PrivilegeMode::ReadWrite,
                FieldMask::FULL,
            )],
            DeletionKind::Fields { .. }
            | DeletionKind::FieldSpace { .. }
            | DeletionKind::IndexSpace { .. }
            | DeletionKind::Partition { .. } => Vec::new(),
        }
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let context = self.context;
        let op = self.as_op();
        analyze_in_context(runtime, context, &op);
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        self.record(runtime);
        let op = self.as_op();
        let fence = op.base().execution_fence_event();
        op::request_early_commit(&op, runtime);
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, fence);
    }
}
