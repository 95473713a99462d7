//! Mapping and execution fences.
//!
//! A fence has no region requirements; it orders itself against every
//! operation still in the context window and then installs itself as the
//! current fence so later operations order against it in turn. A mapping
//! fence only constrains mapping order. An execution fence additionally
//! completes only after everything before it has completed, and gates the
//! execution of everything after it.

use crate::op::{self, OpBase, OpKind, Operation};
use crate::runtime::Runtime;
use crate::types::Provenance;
use std::sync::Arc;

/// What a fence constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Later operations may not map before the fence maps.
    Mapping,
    /// Later operations may not execute before everything prior completes.
    Execution,
}

/// A pipeline fence over one context.
pub struct FenceOp {
    base: OpBase,
    context: usize,
    fence_kind: FenceKind,
}

impl FenceOp {
    /// Creates and initializes a fence in `context`.
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        fence_kind: FenceKind,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            fence_kind,
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    /// Which pipeline stage this fence constrains.
    #[must_use]
    pub const fn fence_kind(&self) -> FenceKind {
        self.fence_kind
    }
}

impl Operation for FenceOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Fence
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let fence_kind = self.fence_kind;
        let context = self.context;
        let op = self.clone().as_op();
        match runtime.context(context) {
            Some(ctx) => {
                if fence_kind == FenceKind::Execution {
                    // Complete only after everything already in the window
                    // completes.
                    let prior = ctx.perform_fence_analysis(runtime);
                    op::record_completion_effect(&op, prior);
                }
                ctx.analyze_fence(runtime, &op);
                if fence_kind == FenceKind::Execution {
                    // Installed after this fence's own analysis so it gates
                    // later operations, not the fence itself.
                    ctx.update_current_execution_fence(op.base().completion_event());
                }
                ctx.update_current_mapping_fence(&op);
            }
            None => {
                op::begin_dependence_analysis(&op);
                op::end_dependence_analysis(&op, runtime);
            }
        }
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        let fence = op.base().execution_fence_event();
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, fence);
    }
}
