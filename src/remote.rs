//! Packing operations for nodes that do not own them.
//!
//! A distributed deployment sometimes needs to answer questions about an
//! operation on a node that holds no `Arc` to it: provenance for a
//! profiling record, a diagnostic for an uninitialized read. The contract
//! here is a serde payload carrying just enough identity to stand in for
//! the original, and a [`RemoteOp`] rebuilt from it on the far side.

use crate::error::{Error, ErrorKind, Result};
use crate::op::{OpBase, OpKind, Operation};
use crate::runtime::Runtime;
use crate::tracing_compat::warn;
use crate::types::{FieldMask, GenerationId, PackedProvenance, Provenance, UniqueOpId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Wire form of one operation's remotable identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePayload {
    /// The origin node's unique id for the operation.
    pub unique_id: UniqueOpId,
    /// The generation the id was captured at.
    pub generation: GenerationId,
    /// The issuing context on the origin node, if any.
    pub context_index: Option<usize>,
    /// Nesting depth of the issuing context.
    pub depth: u32,
    /// The operation's kind.
    pub kind: OpKind,
    /// Packed provenance with its leading existence flag.
    pub provenance: PackedProvenance,
}

/// Captures the remotable identity of a live operation.
#[must_use]
pub fn pack_remote_operation(op: &Arc<dyn Operation>, depth: u32) -> RemotePayload {
    RemotePayload {
        unique_id: op.base().unique_id(),
        generation: op.base().generation(),
        context_index: op.base().context_index(),
        depth,
        kind: op.kind(),
        provenance: Provenance::pack(op.base().provenance().as_ref()),
    }
}

/// A stand-in for an operation owned by another node.
pub struct RemoteOp {
    base: OpBase,
    payload: RemotePayload,
    provenance: Option<Arc<Provenance>>,
}

impl RemoteOp {
    /// Rebuilds a stand-in from a shipped payload.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::MalformedRemotePayload`] when the payload
    /// carries the reserved null id; nothing on the origin node can ever
    /// be named by it.
    pub fn unpack(runtime: &Arc<Runtime>, payload: RemotePayload) -> Result<Arc<Self>> {
        if payload.unique_id == UniqueOpId(0) {
            return Err(Error::with_message(
                ErrorKind::MalformedRemotePayload,
                "remote payload names the reserved null operation id",
            ));
        }
        let provenance = Provenance::unpack(payload.provenance.clone());
        Ok(Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            payload,
            provenance,
        }))
    }

    /// The origin node's identity for this operation.
    #[must_use]
    pub fn origin_id(&self) -> UniqueOpId {
        self.payload.unique_id
    }

    /// The generation the payload was captured at.
    #[must_use]
    pub fn origin_generation(&self) -> GenerationId {
        self.payload.generation
    }

    /// The kind the origin operation had.
    #[must_use]
    pub fn origin_kind(&self) -> OpKind {
        self.payload.kind
    }

    /// Nesting depth of the origin context.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.payload.depth
    }

    /// The origin operation's provenance, if it carried one.
    #[must_use]
    pub fn origin_provenance(&self) -> Option<&Arc<Provenance>> {
        self.provenance.as_ref()
    }
}

impl fmt::Debug for RemoteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteOp")
            .field("payload", &self.payload)
            .finish()
    }
}

impl Operation for RemoteOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::Remote
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    // Diagnostics on the remote side speak with the origin's identity,
    // not the stand-in's.
    fn report_uninitialized_usage(&self, idx: usize, fields: FieldMask) {
        warn!(
            origin = %self.payload.unique_id,
            kind = %self.payload.kind,
            idx,
            ?fields,
            provenance = %self
                .provenance
                .as_deref()
                .map_or("", Provenance::human),
            "remote region requirement reads uninitialized fields"
        );
    }
}
