//! Identifier types for engine entities.
//!
//! Operation identity has two layers. An [`OpId`] names a pool slot for the
//! duration of one activation; it wraps an arena index and becomes stale
//! when the slot is reclaimed. A [`UniqueOpId`] is process-unique and
//! monotonic across all operations ever issued, and is what appears in logs
//! and diagnostics. The [`GenerationId`] counts successive logical uses of
//! one reused operation object; dependence edges are qualified by it.

use crate::util::ArenaIndex;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Identifies a pooled operation slot for one activation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub(crate) ArenaIndex);

impl OpId {
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }

    /// Creates an operation id for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(slot: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(slot, generation))
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({}:{})", self.0.slot(), self.0.generation())
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0.slot())
    }
}

/// Process-unique, monotonically increasing operation id.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct UniqueOpId(pub u64);

impl fmt::Debug for UniqueOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueOpId({})", self.0)
    }
}

impl fmt::Display for UniqueOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Counts successive logical uses of one reused operation object.
///
/// A dependence edge recorded against `(op, gen)` is stale once the
/// operation's generation advances past `gen`.
pub type GenerationId = u64;

/// Identifies a node in a distributed deployment.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct AddressSpaceId(pub u32);

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressSpaceId({})", self.0)
    }
}

/// Globally unique id for a distributed object (for example a physical
/// instance view).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct DistributedId(pub u64);

impl fmt::Debug for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DistributedId({})", self.0)
    }
}

/// Handle for a logical region in the external region tree.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogicalRegion(pub u64);

impl LogicalRegion {
    /// The "no region" sentinel.
    pub const NO_REGION: Self = Self(0);

    /// Returns true if this handle names an actual region.
    #[must_use]
    pub const fn exists(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for LogicalRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalRegion({})", self.0)
    }
}

/// Handle for a field space in the external region tree.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FieldSpace(pub u32);

impl fmt::Debug for FieldSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldSpace({})", self.0)
    }
}

/// Identifies a field within a field space.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FieldId(pub u32);

impl fmt::Debug for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldId({})", self.0)
    }
}

/// Handle for an index space in the external region tree.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct IndexSpace(pub u32);

impl fmt::Debug for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexSpace({})", self.0)
    }
}

/// Handle for an index partition in the external region tree.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct IndexPartition(pub u32);

impl fmt::Debug for IndexPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexPartition({})", self.0)
    }
}
