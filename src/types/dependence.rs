//! Region usages and the dependence-type lattice.
//!
//! The external region tree decides *which* prior users of a region a new
//! requirement can alias; this module decides *what kind* of hazard a pair
//! of overlapping usages constitutes. Only fields present in both masks can
//! produce a hazard at all.

use crate::types::{FieldMask, LogicalRegion};
use serde::{Deserialize, Serialize};

/// Access privilege requested on a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivilegeMode {
    /// No access (placeholder requirement).
    NoAccess,
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
    /// Write access where prior contents are discarded.
    WriteDiscard,
    /// Reduction access with the given reduction operator.
    Reduce(u32),
}

impl PrivilegeMode {
    /// Returns true if this privilege never writes.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::NoAccess | Self::ReadOnly)
    }

    /// Returns true if this privilege writes.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard)
    }
}

/// Coherence requested on a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoherenceMode {
    /// Serialized access in dependence order.
    Exclusive,
    /// Access may be reordered but each access is atomic.
    Atomic,
    /// Concurrent access is visible to all parties.
    Simultaneous,
    /// No consistency guarantees requested.
    Relaxed,
}

/// The privilege/coherence pair that dependence typing operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionUsage {
    /// Requested privilege.
    pub privilege: PrivilegeMode,
    /// Requested coherence.
    pub coherence: CoherenceMode,
}

/// The kind of hazard between two overlapping region usages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependenceType {
    /// No hazard: the usages may proceed in either order.
    NoDependence,
    /// True data dependence (read after write, or write after write).
    TrueDependence,
    /// Anti dependence (write after read, or total overwrite).
    AntiDependence,
    /// Both parties requested atomic coherence; order is free but accesses
    /// must not interleave.
    AtomicDependence,
    /// Both parties requested simultaneous or relaxed coherence.
    SimultaneousDependence,
}

impl DependenceType {
    /// Returns true if this dependence imposes a mapping-order constraint.
    #[must_use]
    pub const fn is_ordering(self) -> bool {
        matches!(self, Self::TrueDependence | Self::AntiDependence)
    }
}

/// Distinguishes write-after-read from read-after-write once a data hazard
/// is established under an exclusive coherence pairing.
const fn anti_or_true(prior: RegionUsage, later: RegionUsage) -> DependenceType {
    if prior.privilege.is_read_only() {
        // Prior only read; the later writer must wait but carries no data.
        DependenceType::AntiDependence
    } else if matches!(later.privilege, PrivilegeMode::WriteDiscard) {
        // Later discards everything the prior wrote.
        DependenceType::AntiDependence
    } else {
        DependenceType::TrueDependence
    }
}

/// Computes the dependence type between a prior usage and a later usage of
/// the same region, assuming their field masks overlap.
#[must_use]
pub const fn compute_dependence_type(
    prior: RegionUsage,
    later: RegionUsage,
) -> DependenceType {
    // Two readers never conflict.
    if prior.privilege.is_read_only() && later.privilege.is_read_only() {
        return DependenceType::NoDependence;
    }
    // Matching reductions fold in any order.
    if let (PrivilegeMode::Reduce(a), PrivilegeMode::Reduce(b)) =
        (prior.privilege, later.privilege)
    {
        if a == b {
            return DependenceType::NoDependence;
        }
    }
    match (prior.coherence, later.coherence) {
        (CoherenceMode::Exclusive, _) | (_, CoherenceMode::Exclusive) => {
            anti_or_true(prior, later)
        }
        (CoherenceMode::Atomic, CoherenceMode::Atomic) => DependenceType::AtomicDependence,
        (CoherenceMode::Atomic, _) | (_, CoherenceMode::Atomic) => anti_or_true(prior, later),
        _ => DependenceType::SimultaneousDependence,
    }
}

/// One region access declared by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRequirement {
    /// The region accessed.
    pub region: LogicalRegion,
    /// The region from which privileges derive in the parent context.
    pub parent: LogicalRegion,
    /// Requested privilege.
    pub privilege: PrivilegeMode,
    /// Requested coherence.
    pub coherence: CoherenceMode,
    /// Fields accessed.
    pub fields: FieldMask,
}

impl RegionRequirement {
    /// Creates a requirement with exclusive coherence.
    #[must_use]
    pub const fn new(region: LogicalRegion, privilege: PrivilegeMode, fields: FieldMask) -> Self {
        Self {
            region,
            parent: region,
            privilege,
            coherence: CoherenceMode::Exclusive,
            fields,
        }
    }

    /// Read-only requirement.
    #[must_use]
    pub const fn read_only(region: LogicalRegion, fields: FieldMask) -> Self {
        Self::new(region, PrivilegeMode::ReadOnly, fields)
    }

    /// Read-write requirement.
    #[must_use]
    pub const fn read_write(region: LogicalRegion, fields: FieldMask) -> Self {
        Self::new(region, PrivilegeMode::ReadWrite, fields)
    }

    /// Discarding write requirement.
    #[must_use]
    pub const fn write_discard(region: LogicalRegion, fields: FieldMask) -> Self {
        Self::new(region, PrivilegeMode::WriteDiscard, fields)
    }

    /// Sets the coherence mode.
    #[must_use]
    pub const fn with_coherence(mut self, coherence: CoherenceMode) -> Self {
        self.coherence = coherence;
        self
    }

    /// Returns the privilege/coherence pair.
    #[must_use]
    pub const fn usage(&self) -> RegionUsage {
        RegionUsage {
            privilege: self.privilege,
            coherence: self.coherence,
        }
    }

    /// Localizes this requirement to its parent context: the parent becomes
    /// the region itself and coherence becomes exclusive.
    pub fn localize(&mut self) {
        self.parent = self.region;
        self.coherence = CoherenceMode::Exclusive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn usage(privilege: PrivilegeMode, coherence: CoherenceMode) -> RegionUsage {
        RegionUsage {
            privilege,
            coherence,
        }
    }

    #[test]
    fn readers_never_conflict() {
        let read = usage(PrivilegeMode::ReadOnly, CoherenceMode::Exclusive);
        assert_eq!(
            compute_dependence_type(read, read),
            DependenceType::NoDependence
        );
    }

    #[test]
    fn read_after_write_is_true_dependence() {
        let write = usage(PrivilegeMode::ReadWrite, CoherenceMode::Exclusive);
        let read = usage(PrivilegeMode::ReadOnly, CoherenceMode::Exclusive);
        assert_eq!(
            compute_dependence_type(write, read),
            DependenceType::TrueDependence
        );
    }

    #[test]
    fn write_after_read_is_anti_dependence() {
        let read = usage(PrivilegeMode::ReadOnly, CoherenceMode::Exclusive);
        let write = usage(PrivilegeMode::ReadWrite, CoherenceMode::Exclusive);
        assert_eq!(
            compute_dependence_type(read, write),
            DependenceType::AntiDependence
        );
    }

    #[test]
    fn overwrite_of_written_data_is_anti() {
        let write = usage(PrivilegeMode::ReadWrite, CoherenceMode::Exclusive);
        let discard = usage(PrivilegeMode::WriteDiscard, CoherenceMode::Exclusive);
        assert_eq!(
            compute_dependence_type(write, discard),
            DependenceType::AntiDependence
        );
        // But reading back written data is a true dependence.
        assert_eq!(
            compute_dependence_type(discard, write),
            DependenceType::TrueDependence
        );
    }

    #[test]
    fn matching_reductions_commute() {
        let red = usage(PrivilegeMode::Reduce(3), CoherenceMode::Exclusive);
        assert_eq!(
            compute_dependence_type(red, red),
            DependenceType::NoDependence
        );
        let other = usage(PrivilegeMode::Reduce(4), CoherenceMode::Exclusive);
        assert_eq!(
            compute_dependence_type(red, other),
            DependenceType::TrueDependence
        );
    }

    #[test]
    fn coherence_relaxations() {
        let atomic = usage(PrivilegeMode::ReadWrite, CoherenceMode::Atomic);
        assert_eq!(
            compute_dependence_type(atomic, atomic),
            DependenceType::AtomicDependence
        );
        let simult = usage(PrivilegeMode::ReadWrite, CoherenceMode::Simultaneous);
        let relaxed = usage(PrivilegeMode::ReadWrite, CoherenceMode::Relaxed);
        assert_eq!(
            compute_dependence_type(simult, relaxed),
            DependenceType::SimultaneousDependence
        );
    }

    #[test]
    fn localize_resets_parent_and_coherence() {
        let mut req = RegionRequirement::read_write(LogicalRegion(5), FieldMask::EMPTY)
            .with_coherence(CoherenceMode::Atomic);
        req.parent = LogicalRegion(1);
        req.localize();
        assert_eq!(req.parent, req.region);
        assert_eq!(req.coherence, CoherenceMode::Exclusive);
    }
}
