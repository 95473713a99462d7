//! Interface to the external region-tree collaborator.
//!
//! The engine never computes aliasing itself: it hands pairs of region
//! requirements to a [`RegionForest`] and receives back a dependence type
//! scoped to the overlapping fields. Partition construction is likewise
//! delegated, returning an asynchronous completion event. The bundled
//! [`InMemoryForest`] implements just enough for the engine's own tests:
//! requirements alias only when they name the same region.

use crate::dispatch::Dispatcher;
use crate::event::Event;
use crate::types::{
    compute_dependence_type, DependenceType, FieldId, FieldMask, IndexPartition, IndexSpace,
    RegionRequirement,
};
use parking_lot::Mutex;
use std::collections::HashSet;

/// A deferred partition-construction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionThunk {
    /// Partition the parent space into equal pieces.
    Equal {
        /// Number of pieces.
        granularity: usize,
    },
    /// Pointwise union of two partitions.
    Union(IndexPartition, IndexPartition),
    /// Pointwise intersection of two partitions.
    Intersection(IndexPartition, IndexPartition),
    /// Pointwise difference of two partitions.
    Difference(IndexPartition, IndexPartition),
    /// Partition driven by the values of a field.
    ByField(FieldId),
    /// Partition driven by the image of another partition.
    ByImage(IndexPartition),
}

/// The region-tree/physical-analysis collaborator.
pub trait RegionForest: Send + Sync {
    /// Computes the dependence of `later` on `prior`: the dependence type
    /// and the field mask it applies to. Non-overlapping fields or
    /// non-aliasing regions yield no dependence.
    fn compute_dependence(
        &self,
        prior: &RegionRequirement,
        later: &RegionRequirement,
    ) -> (DependenceType, FieldMask);

    /// Issues a deferred partition construction against `parent`.
    /// The returned event triggers once the partition is valid.
    fn create_partition(
        &self,
        dispatcher: &Dispatcher,
        parent: IndexSpace,
        partition: IndexPartition,
        thunk: PartitionThunk,
    ) -> Event;

    /// True if the forest has materialized the given partition.
    fn has_partition(&self, partition: IndexPartition) -> bool;
}

/// A minimal forest: regions alias only by identity, partitions complete
/// synchronously.
#[derive(Default)]
pub struct InMemoryForest {
    partitions: Mutex<HashSet<IndexPartition>>,
}

impl RegionForest for InMemoryForest {
    fn compute_dependence(
        &self,
        prior: &RegionRequirement,
        later: &RegionRequirement,
    ) -> (DependenceType, FieldMask) {
        if prior.region != later.region {
            return (DependenceType::NoDependence, FieldMask::EMPTY);
        }
        let overlap = prior.fields & later.fields;
        if overlap.is_empty() {
            return (DependenceType::NoDependence, FieldMask::EMPTY);
        }
        let dtype = compute_dependence_type(prior.usage(), later.usage());
        if dtype == DependenceType::NoDependence {
            (DependenceType::NoDependence, FieldMask::EMPTY)
        } else {
            (dtype, overlap)
        }
    }

    fn create_partition(
        &self,
        dispatcher: &Dispatcher,
        _parent: IndexSpace,
        partition: IndexPartition,
        _thunk: PartitionThunk,
    ) -> Event {
        self.partitions.lock().insert(partition);
        Event::triggered(dispatcher)
    }

    fn has_partition(&self, partition: IndexPartition) -> bool {
        self.partitions.lock().contains(&partition)
    }
}
