//! Tracking of region-tree resources created and deleted by operations.
//!
//! Operations that execute child work (must-epoch launches, task contexts)
//! accumulate the resources their children created or deleted, then merge
//! the accumulation into their parent when the child commits. Creations are
//! unioned (a later arrival cannot un-create a resource); deletions are
//! appended, preserving destruction order per source. A field space deleted
//! while regions still consume it becomes *latent* and is only finally
//! deleted once its full consuming-region set is itself deleted.

use crate::event::Event;
use crate::tracing_compat::warn;
use crate::types::{
    FieldId, FieldSpace, IndexPartition, IndexSpace, LogicalRegion, Provenance,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// A region deletion with its diagnostic tag.
#[derive(Debug, Clone)]
pub struct DeletedRegion {
    /// The deleted region.
    pub region: LogicalRegion,
    /// Where the deletion was issued, if recorded.
    pub provenance: Option<Arc<Provenance>>,
}

/// A field deletion with its diagnostic tag.
#[derive(Debug, Clone)]
pub struct DeletedField {
    /// The field space the field belonged to.
    pub space: FieldSpace,
    /// The deleted field.
    pub field: FieldId,
    /// Where the deletion was issued, if recorded.
    pub provenance: Option<Arc<Provenance>>,
}

/// A field space deletion with its diagnostic tag.
#[derive(Debug, Clone)]
pub struct DeletedFieldSpace {
    /// The deleted field space.
    pub space: FieldSpace,
    /// Where the deletion was issued, if recorded.
    pub provenance: Option<Arc<Provenance>>,
}

/// An index space deletion with its diagnostic tag.
#[derive(Debug, Clone)]
pub struct DeletedIndexSpace {
    /// The deleted index space.
    pub space: IndexSpace,
    /// Whether subspaces are deleted too.
    pub recurse: bool,
    /// Where the deletion was issued, if recorded.
    pub provenance: Option<Arc<Provenance>>,
}

/// An index partition deletion with its diagnostic tag.
#[derive(Debug, Clone)]
pub struct DeletedPartition {
    /// The deleted partition.
    pub partition: IndexPartition,
    /// Whether subpartitions are deleted too.
    pub recurse: bool,
    /// Where the deletion was issued, if recorded.
    pub provenance: Option<Arc<Provenance>>,
}

/// A field-space deletion held back by still-live consuming regions.
#[derive(Debug, Default, Clone)]
pub struct LatentSpace {
    /// Regions that must be deleted before the space may be.
    pub consumers: BTreeSet<LogicalRegion>,
    /// Where the deletion was issued, if recorded.
    pub provenance: Option<Arc<Provenance>>,
}

/// A drained batch of resource changes flowing from a child to its parent.
#[derive(Debug, Default)]
pub struct ResourceUpdate {
    /// Created regions with their ownership flags.
    pub created_regions: BTreeMap<LogicalRegion, bool>,
    /// Deleted regions in destruction order.
    pub deleted_regions: Vec<DeletedRegion>,
    /// Created fields.
    pub created_fields: BTreeSet<(FieldSpace, FieldId)>,
    /// Deleted fields in destruction order.
    pub deleted_fields: Vec<DeletedField>,
    /// Created field spaces with their ownership flags.
    pub created_field_spaces: BTreeMap<FieldSpace, bool>,
    /// Field spaces whose deletion is pending on consuming regions.
    pub latent_field_spaces: BTreeMap<FieldSpace, LatentSpace>,
    /// Deleted field spaces in destruction order.
    pub deleted_field_spaces: Vec<DeletedFieldSpace>,
    /// Created index spaces with their ownership flags.
    pub created_index_spaces: BTreeMap<IndexSpace, bool>,
    /// Deleted index spaces in destruction order.
    pub deleted_index_spaces: Vec<DeletedIndexSpace>,
    /// Created partitions with their ownership flags.
    pub created_partitions: BTreeMap<IndexPartition, bool>,
    /// Deleted partitions in destruction order.
    pub deleted_partitions: Vec<DeletedPartition>,
}

impl ResourceUpdate {
    /// Returns true if the update carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created_regions.is_empty()
            && self.deleted_regions.is_empty()
            && self.created_fields.is_empty()
            && self.deleted_fields.is_empty()
            && self.created_field_spaces.is_empty()
            && self.latent_field_spaces.is_empty()
            && self.deleted_field_spaces.is_empty()
            && self.created_index_spaces.is_empty()
            && self.deleted_index_spaces.is_empty()
            && self.created_partitions.is_empty()
            && self.deleted_partitions.is_empty()
    }
}

/// Target side of a resource return.
pub trait ResourceReceiver: Send + Sync {
    /// Invoked once a child's drained resources arrive. `preconditions`
    /// collects events that must trigger before the receiver treats the
    /// transfer as durable.
    fn receive_resources(
        &self,
        return_index: u64,
        update: ResourceUpdate,
        preconditions: &mut Vec<Event>,
    );
}

/// Accumulates created/deleted region-tree resources.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    created_regions: BTreeMap<LogicalRegion, bool>,
    deleted_regions: Vec<DeletedRegion>,
    created_fields: BTreeSet<(FieldSpace, FieldId)>,
    deleted_fields: Vec<DeletedField>,
    created_field_spaces: BTreeMap<FieldSpace, bool>,
    latent_field_spaces: BTreeMap<FieldSpace, LatentSpace>,
    deleted_field_spaces: Vec<DeletedFieldSpace>,
    created_index_spaces: BTreeMap<IndexSpace, bool>,
    deleted_index_spaces: Vec<DeletedIndexSpace>,
    created_partitions: BTreeMap<IndexPartition, bool>,
    deleted_partitions: Vec<DeletedPartition>,
    /// Return indexes already merged into this tracker; guards against
    /// double-merge across retried remote sends.
    applied_returns: HashSet<u64>,
}

impl ResourceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a created region.
    pub fn record_created_region(&mut self, region: LogicalRegion, owned: bool) {
        *self.created_regions.entry(region).or_insert(false) |= owned;
    }

    /// Records a deleted region, resolving any latent field space whose
    /// consuming regions are now all gone.
    pub fn record_deleted_region(&mut self, deleted: DeletedRegion) {
        let region = deleted.region;
        self.deleted_regions.push(deleted);
        self.resolve_latent_spaces_for(region);
    }

    /// Records a created field.
    pub fn record_created_field(&mut self, space: FieldSpace, field: FieldId) {
        self.created_fields.insert((space, field));
    }

    /// Records a deleted field.
    pub fn record_deleted_field(&mut self, deleted: DeletedField) {
        self.deleted_fields.push(deleted);
    }

    /// Records a created field space.
    pub fn record_created_field_space(&mut self, space: FieldSpace, owned: bool) {
        *self.created_field_spaces.entry(space).or_insert(false) |= owned;
    }

    /// Records a field space deletion that must wait until the given
    /// consuming regions are also deleted. The provenance is carried into
    /// the eventual deletion record.
    pub fn record_latent_field_space(
        &mut self,
        space: FieldSpace,
        consumers: impl IntoIterator<Item = LogicalRegion>,
        provenance: Option<Arc<Provenance>>,
    ) {
        let latent = self.latent_field_spaces.entry(space).or_default();
        latent.consumers.extend(consumers);
        if latent.provenance.is_none() {
            latent.provenance = provenance;
        }
    }

    /// Records a deleted field space.
    pub fn record_deleted_field_space(&mut self, deleted: DeletedFieldSpace) {
        self.deleted_field_spaces.push(deleted);
    }

    /// Records a created index space.
    pub fn record_created_index_space(&mut self, space: IndexSpace, owned: bool) {
        *self.created_index_spaces.entry(space).or_insert(false) |= owned;
    }

    /// Records a deleted index space.
    pub fn record_deleted_index_space(&mut self, deleted: DeletedIndexSpace) {
        self.deleted_index_spaces.push(deleted);
    }

    /// Records a created partition.
    pub fn record_created_partition(&mut self, partition: IndexPartition, owned: bool) {
        *self.created_partitions.entry(partition).or_insert(false) |= owned;
    }

    /// Records a deleted partition.
    pub fn record_deleted_partition(&mut self, deleted: DeletedPartition) {
        self.deleted_partitions.push(deleted);
    }

    /// Returns true if anything has accumulated that a parent should see.
    #[must_use]
    pub fn has_return_resources(&self) -> bool {
        !self.drain_preview_is_empty()
    }

    fn drain_preview_is_empty(&self) -> bool {
        self.created_regions.is_empty()
            && self.deleted_regions.is_empty()
            && self.created_fields.is_empty()
            && self.deleted_fields.is_empty()
            && self.created_field_spaces.is_empty()
            && self.latent_field_spaces.is_empty()
            && self.deleted_field_spaces.is_empty()
            && self.created_index_spaces.is_empty()
            && self.deleted_index_spaces.is_empty()
            && self.created_partitions.is_empty()
            && self.deleted_partitions.is_empty()
    }

    /// Drains this tracker's accumulation into an update batch.
    #[must_use]
    pub fn drain(&mut self) -> ResourceUpdate {
        ResourceUpdate {
            created_regions: core::mem::take(&mut self.created_regions),
            deleted_regions: core::mem::take(&mut self.deleted_regions),
            created_fields: core::mem::take(&mut self.created_fields),
            deleted_fields: core::mem::take(&mut self.deleted_fields),
            created_field_spaces: core::mem::take(&mut self.created_field_spaces),
            latent_field_spaces: core::mem::take(&mut self.latent_field_spaces),
            deleted_field_spaces: core::mem::take(&mut self.deleted_field_spaces),
            created_index_spaces: core::mem::take(&mut self.created_index_spaces),
            deleted_index_spaces: core::mem::take(&mut self.deleted_index_spaces),
            created_partitions: core::mem::take(&mut self.created_partitions),
            deleted_partitions: core::mem::take(&mut self.deleted_partitions),
        }
    }

    /// Drains this tracker into `target`.
    ///
    /// `return_index` identifies this transfer; the receiving side drops a
    /// replayed transfer with an index it has already applied.
    /// `preconditions` collects events the target must observe before the
    /// transfer is durable.
    pub fn return_resources(
        &mut self,
        target: &dyn ResourceReceiver,
        return_index: u64,
        preconditions: &mut Vec<Event>,
    ) {
        if self.drain_preview_is_empty() {
            return;
        }
        let update = self.drain();
        target.receive_resources(return_index, update, preconditions);
    }

    /// Merges a received update into this tracker. Returns false if the
    /// return index was already applied (the update is dropped whole).
    pub fn merge_received_resources(&mut self, return_index: u64, update: ResourceUpdate) -> bool {
        if !self.applied_returns.insert(return_index) {
            warn!(return_index, "dropping replayed resource return");
            return false;
        }
        for (region, owned) in update.created_regions {
            self.record_created_region(region, owned);
        }
        for (space, owned) in update.created_field_spaces {
            self.record_created_field_space(space, owned);
        }
        for (space, owned) in update.created_index_spaces {
            self.record_created_index_space(space, owned);
        }
        for (partition, owned) in update.created_partitions {
            self.record_created_partition(partition, owned);
        }
        self.created_fields.extend(update.created_fields);

        // Deletions are appended, never merged, preserving per-source order.
        for deleted in update.deleted_regions {
            self.record_deleted_region(deleted);
        }
        self.deleted_fields.extend(update.deleted_fields);
        self.deleted_field_spaces.extend(update.deleted_field_spaces);
        self.deleted_index_spaces.extend(update.deleted_index_spaces);
        self.deleted_partitions.extend(update.deleted_partitions);

        for (space, latent) in update.latent_field_spaces {
            self.record_latent_field_space(space, latent.consumers, latent.provenance);
        }
        let latent: Vec<FieldSpace> = self.latent_field_spaces.keys().copied().collect();
        for space in latent {
            self.try_resolve_latent_space(space);
        }
        true
    }

    fn resolve_latent_spaces_for(&mut self, region: LogicalRegion) {
        let affected: Vec<FieldSpace> = self
            .latent_field_spaces
            .iter()
            .filter(|(_, latent)| latent.consumers.contains(&region))
            .map(|(space, _)| *space)
            .collect();
        for space in affected {
            self.try_resolve_latent_space(space);
        }
    }

    /// Promotes a latent field-space deletion to a real one once every
    /// consuming region has been deleted.
    fn try_resolve_latent_space(&mut self, space: FieldSpace) {
        let Some(latent) = self.latent_field_spaces.get(&space) else {
            return;
        };
        let all_deleted = latent
            .consumers
            .iter()
            .all(|region| self.deleted_regions.iter().any(|d| d.region == *region));
        if all_deleted {
            if let Some(latent) = self.latent_field_spaces.remove(&space) {
                self.deleted_field_spaces.push(DeletedFieldSpace {
                    space,
                    provenance: latent.provenance,
                });
            }
        }
    }

    /// Created regions and their ownership flags.
    #[must_use]
    pub fn created_regions(&self) -> &BTreeMap<LogicalRegion, bool> {
        &self.created_regions
    }

    /// Deleted regions in destruction order.
    #[must_use]
    pub fn deleted_regions(&self) -> &[DeletedRegion] {
        &self.deleted_regions
    }

    /// Deleted field spaces in destruction order.
    #[must_use]
    pub fn deleted_field_spaces(&self) -> &[DeletedFieldSpace] {
        &self.deleted_field_spaces
    }

    /// Field spaces whose deletion is still pending on consuming regions.
    #[must_use]
    pub fn latent_field_spaces(&self) -> &BTreeMap<FieldSpace, LatentSpace> {
        &self.latent_field_spaces
    }

    /// Deleted fields in destruction order.
    #[must_use]
    pub fn deleted_fields(&self) -> &[DeletedField] {
        &self.deleted_fields
    }

    /// Created fields.
    #[must_use]
    pub fn created_fields(&self) -> &BTreeSet<(FieldSpace, FieldId)> {
        &self.created_fields
    }

    /// Deleted index spaces in destruction order.
    #[must_use]
    pub fn deleted_index_spaces(&self) -> &[DeletedIndexSpace] {
        &self.deleted_index_spaces
    }

    /// Deleted partitions in destruction order.
    #[must_use]
    pub fn deleted_partitions(&self) -> &[DeletedPartition] {
        &self.deleted_partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_with_region(region: u64, owned: bool) -> ResourceUpdate {
        let mut update = ResourceUpdate::default();
        update.created_regions.insert(LogicalRegion(region), owned);
        update
    }

    #[test]
    fn created_resources_union_ownership() {
        let mut tracker = ResourceTracker::new();
        tracker.merge_received_resources(0, update_with_region(1, false));
        tracker.merge_received_resources(1, update_with_region(1, true));
        tracker.merge_received_resources(2, update_with_region(1, false));
        assert_eq!(tracker.created_regions().len(), 1);
        assert!(tracker.created_regions()[&LogicalRegion(1)]);
    }

    #[test]
    fn replayed_return_index_is_dropped() {
        let mut tracker = ResourceTracker::new();
        let mut update = ResourceUpdate::default();
        update.deleted_regions.push(DeletedRegion {
            region: LogicalRegion(9),
            provenance: None,
        });
        assert!(tracker.merge_received_resources(7, update));

        let mut replay = ResourceUpdate::default();
        replay.deleted_regions.push(DeletedRegion {
            region: LogicalRegion(9),
            provenance: None,
        });
        assert!(!tracker.merge_received_resources(7, replay));
        assert_eq!(tracker.deleted_regions().len(), 1);
    }

    #[test]
    fn deletions_preserve_order() {
        let mut tracker = ResourceTracker::new();
        for region in [3, 1, 2] {
            tracker.record_deleted_region(DeletedRegion {
                region: LogicalRegion(region),
                provenance: None,
            });
        }
        let order: Vec<u64> = tracker.deleted_regions().iter().map(|d| d.region.0).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn latent_space_resolves_once_consumers_deleted() {
        let mut tracker = ResourceTracker::new();
        tracker.record_latent_field_space(
            FieldSpace(4),
            [LogicalRegion(10), LogicalRegion(11)],
            Provenance::from_option(Some("teardown.rs:40")),
        );
        tracker.record_deleted_region(DeletedRegion {
            region: LogicalRegion(10),
            provenance: None,
        });
        assert!(tracker.deleted_field_spaces().is_empty());
        assert_eq!(tracker.latent_field_spaces().len(), 1);

        tracker.record_deleted_region(DeletedRegion {
            region: LogicalRegion(11),
            provenance: None,
        });
        assert!(tracker.latent_field_spaces().is_empty());
        assert_eq!(tracker.deleted_field_spaces().len(), 1);
        let resolved = &tracker.deleted_field_spaces()[0];
        assert_eq!(resolved.space, FieldSpace(4));
        // The provenance supplied with the deferred deletion survives
        // resolution.
        assert_eq!(
            resolved.provenance.as_deref().map(Provenance::human),
            Some("teardown.rs:40")
        );
    }

    #[test]
    fn drain_empties_the_tracker() {
        let mut tracker = ResourceTracker::new();
        tracker.record_created_field(FieldSpace(1), FieldId(2));
        assert!(tracker.has_return_resources());
        let update = tracker.drain();
        assert!(!update.is_empty());
        assert!(!tracker.has_return_resources());
    }
}
