//! Property tests for resource accumulation and merging.
//!
//! The create/delete collections obey a small algebra: merging a child's
//! return into a parent unions created entries (ownership flags OR),
//! appends deleted entries in order, and applies each return index at
//! most once. These laws hold for arbitrary updates.

use opgraph::resource::{DeletedRegion, ResourceTracker, ResourceUpdate};
use opgraph::types::{FieldId, FieldSpace, LogicalRegion};
use proptest::prelude::*;

fn arb_created_regions() -> impl Strategy<Value = Vec<(u64, bool)>> {
    prop::collection::vec((1u64..50, any::<bool>()), 0..12)
}

fn arb_deleted_regions() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..50, 0..12)
}

fn update_from(created: &[(u64, bool)], deleted: &[u64]) -> ResourceUpdate {
    let mut update = ResourceUpdate::default();
    for &(region, owned) in created {
        *update
            .created_regions
            .entry(LogicalRegion(region))
            .or_insert(false) |= owned;
    }
    for &region in deleted {
        update.deleted_regions.push(DeletedRegion {
            region: LogicalRegion(region),
            provenance: None,
        });
    }
    update
}

proptest! {
    #[test]
    fn replayed_return_changes_nothing(
        created in arb_created_regions(),
        deleted in arb_deleted_regions(),
    ) {
        let mut once = ResourceTracker::new();
        prop_assert!(once.merge_received_resources(7, update_from(&created, &deleted)));

        let mut twice = ResourceTracker::new();
        prop_assert!(twice.merge_received_resources(7, update_from(&created, &deleted)));
        prop_assert!(!twice.merge_received_resources(7, update_from(&created, &deleted)));

        prop_assert_eq!(once.created_regions(), twice.created_regions());
        prop_assert_eq!(once.deleted_regions().len(), twice.deleted_regions().len());
    }

    #[test]
    fn ownership_flags_union_across_returns(
        regions in prop::collection::vec(1u64..20, 1..8),
    ) {
        let mut tracker = ResourceTracker::new();
        let unowned: Vec<(u64, bool)> = regions.iter().map(|&r| (r, false)).collect();
        let owned: Vec<(u64, bool)> = regions.iter().map(|&r| (r, true)).collect();
        tracker.merge_received_resources(1, update_from(&unowned, &[]));
        tracker.merge_received_resources(2, update_from(&owned, &[]));
        tracker.merge_received_resources(3, update_from(&unowned, &[]));
        for flag in tracker.created_regions().values() {
            // Once owned, always owned.
            prop_assert!(*flag);
        }
    }

    #[test]
    fn deletions_append_in_source_order(
        first in arb_deleted_regions(),
        second in arb_deleted_regions(),
    ) {
        let mut tracker = ResourceTracker::new();
        tracker.merge_received_resources(1, update_from(&[], &first));
        tracker.merge_received_resources(2, update_from(&[], &second));
        let recorded: Vec<u64> = tracker
            .deleted_regions()
            .iter()
            .map(|d| d.region.0)
            .collect();
        let expected: Vec<u64> = first.iter().chain(second.iter()).copied().collect();
        prop_assert_eq!(recorded, expected);
    }

    #[test]
    fn latent_space_resolves_only_after_every_consumer(
        consumers in prop::collection::vec(1u64..20, 1..6),
    ) {
        let mut tracker = ResourceTracker::new();
        tracker.record_latent_field_space(
            FieldSpace(3),
            consumers.iter().map(|&r| LogicalRegion(r)),
            None,
        );
        let mut distinct: Vec<u64> = consumers.clone();
        distinct.sort_unstable();
        distinct.dedup();
        let (last, rest) = distinct.split_last().expect("non-empty");
        let mut index = 10;
        for &region in rest {
            tracker.merge_received_resources(index, update_from(&[], &[region]));
            index += 1;
            prop_assert!(tracker.deleted_field_spaces().is_empty());
        }
        tracker.merge_received_resources(index, update_from(&[], &[*last]));
        prop_assert_eq!(tracker.deleted_field_spaces().len(), 1);
        prop_assert_eq!(tracker.deleted_field_spaces()[0].space, FieldSpace(3));
        prop_assert!(tracker.latent_field_spaces().is_empty());
    }
}

#[test]
fn created_fields_survive_merge() {
    let mut child = ResourceTracker::new();
    child.record_created_field(FieldSpace(1), FieldId(4));
    child.record_created_field(FieldSpace(1), FieldId(5));
    let update = child.drain();
    let mut parent = ResourceTracker::new();
    assert!(parent.merge_received_resources(0, update));
    assert_eq!(parent.created_fields().len(), 2);
    assert!(!child.has_return_resources());
}