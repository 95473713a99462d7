//! Collective rendezvous tests.
//!
//! Point operations of one index launch must agree on a single shared
//! view identity without a coordinator. These tests drive the rendezvous
//! tables directly for arrival-count properties and run whole index
//! launches for the end-to-end agreement.

use opgraph::op::collective::{CollectiveState, PendingRendezvousKey, ResultSlot};
use opgraph::op::Operation;
use opgraph::ops::copy::IndexCopyOp;
use opgraph::runtime::Runtime;
use opgraph::types::{
    AddressSpaceId, DistributedId, FieldId, FieldMask, LogicalRegion, PrivilegeMode,
    RegionRequirement, UniqueOpId,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn key(region: u64) -> PendingRendezvousKey {
    PendingRendezvousKey {
        region_index: 1,
        analysis_index: 0,
        region: LogicalRegion(region),
    }
}

fn slot() -> ResultSlot {
    Arc::new(Mutex::new(None))
}

fn instances(ids: &[u64]) -> Vec<(DistributedId, FieldMask)> {
    ids.iter()
        .map(|&id| (DistributedId(id), FieldMask::single(FieldId(0))))
        .collect()
}

#[test]
fn four_identical_arrivals_share_one_view() {
    let state = CollectiveState::default();
    let slots: Vec<ResultSlot> = (0..4).map(|_| slot()).collect();
    for (caller, target) in slots.iter().enumerate() {
        state.find_or_create_rendezvous(
            UniqueOpId(caller as u64 + 1),
            key(10),
            AddressSpaceId(0),
            instances(&[7, 8]),
            4,
            target.clone(),
        );
    }
    let first = (*slots[0].lock()).expect("finalized");
    for target in &slots[1..] {
        assert_eq!((*target.lock()).expect("finalized"), first);
    }
    // Finalize consumed the pending entry; a fifth arrival would start a
    // fresh rendezvous rather than re-finalize.
    assert_eq!(state.pending_count(), 0);
}

#[test]
fn duplicate_arrivals_of_one_caller_count_once() {
    let state = CollectiveState::default();
    let first = slot();
    let second = slot();
    let third = slot();
    // The same op arrives twice (two results registered), then a second
    // distinct op arrives. Expected arrivals is two distinct callers.
    state.find_or_create_rendezvous(
        UniqueOpId(1),
        key(11),
        AddressSpaceId(0),
        instances(&[1]),
        2,
        first.clone(),
    );
    state.find_or_create_rendezvous(
        UniqueOpId(1),
        key(11),
        AddressSpaceId(0),
        instances(&[1]),
        2,
        second.clone(),
    );
    assert!(first.lock().is_none());
    state.find_or_create_rendezvous(
        UniqueOpId(2),
        key(11),
        AddressSpaceId(0),
        instances(&[1]),
        2,
        third.clone(),
    );
    assert!(first.lock().is_some());
    assert_eq!(*first.lock(), *second.lock());
    assert_eq!(*first.lock(), *third.lock());
}

#[test]
fn divergent_instance_sets_finalize_independently() {
    let state = CollectiveState::default();
    let left_a = slot();
    let left_b = slot();
    let right = slot();
    state.find_or_create_rendezvous(
        UniqueOpId(1),
        key(12),
        AddressSpaceId(0),
        instances(&[1, 2]),
        3,
        left_a.clone(),
    );
    state.find_or_create_rendezvous(
        UniqueOpId(2),
        key(12),
        AddressSpaceId(0),
        instances(&[1, 2]),
        3,
        left_b.clone(),
    );
    state.find_or_create_rendezvous(
        UniqueOpId(3),
        key(12),
        AddressSpaceId(0),
        instances(&[9]),
        3,
        right.clone(),
    );
    let left_view = (*left_a.lock()).expect("finalized");
    assert_eq!((*left_b.lock()).expect("finalized"), left_view);
    let right_view = (*right.lock()).expect("finalized");
    assert_ne!(left_view.collective_id, right_view.collective_id);
}

#[test]
fn withdrawal_lets_remaining_participants_finalize() {
    let state = CollectiveState::default();
    let stayer = slot();
    state.find_or_create_rendezvous(
        UniqueOpId(1),
        key(13),
        AddressSpaceId(0),
        instances(&[4]),
        2,
        stayer.clone(),
    );
    assert!(stayer.lock().is_none());
    // The second participant is quashed and withdraws instead of arriving.
    state.remove_pending_rendezvous(UniqueOpId(2), key(13));
    assert!(stayer.lock().is_some());
    assert_eq!(state.pending_count(), 0);
}

#[test]
fn index_copy_launch_agrees_end_to_end() {
    let runtime = Runtime::new();
    let context = runtime.create_context();
    let src = RegionRequirement::new(
        LogicalRegion(20),
        PrivilegeMode::ReadOnly,
        FieldMask::single(FieldId(0)),
    );
    let dst = RegionRequirement::new(
        LogicalRegion(21),
        PrivilegeMode::ReadWrite,
        FieldMask::single(FieldId(0)),
    );
    let launch = IndexCopyOp::new(
        &runtime,
        context.index(),
        src,
        dst,
        4,
        instances(&[30, 31]),
        None,
    );
    let op = launch.clone().as_op();
    context.issue(&runtime, &op);
    runtime.dispatcher().run_until_quiescent();
    assert!(launch.base().generation() > 0);
    assert_eq!(launch.collective_state().pending_count(), 0);
}