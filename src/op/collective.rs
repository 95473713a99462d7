//! Collective view rendezvous for point operations of one index launch.
//!
//! N point operations independently discover that they touch the same
//! logical region at the same analysis stage and must agree on a single
//! shared view identity without a central coordinator blocking the launch.
//! Each point arrives at a rendezvous keyed by (region index, analysis
//! index, region); arrivals with equal instance sets share one result,
//! divergent instance sets form independent finalize groups. Once every
//! expected participant has arrived (counted once per calling operation,
//! not per result), the canonical identity is computed and written into
//! every registered target in one pass.

use crate::tracing_compat::{debug, warn};
use crate::types::{AddressSpaceId, DistributedId, FieldMask, LogicalRegion, UniqueOpId};
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Identifies one rendezvous point; ordered by region index, then
/// analysis index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RendezvousKey {
    /// Index of the region requirement within the launch.
    pub region_index: usize,
    /// Index of the analysis stage.
    pub analysis_index: usize,
}

/// A rendezvous key qualified by the concrete region, ordered
/// lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingRendezvousKey {
    /// Index of the region requirement within the launch.
    pub region_index: usize,
    /// Index of the analysis stage.
    pub analysis_index: usize,
    /// The region being rendezvoused on.
    pub region: LogicalRegion,
}

impl PendingRendezvousKey {
    /// The unqualified rendezvous key.
    #[must_use]
    pub const fn key(&self) -> RendezvousKey {
        RendezvousKey {
            region_index: self.region_index,
            analysis_index: self.analysis_index,
        }
    }
}

/// The agreed-upon shared view identity broadcast at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveResult {
    /// The shared distributed identity all participants observe.
    pub collective_id: DistributedId,
    /// The region the identity covers.
    pub region: LogicalRegion,
}

/// Writable slot a participant registers to receive the finalized result.
pub type ResultSlot = Arc<Mutex<Option<CollectiveResult>>>;

/// One instance-set variant under a pending rendezvous.
struct RendezvousResult {
    space: AddressSpaceId,
    instances: Vec<(DistributedId, FieldMask)>,
    targets: Vec<ResultSlot>,
    contributors: HashSet<UniqueOpId>,
}

impl RendezvousResult {
    fn matches(&self, instances: &[(DistributedId, FieldMask)]) -> bool {
        self.instances == instances
    }
}

struct PendingCollective {
    remaining_arrivals: usize,
    /// Insertion order captured at creation fixes the broadcast order;
    /// finalize must not depend on arrival order of later participants.
    results: Vec<RendezvousResult>,
    arrived: HashSet<UniqueOpId>,
}

#[derive(Default)]
struct CollectiveTables {
    pending: BTreeMap<PendingRendezvousKey, PendingCollective>,
    /// Withdrawals that raced ahead of the first arrival for their key;
    /// drained into the entry when it is created.
    early_withdrawals: BTreeMap<PendingRendezvousKey, HashSet<UniqueOpId>>,
}

/// Rendezvous tables owned by the operation that created the collective
/// analysis (typically an index-space launch).
#[derive(Default)]
pub struct CollectiveState {
    // Dedicated lock for the shared tables; never taken while holding an
    // operation's own lock.
    tables: Mutex<CollectiveTables>,
}

impl CollectiveState {
    /// Number of rendezvous still awaiting arrivals.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.tables.lock().pending.len()
    }

    /// Registers an arrival of `caller` at the rendezvous for `key`.
    ///
    /// The first caller creates the pending entry with
    /// `expected_arrivals`. Equal instance sets share one result; a
    /// divergent set opens a new result group under the same key. The
    /// arrival count decrements once per distinct calling operation, no
    /// matter how many results it touches. When it reaches zero the
    /// collective identity is finalized and written into every registered
    /// slot.
    #[allow(clippy::too_many_arguments)]
    pub fn find_or_create_rendezvous(
        &self,
        caller: UniqueOpId,
        key: PendingRendezvousKey,
        space: AddressSpaceId,
        instances: Vec<(DistributedId, FieldMask)>,
        expected_arrivals: usize,
        target: ResultSlot,
    ) {
        let finalize = {
            let mut tables = self.tables.lock();
            let tables = &mut *tables;
            let entry = match tables.pending.entry(key) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    // Withdrawals that beat the first arrival already count
                    // as arrived.
                    let arrived = tables.early_withdrawals.remove(&key).unwrap_or_default();
                    debug_assert!(arrived.len() <= expected_arrivals);
                    vacant.insert(PendingCollective {
                        remaining_arrivals: expected_arrivals.saturating_sub(arrived.len()),
                        results: Vec::new(),
                        arrived,
                    })
                }
            };
            if let Some(result) = entry
                .results
                .iter_mut()
                .find(|result| result.matches(&instances))
            {
                result.targets.push(target);
                result.contributors.insert(caller);
            } else {
                entry.results.push(RendezvousResult {
                    space,
                    instances,
                    targets: vec![target],
                    contributors: HashSet::from([caller]),
                });
            }
            // Duplicate arrivals across results of one op count once.
            if entry.arrived.insert(caller) {
                debug_assert!(entry.remaining_arrivals > 0);
                entry.remaining_arrivals -= 1;
            }
            if entry.remaining_arrivals == 0 {
                tables.pending.remove(&key)
            } else {
                None
            }
        };
        if let Some(collective) = finalize {
            Self::finalize_collective_mapping(key, collective);
        }
    }

    /// Withdraws `caller` from the rendezvous for `key` (e.g. a quashed
    /// point) without corrupting the arrival count. If the withdrawal was
    /// the last missing arrival, the remaining participants finalize. A
    /// withdrawal that beats the first arrival is remembered and applied
    /// when the entry is created.
    pub fn remove_pending_rendezvous(&self, caller: UniqueOpId, key: PendingRendezvousKey) {
        let finalize = {
            let mut tables = self.tables.lock();
            let Some(entry) = tables.pending.get_mut(&key) else {
                tables
                    .early_withdrawals
                    .entry(key)
                    .or_default()
                    .insert(caller);
                return;
            };
            for result in &mut entry.results {
                if result.contributors.remove(&caller) {
                    // Its registered slots stay unfilled.
                    result.targets.clear();
                }
            }
            entry.results.retain(|result| !result.contributors.is_empty());
            if entry.arrived.insert(caller) {
                // Had not arrived yet: it never will, so stop waiting on it.
                debug_assert!(entry.remaining_arrivals > 0);
                entry.remaining_arrivals -= 1;
            }
            if entry.remaining_arrivals == 0 {
                tables.pending.remove(&key)
            } else {
                None
            }
        };
        if let Some(collective) = finalize {
            Self::finalize_collective_mapping(key, collective);
        }
    }

    /// Computes the canonical identity per result group and broadcasts it.
    /// Runs exactly once per key, after the last arrival.
    fn finalize_collective_mapping(key: PendingRendezvousKey, collective: PendingCollective) {
        if collective.results.len() > 1 {
            warn!(
                region_index = key.region_index,
                analysis_index = key.analysis_index,
                region = key.region.0,
                groups = collective.results.len(),
                "divergent instance sets at collective rendezvous"
            );
        }
        for result in collective.results {
            // Canonical identity: the smallest distributed id in the group,
            // deterministic regardless of arrival order.
            let Some(collective_id) = result
                .instances
                .iter()
                .map(|(id, _)| *id)
                .min()
            else {
                continue;
            };
            debug!(
                region = key.region.0,
                space = result.space.0,
                collective_id = collective_id.0,
                participants = result.targets.len(),
                "finalized collective view"
            );
            let value = CollectiveResult {
                collective_id,
                region: key.region,
            };
            for target in result.targets {
                *target.lock() = Some(value);
            }
        }
    }
}

impl core::fmt::Debug for CollectiveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CollectiveState(pending={})", self.pending_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldId;

    fn key() -> PendingRendezvousKey {
        PendingRendezvousKey {
            region_index: 0,
            analysis_index: 1,
            region: LogicalRegion(7),
        }
    }

    fn instances(ids: &[u64]) -> Vec<(DistributedId, FieldMask)> {
        ids.iter()
            .map(|id| (DistributedId(*id), FieldMask::single(FieldId(0))))
            .collect()
    }

    #[test]
    fn equal_instance_sets_share_one_identity() {
        let state = CollectiveState::default();
        let slots: Vec<ResultSlot> = (0..4).map(|_| ResultSlot::default()).collect();
        for (i, slot) in slots.iter().enumerate() {
            state.find_or_create_rendezvous(
                UniqueOpId(i as u64),
                key(),
                AddressSpaceId(0),
                instances(&[30, 12, 25]),
                4,
                slot.clone(),
            );
        }
        assert_eq!(state.pending_count(), 0);
        let expected = CollectiveResult {
            collective_id: DistributedId(12),
            region: LogicalRegion(7),
        };
        for slot in slots {
            assert_eq!(*slot.lock(), Some(expected));
        }
    }

    #[test]
    fn finalize_waits_for_all_arrivals() {
        let state = CollectiveState::default();
        let slot = ResultSlot::default();
        state.find_or_create_rendezvous(
            UniqueOpId(1),
            key(),
            AddressSpaceId(0),
            instances(&[5]),
            2,
            slot.clone(),
        );
        assert!(slot.lock().is_none());
        assert_eq!(state.pending_count(), 1);
    }

    #[test]
    fn duplicate_arrival_of_one_op_counts_once() {
        let state = CollectiveState::default();
        let first = ResultSlot::default();
        let second = ResultSlot::default();
        // Same op arrives twice with divergent instance sets.
        state.find_or_create_rendezvous(
            UniqueOpId(1),
            key(),
            AddressSpaceId(0),
            instances(&[5]),
            2,
            first.clone(),
        );
        state.find_or_create_rendezvous(
            UniqueOpId(1),
            key(),
            AddressSpaceId(0),
            instances(&[6]),
            2,
            second.clone(),
        );
        // Still waiting for the second distinct op.
        assert_eq!(state.pending_count(), 1);
        assert!(first.lock().is_none());

        state.find_or_create_rendezvous(
            UniqueOpId(2),
            key(),
            AddressSpaceId(0),
            instances(&[5]),
            2,
            ResultSlot::default(),
        );
        assert_eq!(state.pending_count(), 0);
        // Divergent sets finalize as independent groups.
        assert_eq!(first.lock().map(|r| r.collective_id), Some(DistributedId(5)));
        assert_eq!(second.lock().map(|r| r.collective_id), Some(DistributedId(6)));
    }

    #[test]
    fn withdrawal_lets_remaining_participants_finalize() {
        let state = CollectiveState::default();
        let slot = ResultSlot::default();
        state.find_or_create_rendezvous(
            UniqueOpId(1),
            key(),
            AddressSpaceId(0),
            instances(&[9, 4]),
            2,
            slot.clone(),
        );
        state.remove_pending_rendezvous(UniqueOpId(2), key());
        assert_eq!(state.pending_count(), 0);
        assert_eq!(slot.lock().map(|r| r.collective_id), Some(DistributedId(4)));
    }

    #[test]
    fn withdrawal_before_first_arrival_still_counts() {
        let state = CollectiveState::default();
        state.remove_pending_rendezvous(UniqueOpId(2), key());

        let slot = ResultSlot::default();
        state.find_or_create_rendezvous(
            UniqueOpId(1),
            key(),
            AddressSpaceId(0),
            instances(&[9, 4]),
            2,
            slot.clone(),
        );
        assert_eq!(state.pending_count(), 0);
        assert_eq!(slot.lock().map(|r| r.collective_id), Some(DistributedId(4)));
    }
}
