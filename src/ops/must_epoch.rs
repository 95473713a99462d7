//! Gang-scheduled operation groups.
//!
//! A must-epoch groups operations that are guaranteed to run
//! concurrently: none may wait on another's completion. The epoch
//! analyzes the union of its children's requirements against the context
//! window, rejects any launch whose children interfere with each other,
//! asks the mapper for one jointly satisfiable assignment, and then fans
//! the children out. Three counts must each drain before the epoch is
//! done: resource returns, child completions, and child commits.

use crate::error::{Error, ErrorKind};
use crate::event::{Event, UserEvent};
use crate::op::{self, OpBase, OpKind, Operation};
use crate::ops::{analyze_in_context, launch_internal};
use crate::resource::{ResourceReceiver, ResourceTracker, ResourceUpdate};
use crate::runtime::Runtime;
use crate::tracing_compat::debug;
use crate::types::{DependenceType, Provenance, RegionRequirement, UniqueOpId};
use parking_lot::Mutex;
use std::sync::Arc;

struct MustEpochInner {
    remaining_resource_returns: usize,
    remaining_subop_completes: usize,
    remaining_subop_commits: usize,
    commit_requested: bool,
    launched: bool,
    /// Atomic/simultaneous hazards between grouped children. Legal under
    /// concurrent execution but the physical layer must synchronize them.
    constraints: Vec<(UniqueOpId, UniqueOpId, DependenceType)>,
}

/// A barrier operation over a gang of concurrently executing children.
pub struct MustEpochOp {
    base: OpBase,
    context: usize,
    children: Mutex<Vec<Arc<dyn Operation>>>,
    resources: Mutex<ResourceTracker>,
    inner: Mutex<MustEpochInner>,
    /// Triggers once every child's resource return has merged.
    returns_drained: UserEvent,
}

impl MustEpochOp {
    /// Creates and initializes an empty epoch in `context`. Children are
    /// added with [`add_operation`] before the epoch is issued.
    ///
    /// [`add_operation`]: MustEpochOp::add_operation
    #[must_use]
    pub fn new(
        runtime: &Arc<Runtime>,
        context: usize,
        provenance: Option<Arc<Provenance>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            base: OpBase::new(runtime.dispatcher()),
            context,
            children: Mutex::new(Vec::new()),
            resources: Mutex::new(ResourceTracker::new()),
            inner: Mutex::new(MustEpochInner {
                remaining_resource_returns: 0,
                remaining_subop_completes: 0,
                remaining_subop_commits: 0,
                commit_requested: false,
                launched: false,
                constraints: Vec::new(),
            }),
            returns_drained: UserEvent::new(runtime.dispatcher()),
        });
        let op = this.clone().as_op();
        op::initialize_operation(&op, runtime, Some(context), provenance);
        runtime.register_operation(&op);
        this
    }

    /// Adds a grouped child. Must precede issue.
    pub fn add_operation(&self, child: &Arc<dyn Operation>) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.launched, "children added after launch");
        inner.remaining_resource_returns += 1;
        inner.remaining_subop_completes += 1;
        inner.remaining_subop_commits += 1;
        drop(inner);
        self.children.lock().push(child.clone());
    }

    /// Number of grouped children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Checks that no two grouped children carry an ordering hazard
    /// against each other. Concurrent execution makes any such hazard
    /// unsatisfiable.
    fn verify_gang(&self, runtime: &Arc<Runtime>) -> Result<(), Error> {
        let children = self.children.lock().clone();
        for (idx1, first) in children.iter().enumerate() {
            for second in &children[idx1 + 1..] {
                for prior in first.requirements() {
                    for later in second.requirements() {
                        let (dtype, _) = runtime.forest().compute_dependence(&prior, &later);
                        if dtype.is_ordering() {
                            // A data hazard between members of a gang can
                            // never be satisfied: neither may wait on the
                            // other.
                            return Err(Error::with_message(
                                ErrorKind::MustEpochFailure,
                                format!(
                                    "grouped operations {} and {} interfere",
                                    first.base().unique_id(),
                                    second.base().unique_id()
                                ),
                            ));
                        }
                        if matches!(
                            dtype,
                            DependenceType::AtomicDependence
                                | DependenceType::SimultaneousDependence
                        ) {
                            self.inner.lock().constraints.push((
                                first.base().unique_id(),
                                second.base().unique_id(),
                                dtype,
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Atomic/simultaneous constraints recorded between grouped children.
    #[must_use]
    pub fn constraints(&self) -> Vec<(UniqueOpId, UniqueOpId, DependenceType)> {
        self.inner.lock().constraints.clone()
    }

    fn notify_subop_complete(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.remaining_subop_completes > 0);
        inner.remaining_subop_completes -= 1;
    }

    fn notify_subop_commit(self: &Arc<Self>, runtime: &Arc<Runtime>) {
        let commit_now = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.remaining_subop_commits > 0);
            inner.remaining_subop_commits -= 1;
            inner.remaining_subop_commits == 0 && inner.commit_requested
        };
        if commit_now {
            let op = self.clone().as_op();
            op::commit_operation(&op, runtime, None);
        }
    }
}

impl Operation for MustEpochOp {
    fn base(&self) -> &OpBase {
        &self.base
    }

    fn kind(&self) -> OpKind {
        OpKind::MustEpoch
    }

    fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
        self
    }

    fn requirements(&self) -> Vec<RegionRequirement> {
        // The epoch orders against the window on behalf of every child.
        self.children
            .lock()
            .iter()
            .flat_map(|child| child.requirements())
            .collect()
    }

    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let context = self.context;
        let op = self.as_op();
        analyze_in_context(runtime, context, &op);
    }

    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        if let Err(failure) = self.verify_gang(runtime) {
            runtime.mapper().report_failure(&failure);
            return;
        }
        let children = self.children.lock().clone();
        if let Err(failure) = runtime.mapper().map_must_epoch(&children) {
            runtime.mapper().report_failure(&failure);
            return;
        }

        let op = self.clone().as_op();
        let fence = op.base().execution_fence_event();
        {
            let mut inner = self.inner.lock();
            inner.launched = true;
        }
        debug!(
            op = %op.base().unique_id(),
            children = children.len(),
            "must epoch launching gang"
        );

        op::record_completion_effect(&op, self.returns_drained.event());
        for (index, child) in children.iter().enumerate() {
            op::record_completion_effect(&op, child.base().completion_event());

            // A child with no tracker of its own still owes the epoch an
            // empty return once it completes.
            let epoch = Arc::downgrade(&self);
            let completion_index = index as u64;
            child
                .base()
                .completion_event()
                .attach(crate::dispatch::Priority::Work, move || {
                    if let Some(epoch) = epoch.upgrade() {
                        let mut preconditions = Vec::new();
                        epoch.receive_resources(
                            completion_index,
                            ResourceUpdate::default(),
                            &mut preconditions,
                        );
                        epoch.notify_subop_complete();
                    }
                });

            let epoch = Arc::downgrade(&self);
            let weak_rt = Arc::downgrade(runtime);
            child
                .base()
                .commit_event()
                .attach(crate::dispatch::Priority::Work, move || {
                    if let (Some(epoch), Some(runtime)) = (epoch.upgrade(), weak_rt.upgrade()) {
                        epoch.notify_subop_commit(&runtime);
                    }
                });

            launch_internal(runtime, child);
        }
        if self.inner.lock().remaining_resource_returns == 0 {
            self.returns_drained.trigger();
        }
        op::complete_mapping(&op, runtime, None);
        op::complete_execution(&op, runtime, fence);
    }

    fn trigger_commit(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let commit_now = {
            let mut inner = self.inner.lock();
            inner.commit_requested = true;
            inner.remaining_subop_commits == 0
        };
        if commit_now {
            let op = self.as_op();
            op::commit_operation(&op, runtime, None);
        }
    }

    fn resources(&self) -> Option<&Mutex<ResourceTracker>> {
        Some(&self.resources)
    }
}

impl ResourceReceiver for MustEpochOp {
    fn receive_resources(
        &self,
        return_index: u64,
        update: ResourceUpdate,
        _preconditions: &mut Vec<Event>,
    ) {
        let merged = self
            .resources
            .lock()
            .merge_received_resources(return_index, update);
        if !merged {
            return;
        }
        let drained = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.remaining_resource_returns > 0);
            inner.remaining_resource_returns -= 1;
            inner.remaining_resource_returns == 0
        };
        if drained {
            self.returns_drained.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::InMemoryForest;
    use crate::mapper::Mapper;
    use crate::ops::fill::FillOp;
    use crate::types::{FieldId, FieldMask, LogicalRegion, PrivilegeMode};

    fn req(region: u64, field: u32) -> RegionRequirement {
        RegionRequirement::new(
            LogicalRegion(region),
            PrivilegeMode::ReadWrite,
            FieldMask::single(FieldId(field)),
        )
    }

    #[test]
    fn epoch_commits_after_every_child() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let epoch = MustEpochOp::new(&runtime, context.index(), None);
        let first = FillOp::new(&runtime, context.index(), req(1, 0), None, None);
        let second = FillOp::new(&runtime, context.index(), req(2, 0), None, None);
        epoch.add_operation(&first.clone().as_op());
        epoch.add_operation(&second.clone().as_op());
        let op = epoch.clone().as_op();
        context.issue(&runtime, &op);
        runtime.dispatcher().run_until_quiescent();
        assert!(first.base().generation() > 0);
        assert!(second.base().generation() > 0);
        assert!(epoch.base().generation() > 0);
    }

    #[derive(Default)]
    struct RecordingMapper {
        failures: Mutex<Vec<String>>,
    }

    impl Mapper for RecordingMapper {
        fn report_failure(&self, failure: &Error) {
            self.failures.lock().push(failure.to_string());
        }
    }

    #[test]
    fn interfering_children_fail_the_gang() {
        let mapper = Arc::new(RecordingMapper::default());
        let runtime =
            Runtime::with_collaborators(Arc::new(InMemoryForest::default()), mapper.clone());
        let context = runtime.create_context();
        let epoch = MustEpochOp::new(&runtime, context.index(), None);
        let first = FillOp::new(&runtime, context.index(), req(3, 1), None, None);
        let second = FillOp::new(&runtime, context.index(), req(3, 1), None, None);
        epoch.add_operation(&first.clone().as_op());
        epoch.add_operation(&second.clone().as_op());
        let op = epoch.clone().as_op();
        context.issue(&runtime, &op);
        runtime.dispatcher().run_until_quiescent();
        // Reported at analysis (the epoch's own requirements interfere)
        // and again when the gang is verified at mapping.
        assert!(!mapper.failures.lock().is_empty());
        assert!(!epoch.base().is_mapped());
    }

    #[test]
    fn duplicate_resource_return_counts_once() {
        let runtime = Runtime::new();
        let context = runtime.create_context();
        let epoch = MustEpochOp::new(&runtime, context.index(), None);
        let child = FillOp::new(&runtime, context.index(), req(4, 0), None, None);
        epoch.add_operation(&child.clone().as_op());
        let mut preconditions = Vec::new();
        let mut update = ResourceUpdate::default();
        update.created_regions.insert(LogicalRegion(40), true);
        epoch.receive_resources(0, update, &mut preconditions);
        let mut replay = ResourceUpdate::default();
        replay.created_regions.insert(LogicalRegion(40), true);
        epoch.receive_resources(0, replay, &mut preconditions);
        let resources = epoch.resources.lock();
        assert_eq!(resources.created_regions().len(), 1);
        assert_eq!(epoch.inner.lock().remaining_resource_returns, 0);
    }
}