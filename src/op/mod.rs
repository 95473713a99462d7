//! The operation pipeline state machine and dependence protocol.
//!
//! Every deferred operation moves through the same monotone pipeline:
//! `created -> dependence-analyzed -> ready -> mapped -> executed ->
//! resolved -> completed -> committed -> reclaimed`. Each stage transition
//! is a `trigger_*` method on [`Operation`], dispatched as an independent
//! work item, never called inline from the previous stage. The base trait
//! supplies defaults appropriate to a leaf operation with no special
//! semantics; concrete kinds override a strict subset.
//!
//! # Design
//!
//! The original formulation is a deep inheritance chain. Here it is a
//! capability set: [`OpBase`] holds the pipeline bookkeeping every op
//! shares, and optional capability states (memoization, predication,
//! collective rendezvous, resource tracking) are exposed through accessor
//! methods that default to `None`. Lifecycle mechanics live as free
//! functions in this module operating on `Arc<dyn Operation>`, so concrete
//! kinds drive the pipeline the same way regardless of which capabilities
//! they carry.
//!
//! Locking: each operation guards its bookkeeping with its own lock. No
//! code path holds two operation locks at once; cross-operation work drains
//! what it needs under one lock, releases it, then touches the other op.

pub mod collective;
pub mod memo;
pub mod predicate;
pub mod predicated;

use crate::dispatch::{Dispatcher, Priority};
use crate::error::{Error, ErrorKind};
use crate::event::{Event, UserEvent};
use crate::resource::ResourceTracker;
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, error, trace, warn};
use crate::types::{
    DependenceType, FieldMask, GenerationId, OpId, Provenance, RegionRequirement, UniqueOpId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

/// The kind of a deferred operation, used for logs and remote payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum OpKind {
    Copy,
    IndexCopy,
    PointCopy,
    Fill,
    IndexFill,
    PointFill,
    Acquire,
    Release,
    Fence,
    Deletion,
    PendingPartition,
    DependentPartition,
    MustEpoch,
    Predicate,
    Timing,
    Remote,
}

impl OpKind {
    /// Stable human-readable name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Copy => "Copy",
            Self::IndexCopy => "Index Copy",
            Self::PointCopy => "Point Copy",
            Self::Fill => "Fill",
            Self::IndexFill => "Index Fill",
            Self::PointFill => "Point Fill",
            Self::Acquire => "Acquire",
            Self::Release => "Release",
            Self::Fence => "Fence",
            Self::Deletion => "Deletion",
            Self::PendingPartition => "Pending Partition",
            Self::DependentPartition => "Dependent Partition",
            Self::MustEpoch => "Must Epoch",
            Self::Predicate => "Predicate",
            Self::Timing => "Timing",
            Self::Remote => "Remote",
        }
    }
}

impl core::fmt::Display for OpKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregates the pending mapping dependences of one operation between
/// `begin_dependence_analysis` and the ready trigger.
#[derive(Debug, Default)]
pub struct MappingDependenceTracker {
    outstanding: usize,
    analysis_done: bool,
    ready_issued: bool,
}

impl MappingDependenceTracker {
    fn record_dependence(&mut self) {
        debug_assert!(!self.analysis_done);
        self.outstanding += 1;
    }

    /// Returns true if the ready trigger should fire now.
    fn satisfy(&mut self) -> bool {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
        self.check_ready()
    }

    /// Marks analysis finished. Returns true if the ready trigger should
    /// fire now.
    fn finalize(&mut self) -> bool {
        self.analysis_done = true;
        self.check_ready()
    }

    fn check_ready(&mut self) -> bool {
        if self.analysis_done && self.outstanding == 0 && !self.ready_issued {
            self.ready_issued = true;
            true
        } else {
            false
        }
    }

    /// Number of unsatisfied dependences.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Counts validating consumers that must commit before this operation may.
#[derive(Debug, Default)]
pub struct CommitDependenceTracker {
    outstanding: usize,
}

impl CommitDependenceTracker {
    fn record_dependence(&mut self) {
        self.outstanding += 1;
    }

    fn satisfy(&mut self) {
        debug_assert!(self.outstanding > 0);
        self.outstanding -= 1;
    }

    /// Number of consumers that have not yet committed.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }
}

type WeakOp = Weak<dyn Operation>;

/// A recorded dependence edge, generation-qualified.
struct IncomingEdge {
    target: WeakOp,
    target_gen: GenerationId,
}

struct OpState {
    op_id: Option<OpId>,
    unique_id: UniqueOpId,
    gen: GenerationId,
    context: Option<usize>,
    provenance: Option<Arc<Provenance>>,

    activated: bool,
    mapped: bool,
    executed: bool,
    resolved: bool,
    completed: bool,
    committed: bool,
    hardened: bool,
    quashed: bool,
    early_commit_request: bool,
    trigger_commit_invoked: bool,
    complete_enqueued: bool,

    // Frozen once the completion gate is passed; no dependence may register
    // against this generation afterwards.
    refs_frozen: bool,
    outstanding_mapping_refs: usize,

    mapping_tracker: MappingDependenceTracker,
    commit_tracker: CommitDependenceTracker,

    /// Edges this op holds mapping references on, released once mapped.
    incoming: Vec<IncomingEdge>,
    /// Dependents recorded against this op, for diagnostics.
    outgoing: Vec<(UniqueOpId, GenerationId)>,
    /// Provably-independent accesses recorded while tracing.
    no_dependences: Vec<(UniqueOpId, GenerationId)>,

    /// Requirement indexes a validating consumer has promised to verify.
    unverified_regions: SmallVec<[usize; 4]>,

    completion_effects: SmallVec<[Event; 4]>,
    execution_fence_event: Option<Event>,

    mapped_event: UserEvent,
    resolved_event: UserEvent,
    completion_event: UserEvent,
    commit_event: UserEvent,
}

impl OpState {
    fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            op_id: None,
            unique_id: UniqueOpId(0),
            gen: 0,
            context: None,
            provenance: None,
            activated: false,
            mapped: false,
            executed: false,
            resolved: false,
            completed: false,
            committed: false,
            hardened: false,
            quashed: false,
            early_commit_request: false,
            trigger_commit_invoked: false,
            complete_enqueued: false,
            refs_frozen: false,
            outstanding_mapping_refs: 0,
            mapping_tracker: MappingDependenceTracker::default(),
            commit_tracker: CommitDependenceTracker::default(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            no_dependences: Vec::new(),
            unverified_regions: SmallVec::new(),
            completion_effects: SmallVec::new(),
            execution_fence_event: None,
            mapped_event: UserEvent::new(dispatcher),
            resolved_event: UserEvent::new(dispatcher),
            completion_event: UserEvent::new(dispatcher),
            commit_event: UserEvent::new(dispatcher),
        }
    }
}

/// Per-operation pipeline bookkeeping shared by every operation kind.
pub struct OpBase {
    dispatcher: Dispatcher,
    state: Mutex<OpState>,
}

impl OpBase {
    /// Creates fresh bookkeeping bound to the given dispatcher.
    #[must_use]
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            state: Mutex::new(OpState::new(dispatcher)),
        }
    }

    /// The process-unique id of the current activation.
    #[must_use]
    pub fn unique_id(&self) -> UniqueOpId {
        self.state.lock().unique_id
    }

    /// The current generation of this operation slot.
    #[must_use]
    pub fn generation(&self) -> GenerationId {
        self.state.lock().gen
    }

    /// The pool id, once registered with a runtime.
    #[must_use]
    pub fn op_id(&self) -> Option<OpId> {
        self.state.lock().op_id
    }

    /// The index of the issuing context, if any.
    #[must_use]
    pub fn context_index(&self) -> Option<usize> {
        self.state.lock().context
    }

    /// The diagnostic tag attached at initialization, if any.
    #[must_use]
    pub fn provenance(&self) -> Option<Arc<Provenance>> {
        self.state.lock().provenance.clone()
    }

    /// Event triggered when this operation finishes mapping.
    #[must_use]
    pub fn mapped_event(&self) -> Event {
        self.state.lock().mapped_event.event()
    }

    /// Event triggered when speculation (if any) is decided.
    #[must_use]
    pub fn resolved_event(&self) -> Event {
        self.state.lock().resolved_event.event()
    }

    /// Event triggered when this operation completes.
    #[must_use]
    pub fn completion_event(&self) -> Event {
        self.state.lock().completion_event.event()
    }

    /// Event triggered when this operation commits (or is quashed).
    #[must_use]
    pub fn commit_event(&self) -> Event {
        self.state.lock().commit_event.event()
    }

    /// True once mapping has finished for the current generation.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.state.lock().mapped
    }

    /// True once the current generation has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// True once the current generation has committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state.lock().committed
    }

    /// True if the current generation was quashed before the pipeline.
    #[must_use]
    pub fn is_quashed(&self) -> bool {
        self.state.lock().quashed
    }

    /// True once this operation has been hardened.
    #[must_use]
    pub fn is_hardened(&self) -> bool {
        self.state.lock().hardened
    }

    /// Outstanding mapping references held by dependents.
    #[must_use]
    pub fn outstanding_mapping_references(&self) -> usize {
        self.state.lock().outstanding_mapping_refs
    }

    /// Number of dependence edges recorded against this op.
    #[must_use]
    pub fn outgoing_count(&self) -> usize {
        self.state.lock().outgoing.len()
    }

    /// Number of dependence edges this op recorded on others.
    #[must_use]
    pub fn incoming_count(&self) -> usize {
        self.state.lock().incoming.len()
    }

    /// Requirement indexes still awaiting verification by consumers.
    #[must_use]
    pub fn unverified_regions(&self) -> Vec<usize> {
        self.state.lock().unverified_regions.to_vec()
    }

    /// Provably-independent accesses recorded while tracing.
    #[must_use]
    pub fn recorded_no_dependences(&self) -> Vec<(UniqueOpId, GenerationId)> {
        self.state.lock().no_dependences.clone()
    }

    pub(crate) fn assign_op_id(&self, op_id: OpId) {
        self.state.lock().op_id = Some(op_id);
    }

    /// Sets the execution fence event new work in the context must observe.
    pub fn set_execution_fence_event(&self, event: Event) {
        self.state.lock().execution_fence_event = Some(event);
    }

    /// The last execution fence observed, if any.
    #[must_use]
    pub fn execution_fence_event(&self) -> Option<Event> {
        self.state.lock().execution_fence_event.clone()
    }
}

impl core::fmt::Debug for OpBase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OpBase")
            .field("unique_id", &state.unique_id)
            .field("gen", &state.gen)
            .field("mapped", &state.mapped)
            .field("executed", &state.executed)
            .field("resolved", &state.resolved)
            .field("completed", &state.completed)
            .field("committed", &state.committed)
            .field("refs", &state.outstanding_mapping_refs)
            .finish_non_exhaustive()
    }
}

/// The state machine every deferred operation implements.
///
/// Pipeline triggers are dispatched as independent work items; overrides
/// replace a stage's behavior but must still drive the corresponding
/// `complete_*` function so downstream stages unblock.
pub trait Operation: Send + Sync {
    /// Shared pipeline bookkeeping.
    fn base(&self) -> &OpBase;

    /// The kind of this operation.
    fn kind(&self) -> OpKind;

    /// Upcasts to a trait object handle.
    fn as_op(self: Arc<Self>) -> Arc<dyn Operation>;

    /// Region requirements declared by this operation, in index order.
    fn requirements(&self) -> Vec<RegionRequirement> {
        Vec::new()
    }

    /// Work to run before dependence analysis, if any.
    fn trigger_prepipeline_stage(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let _ = runtime;
    }

    /// Computes data hazards against prior operations in the context.
    fn trigger_dependence_analysis(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        begin_dependence_analysis(&op);
        end_dependence_analysis(&op, runtime);
    }

    /// Invoked once all mapping dependences are satisfied; enqueues the
    /// mapping and resolution stages.
    fn trigger_ready(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        trace!(op = %op.base().unique_id(), kind = %op.kind(), "ready");
        enqueue_stage(runtime, op.clone(), Operation::trigger_mapping);
        enqueue_stage(runtime, op, Operation::trigger_resolution);
    }

    /// Maps the operation. The default maps and executes immediately,
    /// observing the execution fence if one was recorded.
    fn trigger_mapping(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        let fence = op.base().execution_fence_event();
        complete_mapping(&op, runtime, None);
        complete_execution(&op, runtime, fence);
    }

    /// Decides speculation. The default has nothing to speculate on.
    fn trigger_resolution(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        resolve_speculation(&op, runtime, None);
    }

    /// Replays a captured physical template instead of mapping.
    fn trigger_replay(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let _ = runtime;
        // Only memoizable kinds route here.
        debug_assert!(false, "replay triggered on non-memoizable operation");
    }

    /// Invoked once execution finished and no further dependence can
    /// register against this operation.
    fn trigger_complete(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        complete_operation(&op, runtime, None);
    }

    /// Invoked once completion is visible and all validating consumers have
    /// committed (or early commit was requested).
    fn trigger_commit(self: Arc<Self>, runtime: &Arc<Runtime>) {
        let op = self.as_op();
        commit_operation(&op, runtime, None);
    }

    /// Reconciles a predicate that resolved true. `speculated` reports
    /// whether mapping already began on a guessed value, `launched` whether
    /// the operation entered the execution pipeline.
    fn resolve_true(self: Arc<Self>, runtime: &Arc<Runtime>, speculated: bool, launched: bool) {
        let _ = (speculated, launched);
        let op = self.as_op();
        predicated::default_resolve_true(&op, runtime);
    }

    /// Reconciles a predicate that resolved false: speculative effects are
    /// discarded, an unlaunched operation is quashed.
    fn resolve_false(self: Arc<Self>, runtime: &Arc<Runtime>, speculated: bool, launched: bool) {
        let _ = speculated;
        let op = self.as_op();
        predicated::default_resolve_false(&op, runtime, launched);
    }

    /// Memoization capability state, if this kind supports it.
    fn memo(&self) -> Option<&memo::MemoState> {
        None
    }

    /// Predication capability state, if this kind supports it.
    fn predicated(&self) -> Option<&predicated::PredicatedState> {
        None
    }

    /// Collective rendezvous capability state, if this kind supports it.
    fn collective(&self) -> Option<&collective::CollectiveState> {
        None
    }

    /// Resource accumulation, if this kind owns child resources.
    fn resources(&self) -> Option<&Mutex<ResourceTracker>> {
        None
    }

    /// Diagnostic hook: two requirements of this operation interfere.
    fn report_interfering_requirements(&self, idx1: usize, idx2: usize) -> Error {
        let unique = self.base().unique_id();
        error!(
            op = %unique,
            kind = %self.kind(),
            idx1,
            idx2,
            "aliased and interfering region requirements"
        );
        Error::with_message(
            ErrorKind::InterferingRequirements,
            format!("requirements {idx1} and {idx2} interfere"),
        )
        .for_op(unique.0)
    }

    /// Diagnostic hook: a requirement reads fields nothing has written.
    fn report_uninitialized_usage(&self, idx: usize, fields: FieldMask) {
        warn!(
            op = %self.base().unique_id(),
            kind = %self.kind(),
            idx,
            ?fields,
            "region requirement reads uninitialized fields"
        );
    }
}

/// Dispatches one pipeline stage as an independent work item.
pub(crate) fn enqueue_stage<F>(runtime: &Arc<Runtime>, op: Arc<dyn Operation>, stage: F)
where
    F: FnOnce(Arc<dyn Operation>, &Arc<Runtime>) + Send + 'static,
{
    enqueue_stage_at(runtime, Priority::Work, op, stage);
}

pub(crate) fn enqueue_stage_at<F>(
    runtime: &Arc<Runtime>,
    priority: Priority,
    op: Arc<dyn Operation>,
    stage: F,
) where
    F: FnOnce(Arc<dyn Operation>, &Arc<Runtime>) + Send + 'static,
{
    let weak_rt = Arc::downgrade(runtime);
    // Stages are generation-stamped: one enqueued before a quash or
    // deactivation must not run against the reused slot.
    let gen = op.base().generation();
    runtime.dispatcher().enqueue(priority, move || {
        if op.base().generation() != gen {
            return;
        }
        if let Some(runtime) = weak_rt.upgrade() {
            stage(op, &runtime);
        }
    });
}

/// Prepares an operation for a new use: assigns a fresh unique id, attaches
/// the issuing context and provenance, and marks it activated.
pub fn initialize_operation(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    context: Option<usize>,
    provenance: Option<Arc<Provenance>>,
) {
    let unique_id = runtime.next_unique_id();
    {
        let mut state = op.base().state.lock();
        debug_assert!(!state.activated, "initializing an active operation");
        state.activated = true;
        state.unique_id = unique_id;
        state.context = context;
        state.provenance = provenance;
    }
    trace!(op = %unique_id, kind = %op.kind(), ?context, "initialized");
}

/// Opens the dependence-analysis window for this operation.
pub fn begin_dependence_analysis(op: &Arc<dyn Operation>) {
    let state = op.base().state.lock();
    debug_assert!(state.activated);
    debug_assert!(!state.mapping_tracker.analysis_done);
}

/// Closes the dependence-analysis window. If no dependence remains
/// unsatisfied, the ready trigger is enqueued immediately.
///
/// A recorded execution fence does not hold mapping back; it preconditions
/// `complete_execution` instead, so mapping may run ahead of the fence.
pub fn end_dependence_analysis(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    let ready = {
        let mut state = op.base().state.lock();
        state.mapping_tracker.finalize()
    };
    if ready {
        enqueue_stage(runtime, op.clone(), Operation::trigger_ready);
    }
}

/// Attempts to add a mapping reference on `op` at generation `gen`.
///
/// Fails if the generation is stale or the operation has passed the point
/// where new dependences may register.
#[must_use]
pub fn add_mapping_reference(op: &Arc<dyn Operation>, gen: GenerationId) -> bool {
    let mut state = op.base().state.lock();
    if state.gen != gen
        || state.refs_frozen
        || state.completed
        || state.committed
        || state.quashed
    {
        return false;
    }
    state.outstanding_mapping_refs += 1;
    true
}

/// Releases a mapping reference previously added at generation `gen`.
pub fn remove_mapping_reference(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>, gen: GenerationId) {
    {
        let mut state = op.base().state.lock();
        if state.gen != gen {
            return;
        }
        debug_assert!(state.outstanding_mapping_refs > 0);
        state.outstanding_mapping_refs -= 1;
    }
    check_trigger_complete(op, runtime);
}

/// Registers a plain mapping dependence of `source` on `target` at
/// `target_gen`.
///
/// Returns true if an edge was recorded; false if the dependence was pruned
/// because the target generation has already retired (treated as satisfied).
pub fn register_dependence(
    source: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    target: &Arc<dyn Operation>,
    target_gen: GenerationId,
) -> bool {
    register_region_dependence(
        source,
        runtime,
        target,
        target_gen,
        0,
        DependenceType::TrueDependence,
        false,
    )
}

/// Registers a region dependence of `source` on requirement `target_idx`
/// of `target` at `target_gen`. Field overlap has already been decided by
/// the forest; the logical edge is scoped to the target requirement.
///
/// `validates` marks the dependent as reading back and verifying the
/// target's data; it adds a commit-ordering constraint and verification
/// bookkeeping. Returns true if an edge was recorded, false if pruned.
pub fn register_region_dependence(
    source: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    target: &Arc<dyn Operation>,
    target_gen: GenerationId,
    target_idx: usize,
    dtype: DependenceType,
    validates: bool,
) -> bool {
    if dtype == DependenceType::NoDependence {
        return false;
    }
    // Self-edges are never recorded.
    if Arc::ptr_eq(source, target) {
        return false;
    }
    if !add_mapping_reference(target, target_gen) {
        // Target already retired or commit-safe: treat as satisfied.
        trace!(
            source = %source.base().unique_id(),
            target_gen,
            "pruned stale dependence"
        );
        return false;
    }

    let (source_id, source_gen) = {
        let state = source.base().state.lock();
        (state.unique_id, state.gen)
    };
    {
        let mut state = target.base().state.lock();
        state.outgoing.push((source_id, source_gen));
        if validates {
            state.commit_tracker.record_dependence();
            if !state.unverified_regions.contains(&target_idx) {
                state.unverified_regions.push(target_idx);
            }
        }
    }
    {
        let mut state = source.base().state.lock();
        state.incoming.push(IncomingEdge {
            target: Arc::downgrade(target),
            target_gen,
        });
        state.mapping_tracker.record_dependence();
    }

    // Source becomes ready once the target maps. The continuation is
    // generation-qualified: if the source was quashed and its slot reused
    // before the target mapped, it must not touch the new instance.
    let mapped = target.base().mapped_event();
    let weak_source: WeakOp = Arc::downgrade(source);
    let weak_rt = Arc::downgrade(runtime);
    mapped.attach(Priority::Work, move || {
        if let (Some(source), Some(runtime)) = (weak_source.upgrade(), weak_rt.upgrade()) {
            notify_mapping_dependence_satisfied(&source, &runtime, source_gen);
        }
    });

    // Target may not commit until a validating consumer commits.
    if validates {
        let commit = source.base().commit_event();
        let weak_target: WeakOp = Arc::downgrade(target);
        let weak_rt = Arc::downgrade(runtime);
        commit.attach(Priority::Work, move || {
            if let (Some(target), Some(runtime)) = (weak_target.upgrade(), weak_rt.upgrade()) {
                notify_consumer_committed(&target, &runtime, target_gen, Some(target_idx));
            }
        });
    }

    debug!(
        source = %source_id,
        target = %target.base().unique_id(),
        ?dtype,
        validates,
        "registered dependence"
    );
    true
}

/// Records a provably-independent access while tracing, so a later
/// materialized internal operation in this interval can be checked.
pub fn register_no_dependence(
    source: &Arc<dyn Operation>,
    target: &Arc<dyn Operation>,
    target_gen: GenerationId,
) {
    let target_id = target.base().unique_id();
    let mut state = source.base().state.lock();
    state.no_dependences.push((target_id, target_gen));
}

fn notify_mapping_dependence_satisfied(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    gen: GenerationId,
) {
    let ready = {
        let mut state = op.base().state.lock();
        if state.gen != gen || state.quashed {
            return;
        }
        state.mapping_tracker.satisfy()
    };
    if ready {
        enqueue_stage(runtime, op.clone(), Operation::trigger_ready);
    }
}

fn notify_consumer_committed(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    gen: GenerationId,
    verified_idx: Option<usize>,
) {
    {
        let mut state = op.base().state.lock();
        if state.gen != gen {
            return;
        }
        state.commit_tracker.satisfy();
        if let Some(idx) = verified_idx {
            state.unverified_regions.retain(|i| *i != idx);
        }
    }
    try_trigger_commit(op, runtime);
}

/// Marks verification of the given requirement indexes as done. Used by
/// resilience machinery that confirms region contents out of band; an
/// operation whose regions are all verified is hardened.
pub fn notify_regions_verified(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    indexes: &[usize],
    gen: GenerationId,
) {
    let all_verified = {
        let mut state = op.base().state.lock();
        if state.gen != gen {
            return;
        }
        state
            .unverified_regions
            .retain(|idx| !indexes.contains(idx));
        state.unverified_regions.is_empty()
    };
    if all_verified {
        harden_operation(op, runtime);
    }
}

/// Marks the operation resilient: its data has been verified or duplicated,
/// so commit need not wait for consumers.
pub fn harden_operation(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    {
        let mut state = op.base().state.lock();
        state.hardened = true;
    }
    try_trigger_commit(op, runtime);
}

/// Requests that commit bypass the consumers-committed gate.
pub fn request_early_commit(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    {
        let mut state = op.base().state.lock();
        state.early_commit_request = true;
    }
    try_trigger_commit(op, runtime);
}

/// Records an application-level effect that must trigger before this
/// operation's completion becomes externally visible.
pub fn record_completion_effect(op: &Arc<dyn Operation>, effect: Event) {
    let mut state = op.base().state.lock();
    debug_assert!(!state.completed, "effect recorded after completion");
    state.completion_effects.push(effect);
}

/// Records a batch of completion effects.
pub fn record_completion_effects(op: &Arc<dyn Operation>, effects: impl IntoIterator<Item = Event>) {
    let mut state = op.base().state.lock();
    debug_assert!(!state.completed, "effects recorded after completion");
    state.completion_effects.extend(effects);
}

/// Samples the currently recorded completion effects.
#[must_use]
pub fn find_completion_effects(op: &Arc<dyn Operation>) -> Vec<Event> {
    op.base().state.lock().completion_effects.to_vec()
}

/// Marks mapping finished. If `precondition` has not triggered yet, the
/// call re-dispatches itself after it does.
pub fn complete_mapping(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>, precondition: Option<Event>) {
    if let Some(pre) = precondition {
        if !pre.has_triggered() {
            redispatch(runtime, op, pre, |op, rt| complete_mapping(op, rt, None));
            return;
        }
    }
    let (mapped_event, incoming) = {
        let mut state = op.base().state.lock();
        debug_assert!(!state.mapped, "mapping completed twice");
        state.mapped = true;
        (
            state.mapped_event.clone(),
            core::mem::take(&mut state.incoming),
        )
    };
    trace!(op = %op.base().unique_id(), "mapped");
    mapped_event.trigger();
    // Mapping references held on targets are released once we are mapped;
    // their completion gates open when the last dependent releases.
    for edge in incoming {
        if let Some(target) = edge.target.upgrade() {
            remove_mapping_reference(&target, runtime, edge.target_gen);
        }
    }
    check_trigger_complete(op, runtime);
}

/// Marks execution finished, re-dispatching past `precondition` if needed.
pub fn complete_execution(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    precondition: Option<Event>,
) {
    if let Some(pre) = precondition {
        if !pre.has_triggered() {
            redispatch(runtime, op, pre, |op, rt| complete_execution(op, rt, None));
            return;
        }
    }
    {
        let mut state = op.base().state.lock();
        debug_assert!(!state.executed, "execution completed twice");
        state.executed = true;
    }
    trace!(op = %op.base().unique_id(), "executed");
    check_trigger_complete(op, runtime);
}

/// Marks speculation decided, re-dispatching past `precondition` if needed.
pub fn resolve_speculation(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    precondition: Option<Event>,
) {
    if let Some(pre) = precondition {
        if !pre.has_triggered() {
            redispatch(runtime, op, pre, |op, rt| resolve_speculation(op, rt, None));
            return;
        }
    }
    let resolved_event = {
        let mut state = op.base().state.lock();
        if state.resolved {
            return;
        }
        state.resolved = true;
        state.resolved_event.clone()
    };
    resolved_event.trigger();
    check_trigger_complete(op, runtime);
}

/// Enqueues the complete trigger once mapped, executed, resolved, and no
/// outstanding mapping references remain.
fn check_trigger_complete(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    let fire = {
        let mut state = op.base().state.lock();
        if state.complete_enqueued
            || state.quashed
            || !state.mapped
            || !state.executed
            || !state.resolved
            || state.outstanding_mapping_refs > 0
        {
            false
        } else {
            state.complete_enqueued = true;
            // The outgoing edge set is frozen: no dependence may register
            // against this generation from here on.
            state.refs_frozen = true;
            true
        }
    };
    if fire {
        enqueue_stage(runtime, op.clone(), Operation::trigger_complete);
    }
}

/// Makes completion externally visible once all recorded completion
/// effects have triggered, then attempts commit.
pub fn complete_operation(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    precondition: Option<Event>,
) {
    if let Some(pre) = precondition {
        if !pre.has_triggered() {
            redispatch(runtime, op, pre, |op, rt| complete_operation(op, rt, None));
            return;
        }
    }
    let effects: Vec<Event> = {
        let mut state = op.base().state.lock();
        core::mem::take(&mut state.completion_effects).into_vec()
    };
    if !effects.is_empty() {
        let merged = Event::merge(runtime.dispatcher(), &effects);
        if !merged.has_triggered() {
            redispatch(runtime, op, merged, |op, rt| complete_operation(op, rt, None));
            return;
        }
    }
    let completion_event = {
        let mut state = op.base().state.lock();
        debug_assert!(!state.completed, "completed twice");
        state.completed = true;
        state.completion_event.clone()
    };
    debug!(op = %op.base().unique_id(), kind = %op.kind(), "completed");
    completion_event.trigger();
    try_trigger_commit(op, runtime);
}

fn try_trigger_commit(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    let fire = {
        let mut state = op.base().state.lock();
        if !state.completed || state.trigger_commit_invoked {
            false
        } else if state.early_commit_request
            || state.hardened
            || state.commit_tracker.outstanding() == 0
        {
            state.trigger_commit_invoked = true;
            true
        } else {
            false
        }
    };
    if fire {
        enqueue_stage_at(runtime, Priority::Low, op.clone(), Operation::trigger_commit);
    }
}

/// Commits the operation and returns it to the pool, re-dispatching past
/// `precondition` if needed.
pub fn commit_operation(
    op: &Arc<dyn Operation>,
    runtime: &Arc<Runtime>,
    precondition: Option<Event>,
) {
    if let Some(pre) = precondition {
        if !pre.has_triggered() {
            redispatch(runtime, op, pre, |op, rt| commit_operation(op, rt, None));
            return;
        }
    }
    let commit_event = {
        let mut state = op.base().state.lock();
        debug_assert!(state.completed, "commit before completion");
        debug_assert!(!state.committed, "committed twice");
        state.committed = true;
        state.commit_event.clone()
    };
    debug!(op = %op.base().unique_id(), kind = %op.kind(), "committed");
    commit_event.trigger();
    deactivate(op, runtime);
}

/// Invalidates an operation before it enters the pipeline, propagating
/// cancellation to consumers without ever mapping or executing.
pub fn quash_operation(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    let (events, incoming) = {
        let mut state = op.base().state.lock();
        debug_assert!(!state.mapped, "quash after mapping began");
        if state.quashed {
            return;
        }
        state.quashed = true;
        state.completed = true;
        state.committed = true;
        state.refs_frozen = true;
        (
            [
                state.mapped_event.clone(),
                state.resolved_event.clone(),
                state.completion_event.clone(),
                state.commit_event.clone(),
            ],
            core::mem::take(&mut state.incoming),
        )
    };
    warn!(op = %op.base().unique_id(), kind = %op.kind(), "quashed");
    // All milestone events trigger so dependents observe the edges as
    // satisfied, never as hazards.
    for event in events {
        event.trigger();
    }
    for edge in incoming {
        if let Some(target) = edge.target.upgrade() {
            remove_mapping_reference(&target, runtime, edge.target_gen);
        }
    }
    deactivate(op, runtime);
}

/// Clears per-generation state and advances the generation, making every
/// edge that names the old generation stale by construction.
fn deactivate(op: &Arc<dyn Operation>, runtime: &Arc<Runtime>) {
    let op_id = {
        let base = op.base();
        let mut state = base.state.lock();
        let retired = state.op_id.take();
        let gen = state.gen.wrapping_add(1);
        *state = OpState::new(&base.dispatcher);
        state.gen = gen;
        retired
    };
    if let Some(op_id) = op_id {
        runtime.release_operation(op_id);
    }
}

fn redispatch<F>(runtime: &Arc<Runtime>, op: &Arc<dyn Operation>, precondition: Event, resume: F)
where
    F: FnOnce(&Arc<dyn Operation>, &Arc<Runtime>) + Send + 'static,
{
    let weak_op: WeakOp = Arc::downgrade(op);
    let weak_rt = Arc::downgrade(runtime);
    precondition.attach(Priority::Work, move || {
        if let (Some(op), Some(runtime)) = (weak_op.upgrade(), weak_rt.upgrade()) {
            resume(&op, &runtime);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    struct NoopOp {
        base: OpBase,
    }

    impl NoopOp {
        fn create(runtime: &Arc<Runtime>) -> Arc<dyn Operation> {
            let op: Arc<dyn Operation> = Arc::new(Self {
                base: OpBase::new(runtime.dispatcher()),
            });
            initialize_operation(&op, runtime, None, None);
            runtime.register_operation(&op);
            op
        }
    }

    impl Operation for NoopOp {
        fn base(&self) -> &OpBase {
            &self.base
        }

        fn kind(&self) -> OpKind {
            OpKind::Timing
        }

        fn as_op(self: Arc<Self>) -> Arc<dyn Operation> {
            self
        }
    }

    fn run_pipeline(runtime: &Arc<Runtime>, op: &Arc<dyn Operation>) {
        enqueue_stage(runtime, op.clone(), Operation::trigger_dependence_analysis);
        runtime.dispatcher().run_until_quiescent();
    }

    #[test]
    fn leaf_op_runs_whole_pipeline() {
        let runtime = Runtime::new();
        let op = NoopOp::create(&runtime);
        let commit = op.base().commit_event();
        run_pipeline(&runtime, &op);
        assert!(commit.has_triggered());
    }

    #[test]
    fn dependent_waits_for_target_mapping() {
        let runtime = Runtime::new();
        let target = NoopOp::create(&runtime);
        let source = NoopOp::create(&runtime);
        let target_gen = target.base().generation();

        begin_dependence_analysis(&source);
        assert!(register_dependence(&source, &runtime, &target, target_gen));
        end_dependence_analysis(&source, &runtime);
        runtime.dispatcher().run_until_quiescent();
        // Target never analyzed, so the source must still be waiting.
        assert!(!source.base().is_mapped());

        run_pipeline(&runtime, &target);
        assert!(source.base().is_committed() || source.base().generation() > 0);
    }

    #[test]
    fn stale_generation_dependence_is_pruned() {
        let runtime = Runtime::new();
        let target = NoopOp::create(&runtime);
        let source = NoopOp::create(&runtime);
        let old_gen = target.base().generation();
        run_pipeline(&runtime, &target);
        assert!(target.base().generation() > old_gen);

        begin_dependence_analysis(&source);
        assert!(!register_dependence(&source, &runtime, &target, old_gen));
        end_dependence_analysis(&source, &runtime);
        runtime.dispatcher().run_until_quiescent();
        assert_eq!(source.base().incoming_count(), 0);
    }

    #[test]
    fn mapping_references_freeze_at_completion_gate() {
        let runtime = Runtime::new();
        let op = NoopOp::create(&runtime);
        let gen = op.base().generation();
        assert!(add_mapping_reference(&op, gen));
        assert_eq!(op.base().outstanding_mapping_references(), 1);

        run_pipeline(&runtime, &op);
        // Still held: completion gate needs the reference released, and
        // until it fires further holders may still register.
        assert!(!op.base().is_completed());
        assert!(add_mapping_reference(&op, gen));
        remove_mapping_reference(&op, &runtime, gen);

        remove_mapping_reference(&op, &runtime, gen);
        runtime.dispatcher().run_until_quiescent();
        assert!(op.base().generation() > gen);
        assert!(!add_mapping_reference(&op, gen));
    }

    #[test]
    fn frozen_references_reject_new_holders() {
        let runtime = Runtime::new();
        let target = NoopOp::create(&runtime);
        let source = NoopOp::create(&runtime);
        let target_gen = target.base().generation();
        let source_gen = source.base().generation();

        // Hold the consumer at its own completion gate so the target stays
        // observable past its completion.
        assert!(add_mapping_reference(&source, source_gen));

        begin_dependence_analysis(&source);
        assert!(register_region_dependence(
            &source,
            &runtime,
            &target,
            target_gen,
            0,
            DependenceType::TrueDependence,
            true,
        ));
        end_dependence_analysis(&source, &runtime);

        run_pipeline(&runtime, &target);
        // Target completed; its commit still waits on the held consumer,
        // so the generation is live but the edge set is frozen.
        assert!(target.base().is_completed());
        assert!(!target.base().is_committed());
        assert_eq!(target.base().generation(), target_gen);
        assert!(!add_mapping_reference(&target, target_gen));

        remove_mapping_reference(&source, &runtime, source_gen);
        runtime.dispatcher().run_until_quiescent();
        assert!(target.base().generation() > target_gen);
    }

    #[test]
    fn validating_consumer_gates_commit() {
        let runtime = Runtime::new();
        let target = NoopOp::create(&runtime);
        let source = NoopOp::create(&runtime);
        let target_gen = target.base().generation();

        begin_dependence_analysis(&source);
        assert!(register_region_dependence(
            &source,
            &runtime,
            &target,
            target_gen,
            0,
            DependenceType::TrueDependence,
            true,
        ));

        // Source analysis stays open: its reference pins the target short
        // of completion and the validation gate keeps commit pending.
        run_pipeline(&runtime, &target);
        assert!(target.base().is_mapped());
        assert!(!target.base().is_completed());
        assert!(!target.base().is_committed());
        assert_eq!(target.base().unverified_regions(), vec![0]);

        end_dependence_analysis(&source, &runtime);
        runtime.dispatcher().run_until_quiescent();
        assert!(target.base().generation() > target_gen);
    }

    #[test]
    fn early_commit_bypasses_consumer_gate() {
        let runtime = Runtime::new();
        let target = NoopOp::create(&runtime);
        let source = NoopOp::create(&runtime);
        let target_gen = target.base().generation();

        begin_dependence_analysis(&source);
        assert!(register_region_dependence(
            &source,
            &runtime,
            &target,
            target_gen,
            0,
            DependenceType::TrueDependence,
            true,
        ));
        request_early_commit(&target, &runtime);
        run_pipeline(&runtime, &target);
        assert!(!target.base().is_completed());

        // The consumer maps, releasing its reference; the target may then
        // complete and commit without waiting for the consumer's commit.
        end_dependence_analysis(&source, &runtime);
        runtime.dispatcher().run_until_quiescent();
        assert!(target.base().generation() > target_gen);
    }

    #[test]
    fn quash_prunes_consumers_without_hazard() {
        let runtime = Runtime::new();
        let target = NoopOp::create(&runtime);
        let source = NoopOp::create(&runtime);
        let target_gen = target.base().generation();

        begin_dependence_analysis(&source);
        assert!(register_dependence(&source, &runtime, &target, target_gen));
        end_dependence_analysis(&source, &runtime);

        quash_operation(&target, &runtime);
        runtime.dispatcher().run_until_quiescent();
        // The dependent proceeded and finished despite the quash.
        assert!(source.base().generation() > 0);
    }

    #[test]
    fn completion_effects_gate_completion() {
        let runtime = Runtime::new();
        let op = NoopOp::create(&runtime);
        let effect = UserEvent::new(runtime.dispatcher());
        record_completion_effect(&op, effect.event());
        assert_eq!(find_completion_effects(&op).len(), 1);

        run_pipeline(&runtime, &op);
        assert!(!op.base().is_completed());

        effect.trigger();
        runtime.dispatcher().run_until_quiescent();
        assert!(op.base().generation() > 0);
    }

    #[test]
    fn op_kind_names_are_stable() {
        assert_eq!(OpKind::MustEpoch.name(), "Must Epoch");
        assert_eq!(OpKind::PendingPartition.name(), "Pending Partition");
        assert_eq!(OpKind::Copy.name(), "Copy");
    }
}
