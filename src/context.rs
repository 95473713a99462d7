//! Per-context program-order dependence queues.
//!
//! A context owns the operations it issues until they commit. Issue order
//! defines program order: dependence analysis of issued operations runs
//! serially in that order (chained through completion events), while the
//! pipeline stages behind analysis run with whatever parallelism the
//! dependence graph allows. The context keeps a bounded window of prior
//! operations to analyze new arrivals against, plus the current mapping
//! and execution fences.

use crate::dispatch::{Dispatcher, Priority};
use crate::event::{Event, UserEvent};
use crate::op::memo::MemoStatus;
use crate::op::{self, Operation};
use crate::resource::{ResourceReceiver, ResourceTracker, ResourceUpdate};
use crate::runtime::Runtime;
use crate::tracing_compat::trace;
use crate::types::{GenerationId, RegionRequirement};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

const DEFAULT_WINDOW_LIMIT: usize = 1024;

struct WindowEntry {
    op: Weak<dyn Operation>,
    gen: GenerationId,
    requirements: Vec<RegionRequirement>,
}

struct ContextState {
    window: VecDeque<WindowEntry>,
    window_limit: usize,
    /// Analysis of the most recently issued operation; the next one's
    /// analysis is attached behind it.
    last_analysis: Option<Event>,
    /// All subsequent operations register a mapping dependence on this.
    current_mapping_fence: Option<(Weak<dyn Operation>, GenerationId)>,
    /// All subsequent operations execute only after this triggers.
    current_execution_fence: Option<Event>,
}

/// One issuing context: program order, analysis window, fences, and the
/// resources its child operations return.
pub struct InnerContext {
    index: usize,
    dispatcher: Dispatcher,
    state: Mutex<ContextState>,
    resources: Mutex<ResourceTracker>,
}

impl InnerContext {
    pub(crate) fn new(index: usize, dispatcher: &Dispatcher) -> Self {
        Self {
            index,
            dispatcher: dispatcher.clone(),
            state: Mutex::new(ContextState {
                window: VecDeque::new(),
                window_limit: DEFAULT_WINDOW_LIMIT,
                last_analysis: None,
                current_mapping_fence: None,
                current_execution_fence: None,
            }),
            resources: Mutex::new(ResourceTracker::new()),
        }
    }

    /// The index of this context in its runtime.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Number of prior operations still in the analysis window.
    #[must_use]
    pub fn window_size(&self) -> usize {
        self.state.lock().window.len()
    }

    /// Resources returned by committed child operations.
    #[must_use]
    pub fn resources(&self) -> &Mutex<ResourceTracker> {
        &self.resources
    }

    /// Issues an operation in program order: its prepipeline stage and
    /// dependence analysis run after every previously issued operation's
    /// analysis has finished.
    pub fn issue(&self, runtime: &Arc<Runtime>, op: &Arc<dyn Operation>) {
        let done = UserEvent::new(&self.dispatcher);
        let previous = self.state.lock().last_analysis.replace(done.event());
        trace!(context = self.index, op = %op.base().unique_id(), "issued");

        let stage_op = op.clone();
        let weak_rt = Arc::downgrade(runtime);
        let run = move || {
            if let Some(runtime) = weak_rt.upgrade() {
                stage_op
                    .clone()
                    .trigger_prepipeline_stage(&runtime);
                stage_op.clone().trigger_dependence_analysis(&runtime);
            }
            done.trigger();
        };
        match previous {
            Some(prev) => prev.attach(Priority::Work, run),
            None => self.dispatcher.enqueue(Priority::Work, run),
        }
    }

    /// Runs region dependence analysis for `op` against the window, then
    /// records it in the window. Must be called from the operation's
    /// dependence-analysis stage.
    pub fn analyze(&self, runtime: &Arc<Runtime>, op: &Arc<dyn Operation>) {
        op::begin_dependence_analysis(op);
        self.apply_execution_fence(op);
        let requirements = op.requirements();

        // Interference among the op's own requirements is a caller bug
        // surfaced before any edge is recorded.
        for (idx1, prior) in requirements.iter().enumerate() {
            for (offset, later) in requirements[idx1 + 1..].iter().enumerate() {
                let (dtype, _) = runtime.forest().compute_dependence(prior, later);
                if dtype.is_ordering() {
                    let failure = op.report_interfering_requirements(idx1, idx1 + 1 + offset);
                    runtime.mapper().report_failure(&failure);
                }
            }
        }

        let (window, fence) = {
            let mut state = self.state.lock();
            state
                .window
                .retain(|entry| entry.op.strong_count() > 0);
            let snapshot: Vec<(Weak<dyn Operation>, GenerationId, Vec<RegionRequirement>)> = state
                .window
                .iter()
                .map(|entry| (entry.op.clone(), entry.gen, entry.requirements.clone()))
                .collect();
            (snapshot, state.current_mapping_fence.clone())
        };

        let recording = op
            .memo()
            .is_some_and(|memo| memo.status() == MemoStatus::Record);
        for (weak_prior, prior_gen, prior_reqs) in window {
            let Some(prior) = weak_prior.upgrade() else {
                continue;
            };
            let mut edged = false;
            for later_req in &requirements {
                for (prior_idx, prior_req) in prior_reqs.iter().enumerate() {
                    let (dtype, _overlap) =
                        runtime.forest().compute_dependence(prior_req, later_req);
                    if !dtype.is_ordering() {
                        continue;
                    }
                    // A reader that will consume the target's data
                    // validates the target's requirement.
                    let validates = dtype == crate::types::DependenceType::TrueDependence
                        && !later_req.privilege.is_write();
                    edged |= op::register_region_dependence(
                        op, runtime, &prior, prior_gen, prior_idx, dtype, validates,
                    );
                }
            }
            // While capturing a template, provably independent priors are
            // recorded so replay validation can re-check the interval.
            if recording && !edged {
                op::register_no_dependence(op, &prior, prior_gen);
            }
        }

        if let Some((weak_fence, fence_gen)) = fence {
            if let Some(fence_op) = weak_fence.upgrade() {
                op::register_dependence(op, runtime, &fence_op, fence_gen);
            }
        }

        self.record_in_window(op, requirements);
        op::end_dependence_analysis(op, runtime);
    }

    /// Dependence analysis for a fence: the fence maps only after every
    /// operation still in the window has mapped, regardless of regions.
    pub fn analyze_fence(&self, runtime: &Arc<Runtime>, op: &Arc<dyn Operation>) {
        op::begin_dependence_analysis(op);
        self.apply_execution_fence(op);
        let window: Vec<(Weak<dyn Operation>, GenerationId)> = {
            let mut state = self.state.lock();
            state.window.retain(|entry| entry.op.strong_count() > 0);
            state
                .window
                .iter()
                .map(|entry| (entry.op.clone(), entry.gen))
                .collect()
        };
        for (weak_prior, prior_gen) in window {
            if let Some(prior) = weak_prior.upgrade() {
                op::register_dependence(op, runtime, &prior, prior_gen);
            }
        }
        self.record_in_window(op, Vec::new());
        op::end_dependence_analysis(op, runtime);
    }

    /// Analysis runs serially in program order, so the fence installed by
    /// an earlier execution fence's analysis is visible here even though
    /// it was not yet installed when this operation was issued.
    fn apply_execution_fence(&self, op: &Arc<dyn Operation>) {
        let fence = self.state.lock().current_execution_fence.clone();
        if let Some(fence) = fence {
            op.base().set_execution_fence_event(fence);
        }
    }

    fn record_in_window(&self, op: &Arc<dyn Operation>, requirements: Vec<RegionRequirement>) {
        let mut state = self.state.lock();
        if state.window.len() >= state.window_limit {
            state.window.pop_front();
        }
        state.window.push_back(WindowEntry {
            op: Arc::downgrade(op),
            gen: op.base().generation(),
            requirements,
        });
    }

    /// Merges the completion events of every operation in the window; an
    /// execution fence completes only after this triggers.
    #[must_use]
    pub fn perform_fence_analysis(&self, runtime: &Arc<Runtime>) -> Event {
        let completions: Vec<Event> = {
            let state = self.state.lock();
            state
                .window
                .iter()
                .filter_map(|entry| {
                    let prior = entry.op.upgrade()?;
                    if prior.base().generation() != entry.gen {
                        return None;
                    }
                    Some(prior.base().completion_event())
                })
                .collect()
        };
        Event::merge(runtime.dispatcher(), &completions)
    }

    /// Installs `fence` as the current mapping fence; every subsequently
    /// analyzed operation registers a dependence on it.
    pub fn update_current_mapping_fence(&self, fence: &Arc<dyn Operation>) {
        let mut state = self.state.lock();
        state.current_mapping_fence = Some((Arc::downgrade(fence), fence.base().generation()));
    }

    /// Installs `completion` as the current execution fence event; every
    /// subsequently issued operation executes only after it triggers.
    pub fn update_current_execution_fence(&self, completion: Event) {
        let mut state = self.state.lock();
        state.current_execution_fence = Some(completion);
    }
}

impl ResourceReceiver for InnerContext {
    fn receive_resources(
        &self,
        return_index: u64,
        update: ResourceUpdate,
        _preconditions: &mut Vec<Event>,
    ) {
        self.resources
            .lock()
            .merge_received_resources(return_index, update);
    }
}

impl core::fmt::Debug for InnerContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "InnerContext(index={}, window={})",
            self.index,
            self.window_size()
        )
    }
}
