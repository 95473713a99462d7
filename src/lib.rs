//! Opgraph: deferred operation dependence and lifecycle engine.
//!
//! # Overview
//!
//! Opgraph is the ordering core of a distributed task-based runtime. A
//! context issues operations (copies, fills, fences, deletions, partition
//! constructions, gang launches) in program order; opgraph turns that
//! sequence into a dependence graph that maps, executes, and commits
//! asynchronously and out of program order while preserving the data-hazard
//! semantics of the original sequential program.
//!
//! # Core Guarantees
//!
//! - **Deferred execution**: operations are issued immediately, but mapping,
//!   execution, and commit happen asynchronously, ordered only by explicit
//!   dependence edges and fences
//! - **Generation safety**: operation storage is pooled; every logical use
//!   carries a generation stamp, so stale references resolve as "already
//!   satisfied" instead of touching a reused slot
//! - **Speculation**: predicated operations may begin mapping before their
//!   predicate resolves, and reconcile guess against outcome exactly once
//! - **Memoization**: physical analysis can be captured into a template the
//!   first time a trace shape is seen and replayed on later occurrences
//! - **Collective rendezvous**: point operations of one index launch agree
//!   on a single shared view identity without a central coordinator
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, field masks, region requirements, provenance
//! - [`event`]: one-shot completion events with attachable continuations
//! - [`dispatch`]: priority-laned dispatcher for pipeline stage work
//! - [`op`]: the operation pipeline state machine and capability states
//! - [`ops`]: concrete operation kinds built on the pipeline substrate
//! - [`context`]: per-context program-order dependence queues
//! - [`resource`]: created/deleted resource accumulation and merging
//! - [`forest`]: interface to the external region-tree collaborator
//! - [`mapper`]: interface to the external mapper collaborator
//! - [`runtime`]: the operation pool and collaborator wiring
//! - [`remote`]: packing operations for non-owner nodes
//! - [`error`]: error types
//! - [`util`]: internal utilities (generation-stamped arena)

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod context;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod forest;
pub mod mapper;
pub mod op;
pub mod ops;
pub mod remote;
pub mod resource;
pub mod runtime;
pub mod tracing_compat;
pub mod types;
pub mod util;

pub use context::InnerContext;
pub use dispatch::{Dispatcher, Priority};
pub use error::{Error, ErrorCategory, ErrorKind, Recoverability, Result};
pub use event::{Event, UserEvent};
pub use forest::{InMemoryForest, RegionForest};
pub use mapper::{DefaultMapper, Mapper};
pub use op::{OpKind, Operation};
pub use runtime::Runtime;
pub use types::{
    DependenceType, FieldMask, GenerationId, OpId, Provenance, RegionRequirement, UniqueOpId,
};
