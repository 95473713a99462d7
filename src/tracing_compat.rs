//! Tracing re-exports for structured logging.
//!
//! All internal modules import log macros from here rather than from the
//! `tracing` crate directly, so the logging backend can be swapped or
//! feature-gated in one place.

pub use tracing::{debug, error, info, trace, warn};
