//! Interface to the mapper collaborator.
//!
//! The mapper makes policy decisions the engine never second-guesses:
//! whether to memoize an operation's physical analysis, whether to map
//! speculatively ahead of an unresolved predicate, how to rank source
//! instances, and whether a gang launch is jointly mappable. Callbacks are
//! synchronous; a mapper must not block.

use crate::error::{Error, Result};
use crate::op::Operation;
use crate::tracing_compat::error;
use crate::types::DistributedId;
use std::sync::Arc;

/// Mapper policy callbacks.
pub trait Mapper: Send + Sync {
    /// Whether to capture or replay this operation's physical analysis.
    fn memoize_operation(&self, _op: &Arc<dyn Operation>) -> bool {
        false
    }

    /// A guessed predicate value to map against before resolution, or
    /// `None` to wait for the real value.
    fn speculate(&self, _op: &Arc<dyn Operation>) -> Option<bool> {
        None
    }

    /// Ranks candidate source instances, best first.
    fn select_sources(
        &self,
        _op: &Arc<dyn Operation>,
        candidates: &[DistributedId],
    ) -> Vec<DistributedId> {
        candidates.to_vec()
    }

    /// Produces a jointly satisfiable assignment for a gang launch, or an
    /// error if none exists. Not retried automatically.
    fn map_must_epoch(&self, _ops: &[Arc<dyn Operation>]) -> Result<()> {
        Ok(())
    }

    /// Receives mapping failures for the application's error channel.
    fn report_failure(&self, failure: &Error) {
        error!(%failure, "mapper reported failure");
    }
}

/// The policy-free mapper: never memoizes, never speculates, keeps
/// candidate order, accepts every gang launch.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMapper;

impl Mapper for DefaultMapper {}
