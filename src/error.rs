//! Error types and error handling strategy for opgraph.
//!
//! Error handling follows a small taxonomy:
//!
//! - **Fatal invariant violations** (double-resolving a predicate, the
//!   engine registering against a retired generation) are bugs in a caller
//!   and abort via `panic!`/`debug_assert!` rather than propagating.
//! - **Mapping failures** are recoverable at operation granularity: they are
//!   reported through the mapper error channel and the operation never
//!   proceeds past its mapping stage.
//! - **Stale references** (a dependence target whose generation advanced)
//!   are not errors at all; they are pruned silently as "already satisfied".
//! - **Resource conflicts** (interfering region requirements within one
//!   operation) surface as typed errors through the diagnostic hooks.

use core::fmt;

/// A specialized result type for opgraph operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Mapping ===
    /// The mapper failed to produce a valid instance assignment.
    MappingFailure,
    /// A must-epoch launch could not be jointly satisfied.
    MustEpochFailure,
    /// Two region requirements of one operation interfere.
    InterferingRequirements,
    /// A region was used before any operation wrote to it.
    UninitializedUsage,

    // === Lifecycle ===
    /// An operation was quashed before entering the pipeline.
    OperationQuashed,
    /// A lifecycle method was invoked in a state that does not permit it.
    InvalidStateTransition,

    // === Resources ===
    /// A resource return was replayed with a stale return index.
    DuplicateResourceReturn,

    // === Remote ===
    /// A remote operation payload could not be decoded.
    MalformedRemotePayload,

    // === Internal ===
    /// Internal engine error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::MappingFailure
            | Self::MustEpochFailure
            | Self::InterferingRequirements
            | Self::UninitializedUsage => ErrorCategory::Mapping,
            Self::OperationQuashed | Self::InvalidStateTransition => ErrorCategory::Lifecycle,
            Self::DuplicateResourceReturn => ErrorCategory::Resources,
            Self::MalformedRemotePayload => ErrorCategory::Remote,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the recoverability classification for this kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::MappingFailure | Self::MustEpochFailure => Recoverability::Transient,
            Self::InterferingRequirements
            | Self::UninitializedUsage
            | Self::InvalidStateTransition
            | Self::DuplicateResourceReturn
            | Self::MalformedRemotePayload
            | Self::Internal => Recoverability::Permanent,
            Self::OperationQuashed => Recoverability::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MappingFailure => "mapping failure",
            Self::MustEpochFailure => "must-epoch mapping failure",
            Self::InterferingRequirements => "interfering region requirements",
            Self::UninitializedUsage => "uninitialized region usage",
            Self::OperationQuashed => "operation quashed",
            Self::InvalidStateTransition => "invalid state transition",
            Self::DuplicateResourceReturn => "duplicate resource return",
            Self::MalformedRemotePayload => "malformed remote payload",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Coarse grouping of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Mapper-visible failures.
    Mapping,
    /// Operation lifecycle violations.
    Lifecycle,
    /// Resource tracking failures.
    Resources,
    /// Remote operation packing/unpacking failures.
    Remote,
    /// Engine bugs.
    Internal,
}

/// Classification of whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure; a retry with different mapper decisions may succeed.
    Transient,
    /// Unrecoverable; do not retry.
    Permanent,
    /// Depends on context.
    Unknown,
}

/// The error type for opgraph operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    /// The unique id of the operation the error is attributed to, if any.
    op: Option<u64>,
}

impl Error {
    /// Creates a new error of the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            op: None,
        }
    }

    /// Creates a new error with a message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            op: None,
        }
    }

    /// Attributes this error to an operation by unique id.
    #[must_use]
    pub const fn for_op(mut self, unique_op_id: u64) -> Self {
        self.op = Some(unique_op_id);
        self
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the recoverability classification of this error.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns the unique id of the attributed operation, if any.
    #[must_use]
    pub const fn op(&self) -> Option<u64> {
        self.op
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(op) = self.op {
            write!(f, " (op {op})")?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_categories() {
        assert_eq!(ErrorKind::MappingFailure.category(), ErrorCategory::Mapping);
        assert_eq!(
            ErrorKind::InvalidStateTransition.category(),
            ErrorCategory::Lifecycle
        );
        assert_eq!(
            ErrorKind::DuplicateResourceReturn.category(),
            ErrorCategory::Resources
        );
        assert_eq!(ErrorKind::Internal.category(), ErrorCategory::Internal);
    }

    #[test]
    fn mapping_failures_are_transient() {
        assert_eq!(
            ErrorKind::MappingFailure.recoverability(),
            Recoverability::Transient
        );
        assert_eq!(
            ErrorKind::Internal.recoverability(),
            Recoverability::Permanent
        );
    }

    #[test]
    fn display_includes_attribution() {
        let err = Error::with_message(ErrorKind::InterferingRequirements, "regions 0 and 1")
            .for_op(42);
        let text = err.to_string();
        assert!(text.contains("op 42"));
        assert!(text.contains("regions 0 and 1"));
    }
}
