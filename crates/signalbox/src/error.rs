#![forbid(unsafe_code)]

//! Error and diagnostic types.
//!
//! [`SignalError`] is the outcome of a rejected write batch. It is `Clone`
//! because every caller that joined a batch holds the same [`Completion`].
//!
//! [`Diagnostic`] covers conditions that are reported but never fail the
//! caller: non-object initial state, redundant creates, unknown names.
//!
//! [`Completion`]: crate::Completion

use std::fmt;

use signalbox_path::{PathWriteError, ValueKind};

/// Failure of a pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// A deep write path could not be resolved.
    PathWrite(PathWriteError),
    /// A whole-state setter was called with something other than an object.
    PatchNotObject { found: ValueKind },
    /// A shallow merge was flushed into state that is not an object.
    StateNotObject { signal: String, found: ValueKind },
    /// The signal was destroyed before the batch could settle.
    Destroyed { signal: String },
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathWrite(err) => write!(f, "path write failed: {err}"),
            Self::PatchNotObject { found } => {
                write!(f, "whole-state patch must be an object, got {found}")
            }
            Self::StateNotObject { signal, found } => write!(
                f,
                "signal '{signal}' holds {found} state; shallow merge needs an object"
            ),
            Self::Destroyed { signal } => write!(f, "signal '{signal}' was destroyed"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PathWrite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PathWriteError> for SignalError {
    fn from(err: PathWriteError) -> Self {
        Self::PathWrite(err)
    }
}

/// Non-fatal condition, logged at `warn` and kept in the registry log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Initial state is not an object; shallow merges into it will fail.
    NonObjectState { signal: String, found: ValueKind },
    /// `create` was called again for a live signal with different options or
    /// a different initial value.
    RedundantCreate { signal: String },
    /// A read or get named a signal that does not exist.
    UnknownSignal { signal: String },
}

impl Diagnostic {
    /// Name of the signal the diagnostic refers to.
    #[must_use]
    pub fn signal(&self) -> &str {
        match self {
            Self::NonObjectState { signal, .. }
            | Self::RedundantCreate { signal }
            | Self::UnknownSignal { signal } => signal,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonObjectState { signal, found } => write!(
                f,
                "signal '{signal}' was seeded with {found} state; later changes will not be reactive"
            ),
            Self::RedundantCreate { signal } => write!(
                f,
                "signal '{signal}' already exists; new initial state and options are ignored"
            ),
            Self::UnknownSignal { signal } => write!(f, "signal '{signal}' is not defined"),
        }
    }
}
