//! Error reporting sink
//!
//! Every failed callback or store operation is handed to an [`ErrorSink`]
//! as a [`Failure`]: the identity involved (if any), the phase that failed
//! and the error itself. The dispatch loop never stops because of a
//! failure; the sink is where operational tooling picks them up.

use std::fmt;

#[cfg(test)]
use mockall::automock;
use tracing::error;

use crate::object::ObjectKey;
use crate::Error;

/// Stage of the engine a failure happened in
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// User reconcile logic
    Reconcile,
    /// A finalizer drain step, named by finalizer identifier
    Finalize(String),
    /// User deleted logic
    Deleted,
    /// Opening or consuming the watch stream
    Watch,
    /// Full list during (re)synchronization
    List,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Reconcile => f.write_str("reconcile"),
            Phase::Finalize(id) => write!(f, "finalize({id})"),
            Phase::Deleted => f.write_str("deleted"),
            Phase::Watch => f.write_str("watch"),
            Phase::List => f.write_str("list"),
        }
    }
}

/// A reported failure: (identity, phase, error)
#[derive(Debug)]
pub struct Failure {
    /// Object the failure is about; `None` for watch/list failures
    pub key: Option<ObjectKey>,
    /// Where it failed
    pub phase: Phase,
    /// What failed
    pub error: Error,
}

impl Failure {
    /// Failure of a callback or write for one object
    pub fn for_object(key: ObjectKey, phase: Phase, error: Error) -> Self {
        Self {
            key: Some(key),
            phase,
            error,
        }
    }

    /// Failure of the watch subscription itself
    pub fn for_stream(phase: Phase, error: Error) -> Self {
        Self {
            key: None,
            phase,
            error,
        }
    }
}

/// Receiver of engine failures
#[cfg_attr(test, automock)]
pub trait ErrorSink: Send + Sync {
    /// Record one failure; must not block
    fn report(&self, failure: &Failure);
}

/// Sink that logs every failure through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, failure: &Failure) {
        match &failure.key {
            Some(key) => error!(
                %key,
                phase = %failure.phase,
                error = %failure.error,
                retryable = failure.error.is_retryable(),
                "operation failed"
            ),
            None => error!(
                phase = %failure.phase,
                error = %failure.error,
                retryable = failure.error.is_retryable(),
                "operation failed"
            ),
        }
    }
}
