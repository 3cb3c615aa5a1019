//! Result-or-fault model for executed operations
//!
//! Every unit of work wrapped by a pipeline produces an [`Outcome`]: either
//! the operation's value or an [`ExecutionError`]. Faults never unwind
//! through strategy boundaries as panics or early returns; they travel as
//! data so each strategy can inspect them uniformly through its predicate.
//! The outermost call site decides whether to re-raise (via
//! [`Outcome::into_result`]) or consume the outcome as data.

use std::any::TypeId;
use std::time::Duration;

use thiserror::Error;

/// Faults that can surface from a pipeline execution.
///
/// The engine's own rejections (circuit open/isolated, timeout, rate limit,
/// cancellation) are distinct variants, never confused with the wrapped
/// operation's fault, and are classifiable by downstream predicates — an
/// outer retry can choose to retry on `CircuitOpen`, for example. The
/// operation's own error is carried transparently so re-raising at the
/// boundary surfaces the original error value unchanged.
#[derive(Debug, Error)]
pub enum ExecutionError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls.
    #[error("circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// Circuit breaker was manually isolated, rejecting calls.
    #[error("circuit breaker is isolated, rejecting calls")]
    CircuitIsolated,

    /// Operation ran longer than the configured timeout.
    #[error("operation timed out after {timeout:?}")]
    Timeout {
        /// The timeout that expired.
        timeout: Duration,
    },

    /// Rate limiter had no permit available and the queue was full.
    #[error("rate limiter rejected the call ({permits} permits, {queue_limit} queue slots)")]
    RateLimited {
        /// Configured permit limit.
        permits: usize,
        /// Configured queue limit.
        queue_limit: usize,
    },

    /// The execution was cancelled. Never classified as a handled failure.
    #[error("execution was cancelled")]
    Cancelled,

    /// The wrapped operation failed with its own error.
    #[error(transparent)]
    Operation(E),
}

impl<E> ExecutionError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether this fault is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this fault was synthesized by the engine itself rather than
    /// raised by the wrapped operation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen | Self::CircuitIsolated | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// The wrapped operation's error, if this fault carries one.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            _ => None,
        }
    }
}

/// The result-or-fault union produced by executing an operation or a
/// strategy. Immutable once constructed; `Debug` output is for diagnostics
/// only.
#[derive(Debug)]
pub enum Outcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The operation produced a value.
    Success(T),
    /// The operation or the engine produced a fault.
    Failure(ExecutionError<E>),
}

impl<T, E> Outcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Capture an operation result into an outcome.
    pub fn from_result(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::Failure(ExecutionError::Operation(error)),
        }
    }

    /// A cancellation outcome.
    pub fn cancelled() -> Self {
        Self::Failure(ExecutionError::Cancelled)
    }

    /// Whether the outcome is a success value.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the outcome is a fault.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Whether the outcome is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Failure(ExecutionError::Cancelled))
    }

    /// The success value, if present.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// The fault, if present.
    pub fn error(&self) -> Option<&ExecutionError<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(error) => Some(error),
        }
    }

    /// Whether the result type carries no meaningful value.
    pub fn is_void(&self) -> bool
    where
        T: 'static,
    {
        TypeId::of::<T>() == TypeId::of::<()>()
    }

    /// Re-raise boundary: convert the outcome back into a `Result`.
    ///
    /// A captured operation fault comes back as the verbatim original error
    /// (wrapped transparently), not a new synthetic one.
    pub fn into_result(self) -> Result<T, ExecutionError<E>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(error) => Err(error),
        }
    }
}
