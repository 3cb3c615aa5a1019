//! Handled-outcome classification
//!
//! Every reactive strategy (retry, circuit breaker, hedging, fallback) asks
//! the same question of an outcome: is this something I must react to? The
//! answer comes from a caller-composed [`HandlePredicate`]. Cancellation is
//! excluded centrally and can never be classified as handled.

use std::fmt;
use std::sync::Arc;

use crate::outcome::{ExecutionError, Outcome};

type Check<T, E> = Arc<dyn Fn(&Outcome<T, E>) -> bool + Send + Sync>;

/// Composable classifier deciding which outcomes a strategy reacts to.
///
/// Checks are OR-ed together; the first matching check classifies the
/// outcome as handled. Build from a base constructor and widen with the
/// `or_*` combinators:
///
/// ```
/// use faultline_resilience::HandlePredicate;
///
/// // Handle every failure, plus successes carrying a server error code.
/// let predicate: HandlePredicate<u16, std::io::Error> =
///     HandlePredicate::failures().or_success(|status| *status >= 500);
/// ```
pub struct HandlePredicate<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    checks: Vec<Check<T, E>>,
}

impl<T, E> HandlePredicate<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Handle every failure outcome (operation faults and engine
    /// rejections alike). This is the default predicate.
    pub fn failures() -> Self {
        Self { checks: vec![Arc::new(|outcome: &Outcome<T, E>| outcome.is_failure())] }
    }

    /// Handle nothing. Useful as a base for purely additive composition.
    pub fn never() -> Self {
        Self { checks: Vec::new() }
    }

    /// Also handle operation errors matching the given check.
    #[must_use]
    pub fn or_operation<F>(mut self, check: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.checks.push(Arc::new(move |outcome: &Outcome<T, E>| {
            outcome.error().and_then(ExecutionError::operation_error).is_some_and(&check)
        }));
        self
    }

    /// Also handle rejections synthesized by the engine itself (circuit
    /// open/isolated, timeout, rate limited).
    #[must_use]
    pub fn or_rejection(mut self) -> Self {
        self.checks.push(Arc::new(|outcome: &Outcome<T, E>| {
            outcome.error().is_some_and(ExecutionError::is_rejection)
        }));
        self
    }

    /// Also handle success values matching the given check (e.g. an HTTP
    /// response carrying a retryable status).
    #[must_use]
    pub fn or_success<F>(mut self, check: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.checks
            .push(Arc::new(move |outcome: &Outcome<T, E>| outcome.value().is_some_and(&check)));
        self
    }

    /// Classify an outcome. Cancellation is never handled, regardless of
    /// how the predicate was composed.
    pub fn is_handled(&self, outcome: &Outcome<T, E>) -> bool {
        if outcome.is_cancelled() {
            return false;
        }
        self.checks.iter().any(|check| check(outcome))
    }
}

impl<T, E> Default for HandlePredicate<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::failures()
    }
}

impl<T, E> Clone for HandlePredicate<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self { checks: self.checks.clone() }
    }
}

impl<T, E> fmt::Debug for HandlePredicate<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePredicate").field("checks", &self.checks.len()).finish()
    }
}
