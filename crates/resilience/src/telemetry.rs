//! Resilience events and the telemetry sink boundary
//!
//! Strategies append named [`ResilienceEvent`]s to the execution context;
//! after a call completes the pipeline forwards the log to the configured
//! [`TelemetrySink`]. Formatting and listener plumbing live outside the
//! engine — the default sink just emits `tracing` records.

use std::fmt;
use std::time::Instant;

/// Event names emitted by the built-in strategies.
pub mod event_names {
    /// Retry is about to wait and re-attempt.
    pub const ON_RETRY: &str = "on_retry";
    /// Circuit transitioned to Open.
    pub const CIRCUIT_OPENED: &str = "circuit_opened";
    /// Circuit transitioned to Closed.
    pub const CIRCUIT_CLOSED: &str = "circuit_closed";
    /// Circuit transitioned to HalfOpen.
    pub const CIRCUIT_HALF_OPENED: &str = "circuit_half_opened";
    /// Circuit rejected a call without invoking the operation.
    pub const CIRCUIT_REJECTED: &str = "circuit_rejected";
    /// A hedged attempt is being launched.
    pub const ON_HEDGE: &str = "on_hedge";
    /// The timeout strategy expired an attempt.
    pub const ON_TIMEOUT: &str = "on_timeout";
    /// The fallback strategy substituted an outcome.
    pub const ON_FALLBACK: &str = "on_fallback";
    /// The rate limiter rejected a call.
    pub const RATE_LIMITED: &str = "rate_limited";
}

/// A single named event recorded during a pipeline execution.
#[derive(Debug, Clone)]
pub struct ResilienceEvent {
    /// Event name (one of [`event_names`] for built-in strategies).
    pub name: &'static str,
    /// Name of the strategy that emitted the event.
    pub strategy: &'static str,
    /// Attempt number, for per-attempt events.
    pub attempt: Option<u32>,
    /// Free-form detail for diagnostics.
    pub detail: Option<String>,
    /// When the event was recorded.
    pub at: Instant,
}

impl ResilienceEvent {
    /// Create an event with no attempt number or detail.
    pub fn new(name: &'static str, strategy: &'static str) -> Self {
        Self { name, strategy, attempt: None, detail: None, at: Instant::now() }
    }

    /// Attach an attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attach a detail string.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.strategy, self.name)?;
        if let Some(attempt) = self.attempt {
            write!(f, " attempt={attempt}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Narrow interface the engine emits events through.
///
/// Implementations must be cheap; they are called once per execution with
/// the full event log.
pub trait TelemetrySink: Send + Sync {
    /// Record one event from a finished execution.
    fn record(&self, pipeline: Option<&str>, operation_key: Option<&str>, event: &ResilienceEvent);
}

/// Default sink that forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, pipeline: Option<&str>, operation_key: Option<&str>, event: &ResilienceEvent) {
        tracing::debug!(
            pipeline = pipeline.unwrap_or("<unnamed>"),
            operation = operation_key.unwrap_or("<unkeyed>"),
            strategy = event.strategy,
            attempt = event.attempt,
            "{}",
            event.name
        );
    }
}

/// Sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _: Option<&str>, _: Option<&str>, _: &ResilienceEvent) {}
}
