//! Pipeline assembly and build-time validation
//!
//! Strategies are appended in nesting order (first added = outermost) and
//! assembled into an immutable [`Pipeline`] by [`PipelineBuilder::build`].
//! Every config is validated structurally before any strategy is
//! constructed, and the finished chain is walked — including the children
//! of composite components — to reject a strategy instance appearing twice.
//! All failures surface as [`ConfigError`] at build time, never at
//! execution time.

use std::sync::Arc;

use thiserror::Error;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerStrategy};
use crate::fallback::{FallbackConfig, FallbackStrategy};
use crate::hedging::{HedgingConfig, HedgingStrategy};
use crate::pipeline::{Pipeline, Strategy};
use crate::rate_limiter::{RateLimiterConfig, RateLimiterStrategy};
use crate::retry::{RetryConfig, RetryStrategy};
use crate::telemetry::{TelemetrySink, TracingSink};
use crate::timeout::{TimeoutConfig, TimeoutStrategy};

/// Build-time configuration failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A strategy's options failed structural validation.
    #[error("invalid {strategy} configuration: {message}")]
    InvalidConfig {
        /// Strategy the options belong to.
        strategy: &'static str,
        /// What was wrong.
        message: &'static str,
    },

    /// The same component instance appears twice in the pipeline tree.
    #[error("duplicate {strategy} component instance in pipeline")]
    DuplicateComponent {
        /// Name of the aliased component.
        strategy: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid(strategy: &'static str, message: &'static str) -> Self {
        Self::InvalidConfig { strategy, message }
    }
}

enum Entry<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    Retry(RetryConfig<T, E>),
    CircuitBreaker(CircuitBreakerConfig<T, E>),
    Hedging(HedgingConfig<T, E>),
    Timeout(TimeoutConfig),
    RateLimiter(RateLimiterConfig),
    Fallback(FallbackConfig<T, E>),
    Component(Arc<dyn Strategy<T, E>>),
}

/// Assembles a [`Pipeline`] from strategy options.
///
/// ```
/// use std::time::Duration;
/// use faultline_resilience::{PipelineBuilder, RetryConfig, TimeoutConfig};
///
/// let pipeline = PipelineBuilder::<String, std::io::Error>::new()
///     .retry(RetryConfig::builder().max_retries(3).build())
///     .timeout(TimeoutConfig::builder().timeout(Duration::from_secs(2)).build())
///     .build()
///     .expect("valid configuration");
/// # drop(pipeline);
/// ```
pub struct PipelineBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    name: Option<String>,
    telemetry: Arc<dyn TelemetrySink>,
    entries: Vec<Entry<T, E>>,
}

impl<T, E> Default for PipelineBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> PipelineBuilder<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { name: None, telemetry: Arc::new(TracingSink), entries: Vec::new() }
    }

    /// Name the pipeline, for telemetry and diagnostics.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the default `tracing`-backed telemetry sink.
    #[must_use]
    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Append a retry strategy.
    #[must_use]
    pub fn retry(mut self, config: RetryConfig<T, E>) -> Self {
        self.entries.push(Entry::Retry(config));
        self
    }

    /// Append a circuit breaker strategy.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig<T, E>) -> Self {
        self.entries.push(Entry::CircuitBreaker(config));
        self
    }

    /// Append a hedging strategy.
    #[must_use]
    pub fn hedging(mut self, config: HedgingConfig<T, E>) -> Self {
        self.entries.push(Entry::Hedging(config));
        self
    }

    /// Append a timeout strategy.
    #[must_use]
    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.entries.push(Entry::Timeout(config));
        self
    }

    /// Append a concurrency limiter strategy.
    #[must_use]
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.entries.push(Entry::RateLimiter(config));
        self
    }

    /// Append a fallback strategy.
    #[must_use]
    pub fn fallback(mut self, config: FallbackConfig<T, E>) -> Self {
        self.entries.push(Entry::Fallback(config));
        self
    }

    /// Append a caller-built component (custom strategy or composite).
    #[must_use]
    pub fn component(mut self, component: Arc<dyn Strategy<T, E>>) -> Self {
        self.entries.push(Entry::Component(component));
        self
    }

    /// Append another pipeline's strategies in place, preserving their
    /// order. The strategies are shared, not copied, so the aliasing guard
    /// applies across both pipelines' entries here.
    #[must_use]
    pub fn pipeline(mut self, pipeline: &Pipeline<T, E>) -> Self {
        for component in pipeline.chain() {
            self.entries.push(Entry::Component(Arc::clone(component)));
        }
        self
    }

    /// Validate every pending config, construct the strategies, and check
    /// the finished tree for aliased instances.
    pub fn build(self) -> Result<Pipeline<T, E>, ConfigError> {
        let mut chain: Vec<Arc<dyn Strategy<T, E>>> = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let component: Arc<dyn Strategy<T, E>> = match entry {
                Entry::Retry(config) => Arc::new(RetryStrategy::from_config(config)?),
                Entry::CircuitBreaker(config) => {
                    Arc::new(CircuitBreakerStrategy::from_config(config)?)
                }
                Entry::Hedging(config) => Arc::new(HedgingStrategy::from_config(config)?),
                Entry::Timeout(config) => Arc::new(TimeoutStrategy::from_config(config)?),
                Entry::RateLimiter(config) => {
                    Arc::new(RateLimiterStrategy::from_config(config)?)
                }
                Entry::Fallback(config) => Arc::new(FallbackStrategy::from_config(config)?),
                Entry::Component(component) => component,
            };
            chain.push(component);
        }

        let mut seen = Vec::new();
        for component in &chain {
            check_aliasing(component, &mut seen)?;
        }

        Ok(Pipeline::from_parts(self.name, chain, self.telemetry))
    }
}

/// Depth-first walk over a component and its children, tracking instance
/// identity by pointer. Composites nested inside composites are covered by
/// recursing through [`Strategy::subcomponents`].
fn check_aliasing<T, E>(
    component: &Arc<dyn Strategy<T, E>>,
    seen: &mut Vec<*const ()>,
) -> Result<(), ConfigError>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let pointer = Arc::as_ptr(component) as *const ();
    if seen.contains(&pointer) {
        return Err(ConfigError::DuplicateComponent { strategy: component.name() });
    }
    seen.push(pointer);
    for child in component.subcomponents() {
        check_aliasing(&child, seen)?;
    }
    Ok(())
}
