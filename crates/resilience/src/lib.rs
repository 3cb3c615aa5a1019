//! Composable resilience execution engine.
//!
//! Wraps an arbitrary unit of work with fault-handling strategies — retry,
//! circuit breaking, hedging, timeout, concurrency limiting, fallback —
//! composed as nested middleware. The caller's code never depends on which
//! strategies are in the pipeline.
//!
//! Faults travel as data: every outcome is an [`Outcome`], classified per
//! strategy by a [`HandlePredicate`], and only re-raised (or not) at the
//! outermost call site. Pipelines are built once, validated eagerly, and
//! shared across concurrent calls.
//!
//! ```no_run
//! use std::time::Duration;
//! use faultline_resilience::{
//!     CircuitBreakerConfig, PipelineBuilder, RetryConfig, TimeoutConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = PipelineBuilder::<String, std::io::Error>::new()
//!     .name("fetch-profile")
//!     .retry(RetryConfig::builder().max_retries(3).build())
//!     .circuit_breaker(
//!         CircuitBreakerConfig::builder()
//!             .failure_ratio(0.5)
//!             .minimum_throughput(4)
//!             .build(),
//!     )
//!     .timeout(TimeoutConfig::builder().timeout(Duration::from_secs(2)).build())
//!     .build()?;
//!
//! let profile = pipeline
//!     .execute(|_ctx| async { Ok("profile".to_owned()) })
//!     .await?;
//! # drop(profile);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod builder;
pub mod circuit_breaker;
pub mod clock;
pub mod context;
pub mod fallback;
pub mod hedging;
mod health;
pub mod outcome;
pub mod pipeline;
pub mod predicate;
pub mod random;
pub mod rate_limiter;
pub mod retry;
pub mod telemetry;
pub mod timeout;

// Re-export the surface most callers need directly from the crate root.
pub use builder::{ConfigError, PipelineBuilder};
pub use circuit_breaker::{
    BreakSignal, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerSnapshot,
    CircuitBreakerStrategy, CircuitState, ManualControl, StateProvider,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ContextPool, ExecutionMode, PropertyBag, PropertyKey, ResilienceContext};
pub use fallback::{FallbackConfig, FallbackConfigBuilder, FallbackStrategy};
pub use hedging::{HedgingConfig, HedgingConfigBuilder, HedgingStrategy};
pub use outcome::{ExecutionError, Outcome};
pub use pipeline::{Next, OperationContext, OperationFn, Pipeline, Strategy};
pub use predicate::HandlePredicate;
pub use random::{FixedRandomizer, Randomizer, ThreadRngRandomizer};
pub use rate_limiter::{RateLimiterConfig, RateLimiterStrategy};
pub use retry::{Backoff, RetryConfig, RetryConfigBuilder, RetryStrategy};
pub use telemetry::{NullSink, ResilienceEvent, TelemetrySink, TracingSink};
pub use timeout::{TimeoutConfig, TimeoutConfigBuilder, TimeoutStrategy};
