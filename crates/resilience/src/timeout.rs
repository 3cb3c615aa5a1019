//! Timeout strategy
//!
//! Races the inner chain against a deadline. On expiry the inner attempt is
//! cancelled through a child token installed for its scope and the call
//! surfaces a [`Timeout`](crate::ExecutionError::Timeout) rejection. Outer
//! cancellation is kept distinct: a call cancelled from outside reports
//! `Cancelled`, never `Timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::builder::ConfigError;
use crate::context::ResilienceContext;
use crate::outcome::{ExecutionError, Outcome};
use crate::pipeline::{Next, Strategy};
use crate::telemetry::{event_names, ResilienceEvent};

const STRATEGY_NAME: &str = "timeout";

type TimeoutCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Timeout options. Construct with [`TimeoutConfig::builder`].
pub struct TimeoutConfig {
    /// Deadline applied to each invocation of the inner chain.
    pub timeout: Duration,
    /// Invoked when the deadline expires, with the configured timeout.
    pub on_timeout: Option<TimeoutCallback>,
}

impl TimeoutConfig {
    pub fn builder() -> TimeoutConfigBuilder {
        TimeoutConfigBuilder::default()
    }

    /// Structural validation, run at pipeline build time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid(STRATEGY_NAME, "timeout must be positive"));
        }
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), on_timeout: None }
    }
}

/// Fluent builder for [`TimeoutConfig`].
#[derive(Default)]
pub struct TimeoutConfigBuilder {
    config: TimeoutConfig,
}

impl TimeoutConfigBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.config.on_timeout = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> TimeoutConfig {
        self.config
    }
}

/// The timeout pipeline component.
pub struct TimeoutStrategy {
    config: TimeoutConfig,
}

impl TimeoutStrategy {
    pub fn from_config(config: TimeoutConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for TimeoutStrategy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    async fn execute(&self, ctx: &mut ResilienceContext, next: Next<'_, T, E>) -> Outcome<T, E> {
        let timeout = self.config.timeout;
        let parent = ctx.cancellation_token().clone();
        // The inner scope runs under a child token so expiry cancels only
        // this attempt, not the overall call.
        let child = parent.child_token();
        ctx.set_cancellation_token(child.clone());

        let completed = tokio::select! {
            biased;
            outcome = next.run(ctx) => Some(outcome),
            _ = tokio::time::sleep(timeout) => None,
        };

        ctx.set_cancellation_token(parent.clone());
        match completed {
            Some(outcome) => outcome,
            None => {
                child.cancel();
                if parent.is_cancelled() {
                    return Outcome::cancelled();
                }
                debug!(
                    strategy = STRATEGY_NAME,
                    timeout_ms = timeout.as_millis() as u64,
                    "attempt timed out"
                );
                ctx.record_event(
                    ResilienceEvent::new(event_names::ON_TIMEOUT, STRATEGY_NAME)
                        .with_detail(format!("{timeout:?}")),
                );
                if let Some(callback) = &self.config.on_timeout {
                    callback(timeout);
                }
                Outcome::Failure(ExecutionError::Timeout { timeout })
            }
        }
    }
}
