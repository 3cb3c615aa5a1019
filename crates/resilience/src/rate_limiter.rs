//! Concurrency limiter strategy
//!
//! Admission control over the inner chain: a call needs a permit before it
//! may proceed. With none free it queues up to the configured queue limit
//! (the wait observes cancellation) or is rejected immediately with a
//! [`RateLimited`](crate::ExecutionError::RateLimited) fault. Permits are
//! released unconditionally when the call completes, whatever the outcome.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::builder::ConfigError;
use crate::context::ResilienceContext;
use crate::outcome::{ExecutionError, Outcome};
use crate::pipeline::{Next, Strategy};
use crate::telemetry::{event_names, ResilienceEvent};

const STRATEGY_NAME: &str = "rate_limiter";

/// Concurrency limiter options.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Calls allowed to run concurrently.
    pub permits: usize,
    /// Calls allowed to wait for a permit; `0` rejects immediately.
    pub queue_limit: usize,
}

impl RateLimiterConfig {
    pub fn new(permits: usize, queue_limit: usize) -> Self {
        Self { permits, queue_limit }
    }

    /// Structural validation, run at pipeline build time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.permits == 0 {
            return Err(ConfigError::invalid(STRATEGY_NAME, "permits must be at least 1"));
        }
        if self.permits > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(STRATEGY_NAME, "permits exceeds supported maximum"));
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { permits: 10, queue_limit: 0 }
    }
}

/// The concurrency limiter pipeline component.
pub struct RateLimiterStrategy {
    config: RateLimiterConfig,
    semaphore: Semaphore,
    queued: AtomicUsize,
}

impl RateLimiterStrategy {
    pub fn from_config(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, semaphore: Semaphore::new(config.permits), queued: AtomicUsize::new(0) })
    }

    fn rejection<T, E>(&self, ctx: &mut ResilienceContext) -> Outcome<T, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        debug!(
            strategy = STRATEGY_NAME,
            permits = self.config.permits,
            queue_limit = self.config.queue_limit,
            "call rejected, no permit and queue full"
        );
        ctx.record_event(ResilienceEvent::new(event_names::RATE_LIMITED, STRATEGY_NAME));
        Outcome::Failure(ExecutionError::RateLimited {
            permits: self.config.permits,
            queue_limit: self.config.queue_limit,
        })
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for RateLimiterStrategy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    async fn execute(&self, ctx: &mut ResilienceContext, next: Next<'_, T, E>) -> Outcome<T, E> {
        let _permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                // Join the queue if there is room.
                let joined = self
                    .queued
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                        (queued < self.config.queue_limit).then_some(queued + 1)
                    })
                    .is_ok();
                if !joined {
                    return self.rejection(ctx);
                }
                let token = ctx.cancellation_token().clone();
                let acquired = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = self.semaphore.acquire() => permit.ok(),
                };
                self.queued.fetch_sub(1, Ordering::SeqCst);
                match acquired {
                    Some(permit) => permit,
                    None => return Outcome::cancelled(),
                }
            }
        };
        // Permit held for the whole inner execution; released on drop no
        // matter how the outcome turns out.
        next.run(ctx).await
    }
}
