//! Retry strategy
//!
//! Re-invokes the inner chain while outcomes classify as handled, waiting a
//! computed backoff between attempts. Exhaustion returns the last outcome
//! verbatim; no synthetic "retries exhausted" fault is introduced. The
//! inter-attempt wait races the cancellation token, so cancelling the call
//! mid-delay surfaces promptly as a cancellation, not the prior fault.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::builder::ConfigError;
use crate::context::ResilienceContext;
use crate::outcome::Outcome;
use crate::pipeline::{Next, Strategy};
use crate::predicate::HandlePredicate;
use crate::random::{Randomizer, ThreadRngRandomizer};
use crate::telemetry::{event_names, ResilienceEvent};

const STRATEGY_NAME: &str = "retry";

/// How the inter-attempt delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Same delay every attempt.
    Constant,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay doubles each attempt.
    #[default]
    Exponential,
}

type DelayGenerator<T, E> =
    Arc<dyn Fn(&Outcome<T, E>, u32) -> Option<Duration> + Send + Sync>;
type RetryCallback = Arc<dyn Fn(u32, Duration) + Send + Sync>;

/// Retry options. Construct with [`RetryConfig::builder`].
pub struct RetryConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Which outcomes trigger another attempt.
    pub predicate: HandlePredicate<T, E>,
    /// Maximum retries after the initial attempt; `None` retries until
    /// success or cancellation.
    pub max_retries: Option<u32>,
    /// Delay growth curve.
    pub backoff: Backoff,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied to the computed delay.
    pub max_delay: Duration,
    /// Perturb delays by up to ±25% to decorrelate retry storms.
    pub use_jitter: bool,
    /// Randomness source for jitter.
    pub randomizer: Arc<dyn Randomizer>,
    /// Overrides the backoff delay per retry; may inspect the outcome, e.g.
    /// to honor a server-supplied retry hint. Returning `None` falls back
    /// to the backoff curve.
    pub delay_generator: Option<DelayGenerator<T, E>>,
    /// Invoked before each wait with the retry number and chosen delay.
    pub on_retry: Option<RetryCallback>,
}

impl<T, E> RetryConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryConfigBuilder<T, E> {
        RetryConfigBuilder::default()
    }

    /// Structural validation, run at pipeline build time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == Some(0) {
            return Err(ConfigError::invalid(
                STRATEGY_NAME,
                "max_retries must be at least 1 (or unbounded)",
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                STRATEGY_NAME,
                "max_delay must be at least base_delay",
            ));
        }
        Ok(())
    }
}

impl<T, E> Default for RetryConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            predicate: HandlePredicate::failures(),
            max_retries: Some(3),
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            use_jitter: true,
            randomizer: Arc::new(ThreadRngRandomizer),
            delay_generator: None,
            on_retry: None,
        }
    }
}

/// Fluent builder for [`RetryConfig`].
pub struct RetryConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: RetryConfig<T, E>,
}

impl<T, E> Default for RetryConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self { config: RetryConfig::default() }
    }
}

impl<T, E> RetryConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn predicate(mut self, predicate: HandlePredicate<T, E>) -> Self {
        self.config.predicate = predicate;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = Some(retries);
        self
    }

    /// Retry until success or cancellation.
    pub fn unbounded(mut self) -> Self {
        self.config.max_retries = None;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn use_jitter(mut self, jitter: bool) -> Self {
        self.config.use_jitter = jitter;
        self
    }

    pub fn randomizer(mut self, randomizer: Arc<dyn Randomizer>) -> Self {
        self.config.randomizer = randomizer;
        self
    }

    pub fn delay_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&Outcome<T, E>, u32) -> Option<Duration> + Send + Sync + 'static,
    {
        self.config.delay_generator = Some(Arc::new(generator));
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, Duration) + Send + Sync + 'static,
    {
        self.config.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> RetryConfig<T, E> {
        self.config
    }
}

/// The retry pipeline component.
pub struct RetryStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: RetryConfig<T, E>,
}

impl<T, E> RetryStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn from_config(config: RetryConfig<T, E>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Backoff delay for the given retry number (1-based), jittered and
    /// capped.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let config = &self.config;
        let raw = match config.backoff {
            Backoff::Constant => config.base_delay,
            Backoff::Linear => config.base_delay.saturating_mul(retry),
            Backoff::Exponential => {
                let shift = (retry - 1).min(31);
                config.base_delay.saturating_mul(1u32 << shift)
            }
        };
        let capped = raw.min(config.max_delay);
        if config.use_jitter && !capped.is_zero() {
            // ±25% perturbation.
            let factor = 0.75 + 0.5 * config.randomizer.next_f64();
            capped.mul_f64(factor)
        } else {
            capped
        }
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for RetryStrategy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    async fn execute(&self, ctx: &mut ResilienceContext, next: Next<'_, T, E>) -> Outcome<T, E> {
        let mut retries: u32 = 0;
        loop {
            let outcome = next.run(ctx).await;
            if outcome.is_cancelled() || !self.config.predicate.is_handled(&outcome) {
                return outcome;
            }
            if let Some(max) = self.config.max_retries {
                if retries >= max {
                    return outcome;
                }
            }
            retries += 1;

            let delay = self
                .config
                .delay_generator
                .as_ref()
                .and_then(|generator| generator(&outcome, retries))
                .unwrap_or_else(|| self.backoff_delay(retries));

            debug!(
                strategy = STRATEGY_NAME,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "outcome handled, retrying"
            );
            ctx.record_event(
                ResilienceEvent::new(event_names::ON_RETRY, STRATEGY_NAME)
                    .with_attempt(retries)
                    .with_detail(format!("delay {delay:?}")),
            );
            if let Some(callback) = &self.config.on_retry {
                callback(retries, delay);
            }

            let token = ctx.cancellation_token().clone();
            if delay.is_zero() {
                if token.is_cancelled() {
                    return Outcome::cancelled();
                }
            } else {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Outcome::cancelled(),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::random::FixedRandomizer;
    use crate::telemetry::NullSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry_pipeline(config: RetryConfig<u32, std::io::Error>) -> Pipeline<u32, std::io::Error> {
        let strategy = RetryStrategy::from_config(config).expect("valid config");
        Pipeline::from_parts(None, vec![Arc::new(strategy) as _], Arc::new(NullSink))
    }

    fn fast_config() -> RetryConfigBuilder<u32, std::io::Error> {
        RetryConfig::builder().base_delay(Duration::from_millis(1)).use_jitter(false)
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_outcome_verbatim() {
        let pipeline = retry_pipeline(fast_config().max_retries(3).build());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = pipeline
            .execute_outcome_with_state(Arc::clone(&calls), |_ctx, calls| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::other(format!("attempt {n}")))
            })
            .await;

        // 1 initial + 3 retries, and the 4th outcome comes back unchanged.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match outcome.error() {
            Some(crate::outcome::ExecutionError::Operation(e)) => {
                assert_eq!(e.to_string(), "attempt 3");
            }
            other => panic!("expected operation fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_stops_retrying() {
        let pipeline = retry_pipeline(fast_config().max_retries(5).build());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = pipeline
            .execute_outcome_with_state(Arc::clone(&calls), |_ctx, calls| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(std::io::Error::other("first"))
                } else {
                    Ok(99)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.value(), Some(&99));
    }

    #[tokio::test]
    async fn test_unhandled_fault_passes_through() {
        let pipeline = retry_pipeline(
            fast_config().max_retries(5).predicate(HandlePredicate::never()).build(),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = pipeline
            .execute_outcome_with_state(Arc::clone(&calls), |_ctx, calls| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::other("boom"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.is_failure());
    }

    #[tokio::test]
    async fn test_delay_generator_overrides_backoff() {
        let waited = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&waited);
        let config = fast_config()
            .max_retries(2)
            .delay_generator(|_outcome, retry| Some(Duration::from_millis(u64::from(retry))))
            .on_retry(move |retry, delay| seen.lock().push((retry, delay)))
            .build();
        let pipeline = retry_pipeline(config);

        let _ = pipeline
            .execute_outcome(|_ctx| async { Err(std::io::Error::other("boom")) })
            .await;

        let recorded = waited.lock().clone();
        assert_eq!(
            recorded,
            vec![(1, Duration::from_millis(1)), (2, Duration::from_millis(2))]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_during_delay_surfaces_cancelled() {
        let pipeline = retry_pipeline(
            fast_config()
                .unbounded()
                .base_delay(Duration::from_secs(60))
                .max_delay(Duration::from_secs(60))
                .build(),
        );
        let mut ctx = ResilienceContext::new();
        let token = ctx.cancellation_token().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let outcome = pipeline
            .execute_outcome_with_context(&mut ctx, |_ctx| async {
                Err(std::io::Error::other("boom"))
            })
            .await;
        // The fault was observed before cancellation, but cancellation wins.
        assert!(outcome.is_cancelled());
    }

    #[test]
    fn test_backoff_curves() {
        let base = Duration::from_millis(100);
        let strategy = RetryStrategy::from_config(
            RetryConfig::<u32, std::io::Error>::builder()
                .backoff(Backoff::Exponential)
                .base_delay(base)
                .max_delay(Duration::from_millis(350))
                .use_jitter(false)
                .build(),
        )
        .expect("valid config");
        assert_eq!(strategy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(strategy.backoff_delay(2), Duration::from_millis(200));
        // Capped by max_delay.
        assert_eq!(strategy.backoff_delay(3), Duration::from_millis(350));

        let linear = RetryStrategy::from_config(
            RetryConfig::<u32, std::io::Error>::builder()
                .backoff(Backoff::Linear)
                .base_delay(base)
                .use_jitter(false)
                .build(),
        )
        .expect("valid config");
        assert_eq!(linear.backoff_delay(3), Duration::from_millis(300));

        let constant = RetryStrategy::from_config(
            RetryConfig::<u32, std::io::Error>::builder()
                .backoff(Backoff::Constant)
                .base_delay(base)
                .use_jitter(false)
                .build(),
        )
        .expect("valid config");
        assert_eq!(constant.backoff_delay(5), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_perturbation_is_bounded() {
        let strategy = RetryStrategy::from_config(
            RetryConfig::<u32, std::io::Error>::builder()
                .backoff(Backoff::Constant)
                .base_delay(Duration::from_millis(100))
                .use_jitter(true)
                .randomizer(Arc::new(FixedRandomizer(0.0)))
                .build(),
        )
        .expect("valid config");
        // factor = 0.75 at the low edge.
        assert_eq!(strategy.backoff_delay(1), Duration::from_millis(75));

        let high = RetryStrategy::from_config(
            RetryConfig::<u32, std::io::Error>::builder()
                .backoff(Backoff::Constant)
                .base_delay(Duration::from_millis(100))
                .use_jitter(true)
                .randomizer(Arc::new(FixedRandomizer(1.0)))
                .build(),
        )
        .expect("valid config");
        // factor = 1.25 at the high edge.
        assert_eq!(high.backoff_delay(1), Duration::from_millis(125));
    }

    #[test]
    fn test_config_validation() {
        let zero_retries =
            RetryConfig::<u32, std::io::Error>::builder().max_retries(0).build();
        assert!(zero_retries.validate().is_err());

        let inverted = RetryConfig::<u32, std::io::Error>::builder()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(1))
            .build();
        assert!(inverted.validate().is_err());

        assert!(RetryConfig::<u32, std::io::Error>::default().validate().is_ok());
    }
}
