//! Hedging strategy
//!
//! Launches the primary attempt, then additional concurrent attempts each
//! time the hedging delay elapses without an accepted outcome, up to the
//! configured maximum. The first attempt whose outcome is not a handled
//! failure wins by completion order, regardless of start order; the losers
//! are cancelled through their child tokens and their results discarded. If
//! every attempt fails, the last-completed outcome is returned.
//!
//! Each attempt runs on a forked context with its own child cancellation
//! token, so attempts never share mutable state through the engine;
//! cancelling the overall call propagates to every fork. Hedged attempts
//! normally re-run the original callback, but an action generator can
//! substitute a different one per attempt (e.g. hedge against a secondary
//! endpoint).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::builder::ConfigError;
use crate::context::ResilienceContext;
use crate::outcome::Outcome;
use crate::pipeline::{Next, OperationFn, Strategy};
use crate::predicate::HandlePredicate;
use crate::telemetry::{event_names, ResilienceEvent};

const STRATEGY_NAME: &str = "hedging";

type HedgingDelayGenerator = Arc<dyn Fn(u32) -> Duration + Send + Sync>;
type HedgingActionGenerator<T, E> =
    Arc<dyn Fn(u32) -> Option<Arc<OperationFn<T, E>>> + Send + Sync>;
type HedgingCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Hedging options. Construct with [`HedgingConfig::builder`].
pub struct HedgingConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Which outcomes keep the race going (handled = not accepted).
    pub predicate: HandlePredicate<T, E>,
    /// Additional concurrent attempts beyond the primary.
    pub max_hedged_attempts: u32,
    /// Wait between consecutive attempt launches.
    pub hedging_delay: Duration,
    /// Optional per-attempt delay override (argument is the attempt number
    /// about to be launched, 1-based).
    pub delay_generator: Option<HedgingDelayGenerator>,
    /// Optional replacement callback for hedged attempts, keyed by the
    /// attempt number (1-based). A hedge against an alternate endpoint, for
    /// example. Returning `None` runs the original callback; the primary
    /// always does.
    pub action_generator: Option<HedgingActionGenerator<T, E>>,
    /// Invoked when a hedged attempt launches, with its attempt number.
    pub on_hedging: Option<HedgingCallback>,
}

impl<T, E> HedgingConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> HedgingConfigBuilder<T, E> {
        HedgingConfigBuilder::default()
    }

    /// Structural validation, run at pipeline build time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_hedged_attempts == 0 {
            return Err(ConfigError::invalid(
                STRATEGY_NAME,
                "max_hedged_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

impl<T, E> Default for HedgingConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            predicate: HandlePredicate::failures(),
            max_hedged_attempts: 1,
            hedging_delay: Duration::from_secs(2),
            delay_generator: None,
            action_generator: None,
            on_hedging: None,
        }
    }
}

/// Fluent builder for [`HedgingConfig`].
pub struct HedgingConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: HedgingConfig<T, E>,
}

impl<T, E> Default for HedgingConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self { config: HedgingConfig::default() }
    }
}

impl<T, E> HedgingConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn predicate(mut self, predicate: HandlePredicate<T, E>) -> Self {
        self.config.predicate = predicate;
        self
    }

    pub fn max_hedged_attempts(mut self, attempts: u32) -> Self {
        self.config.max_hedged_attempts = attempts;
        self
    }

    pub fn hedging_delay(mut self, delay: Duration) -> Self {
        self.config.hedging_delay = delay;
        self
    }

    pub fn delay_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.config.delay_generator = Some(Arc::new(generator));
        self
    }

    /// Substitute the callback for individual hedged attempts.
    pub fn action_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(u32) -> Option<Arc<OperationFn<T, E>>> + Send + Sync + 'static,
    {
        self.config.action_generator = Some(Arc::new(generator));
        self
    }

    pub fn on_hedging<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.config.on_hedging = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> HedgingConfig<T, E> {
        self.config
    }
}

/// The hedging pipeline component.
pub struct HedgingStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: HedgingConfig<T, E>,
}

impl<T, E> HedgingStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn from_config(config: HedgingConfig<T, E>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Delay before launching the given attempt number.
    fn delay_before(&self, attempt: u32) -> Duration {
        match &self.config.delay_generator {
            Some(generator) => generator(attempt),
            None => self.config.hedging_delay,
        }
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for HedgingStrategy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    async fn execute(&self, ctx: &mut ResilienceContext, next: Next<'_, T, E>) -> Outcome<T, E> {
        let token = ctx.cancellation_token().clone();
        let total_allowed = self.config.max_hedged_attempts + 1;

        // Every attempt owns its forked context and hands it back with the
        // outcome so the attempt's events can be folded into the call. A
        // hedged attempt may carry a replacement callback from the action
        // generator; the primary always runs the original.
        let run_attempt = move |fork: ResilienceContext,
                                attempt: u32,
                                action: Option<Arc<OperationFn<T, E>>>| async move {
            let mut fork = fork;
            let outcome = match &action {
                Some(operation) => next.with_operation(operation.as_ref()).run(&mut fork).await,
                None => next.run(&mut fork).await,
            };
            (attempt, outcome, fork)
        };
        let action_for = |attempt: u32| {
            self.config.action_generator.as_ref().and_then(|generator| generator(attempt))
        };

        let mut attempts = FuturesUnordered::new();
        let mut fork_tokens = Vec::with_capacity(total_allowed as usize);
        let mut launched: u32 = 0;

        // Primary attempt.
        let fork = ctx.fork_for_attempt();
        fork_tokens.push(fork.cancellation_token().clone());
        attempts.push(run_attempt(fork, launched, None));
        launched += 1;

        let mut next_launch = Box::pin(tokio::time::sleep(self.delay_before(launched)));

        loop {
            let more_allowed = launched < total_allowed;
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    for fork_token in &fork_tokens {
                        fork_token.cancel();
                    }
                    return Outcome::cancelled();
                }
                Some((attempt, outcome, fork)) = attempts.next() => {
                    ctx.absorb_attempt(fork);
                    let accepted =
                        !outcome.is_cancelled() && !self.config.predicate.is_handled(&outcome);
                    if accepted {
                        debug!(
                            strategy = STRATEGY_NAME,
                            attempt,
                            "attempt accepted, cancelling the rest"
                        );
                        for fork_token in &fork_tokens {
                            fork_token.cancel();
                        }
                        return outcome;
                    }
                    if attempts.is_empty() {
                        if !more_allowed {
                            // Every attempt failed: last-completed outcome.
                            return outcome;
                        }
                        // Nothing left in flight; no point waiting out the
                        // delay before the next launch.
                        let fork = ctx.fork_for_attempt();
                        fork_tokens.push(fork.cancellation_token().clone());
                        attempts.push(run_attempt(fork, launched, action_for(launched)));
                        self.note_hedge(ctx, launched);
                        launched += 1;
                        if launched < total_allowed {
                            next_launch =
                                Box::pin(tokio::time::sleep(self.delay_before(launched)));
                        }
                    }
                }
                _ = next_launch.as_mut(), if more_allowed => {
                    let fork = ctx.fork_for_attempt();
                    fork_tokens.push(fork.cancellation_token().clone());
                    attempts.push(run_attempt(fork, launched, action_for(launched)));
                    self.note_hedge(ctx, launched);
                    launched += 1;
                    if launched < total_allowed {
                        next_launch = Box::pin(tokio::time::sleep(self.delay_before(launched)));
                    }
                }
            }
        }
    }
}

impl<T, E> HedgingStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn note_hedge(&self, ctx: &mut ResilienceContext, attempt: u32) {
        debug!(strategy = STRATEGY_NAME, attempt, "launching hedged attempt");
        ctx.record_event(
            ResilienceEvent::new(event_names::ON_HEDGE, STRATEGY_NAME).with_attempt(attempt),
        );
        if let Some(callback) = &self.config.on_hedging {
            callback(attempt);
        }
    }
}
