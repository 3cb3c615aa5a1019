//! Fallback strategy
//!
//! Substitutes a replacement outcome when the inner chain produces a
//! handled one. Unhandled outcomes and cancellations pass through
//! untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::builder::ConfigError;
use crate::context::ResilienceContext;
use crate::outcome::Outcome;
use crate::pipeline::{Next, Strategy};
use crate::predicate::HandlePredicate;
use crate::telemetry::{event_names, ResilienceEvent};

const STRATEGY_NAME: &str = "fallback";

type FallbackAction<T, E> = Arc<dyn Fn(&Outcome<T, E>) -> Outcome<T, E> + Send + Sync>;
type FallbackCallback = Arc<dyn Fn() + Send + Sync>;

/// Fallback options. The substitution action is mandatory, so construction
/// starts from [`FallbackConfig::builder`] with the action.
pub struct FallbackConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Which outcomes get substituted.
    pub predicate: HandlePredicate<T, E>,
    /// Produces the replacement outcome; receives the handled one.
    pub action: FallbackAction<T, E>,
    /// Invoked whenever a substitution happens.
    pub on_fallback: Option<FallbackCallback>,
}

impl<T, E> FallbackConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder<F>(action: F) -> FallbackConfigBuilder<T, E>
    where
        F: Fn(&Outcome<T, E>) -> Outcome<T, E> + Send + Sync + 'static,
    {
        FallbackConfigBuilder {
            config: Self {
                predicate: HandlePredicate::failures(),
                action: Arc::new(action),
                on_fallback: None,
            },
        }
    }

    /// Shorthand for substituting a fixed value.
    pub fn with_value(value: T) -> FallbackConfigBuilder<T, E>
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::builder(move |_outcome| Outcome::Success(value.clone()))
    }

    /// Structural validation, run at pipeline build time. The action is
    /// enforced by construction, so there is nothing left to check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Fluent builder for [`FallbackConfig`].
pub struct FallbackConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: FallbackConfig<T, E>,
}

impl<T, E> FallbackConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn predicate(mut self, predicate: HandlePredicate<T, E>) -> Self {
        self.config.predicate = predicate;
        self
    }

    pub fn on_fallback<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_fallback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> FallbackConfig<T, E> {
        self.config
    }
}

/// The fallback pipeline component.
pub struct FallbackStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: FallbackConfig<T, E>,
}

impl<T, E> FallbackStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn from_config(config: FallbackConfig<T, E>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for FallbackStrategy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    async fn execute(&self, ctx: &mut ResilienceContext, next: Next<'_, T, E>) -> Outcome<T, E> {
        let outcome = next.run(ctx).await;
        if outcome.is_cancelled() || !self.config.predicate.is_handled(&outcome) {
            return outcome;
        }
        debug!(strategy = STRATEGY_NAME, "substituting fallback outcome");
        ctx.record_event(ResilienceEvent::new(event_names::ON_FALLBACK, STRATEGY_NAME));
        if let Some(callback) = &self.config.on_fallback {
            callback();
        }
        (self.config.action)(&outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::telemetry::NullSink;

    fn fallback_pipeline(
        config: FallbackConfig<u32, std::io::Error>,
    ) -> Pipeline<u32, std::io::Error> {
        let strategy = FallbackStrategy::from_config(config).expect("valid config");
        Pipeline::from_parts(None, vec![Arc::new(strategy) as _], Arc::new(NullSink))
    }

    #[tokio::test]
    async fn test_substitutes_on_handled_failure() {
        let pipeline = fallback_pipeline(FallbackConfig::with_value(42).build());
        let result =
            pipeline.execute(|_view| async { Err(std::io::Error::other("boom")) }).await;
        assert!(matches!(result, Ok(42)));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let pipeline = fallback_pipeline(FallbackConfig::with_value(42).build());
        let result = pipeline.execute(|_view| async { Ok(7) }).await;
        assert!(matches!(result, Ok(7)));
    }

    #[tokio::test]
    async fn test_unhandled_fault_passes_through() {
        let pipeline = fallback_pipeline(
            FallbackConfig::with_value(42).predicate(HandlePredicate::never()).build(),
        );
        let outcome =
            pipeline.execute_outcome(|_view| async { Err(std::io::Error::other("boom")) }).await;
        assert!(outcome.is_failure());
    }

    #[tokio::test]
    async fn test_action_sees_handled_outcome() {
        let pipeline = fallback_pipeline(
            FallbackConfig::builder(|outcome: &Outcome<u32, std::io::Error>| {
                // Substitute based on what failed.
                match outcome.error() {
                    Some(e) if e.to_string().contains("boom") => Outcome::Success(1),
                    _ => Outcome::Success(2),
                }
            })
            .build(),
        );
        let result =
            pipeline.execute(|_view| async { Err(std::io::Error::other("boom")) }).await;
        assert!(matches!(result, Ok(1)));
    }

    #[tokio::test]
    async fn test_cancellation_is_never_substituted() {
        let pipeline = fallback_pipeline(FallbackConfig::with_value(42).build());
        let mut ctx = ResilienceContext::new();
        ctx.cancellation_token().cancel();

        let outcome = pipeline
            .execute_outcome_with_context(&mut ctx, |_view| async { Ok(0) })
            .await;
        assert!(outcome.is_cancelled());
    }
}
