//! Pipeline execution core
//!
//! A pipeline is an ordered chain of [`Strategy`] components executed as
//! nested middleware around the caller's operation: the outermost strategy
//! runs first, hands control inward through [`Next`], and observes the
//! [`Outcome`] on the way back out. Each strategy decides how often to
//! invoke `next` — retry loops, hedging races, most others call it exactly
//! once. A pipeline with no strategies is a transparent pass-through.
//!
//! The asynchronous path is the primitive; [`Pipeline::execute_sync`] drives
//! it to completion on a process-wide blocking runtime.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::context::{ExecutionMode, PropertyBag, ResilienceContext};
use crate::outcome::{ExecutionError, Outcome};
use crate::telemetry::TelemetrySink;

/// Owned view of the execution context handed to the caller's operation.
///
/// Attempts launched concurrently (hedging) each receive their own view with
/// a child cancellation token; property values are shared, not copied.
#[derive(Debug, Clone)]
pub struct OperationContext {
    operation_key: Option<String>,
    cancellation: CancellationToken,
    properties: PropertyBag,
    is_synchronous: bool,
}

impl OperationContext {
    fn from_context(ctx: &ResilienceContext) -> Self {
        Self {
            operation_key: ctx.operation_key().map(str::to_owned),
            cancellation: ctx.cancellation_token().clone(),
            properties: ctx.properties().clone(),
            is_synchronous: ctx.is_synchronous(),
        }
    }

    /// The optional operation label.
    pub fn operation_key(&self) -> Option<&str> {
        self.operation_key.as_deref()
    }

    /// Cancellation signal for this attempt. Long-running operations should
    /// observe it at their own suspension points.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Properties set on the execution context before the call.
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Whether the caller entered through the blocking surface.
    pub fn is_synchronous(&self) -> bool {
        self.is_synchronous
    }
}

/// Type-erased operation invoked at the innermost point of the chain.
pub type OperationFn<T, E> =
    dyn Fn(OperationContext) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// A single fault-handling behavior in a pipeline.
///
/// Implementations must be safe for concurrent use: one strategy instance
/// serves every in-flight call of its pipeline. Per-call state belongs on
/// the stack of `execute`, never in the strategy itself.
#[async_trait]
pub trait Strategy<T, E>: Send + Sync
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Short name used in events and diagnostics.
    fn name(&self) -> &'static str;

    /// Run the strategy around the rest of the chain.
    async fn execute(&self, ctx: &mut ResilienceContext, next: Next<'_, T, E>) -> Outcome<T, E>;

    /// Child components, for composite strategies. The builder walks these
    /// when checking for aliased instances in nested composites.
    fn subcomponents(&self) -> Vec<Arc<dyn Strategy<T, E>>> {
        Vec::new()
    }
}

/// Continuation over the remaining chain plus the caller's operation.
///
/// `Next` is a pair of borrows and is `Copy`, so a strategy can invoke it
/// any number of times (sequentially or concurrently).
pub struct Next<'a, T, E> {
    chain: &'a [Arc<dyn Strategy<T, E>>],
    operation: &'a OperationFn<T, E>,
}

impl<T, E> Clone for Next<'_, T, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, E> Copy for Next<'_, T, E> {}

impl<'a, T, E> Next<'a, T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Descend into the next-inner component, or invoke the operation if
    /// this is the innermost point.
    ///
    /// The cancellation token is checked before descending, and the
    /// operation itself races against it, so cancellation observed anywhere
    /// in the chain surfaces promptly as [`Outcome::cancelled`].
    pub async fn run(self, ctx: &mut ResilienceContext) -> Outcome<T, E> {
        let token = ctx.cancellation_token().clone();
        if token.is_cancelled() {
            return Outcome::cancelled();
        }
        match self.chain.split_first() {
            Some((strategy, rest)) => {
                let next = Next { chain: rest, operation: self.operation };
                strategy.execute(ctx, next).await
            }
            None => {
                let view = OperationContext::from_context(ctx);
                let operation = (self.operation)(view);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Outcome::cancelled(),
                    result = operation => Outcome::from_result(result),
                }
            }
        }
    }

    /// The same continuation bound to a replacement operation.
    ///
    /// Used by strategies that substitute the callback for an individual
    /// attempt (hedging's action generator); the remaining chain is
    /// unchanged.
    pub fn with_operation<'b>(self, operation: &'b OperationFn<T, E>) -> Next<'b, T, E>
    where
        'a: 'b,
    {
        Next { chain: self.chain, operation }
    }
}

impl<T, E> fmt::Debug for Next<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("remaining", &self.chain.len()).finish()
    }
}

struct PipelineInner<T, E> {
    name: Option<String>,
    chain: Vec<Arc<dyn Strategy<T, E>>>,
    telemetry: Arc<dyn TelemetrySink>,
}

/// An immutable, cheaply cloneable composition of strategies.
///
/// Built once by [`PipelineBuilder`](crate::builder::PipelineBuilder) and
/// reused concurrently by any number of independent calls; clones share the
/// same strategy instances and state.
pub struct Pipeline<T, E> {
    inner: Arc<PipelineInner<T, E>>,
}

impl<T, E> Clone for Pipeline<T, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

// Shared runtime backing the blocking execution surface. Two workers are
// enough: executions block the caller's thread, not these.
static SYNC_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("faultline-sync")
        .build()
        .expect("failed to build blocking-adapter runtime")
});

impl<T, E> Pipeline<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub(crate) fn from_parts(
        name: Option<String>,
        chain: Vec<Arc<dyn Strategy<T, E>>>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self { inner: Arc::new(PipelineInner { name, chain, telemetry }) }
    }

    /// The pipeline's configured name, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Names of the strategies in nesting order (first = outermost).
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.inner.chain.iter().map(|s| s.name()).collect()
    }

    pub(crate) fn chain(&self) -> &[Arc<dyn Strategy<T, E>>] {
        &self.inner.chain
    }

    async fn run_outcome<F, Fut>(
        &self,
        ctx: &mut ResilienceContext,
        mode: ExecutionMode,
        operation: F,
    ) -> Outcome<T, E>
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        ctx.initialize::<T>(mode);
        // A reused caller-owned context keeps its log; only forward what
        // this execution appended.
        let already_reported = ctx.events().len();
        let boxed =
            move |view: OperationContext| -> BoxFuture<'static, Result<T, E>> {
                Box::pin(operation(view))
            };
        let erased: &OperationFn<T, E> = &boxed;
        let next = Next { chain: &self.inner.chain, operation: erased };
        let outcome = next.run(ctx).await;
        for event in &ctx.events()[already_reported..] {
            self.inner.telemetry.record(self.name(), ctx.operation_key(), event);
        }
        outcome
    }

    /// Execute an operation, returning its outcome as data.
    pub async fn execute_outcome<F, Fut>(&self, operation: F) -> Outcome<T, E>
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut ctx = ResilienceContext::acquire();
        let outcome = self.run_outcome(&mut ctx, ExecutionMode::Asynchronous, operation).await;
        ResilienceContext::release(ctx);
        outcome
    }

    /// Execute an operation, re-raising any fault at the boundary.
    pub async fn execute<F, Fut>(&self, operation: F) -> Result<T, ExecutionError<E>>
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_outcome(operation).await.into_result()
    }

    /// Execute with a caller-owned context, returning the outcome.
    ///
    /// Use this to supply an external cancellation token or pre-seeded
    /// properties, or to inspect the event log after the call.
    pub async fn execute_outcome_with_context<F, Fut>(
        &self,
        ctx: &mut ResilienceContext,
        operation: F,
    ) -> Outcome<T, E>
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.run_outcome(ctx, ExecutionMode::Asynchronous, operation).await
    }

    /// Execute with a caller-owned context, re-raising any fault.
    pub async fn execute_with_context<F, Fut>(
        &self,
        ctx: &mut ResilienceContext,
        operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_outcome_with_context(ctx, operation).await.into_result()
    }

    /// Execute with an explicit state value instead of a capturing closure.
    ///
    /// The state is cloned per attempt, so hedged attempts never share it
    /// mutably. For `Arc`-wrapped state the clone is a pointer bump.
    pub async fn execute_outcome_with_state<S, F, Fut>(
        &self,
        state: S,
        operation: F,
    ) -> Outcome<T, E>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(OperationContext, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_outcome(move |view| operation(view, state.clone())).await
    }

    /// Execute with an explicit state value, re-raising any fault.
    pub async fn execute_with_state<S, F, Fut>(
        &self,
        state: S,
        operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(OperationContext, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_outcome_with_state(state, operation).await.into_result()
    }

    /// Blocking variant of [`Pipeline::execute_outcome`].
    ///
    /// Drives the asynchronous execution to completion on a shared runtime.
    /// Must not be called from within an async runtime; doing so panics in
    /// `tokio`.
    pub fn execute_sync_outcome<F, Fut>(&self, operation: F) -> Outcome<T, E>
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut ctx = ResilienceContext::acquire();
        let outcome = SYNC_RUNTIME
            .block_on(self.run_outcome(&mut ctx, ExecutionMode::Synchronous, operation));
        ResilienceContext::release(ctx);
        outcome
    }

    /// Blocking variant of [`Pipeline::execute`].
    pub fn execute_sync<F, Fut>(&self, operation: F) -> Result<T, ExecutionError<E>>
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_sync_outcome(operation).into_result()
    }
}

impl<T, E> fmt::Debug for Pipeline<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("strategies", &self.strategy_names())
            .finish()
    }
}
