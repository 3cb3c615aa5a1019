//! Per-execution resilience context and the shared context pool
//!
//! A [`ResilienceContext`] travels from the outermost strategy to the
//! caller's operation and back. It carries the cancellation signal, the
//! sync/async and void/typed markers, a typed property bag, and the
//! append-only event log. Contexts are pooled between calls; the pool is an
//! optimization, not a correctness requirement — callers may also construct
//! and drop contexts freely.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::telemetry::ResilienceEvent;

/// Whether the execution entered through the blocking or the async surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Caller is blocking on the execution.
    Synchronous,
    /// Caller awaits the execution.
    #[default]
    Asynchronous,
}

/// Typed key for the context property bag.
///
/// Keys pair a namespace string with the value type, so two components
/// using the same name but different types cannot collide.
pub struct PropertyKey<V> {
    name: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> PropertyKey<V> {
    /// Create a key with the given namespaced name.
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    /// The key's name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<V> fmt::Debug for PropertyKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyKey").field("name", &self.name).finish()
    }
}

/// Typed key→value bag. Values are stored behind `Arc`, so cloning the bag
/// (for hedged attempts) shares the values rather than copying them.
#[derive(Default, Clone)]
pub struct PropertyBag {
    entries: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl PropertyBag {
    /// Store a value under a typed key, replacing any previous value.
    pub fn set<V: Send + Sync + 'static>(&mut self, key: &PropertyKey<V>, value: V) {
        self.entries.insert(key.name, Arc::new(value));
    }

    /// Fetch the value for a typed key, if present and of the right type.
    pub fn get<V: Send + Sync + 'static>(&self, key: &PropertyKey<V>) -> Option<Arc<V>> {
        let entry = self.entries.get(key.name)?;
        Arc::clone(entry).downcast::<V>().ok()
    }

    /// Whether the bag holds a value of the key's type under the key's name.
    pub fn contains<V: Send + Sync + 'static>(&self, key: &PropertyKey<V>) -> bool {
        self.entries.get(key.name).is_some_and(|entry| entry.as_ref().type_id() == TypeId::of::<V>())
    }

    /// Number of stored properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all properties.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBag").field("len", &self.entries.len()).finish()
    }
}

/// Per-execution mutable state threaded through a pipeline.
#[derive(Debug, Clone)]
pub struct ResilienceContext {
    operation_key: Option<String>,
    cancellation: CancellationToken,
    mode: ExecutionMode,
    is_void: bool,
    result_type: &'static str,
    initialized: bool,
    properties: PropertyBag,
    events: Vec<ResilienceEvent>,
}

impl ResilienceContext {
    /// Create an uninitialized context.
    pub fn new() -> Self {
        Self {
            operation_key: None,
            cancellation: CancellationToken::new(),
            mode: ExecutionMode::Asynchronous,
            is_void: false,
            result_type: "",
            initialized: false,
            properties: PropertyBag::default(),
            events: Vec::new(),
        }
    }

    /// Acquire a context from the shared process-wide pool.
    pub fn acquire() -> Self {
        SHARED_POOL.acquire()
    }

    /// Reset a context and return it to the shared pool.
    ///
    /// Dropping a context instead of returning it is always safe.
    pub fn release(context: Self) {
        SHARED_POOL.release(context);
    }

    /// Set the optional operation label.
    #[must_use]
    pub fn with_operation_key(mut self, key: impl Into<String>) -> Self {
        self.operation_key = Some(key.into());
        self
    }

    /// The optional operation label.
    pub fn operation_key(&self) -> Option<&str> {
        self.operation_key.as_deref()
    }

    /// Mark the context initialized for an execution producing `T`.
    pub(crate) fn initialize<T: 'static>(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.is_void = TypeId::of::<T>() == TypeId::of::<()>();
        self.result_type = type_name::<T>();
        self.initialized = true;
    }

    /// Whether the context has been initialized for an execution.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the execution entered through the blocking surface.
    pub fn is_synchronous(&self) -> bool {
        self.mode == ExecutionMode::Synchronous
    }

    /// Whether the execution produces no meaningful value.
    pub fn is_void(&self) -> bool {
        self.is_void
    }

    /// Type name of the execution's result type, for diagnostics.
    pub fn result_type(&self) -> &'static str {
        self.result_type
    }

    /// The cancellation signal for this execution.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Replace the cancellation signal (used by caller-supplied tokens and
    /// by strategies installing a child scope).
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancellation = token;
    }

    /// Read-only access to the property bag.
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Mutable access to the property bag.
    pub fn properties_mut(&mut self) -> &mut PropertyBag {
        &mut self.properties
    }

    /// The append-only event log recorded so far.
    pub fn events(&self) -> &[ResilienceEvent] {
        &self.events
    }

    /// Append an event to the log.
    pub fn record_event(&mut self, event: ResilienceEvent) {
        self.events.push(event);
    }

    /// Clone the context for an independent concurrent attempt.
    ///
    /// The fork gets a child cancellation token: cancelling the original
    /// cancels every fork, while a fork can be cancelled alone. Property
    /// values are shared (`Arc`), never mutably aliased by the engine.
    pub fn fork_for_attempt(&self) -> Self {
        let mut fork = self.clone();
        fork.cancellation = self.cancellation.child_token();
        fork.events = Vec::new();
        fork
    }

    /// Fold a finished attempt's observations back into this context.
    pub fn absorb_attempt(&mut self, attempt: Self) {
        self.events.extend(attempt.events);
    }

    /// Reset every field to its default so the context can be reused.
    pub fn reset(&mut self) {
        self.operation_key = None;
        self.cancellation = CancellationToken::new();
        self.mode = ExecutionMode::Asynchronous;
        self.is_void = false;
        self.result_type = "";
        self.initialized = false;
        self.properties.clear();
        self.events.clear();
    }
}

impl Default for ResilienceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded, thread-safe free list of reusable contexts.
///
/// `acquire` falls back to allocation when the pool is empty and never
/// blocks; `release` resets the context before making it available and
/// drops it if the pool is at capacity.
pub struct ContextPool {
    slots: Mutex<Vec<ResilienceContext>>,
    capacity: usize,
}

impl ContextPool {
    /// Create a pool holding at most `capacity` idle contexts.
    pub fn new(capacity: usize) -> Self {
        Self { slots: Mutex::new(Vec::with_capacity(capacity.min(16))), capacity }
    }

    /// Take a context from the pool, or allocate a fresh one.
    pub fn acquire(&self) -> ResilienceContext {
        self.slots.lock().pop().unwrap_or_default()
    }

    /// Reset a context and return it to the pool (dropped if full).
    pub fn release(&self, mut context: ResilienceContext) {
        context.reset();
        let mut slots = self.slots.lock();
        if slots.len() < self.capacity {
            slots.push(context);
        }
    }

    /// Number of idle contexts currently pooled.
    pub fn idle(&self) -> usize {
        self.slots.lock().len()
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}

const SHARED_POOL_CAPACITY: usize = 64;

static SHARED_POOL: Lazy<ContextPool> = Lazy::new(|| ContextPool::new(SHARED_POOL_CAPACITY));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{event_names, ResilienceEvent};

    static RETRY_HINT: PropertyKey<u32> = PropertyKey::new("faultline.retry_hint");
    static RETRY_HINT_TEXT: PropertyKey<String> = PropertyKey::new("faultline.retry_hint");

    #[test]
    fn test_property_bag_typed_access() {
        let mut bag = PropertyBag::default();
        bag.set(&RETRY_HINT, 3);

        assert!(bag.contains(&RETRY_HINT));
        assert_eq!(bag.get(&RETRY_HINT).as_deref(), Some(&3));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn test_property_bag_type_mismatch_is_none() {
        let mut bag = PropertyBag::default();
        bag.set(&RETRY_HINT, 3);

        // Same name, different value type: typed keys do not alias.
        assert!(bag.get(&RETRY_HINT_TEXT).is_none());
        assert!(!bag.contains(&RETRY_HINT_TEXT));
    }

    #[test]
    fn test_context_initialize_markers() {
        let mut ctx = ResilienceContext::new();
        assert!(!ctx.is_initialized());

        ctx.initialize::<()>(ExecutionMode::Synchronous);
        assert!(ctx.is_initialized());
        assert!(ctx.is_synchronous());
        assert!(ctx.is_void());

        let mut ctx = ResilienceContext::new();
        ctx.initialize::<u64>(ExecutionMode::Asynchronous);
        assert!(!ctx.is_synchronous());
        assert!(!ctx.is_void());
        assert!(ctx.result_type().contains("u64"));
    }

    #[test]
    fn test_fork_gets_child_token() {
        let ctx = ResilienceContext::new();
        let fork = ctx.fork_for_attempt();

        // Cancelling the fork does not cancel the parent.
        fork.cancellation_token().cancel();
        assert!(!ctx.cancellation_token().is_cancelled());

        // Cancelling the parent cancels a new fork.
        let fork2 = ctx.fork_for_attempt();
        ctx.cancellation_token().cancel();
        assert!(fork2.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_absorb_attempt_merges_events() {
        let mut ctx = ResilienceContext::new();
        let mut fork = ctx.fork_for_attempt();
        fork.record_event(ResilienceEvent::new(event_names::ON_HEDGE, "hedging"));

        ctx.absorb_attempt(fork);
        assert_eq!(ctx.events().len(), 1);
    }

    #[test]
    fn test_pool_release_resets_context() {
        let pool = ContextPool::new(4);

        let mut ctx = pool.acquire();
        ctx.initialize::<i32>(ExecutionMode::Synchronous);
        ctx.properties_mut().set(&RETRY_HINT, 9);
        ctx.record_event(ResilienceEvent::new(event_names::ON_RETRY, "retry"));
        pool.release(ctx);

        let reused = pool.acquire();
        assert!(!reused.is_initialized());
        assert!(reused.properties().is_empty());
        assert!(reused.events().is_empty());
        assert!(reused.operation_key().is_none());
    }

    #[test]
    fn test_pool_bounded_and_falls_back_to_allocation() {
        let pool = ContextPool::new(1);
        pool.release(ResilienceContext::new());
        pool.release(ResilienceContext::new());
        assert_eq!(pool.idle(), 1);

        // Draining past the idle count allocates instead of blocking.
        let _a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_shared_pool_roundtrip() {
        let mut ctx = ResilienceContext::acquire();
        ctx.initialize::<i32>(ExecutionMode::Asynchronous);
        ResilienceContext::release(ctx);

        let reused = ResilienceContext::acquire();
        assert!(!reused.is_initialized());
    }
}
