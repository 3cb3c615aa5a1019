//! Circuit breaker strategy
//!
//! Tracks outcome health over a sampling window and stops calling a faulting
//! dependency once the failure ratio trips. States: Closed (normal
//! operation), Open (calls rejected until the break duration elapses),
//! HalfOpen (exactly one trial call probes recovery), Isolated (manual
//! override rejecting everything).
//!
//! Transitions are lazy: Open advances to HalfOpen on the next admitted
//! call, never via a background timer. One strategy instance serves all
//! concurrent calls of its pipeline; the window lock lives in
//! [`HealthMetrics`](crate::health), the state lock here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::health::{HealthMetrics, HealthSnapshot};
use crate::outcome::{ExecutionError, Outcome};
use crate::pipeline::{Next, Strategy};
use crate::predicate::HandlePredicate;
use crate::telemetry::{event_names, ResilienceEvent};
use crate::builder::ConfigError;
use crate::context::ResilienceContext;

const STRATEGY_NAME: &str = "circuit_breaker";

/// Externally observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through; outcomes feed the health window.
    Closed,
    /// Calls are rejected until the break duration elapses.
    Open,
    /// One trial call probes whether the dependency recovered.
    HalfOpen,
    /// Manual override; calls are rejected until manually closed.
    Isolated,
}

/// Window aggregate handed to a break-duration generator when the circuit
/// opens.
#[derive(Debug, Clone, Copy)]
pub struct BreakSignal {
    /// Failures observed in the current window.
    pub failure_count: u64,
    /// Failure ratio over the current window.
    pub failure_ratio: f64,
}

/// Point-in-time view of a breaker for observability.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerSnapshot {
    /// Current (lazily computed) state.
    pub state: CircuitState,
    /// Calls observed in the current window.
    pub total_calls: u64,
    /// Failures observed in the current window.
    pub failed_calls: u64,
    /// Failure ratio over the current window.
    pub failure_ratio: f64,
}

type BreakDurationGenerator = Arc<dyn Fn(BreakSignal) -> Duration + Send + Sync>;
type OpenedCallback = Arc<dyn Fn(Duration) + Send + Sync>;
type StateCallback = Arc<dyn Fn() + Send + Sync>;

/// Circuit breaker options. Construct with
/// [`CircuitBreakerConfig::builder`]; defaults follow common client-side
/// breaker practice (10% failure ratio over 30 s, minimum 100 calls, 5 s
/// break).
pub struct CircuitBreakerConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Which outcomes count as failures toward the window.
    pub predicate: HandlePredicate<T, E>,
    /// Failure ratio in `(0, 1]` that trips the circuit.
    pub failure_ratio: f64,
    /// Window over which outcomes are aggregated.
    pub sampling_duration: Duration,
    /// Minimum calls in the window before the ratio is consulted.
    pub minimum_throughput: u32,
    /// How long the circuit stays Open after tripping.
    pub break_duration: Duration,
    /// Optional generator computing a break duration from the window.
    pub break_duration_generator: Option<BreakDurationGenerator>,
    /// Clock used for window rotation and break timing.
    pub clock: Arc<dyn Clock>,
    /// Read-only state handle to bind at build.
    pub state_provider: Option<StateProvider>,
    /// Manual isolate/close handle to bind at build.
    pub manual_control: Option<ManualControl>,
    /// Invoked when the circuit opens, with the chosen break duration.
    pub on_opened: Option<OpenedCallback>,
    /// Invoked when the circuit closes.
    pub on_closed: Option<StateCallback>,
    /// Invoked when the circuit half-opens.
    pub on_half_opened: Option<StateCallback>,
}

impl<T, E> CircuitBreakerConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Start building a config from defaults.
    pub fn builder() -> CircuitBreakerConfigBuilder<T, E> {
        CircuitBreakerConfigBuilder::default()
    }

    /// Structural validation, run at pipeline build time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                STRATEGY_NAME,
                "failure_ratio must be in (0, 1]",
            ));
        }
        if self.sampling_duration.is_zero() {
            return Err(ConfigError::invalid(
                STRATEGY_NAME,
                "sampling_duration must be positive",
            ));
        }
        if self.minimum_throughput < 2 {
            return Err(ConfigError::invalid(
                STRATEGY_NAME,
                "minimum_throughput must be at least 2",
            ));
        }
        if self.break_duration.is_zero() {
            return Err(ConfigError::invalid(
                STRATEGY_NAME,
                "break_duration must be positive",
            ));
        }
        Ok(())
    }
}

impl<T, E> Default for CircuitBreakerConfig<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            predicate: HandlePredicate::failures(),
            failure_ratio: 0.1,
            sampling_duration: Duration::from_secs(30),
            minimum_throughput: 100,
            break_duration: Duration::from_secs(5),
            break_duration_generator: None,
            clock: Arc::new(SystemClock),
            state_provider: None,
            manual_control: None,
            on_opened: None,
            on_closed: None,
            on_half_opened: None,
        }
    }
}

/// Fluent builder for [`CircuitBreakerConfig`].
pub struct CircuitBreakerConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    config: CircuitBreakerConfig<T, E>,
}

impl<T, E> Default for CircuitBreakerConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }
}

impl<T, E> CircuitBreakerConfigBuilder<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn predicate(mut self, predicate: HandlePredicate<T, E>) -> Self {
        self.config.predicate = predicate;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.config.failure_ratio = ratio;
        self
    }

    pub fn sampling_duration(mut self, duration: Duration) -> Self {
        self.config.sampling_duration = duration;
        self
    }

    pub fn minimum_throughput(mut self, calls: u32) -> Self {
        self.config.minimum_throughput = calls;
        self
    }

    pub fn break_duration(mut self, duration: Duration) -> Self {
        self.config.break_duration = duration;
        self
    }

    /// Compute the break duration per trip from the current window, e.g.
    /// to back off harder under sustained failure.
    pub fn break_duration_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(BreakSignal) -> Duration + Send + Sync + 'static,
    {
        self.config.break_duration_generator = Some(Arc::new(generator));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.config.clock = clock;
        self
    }

    pub fn state_provider(mut self, provider: StateProvider) -> Self {
        self.config.state_provider = Some(provider);
        self
    }

    pub fn manual_control(mut self, control: ManualControl) -> Self {
        self.config.manual_control = Some(control);
        self
    }

    pub fn on_opened<F>(mut self, callback: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.config.on_opened = Some(Arc::new(callback));
        self
    }

    pub fn on_closed<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_closed = Some(Arc::new(callback));
        self
    }

    pub fn on_half_opened<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_half_opened = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> CircuitBreakerConfig<T, E> {
        self.config
    }
}

enum StateInner {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
    Isolated,
}

enum Admission {
    Allowed,
    Trial { half_opened: bool },
    RejectedOpen,
    RejectedIsolated,
}

enum Transition {
    Opened(Duration),
    Closed,
}

/// State machine plus health window, shared by the strategy and any bound
/// observation handles.
struct BreakerCore {
    state: Mutex<StateInner>,
    metrics: HealthMetrics,
    clock: Arc<dyn Clock>,
    failure_ratio: f64,
    minimum_throughput: u32,
    break_duration: Duration,
    break_duration_generator: Option<BreakDurationGenerator>,
    on_opened: Option<OpenedCallback>,
    on_closed: Option<StateCallback>,
    on_half_opened: Option<StateCallback>,
}

impl BreakerCore {
    fn compute_break(&self, snapshot: HealthSnapshot) -> Duration {
        match &self.break_duration_generator {
            Some(generator) => generator(BreakSignal {
                failure_count: snapshot.failures,
                failure_ratio: snapshot.failure_ratio(),
            }),
            None => self.break_duration,
        }
    }

    /// Decide whether a call may proceed, lazily advancing Open→HalfOpen.
    fn admit(&self) -> Admission {
        let now = self.clock.now();
        let half_opened;
        {
            let mut state = self.state.lock();
            match &mut *state {
                StateInner::Closed => return Admission::Allowed,
                StateInner::Isolated => return Admission::RejectedIsolated,
                StateInner::Open { until } => {
                    if now < *until {
                        return Admission::RejectedOpen;
                    }
                    *state = StateInner::HalfOpen { trial_in_flight: true };
                    half_opened = true;
                }
                StateInner::HalfOpen { trial_in_flight } => {
                    if *trial_in_flight {
                        return Admission::RejectedOpen;
                    }
                    *trial_in_flight = true;
                    half_opened = false;
                }
            }
        }
        if half_opened {
            info!(strategy = STRATEGY_NAME, "circuit half-opened, admitting trial call");
            if let Some(callback) = &self.on_half_opened {
                callback();
            }
        }
        Admission::Trial { half_opened }
    }

    /// Record a non-trial outcome; returns the transition it caused.
    fn record(&self, failure: bool) -> Option<Transition> {
        if failure {
            self.metrics.record_failure();
        } else {
            self.metrics.record_success();
            return None;
        }
        let snapshot = self.metrics.snapshot();
        if snapshot.total < u64::from(self.minimum_throughput)
            || snapshot.failure_ratio() < self.failure_ratio
        {
            return None;
        }
        let duration = self.compute_break(snapshot);
        {
            let mut state = self.state.lock();
            // A concurrent call or manual override may have moved the state
            // already; only trip from Closed.
            if !matches!(*state, StateInner::Closed) {
                return None;
            }
            *state = StateInner::Open { until: self.clock.now() + duration };
        }
        warn!(
            strategy = STRATEGY_NAME,
            failures = snapshot.failures,
            total = snapshot.total,
            break_ms = duration.as_millis() as u64,
            "circuit opened"
        );
        if let Some(callback) = &self.on_opened {
            callback(duration);
        }
        Some(Transition::Opened(duration))
    }

    /// Settle the HalfOpen trial from its outcome.
    fn finish_trial(&self, failure: bool) -> Option<Transition> {
        if failure {
            let snapshot = self.metrics.snapshot();
            let duration = self.compute_break(snapshot);
            {
                let mut state = self.state.lock();
                if !matches!(*state, StateInner::HalfOpen { .. }) {
                    return None;
                }
                *state = StateInner::Open { until: self.clock.now() + duration };
            }
            warn!(
                strategy = STRATEGY_NAME,
                break_ms = duration.as_millis() as u64,
                "trial call failed, circuit re-opened"
            );
            if let Some(callback) = &self.on_opened {
                callback(duration);
            }
            Some(Transition::Opened(duration))
        } else {
            {
                let mut state = self.state.lock();
                if !matches!(*state, StateInner::HalfOpen { .. }) {
                    return None;
                }
                *state = StateInner::Closed;
            }
            self.metrics.reset();
            info!(strategy = STRATEGY_NAME, "trial call succeeded, circuit closed");
            if let Some(callback) = &self.on_closed {
                callback();
            }
            Some(Transition::Closed)
        }
    }

    /// Release the trial slot without recording an outcome (cancelled
    /// trial).
    fn abandon_trial(&self) {
        let mut state = self.state.lock();
        if let StateInner::HalfOpen { trial_in_flight } = &mut *state {
            *trial_in_flight = false;
        }
    }

    fn isolate(&self) {
        *self.state.lock() = StateInner::Isolated;
        warn!(strategy = STRATEGY_NAME, "circuit manually isolated");
    }

    fn close(&self) {
        *self.state.lock() = StateInner::Closed;
        self.metrics.reset();
        info!(strategy = STRATEGY_NAME, "circuit manually closed");
        if let Some(callback) = &self.on_closed {
            callback();
        }
    }

    /// Current state, with elapsed breaks reported as HalfOpen. Read-only:
    /// observation never mutates the machine or fires callbacks.
    fn current_state(&self) -> CircuitState {
        let now = self.clock.now();
        match &*self.state.lock() {
            StateInner::Closed => CircuitState::Closed,
            StateInner::Isolated => CircuitState::Isolated,
            StateInner::HalfOpen { .. } => CircuitState::HalfOpen,
            StateInner::Open { until } => {
                if now >= *until {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }

    fn snapshot(&self) -> CircuitBreakerSnapshot {
        let window = self.metrics.snapshot();
        CircuitBreakerSnapshot {
            state: self.current_state(),
            total_calls: window.total,
            failed_calls: window.failures,
            failure_ratio: window.failure_ratio(),
        }
    }
}

/// Read-only state handle, bound to one breaker at pipeline build.
#[derive(Clone, Default)]
pub struct StateProvider {
    core: Arc<OnceCell<Arc<BreakerCore>>>,
}

impl StateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current breaker state; `None` until bound by a build.
    pub fn state(&self) -> Option<CircuitState> {
        self.core.get().map(|core| core.current_state())
    }

    /// Full observability snapshot; `None` until bound by a build.
    pub fn snapshot(&self) -> Option<CircuitBreakerSnapshot> {
        self.core.get().map(|core| core.snapshot())
    }

    fn bind(&self, core: Arc<BreakerCore>) -> Result<(), ConfigError> {
        self.core
            .set(core)
            .map_err(|_| ConfigError::invalid(STRATEGY_NAME, "state provider already bound"))
    }
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider").field("state", &self.state()).finish()
    }
}

/// Manual isolate/close handle, bound to one breaker at pipeline build.
/// Usable independently of execution calls.
#[derive(Clone, Default)]
pub struct ManualControl {
    core: Arc<OnceCell<Arc<BreakerCore>>>,
}

impl ManualControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the breaker into Isolated. Returns `false` if not yet bound.
    pub fn isolate(&self) -> bool {
        match self.core.get() {
            Some(core) => {
                core.isolate();
                true
            }
            None => false,
        }
    }

    /// Force the breaker Closed and reset its window. Returns `false` if
    /// not yet bound.
    pub fn close(&self) -> bool {
        match self.core.get() {
            Some(core) => {
                core.close();
                true
            }
            None => false,
        }
    }

    fn bind(&self, core: Arc<BreakerCore>) -> Result<(), ConfigError> {
        self.core
            .set(core)
            .map_err(|_| ConfigError::invalid(STRATEGY_NAME, "manual control already bound"))
    }
}

impl std::fmt::Debug for ManualControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualControl").field("bound", &self.core.get().is_some()).finish()
    }
}

/// The circuit breaker pipeline component.
pub struct CircuitBreakerStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    predicate: HandlePredicate<T, E>,
    core: Arc<BreakerCore>,
}

impl<T, E> CircuitBreakerStrategy<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Validate the config, build a fresh breaker, and bind any handles.
    pub fn from_config(config: CircuitBreakerConfig<T, E>) -> Result<Self, ConfigError> {
        config.validate()?;
        let core = Arc::new(BreakerCore {
            state: Mutex::new(StateInner::Closed),
            metrics: HealthMetrics::new(config.sampling_duration, Arc::clone(&config.clock)),
            clock: config.clock,
            failure_ratio: config.failure_ratio,
            minimum_throughput: config.minimum_throughput,
            break_duration: config.break_duration,
            break_duration_generator: config.break_duration_generator,
            on_opened: config.on_opened,
            on_closed: config.on_closed,
            on_half_opened: config.on_half_opened,
        });
        if let Some(provider) = &config.state_provider {
            provider.bind(Arc::clone(&core))?;
        }
        if let Some(control) = &config.manual_control {
            control.bind(Arc::clone(&core))?;
        }
        Ok(Self { predicate: config.predicate, core })
    }

    fn record_transition(ctx: &mut ResilienceContext, transition: Transition) {
        match transition {
            Transition::Opened(duration) => ctx.record_event(
                ResilienceEvent::new(event_names::CIRCUIT_OPENED, STRATEGY_NAME)
                    .with_detail(format!("break {duration:?}")),
            ),
            Transition::Closed => ctx
                .record_event(ResilienceEvent::new(event_names::CIRCUIT_CLOSED, STRATEGY_NAME)),
        }
    }
}

#[async_trait]
impl<T, E> Strategy<T, E> for CircuitBreakerStrategy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    async fn execute(&self, ctx: &mut ResilienceContext, next: Next<'_, T, E>) -> Outcome<T, E> {
        match self.core.admit() {
            Admission::RejectedOpen => {
                ctx.record_event(ResilienceEvent::new(
                    event_names::CIRCUIT_REJECTED,
                    STRATEGY_NAME,
                ));
                Outcome::Failure(ExecutionError::CircuitOpen)
            }
            Admission::RejectedIsolated => {
                ctx.record_event(ResilienceEvent::new(
                    event_names::CIRCUIT_REJECTED,
                    STRATEGY_NAME,
                ));
                Outcome::Failure(ExecutionError::CircuitIsolated)
            }
            Admission::Allowed => {
                let outcome = next.run(ctx).await;
                // Cancellation is neither success nor failure for the
                // window.
                if outcome.is_cancelled() {
                    return outcome;
                }
                if let Some(transition) = self.core.record(self.predicate.is_handled(&outcome)) {
                    Self::record_transition(ctx, transition);
                }
                outcome
            }
            Admission::Trial { half_opened } => {
                if half_opened {
                    ctx.record_event(ResilienceEvent::new(
                        event_names::CIRCUIT_HALF_OPENED,
                        STRATEGY_NAME,
                    ));
                }
                let outcome = next.run(ctx).await;
                if outcome.is_cancelled() {
                    // Trial never completed: release the slot so the next
                    // caller can probe.
                    self.core.abandon_trial();
                    return outcome;
                }
                if let Some(transition) =
                    self.core.finish_trial(self.predicate.is_handled(&outcome))
                {
                    Self::record_transition(ctx, transition);
                }
                outcome
            }
        }
    }
}
