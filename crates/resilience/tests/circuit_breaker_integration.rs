//! Integration tests for the circuit breaker state machine
//!
//! Drives the breaker through the public pipeline surface with a manual
//! clock, covering the trip condition, the HalfOpen trial protocol, metric
//! resets, and manual control.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use faultline_resilience::{
    CircuitBreakerConfig, CircuitState, ExecutionError, ManualClock, ManualControl, Pipeline,
    PipelineBuilder, StateProvider,
};

/// Custom error type for testing
#[derive(Debug)]
struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test failure")
    }
}

impl std::error::Error for TestError {}

struct Harness {
    pipeline: Pipeline<u32, TestError>,
    clock: ManualClock,
    provider: StateProvider,
    control: ManualControl,
    calls: Arc<AtomicU32>,
}

/// Breaker with ratio 0.5, 10 s sampling, minimum throughput 4, 2 s break.
fn harness() -> Harness {
    let clock = ManualClock::new();
    let provider = StateProvider::new();
    let control = ManualControl::new();
    let pipeline = PipelineBuilder::<u32, TestError>::new()
        .circuit_breaker(
            CircuitBreakerConfig::builder()
                .failure_ratio(0.5)
                .sampling_duration(Duration::from_secs(10))
                .minimum_throughput(4)
                .break_duration(Duration::from_secs(2))
                .clock(Arc::new(clock.clone()))
                .state_provider(provider.clone())
                .manual_control(control.clone())
                .build(),
        )
        .build()
        .expect("valid configuration");
    Harness { pipeline, clock, provider, control, calls: Arc::new(AtomicU32::new(0)) }
}

impl Harness {
    async fn run(&self, fail: bool) -> Result<u32, ExecutionError<TestError>> {
        self.pipeline
            .execute_with_state(Arc::clone(&self.calls), move |_ctx, calls| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(TestError)
                } else {
                    Ok(1)
                }
            })
            .await
    }

    fn state(&self) -> CircuitState {
        self.provider.state().expect("provider bound at build")
    }
}

/// Validates the trip condition: ratio and minimum throughput together.
///
/// # Test Steps
/// 1. Record 2 failures then 2 successes and verify the breaker stays
///    Closed (the ratio is only consulted when a failure lands, and at
///    that point the window is below the minimum throughput)
/// 2. Record 3 failures + 1 success within the window and verify the
///    breaker Opens (4 calls, ratio 0.75)
#[tokio::test(flavor = "multi_thread")]
async fn test_trip_requires_ratio_and_throughput() {
    // 2 failures + 2 successes, failures first: when the second failure
    // lands only 2 calls are in the window, below the minimum throughput,
    // so the breaker must stay Closed.
    let h = harness();
    let _ = h.run(true).await;
    let _ = h.run(true).await;
    let _ = h.run(false).await;
    let _ = h.run(false).await;
    assert_eq!(h.state(), CircuitState::Closed);
    assert_eq!(h.calls.load(Ordering::SeqCst), 4);

    // 3 failures + 1 success within the window: 4 calls, ratio 0.75.
    let h = harness();
    let _ = h.run(true).await;
    let _ = h.run(true).await;
    let _ = h.run(false).await;
    let _ = h.run(true).await;
    assert_eq!(h.state(), CircuitState::Open);
}

/// Validates Open rejects calls without invoking the operation.
///
/// # Test Steps
/// 1. Trip the breaker
/// 2. Execute again and verify the circuit-open fault
/// 3. Confirm the operation call count did not move
#[tokio::test(flavor = "multi_thread")]
async fn test_open_rejects_without_invoking_operation() {
    let h = harness();
    for _ in 0..4 {
        let _ = h.run(true).await;
    }
    assert_eq!(h.state(), CircuitState::Open);
    let before = h.calls.load(Ordering::SeqCst);

    let result = h.run(false).await;
    assert!(matches!(result, Err(ExecutionError::CircuitOpen)));
    assert_eq!(h.calls.load(Ordering::SeqCst), before);
}

/// Validates exactly one HalfOpen trial passes while a concurrent call is
/// rejected as if still Open.
///
/// # Test Steps
/// 1. Trip the breaker and advance past the break duration
/// 2. Start a trial call that blocks inside the operation
/// 3. Execute a second call while the trial is outstanding; expect
///    rejection
/// 4. Let the trial succeed and verify the breaker Closes
#[tokio::test(flavor = "multi_thread")]
async fn test_half_open_admits_exactly_one_trial() {
    let h = harness();
    for _ in 0..4 {
        let _ = h.run(true).await;
    }
    h.clock.advance(Duration::from_secs(2));

    let gate = Arc::new(tokio::sync::Notify::new());
    let entered = Arc::new(tokio::sync::Notify::new());

    let trial_pipeline = h.pipeline.clone();
    let trial_gate = Arc::clone(&gate);
    let trial_entered = Arc::clone(&entered);
    let trial = tokio::spawn(async move {
        trial_pipeline
            .execute(move |_ctx| {
                let gate = Arc::clone(&trial_gate);
                let entered = Arc::clone(&trial_entered);
                async move {
                    entered.notify_one();
                    gate.notified().await;
                    Ok(7)
                }
            })
            .await
    });

    // Wait until the trial is inside the operation, then probe.
    entered.notified().await;
    let concurrent = h.run(false).await;
    assert!(matches!(concurrent, Err(ExecutionError::CircuitOpen)));

    gate.notify_one();
    assert!(matches!(trial.await.expect("trial task"), Ok(7)));
    assert_eq!(h.state(), CircuitState::Closed);
}

/// Validates a successful trial resets the health metrics.
///
/// # Test Steps
/// 1. Trip the breaker, advance past the break, run a succeeding trial
/// 2. Record one more failure
/// 3. Verify the breaker stays Closed: the pre-trip window is gone
#[tokio::test(flavor = "multi_thread")]
async fn test_trial_success_resets_metrics() {
    let h = harness();
    for _ in 0..4 {
        let _ = h.run(true).await;
    }
    h.clock.advance(Duration::from_secs(2));

    assert!(matches!(h.run(false).await, Ok(1)));
    assert_eq!(h.state(), CircuitState::Closed);

    let _ = h.run(true).await;
    assert_eq!(h.state(), CircuitState::Closed);
}

/// Validates a failed trial re-opens the breaker for a fresh break.
///
/// # Test Steps
/// 1. Trip the breaker and advance past the break
/// 2. Run a failing trial; verify Open again
/// 3. Advance past the new break and verify a trial is admitted again
#[tokio::test(flavor = "multi_thread")]
async fn test_trial_failure_reopens() {
    let h = harness();
    for _ in 0..4 {
        let _ = h.run(true).await;
    }
    h.clock.advance(Duration::from_secs(2));

    assert!(matches!(h.run(true).await, Err(ExecutionError::Operation(_))));
    assert_eq!(h.state(), CircuitState::Open);
    assert!(matches!(h.run(false).await, Err(ExecutionError::CircuitOpen)));

    h.clock.advance(Duration::from_secs(2));
    assert!(matches!(h.run(false).await, Ok(1)));
    assert_eq!(h.state(), CircuitState::Closed);
}

/// Validates failures aging out of the sampling window stop counting
/// toward the trip condition.
///
/// # Test Steps
/// 1. Record 3 failures, advance past the sampling duration
/// 2. Record 1 more failure (window otherwise empty)
/// 3. Verify the breaker stays Closed
#[tokio::test(flavor = "multi_thread")]
async fn test_expired_window_does_not_trip() {
    let h = harness();
    for _ in 0..3 {
        let _ = h.run(true).await;
    }
    h.clock.advance(Duration::from_secs(11));

    let _ = h.run(true).await;
    assert_eq!(h.state(), CircuitState::Closed);
}

/// Validates manual control: isolate rejects everything regardless of
/// metrics; close restores traffic and resets the window.
///
/// # Test Steps
/// 1. Isolate a healthy breaker and verify the isolation fault
/// 2. Close it manually and verify calls flow again
/// 3. Trip it, close manually, and verify the window was reset
#[tokio::test(flavor = "multi_thread")]
async fn test_manual_isolate_and_close() {
    let h = harness();

    assert!(h.control.isolate());
    assert_eq!(h.state(), CircuitState::Isolated);
    assert!(matches!(h.run(false).await, Err(ExecutionError::CircuitIsolated)));
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    assert!(h.control.close());
    assert_eq!(h.state(), CircuitState::Closed);
    assert!(matches!(h.run(false).await, Ok(1)));

    for _ in 0..4 {
        let _ = h.run(true).await;
    }
    assert_eq!(h.state(), CircuitState::Open);
    assert!(h.control.close());
    assert_eq!(h.state(), CircuitState::Closed);
    // The window was reset: a single failure cannot re-trip.
    let _ = h.run(true).await;
    assert_eq!(h.state(), CircuitState::Closed);
}

/// Validates the observability snapshot reflects the live window.
#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_reflects_window() {
    let h = harness();
    let _ = h.run(true).await;
    let _ = h.run(false).await;

    let snapshot = h.provider.snapshot().expect("provider bound at build");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.total_calls, 2);
    assert_eq!(snapshot.failed_calls, 1);
    assert!((snapshot.failure_ratio - 0.5).abs() < f64::EPSILON);
}
