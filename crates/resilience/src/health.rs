//! Rolling health metrics for the circuit breaker
//!
//! Outcome counts are aggregated over the configured sampling duration.
//! Short windows (below [`SINGLE_WINDOW_MAX`]) use one counter pair reset
//! wholesale when the window expires; longer windows divide the duration
//! into a ring of buckets that age out individually, so the failure ratio
//! degrades smoothly instead of dropping to zero at each boundary.
//!
//! Rotation is lazy: buckets are advanced on access from elapsed clock
//! time, never by a timer thread. The lock is scoped to the metrics object,
//! so concurrent recorders contend only here, not on the whole breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::Clock;

/// Sampling durations at or below this use the single-window variant.
pub(crate) const SINGLE_WINDOW_MAX: Duration = Duration::from_millis(200);

/// Bucket count for the rolling variant. More buckets sharpen the ratio
/// estimate at the cost of memory; ten matches a 10% aging granularity.
pub(crate) const ROLLING_BUCKETS: usize = 10;

/// Point-in-time aggregate over the non-expired window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct HealthSnapshot {
    pub total: u64,
    pub failures: u64,
}

impl HealthSnapshot {
    /// Failure ratio over the window; zero when no calls were observed.
    pub fn failure_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    total: u64,
    failures: u64,
}

enum Window {
    /// One counter pair, reset wholesale when the sampling duration elapses.
    Single { started: Instant, bucket: Bucket },
    /// Ring of buckets spanning the sampling duration; `head` is the bucket
    /// currently being written, `head_started` when it was opened.
    Rolling { buckets: [Bucket; ROLLING_BUCKETS], head: usize, head_started: Instant },
}

pub(crate) struct HealthMetrics {
    sampling: Duration,
    bucket_len: Duration,
    clock: Arc<dyn Clock>,
    window: Mutex<Window>,
}

impl HealthMetrics {
    pub fn new(sampling: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let window = if sampling <= SINGLE_WINDOW_MAX {
            Window::Single { started: now, bucket: Bucket::default() }
        } else {
            Window::Rolling {
                buckets: [Bucket::default(); ROLLING_BUCKETS],
                head: 0,
                head_started: now,
            }
        };
        Self {
            sampling,
            bucket_len: sampling / ROLLING_BUCKETS as u32,
            clock,
            window: Mutex::new(window),
        }
    }

    pub fn record_success(&self) {
        self.record(false);
    }

    pub fn record_failure(&self) {
        self.record(true);
    }

    fn record(&self, failure: bool) {
        let now = self.clock.now();
        let mut window = self.window.lock();
        self.rotate(&mut window, now);
        let bucket = match &mut *window {
            Window::Single { bucket, .. } => bucket,
            Window::Rolling { buckets, head, .. } => &mut buckets[*head],
        };
        bucket.total += 1;
        if failure {
            bucket.failures += 1;
        }
    }

    /// Aggregate over the non-expired portion of the window.
    pub fn snapshot(&self) -> HealthSnapshot {
        let now = self.clock.now();
        let mut window = self.window.lock();
        self.rotate(&mut window, now);
        match &*window {
            Window::Single { bucket, .. } => {
                HealthSnapshot { total: bucket.total, failures: bucket.failures }
            }
            Window::Rolling { buckets, .. } => {
                let mut snapshot = HealthSnapshot { total: 0, failures: 0 };
                for bucket in buckets {
                    snapshot.total += bucket.total;
                    snapshot.failures += bucket.failures;
                }
                snapshot
            }
        }
    }

    /// Discard all observations and restart the window at the current time.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut window = self.window.lock();
        match &mut *window {
            Window::Single { started, bucket } => {
                *started = now;
                *bucket = Bucket::default();
            }
            Window::Rolling { buckets, head, head_started } => {
                *buckets = [Bucket::default(); ROLLING_BUCKETS];
                *head = 0;
                *head_started = now;
            }
        }
    }

    /// Catch the window up with elapsed time, zeroing expired state.
    fn rotate(&self, window: &mut Window, now: Instant) {
        match window {
            Window::Single { started, bucket } => {
                if now.duration_since(*started) >= self.sampling {
                    *started = now;
                    *bucket = Bucket::default();
                }
            }
            Window::Rolling { buckets, head, head_started } => {
                let elapsed = now.duration_since(*head_started);
                if elapsed < self.bucket_len {
                    return;
                }
                let advance = (elapsed.as_nanos() / self.bucket_len.as_nanos()) as usize;
                if advance >= ROLLING_BUCKETS {
                    *buckets = [Bucket::default(); ROLLING_BUCKETS];
                    *head = 0;
                    *head_started = now;
                    return;
                }
                for _ in 0..advance {
                    *head = (*head + 1) % ROLLING_BUCKETS;
                    buckets[*head] = Bucket::default();
                }
                *head_started += self.bucket_len * advance as u32;
            }
        }
    }
}
