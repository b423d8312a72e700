use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default sampling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Throughput over one completed window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateSample {
    /// Events per second, rounded
    pub rate: u64,

    /// Events counted in the window
    pub count: u64,

    pub elapsed: Duration,
}

/// Windowed events-per-second counter
///
/// Cloning yields another handle to the same counter.
#[derive(Clone)]
pub struct RateEstimator {
    inner: Arc<Inner>,
}

struct Inner {
    counter: AtomicU64,
    window_start: Mutex<Instant>,
    /// Rate of the last completed window
    current: AtomicU64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counter: AtomicU64::new(0),
                window_start: Mutex::new(Instant::now()),
                current: AtomicU64::new(0),
            }),
        }
    }

    /// Count one event
    pub fn record(&self) {
        self.inner.counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current window and start a new one
    pub fn sample(&self) -> RateSample {
        self.sample_at(Instant::now())
    }

    /// Close the current window at `now`
    pub fn sample_at(&self, now: Instant) -> RateSample {
        let mut window_start = self.inner.window_start.lock();
        let elapsed = now.saturating_duration_since(*window_start);
        let count = self.inner.counter.swap(0, Ordering::Relaxed);
        *window_start = now;

        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (count as f64 / secs).round() as u64
        } else {
            count
        };
        self.inner.current.store(rate, Ordering::Relaxed);

        RateSample {
            rate,
            count,
            elapsed,
        }
    }

    /// Rate of the last completed window
    pub fn current(&self) -> u64 {
        self.inner.current.load(Ordering::Relaxed)
    }

    /// Zero everything and restart the window now
    pub fn reset(&self) {
        let mut window_start = self.inner.window_start.lock();
        self.inner.counter.store(0, Ordering::Relaxed);
        self.inner.current.store(0, Ordering::Relaxed);
        *window_start = Instant::now();
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_reports_zero() {
        let rate = RateEstimator::new();
        tokio::time::advance(Duration::from_secs(1)).await;

        let sample = rate.sample();
        assert_eq!(sample.rate, 0);
        assert_eq!(sample.count, 0);
        assert_eq!(rate.current(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_events_in_one_second() {
        let rate = RateEstimator::new();
        for _ in 0..42 {
            rate.record();
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        assert_eq!(rate.sample().rate, 42);
        assert_eq!(rate.current(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_normalized_by_elapsed_time() {
        let rate = RateEstimator::new();
        for _ in 0..5 {
            rate.record();
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        // 2.5/s rounds away from zero
        assert_eq!(rate.sample().rate, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_resets_window() {
        let rate = RateEstimator::new();
        rate.record();
        tokio::time::advance(Duration::from_secs(1)).await;
        rate.sample();

        tokio::time::advance(Duration::from_secs(1)).await;
        let sample = rate.sample();
        assert_eq!(sample.count, 0);
        assert_eq!(sample.elapsed, Duration::from_secs(1));
    }
}
