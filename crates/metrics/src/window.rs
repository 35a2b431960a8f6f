use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

/// Number of buckets in a sliding window.
const BUCKETS: usize = 30;

/// Capacity of the latency sample ring.
const LATENCY_SAMPLES: usize = 256;

/// One lazily-reset bucket of counters.
#[derive(Debug, Default)]
struct Bucket {
    /// Index of the window slice this bucket currently holds data for.
    epoch: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    throttles: AtomicU64,
}

impl Bucket {
    /// Claims the bucket for `epoch`, zeroing stale counters. Multiple
    /// writers may race here; the CAS makes exactly one of them reset.
    fn claim(&self, epoch: u64) {
        let seen = self.epoch.load(Ordering::Acquire);
        if seen == epoch {
            return
        }
        if self.epoch.compare_exchange(seen, epoch, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.requests.store(0, Ordering::Release);
            self.errors.store(0, Ordering::Release);
            self.throttles.store(0, Ordering::Release);
        }
    }
}

/// Windowed request/error/throttle counters.
///
/// The window is a ring of [`BUCKETS`] buckets; a bucket is reused once its
/// slice of time rotates out, so rates never include data older than the
/// window and counters never go negative.
#[derive(Debug)]
pub struct SlidingWindow {
    started: Instant,
    bucket_width: Duration,
    buckets: [Bucket; BUCKETS],
}

impl SlidingWindow {
    /// Creates a window spanning `window` in total.
    pub fn new(window: Duration) -> Self {
        Self {
            started: Instant::now(),
            bucket_width: window / BUCKETS as u32,
            buckets: Default::default(),
        }
    }

    fn current_epoch(&self) -> u64 {
        (self.started.elapsed().as_nanos() / self.bucket_width.as_nanos().max(1)) as u64
    }

    fn bucket_for(&self, epoch: u64) -> &Bucket {
        let bucket = &self.buckets[(epoch % BUCKETS as u64) as usize];
        bucket.claim(epoch);
        bucket
    }

    /// Records a completed request.
    pub fn record_request(&self) {
        self.record_request_at(self.current_epoch());
    }

    /// Records a failed request.
    pub fn record_error(&self) {
        self.record_error_at(self.current_epoch());
    }

    /// Records a throttled response.
    pub fn record_throttle(&self) {
        self.record_throttle_at(self.current_epoch());
    }

    pub(crate) fn record_request_at(&self, epoch: u64) {
        self.bucket_for(epoch).requests.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_error_at(&self, epoch: u64) {
        self.bucket_for(epoch).errors.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_throttle_at(&self, epoch: u64) {
        self.bucket_for(epoch).throttles.fetch_add(1, Ordering::AcqRel);
    }

    /// Sums `(requests, errors, throttles)` over the live window.
    pub fn totals(&self) -> (u64, u64, u64) {
        self.totals_at(self.current_epoch())
    }

    pub(crate) fn totals_at(&self, now_epoch: u64) -> (u64, u64, u64) {
        let oldest = now_epoch.saturating_sub(BUCKETS as u64 - 1);
        let (mut requests, mut errors, mut throttles) = (0, 0, 0);
        for bucket in &self.buckets {
            let epoch = bucket.epoch.load(Ordering::Acquire);
            if epoch >= oldest && epoch <= now_epoch {
                requests += bucket.requests.load(Ordering::Acquire);
                errors += bucket.errors.load(Ordering::Acquire);
                throttles += bucket.throttles.load(Ordering::Acquire);
            }
        }
        (requests, errors, throttles)
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

/// Fixed-size ring of latency samples for percentile estimates.
///
/// Samples are stored as `micros + 1` so zero can mark empty slots.
#[derive(Debug)]
pub struct LatencyRing {
    samples: Box<[AtomicU64]>,
    cursor: AtomicUsize,
}

impl LatencyRing {
    /// Creates an empty ring.
    pub fn new() -> Self {
        Self {
            samples: (0..LATENCY_SAMPLES).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Records one latency observation.
    pub fn record(&self, latency: Duration) {
        let slot = self.cursor.fetch_add(1, Ordering::AcqRel) % self.samples.len();
        self.samples[slot].store(latency.as_micros() as u64 + 1, Ordering::Release);
    }

    /// Returns the `q`-quantile of the recorded samples, if any.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        let mut observed: Vec<u64> = self
            .samples
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .filter(|&s| s > 0)
            .collect();
        if observed.is_empty() {
            return None
        }
        observed.sort_unstable();
        let rank = ((q * observed.len() as f64).ceil() as usize).clamp(1, observed.len());
        Some(Duration::from_micros(observed[rank - 1] - 1))
    }
}

impl Default for LatencyRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_within_window() {
        let window = SlidingWindow::new(Duration::from_secs(30));
        for _ in 0..5 {
            window.record_request_at(10);
        }
        window.record_error_at(10);
        window.record_throttle_at(11);
        assert_eq!(window.totals_at(11), (5, 1, 1));
    }

    #[test]
    fn old_buckets_rotate_out() {
        let window = SlidingWindow::new(Duration::from_secs(30));
        window.record_request_at(0);
        window.record_error_at(0);
        assert_eq!(window.totals_at(0), (1, 1, 0));
        // a full rotation later the epoch-0 bucket is stale
        assert_eq!(window.totals_at(BUCKETS as u64), (0, 0, 0));
    }

    #[test]
    fn bucket_reuse_resets_counters() {
        let window = SlidingWindow::new(Duration::from_secs(30));
        window.record_request_at(3);
        // same slot, one rotation later
        window.record_request_at(3 + BUCKETS as u64);
        assert_eq!(window.totals_at(3 + BUCKETS as u64), (1, 0, 0));
    }

    #[test]
    fn latency_quantiles() {
        let ring = LatencyRing::new();
        for millis in 1..=100u64 {
            ring.record(Duration::from_millis(millis));
        }
        assert_eq!(ring.quantile(0.9), Some(Duration::from_millis(90)));
        assert_eq!(ring.quantile(1.0), Some(Duration::from_millis(100)));
        assert_eq!(LatencyRing::new().quantile(0.9), None);
    }
}
