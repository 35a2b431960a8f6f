//! Sliding-window metrics per `(upstream, network, method)` and the scoring
//! that turns them into upstream rankings.
//!
//! Counters are windowed over roughly thirty minutes with lazily reset
//! buckets; writers only touch atomics, readers assemble snapshots without
//! locking. Snapshots feed the scorer, which produces a scalar cost per
//! upstream. Lower is better.

mod score;
mod tracker;
mod window;

pub use score::{rank, score_snapshot, Ranked};
pub use tracker::{MetricsSnapshot, MetricsTracker, TrackerKey, DEFAULT_LATENCY_QUANTILE};
pub use window::{LatencyRing, SlidingWindow};
