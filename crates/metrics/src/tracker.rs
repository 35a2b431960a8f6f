use crate::window::{LatencyRing, SlidingWindow};
use dashmap::DashMap;
use manifold_primitives::{ErrorKind, NetworkId, UpstreamId};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Key of one tracked method series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerKey {
    /// The serving upstream.
    pub upstream: UpstreamId,
    /// The network the request belonged to.
    pub network: NetworkId,
    /// The JSON-RPC method.
    pub method: String,
}

#[derive(Debug, Default)]
struct MethodSeries {
    window: SlidingWindow,
    latency: LatencyRing,
}

#[derive(Debug, Default)]
struct LagGauges {
    /// Blocks behind the network's best observed head.
    block_head_lag: AtomicU64,
    /// Blocks between the upstream's head and its finalized block, relative
    /// to the network's best.
    finalization_lag: AtomicU64,
}

/// Latency quantile reported by [`MetricsTracker::snapshot`] when the caller
/// does not ask for a specific one.
pub const DEFAULT_LATENCY_QUANTILE: f64 = 0.9;

/// Read-side snapshot of one upstream's health for a method.
///
/// Plain floats so the scorer and selection policies can treat it as a pure
/// value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Errors divided by requests over the window.
    pub error_rate: f64,
    /// Latency in seconds at the requested quantile of the sample ring,
    /// p90 unless the snapshot was taken at another quantile.
    pub latency: f64,
    /// Throttled responses divided by requests over the window.
    pub throttled_rate: f64,
    /// Requests observed in the window.
    pub total_requests: u64,
    /// Blocks behind the best upstream's head.
    pub block_head_lag: u64,
    /// Blocks behind the best upstream's finalized block.
    pub finalization_lag: u64,
}

/// Process-wide tracker of upstream health.
///
/// Shared by the executor (writer) and the selector (reader); all hot paths
/// are atomic adds on windowed buckets.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    series: DashMap<TrackerKey, Arc<MethodSeries>>,
    lags: DashMap<(UpstreamId, NetworkId), Arc<LagGauges>>,
}

impl MetricsTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, key: &TrackerKey) -> Arc<MethodSeries> {
        if let Some(series) = self.series.get(key) {
            return Arc::clone(&series)
        }
        Arc::clone(&self.series.entry(key.clone()).or_default())
    }

    fn lag_gauges(&self, upstream: &UpstreamId, network: &NetworkId) -> Arc<LagGauges> {
        let key = (upstream.clone(), network.clone());
        if let Some(gauges) = self.lags.get(&key) {
            return Arc::clone(&gauges)
        }
        Arc::clone(&self.lags.entry(key).or_default())
    }

    /// Records a successful request with its observed latency.
    pub fn record_success(&self, key: &TrackerKey, latency: Duration) {
        let series = self.series(key);
        series.window.record_request();
        series.latency.record(latency);
        metrics::counter!(
            "manifold_upstream_requests_total",
            "upstream" => key.upstream.to_string(),
            "network" => key.network.to_string(),
            "method" => key.method.clone(),
            "outcome" => "success",
        )
        .increment(1);
        metrics::histogram!(
            "manifold_upstream_latency_seconds",
            "upstream" => key.upstream.to_string(),
            "network" => key.network.to_string(),
        )
        .record(latency.as_secs_f64());
    }

    /// Records a failed request.
    pub fn record_error(&self, key: &TrackerKey, kind: ErrorKind) {
        let series = self.series(key);
        series.window.record_request();
        series.window.record_error();
        if kind == ErrorKind::Throttled {
            series.window.record_throttle();
        }
        metrics::counter!(
            "manifold_upstream_requests_total",
            "upstream" => key.upstream.to_string(),
            "network" => key.network.to_string(),
            "method" => key.method.clone(),
            "outcome" => kind.as_ref().to_owned(),
        )
        .increment(1);
    }

    /// Publishes the upstream's lag behind the network's best head and
    /// finalized block.
    pub fn set_lag(
        &self,
        upstream: &UpstreamId,
        network: &NetworkId,
        block_head_lag: u64,
        finalization_lag: u64,
    ) {
        let gauges = self.lag_gauges(upstream, network);
        gauges.block_head_lag.store(block_head_lag, Ordering::Release);
        gauges.finalization_lag.store(finalization_lag, Ordering::Release);
        metrics::gauge!(
            "manifold_upstream_block_head_lag",
            "upstream" => upstream.to_string(),
            "network" => network.to_string(),
        )
        .set(block_head_lag as f64);
    }

    /// Snapshot for one `(upstream, network, method)` series at the default
    /// latency quantile.
    pub fn snapshot(&self, key: &TrackerKey) -> MetricsSnapshot {
        self.snapshot_at_quantile(key, DEFAULT_LATENCY_QUANTILE)
    }

    /// Snapshot for one series with the latency read at `quantile`, e.g. the
    /// hedge stage's configured quantile.
    pub fn snapshot_at_quantile(&self, key: &TrackerKey, quantile: f64) -> MetricsSnapshot {
        let (requests, errors, throttles, latency) = match self.series.get(key) {
            Some(series) => {
                let (requests, errors, throttles) = series.window.totals();
                let latency =
                    series.latency.quantile(quantile).map_or(0.0, |d| d.as_secs_f64());
                (requests, errors, throttles, latency)
            }
            None => (0, 0, 0, 0.0),
        };
        self.assemble(key, requests, errors, throttles, latency)
    }

    /// Snapshot aggregated across every method of `(upstream, network)` at
    /// the default latency quantile.
    pub fn snapshot_upstream(&self, upstream: &UpstreamId, network: &NetworkId) -> MetricsSnapshot {
        self.snapshot_upstream_at_quantile(upstream, network, DEFAULT_LATENCY_QUANTILE)
    }

    /// Aggregated snapshot with the latency read at `quantile`. The reported
    /// latency is the worst per-method quantile, so one slow method is not
    /// averaged away.
    pub fn snapshot_upstream_at_quantile(
        &self,
        upstream: &UpstreamId,
        network: &NetworkId,
        quantile: f64,
    ) -> MetricsSnapshot {
        let (mut requests, mut errors, mut throttles) = (0, 0, 0);
        let mut latency = 0.0f64;
        for entry in self.series.iter() {
            let key = entry.key();
            if &key.upstream == upstream && &key.network == network {
                let (r, e, t) = entry.value().window.totals();
                requests += r;
                errors += e;
                throttles += t;
                if let Some(q) = entry.value().latency.quantile(quantile) {
                    latency = latency.max(q.as_secs_f64());
                }
            }
        }
        let probe = TrackerKey {
            upstream: upstream.clone(),
            network: network.clone(),
            method: String::new(),
        };
        self.assemble(&probe, requests, errors, throttles, latency)
    }

    fn assemble(
        &self,
        key: &TrackerKey,
        requests: u64,
        errors: u64,
        throttles: u64,
        latency: f64,
    ) -> MetricsSnapshot {
        let (block_head_lag, finalization_lag) = self
            .lags
            .get(&(key.upstream.clone(), key.network.clone()))
            .map(|gauges| {
                (
                    gauges.block_head_lag.load(Ordering::Acquire),
                    gauges.finalization_lag.load(Ordering::Acquire),
                )
            })
            .unwrap_or((0, 0));

        let denom = requests.max(1) as f64;
        MetricsSnapshot {
            error_rate: errors as f64 / denom,
            latency,
            throttled_rate: throttles as f64 / denom,
            total_requests: requests,
            block_head_lag,
            finalization_lag,
        }
    }
}
