use crate::MetricsSnapshot;
use manifold_config::ScoreMultiplierConfig;
use manifold_primitives::UpstreamId;

/// An upstream with its computed score. Lower scores rank first.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    /// The scored upstream.
    pub upstream: UpstreamId,
    /// Scalar cost; lower is better.
    pub score: f64,
}

/// Squashes an unbounded cost into `[0, 1)`.
fn squash(value: f64) -> f64 {
    value / (1.0 + value)
}

/// Computes the scalar score of one snapshot.
///
/// Rates are already in `[0, 1]`; latency and the lag terms are squashed.
/// The request-count term prefers upstreams with more observed traffic, so a
/// cold upstream does not outrank a proven one purely by having no errors
/// yet.
pub fn score_snapshot(snapshot: &MetricsSnapshot, weights: &ScoreMultiplierConfig) -> f64 {
    let cold_penalty = 1.0 / (1.0 + (snapshot.total_requests as f64).ln_1p());
    let sum = weights.error_rate * snapshot.error_rate +
        weights.p90_latency * squash(snapshot.latency) +
        weights.throttled_rate * snapshot.throttled_rate +
        weights.block_head_lag * squash(snapshot.block_head_lag as f64) +
        weights.finalization_lag * squash(snapshot.finalization_lag as f64) +
        weights.total_requests * cold_penalty;
    weights.overall * sum
}

/// Scores and sorts candidates. Ties break by upstream id so identical
/// snapshots always produce the same order.
pub fn rank(
    candidates: impl IntoIterator<Item = (UpstreamId, MetricsSnapshot, ScoreMultiplierConfig)>,
) -> Vec<Ranked> {
    let mut ranked: Vec<Ranked> = candidates
        .into_iter()
        .map(|(upstream, snapshot, weights)| Ranked {
            score: score_snapshot(&snapshot, &weights),
            upstream,
        })
        .collect();
    ranked.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.upstream.cmp(&b.upstream))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(error_rate: f64, latency: f64, lag: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            error_rate,
            latency,
            throttled_rate: 0.0,
            total_requests: 100,
            block_head_lag: lag,
            finalization_lag: 0,
        }
    }

    #[test]
    fn errors_dominate_latency() {
        let weights = ScoreMultiplierConfig::default();
        let erroring = score_snapshot(&snapshot(0.5, 0.05, 0), &weights);
        let slow = score_snapshot(&snapshot(0.0, 0.5, 0), &weights);
        assert!(erroring > slow);
    }

    #[test]
    fn lag_costs() {
        let weights = ScoreMultiplierConfig::default();
        let lagging = score_snapshot(&snapshot(0.0, 0.05, 50), &weights);
        let synced = score_snapshot(&snapshot(0.0, 0.05, 0), &weights);
        assert!(lagging > synced);
    }

    #[test]
    fn rank_is_deterministic_on_ties() {
        let weights = ScoreMultiplierConfig::default;
        let a = (UpstreamId::new("b"), snapshot(0.1, 0.05, 0), weights());
        let b = (UpstreamId::new("a"), snapshot(0.1, 0.05, 0), weights());
        let ranked = rank(vec![a, b]);
        assert_eq!(ranked[0].upstream, UpstreamId::new("a"));
        assert_eq!(ranked[1].upstream, UpstreamId::new("b"));
    }

    #[test]
    fn proven_upstream_preferred_over_cold() {
        let weights = ScoreMultiplierConfig::default();
        let cold = MetricsSnapshot { total_requests: 0, ..Default::default() };
        let proven = MetricsSnapshot { total_requests: 10_000, ..Default::default() };
        assert!(score_snapshot(&cold, &weights) > score_snapshot(&proven, &weights));
    }
}
