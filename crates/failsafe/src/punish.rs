use dashmap::DashMap;
use manifold_config::PunishMisbehaviorConfig;
use manifold_primitives::UpstreamId;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::warn;

/// Dispute accounting and cordoning.
///
/// An upstream that keeps disagreeing with winning consensus groups accrues
/// disputes per `(upstream, method)`. Crossing the threshold inside the
/// window cordons the upstream: it is excluded from selection until the
/// sit-out penalty elapses.
#[derive(Debug, Default)]
pub struct MisbehaviorTracker {
    config: Option<PunishMisbehaviorConfig>,
    disputes: DashMap<(UpstreamId, String), VecDeque<Instant>>,
    cordoned_until: DashMap<UpstreamId, Instant>,
}

impl MisbehaviorTracker {
    /// Creates a tracker; `None` disables punishment entirely.
    pub fn new(config: Option<PunishMisbehaviorConfig>) -> Self {
        Self { config, ..Default::default() }
    }

    /// Records one dispute for `(upstream, method)`. May cordon.
    pub fn record_dispute(&self, upstream: &UpstreamId, method: &str) {
        let Some(config) = &self.config else { return };
        let now = Instant::now();
        let key = (upstream.clone(), method.to_owned());
        let mut entry = self.disputes.entry(key).or_default();
        entry.push_back(now);
        while entry
            .front()
            .is_some_and(|at| now.duration_since(*at) > config.dispute_window)
        {
            entry.pop_front();
        }
        if entry.len() >= config.dispute_threshold as usize {
            warn!(
                target: "failsafe::punish",
                upstream = %upstream,
                method,
                disputes = entry.len(),
                penalty = ?config.sit_out_penalty,
                "cordoning misbehaving upstream"
            );
            entry.clear();
            self.cordoned_until.insert(upstream.clone(), now + config.sit_out_penalty);
        }
    }

    /// Returns `true` while the upstream is sitting out.
    pub fn is_cordoned(&self, upstream: &UpstreamId) -> bool {
        let Some(until) = self.cordoned_until.get(upstream).map(|entry| *entry) else {
            return false
        };
        if Instant::now() >= until {
            self.cordoned_until.remove(upstream);
            return false
        }
        true
    }

    /// Disputes currently accrued for `(upstream, method)`.
    pub fn dispute_count(&self, upstream: &UpstreamId, method: &str) -> usize {
        self.disputes
            .get(&(upstream.clone(), method.to_owned()))
            .map_or(0, |entry| entry.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> PunishMisbehaviorConfig {
        PunishMisbehaviorConfig {
            dispute_threshold: 3,
            dispute_window: Duration::from_secs(600),
            sit_out_penalty: Duration::from_secs(300),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cordons_after_threshold() {
        let tracker = MisbehaviorTracker::new(Some(config()));
        let upstream = UpstreamId::new("bad");

        tracker.record_dispute(&upstream, "eth_call");
        tracker.record_dispute(&upstream, "eth_call");
        assert!(!tracker.is_cordoned(&upstream));
        assert_eq!(tracker.dispute_count(&upstream, "eth_call"), 2);

        tracker.record_dispute(&upstream, "eth_call");
        assert!(tracker.is_cordoned(&upstream));

        // penalty expires
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(!tracker.is_cordoned(&upstream));
    }

    #[tokio::test(start_paused = true)]
    async fn window_prunes_old_disputes() {
        let tracker = MisbehaviorTracker::new(Some(config()));
        let upstream = UpstreamId::new("flaky");

        tracker.record_dispute(&upstream, "eth_call");
        tokio::time::sleep(Duration::from_secs(601)).await;
        tracker.record_dispute(&upstream, "eth_call");
        tracker.record_dispute(&upstream, "eth_call");
        // the first dispute rotated out of the window
        assert!(!tracker.is_cordoned(&upstream));
    }

    #[tokio::test]
    async fn counters_are_per_method() {
        let tracker = MisbehaviorTracker::new(Some(config()));
        let upstream = UpstreamId::new("bad");
        tracker.record_dispute(&upstream, "eth_call");
        tracker.record_dispute(&upstream, "eth_getLogs");
        assert_eq!(tracker.dispute_count(&upstream, "eth_call"), 1);
        assert_eq!(tracker.dispute_count(&upstream, "eth_getLogs"), 1);
    }

    #[test]
    fn disabled_without_config() {
        let tracker = MisbehaviorTracker::new(None);
        let upstream = UpstreamId::new("any");
        tracker.record_dispute(&upstream, "eth_call");
        assert_eq!(tracker.dispute_count(&upstream, "eth_call"), 0);
        assert!(!tracker.is_cordoned(&upstream));
    }
}
