//! Upstream selection.
//!
//! The selector ranks a network's upstreams by score and passes them through
//! the selection policy, a pure function of the upstreams' config and
//! metrics. Policy output is cached between evaluation intervals; excluded
//! upstreams can be periodically resampled so their metrics recover.

use manifold_config::{SelectionPolicyConfig, UpstreamGroup};
use manifold_failsafe::MisbehaviorTracker;
use manifold_metrics::{rank, MetricsSnapshot, MetricsTracker, TrackerKey};
use manifold_primitives::{NetworkId, RequestDirectives, UpstreamId};
use manifold_upstream::{BreakerSnapshot, Upstream};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tokio::time::Instant;
use tracing::{debug, trace};

/// One upstream as seen by a selection policy.
#[derive(Debug, Clone)]
pub struct PolicyUpstream {
    /// The upstream id.
    pub id: UpstreamId,
    /// Selection pool the upstream belongs to.
    pub group: UpstreamGroup,
    /// Health snapshot at evaluation time.
    pub metrics: MetricsSnapshot,
}

/// Input handed to a selection policy.
#[derive(Debug)]
pub struct PolicyInput<'a> {
    /// Method under evaluation, when evaluating per method.
    pub method: Option<&'a str>,
    /// All of the network's upstreams with their snapshots.
    pub upstreams: &'a [PolicyUpstream],
}

/// The user-pluggable selection policy seam.
///
/// Implementations must be pure functions of their input so selector output
/// stays stable under identical metric snapshots.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    /// Returns the ids allowed to serve requests, best knowledge first.
    fn select(&self, input: &PolicyInput<'_>) -> Vec<UpstreamId>;
}

/// The default heuristic.
///
/// Healthy `default`-group upstreams (error rate below 0.7, head lag below
/// 10 blocks) serve alone; if fewer than the threshold are healthy, healthy
/// `fallback` upstreams are promoted; if nothing is healthy the full set is
/// returned and the retry policies deal with the fallout.
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    /// Healthy default-group upstreams required before fallbacks stay out.
    pub min_healthy_threshold: usize,
}

const MAX_HEALTHY_ERROR_RATE: f64 = 0.7;
const MAX_HEALTHY_HEAD_LAG: u64 = 10;

fn is_healthy(snapshot: &MetricsSnapshot) -> bool {
    snapshot.error_rate < MAX_HEALTHY_ERROR_RATE && snapshot.block_head_lag < MAX_HEALTHY_HEAD_LAG
}

impl SelectionPolicy for DefaultPolicy {
    fn select(&self, input: &PolicyInput<'_>) -> Vec<UpstreamId> {
        let healthy_defaults: Vec<UpstreamId> = input
            .upstreams
            .iter()
            .filter(|u| u.group == UpstreamGroup::Default && is_healthy(&u.metrics))
            .map(|u| u.id.clone())
            .collect();

        if healthy_defaults.len() >= self.min_healthy_threshold {
            return healthy_defaults
        }

        let mut promoted = healthy_defaults;
        promoted.extend(
            input
                .upstreams
                .iter()
                .filter(|u| u.group == UpstreamGroup::Fallback && is_healthy(&u.metrics))
                .map(|u| u.id.clone()),
        );

        if promoted.is_empty() {
            return input.upstreams.iter().map(|u| u.id.clone()).collect()
        }
        promoted
    }
}

#[derive(Debug)]
struct CachedEval {
    allowed: HashSet<UpstreamId>,
    at: Instant,
}

#[derive(Debug)]
struct ResampleState {
    window_started: Instant,
    admitted: u32,
}

/// Ranks and filters a network's upstreams per request.
#[derive(Debug)]
pub struct Selector {
    network: NetworkId,
    upstreams: Vec<Arc<Upstream>>,
    tracker: Arc<MetricsTracker>,
    punisher: Arc<MisbehaviorTracker>,
    policy: Option<Arc<dyn SelectionPolicy>>,
    config: SelectionPolicyConfig,
    evals: Mutex<HashMap<String, CachedEval>>,
    resamples: Mutex<HashMap<UpstreamId, ResampleState>>,
}

impl Selector {
    /// Creates the selector for one network. `policy` of `None` disables
    /// policy filtering; ranking and cordon checks still apply.
    pub fn new(
        network: NetworkId,
        upstreams: Vec<Arc<Upstream>>,
        tracker: Arc<MetricsTracker>,
        punisher: Arc<MisbehaviorTracker>,
        policy: Option<Arc<dyn SelectionPolicy>>,
        config: SelectionPolicyConfig,
    ) -> Self {
        Self {
            network,
            upstreams,
            tracker,
            punisher,
            policy,
            config,
            evals: Mutex::new(HashMap::new()),
            resamples: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the candidates for a request, best first.
    pub fn select(&self, method: &str, directives: &RequestDirectives) -> Vec<Arc<Upstream>> {
        let allowed = self.policy_allowed(method);

        let ranked = rank(self.upstreams.iter().map(|upstream| {
            (
                upstream.id().clone(),
                self.snapshot(upstream.id(), method),
                upstream.config().score_multipliers.clone(),
            )
        }));

        let by_id: HashMap<&UpstreamId, &Arc<Upstream>> =
            self.upstreams.iter().map(|u| (u.id(), u)).collect();

        let mut candidates = Vec::with_capacity(ranked.len());
        let mut resampled = Vec::new();
        for entry in &ranked {
            let Some(upstream) = by_id.get(&entry.upstream).copied() else { continue };
            if !directives.allows_upstream(entry.upstream.as_str()) {
                continue
            }
            if !upstream.supports(method) {
                continue
            }
            if self.punisher.is_cordoned(&entry.upstream) {
                trace!(
                    target: "network::selector",
                    network = %self.network,
                    upstream = %entry.upstream,
                    "skipping cordoned upstream"
                );
                continue
            }
            if upstream.breaker().snapshot() == BreakerSnapshot::Open {
                continue
            }
            match &allowed {
                Some(set) if !set.contains(&entry.upstream) => {
                    if self.admit_resample(&entry.upstream) {
                        resampled.push(Arc::clone(upstream));
                    }
                }
                _ => candidates.push(Arc::clone(upstream)),
            }
        }

        // resampled upstreams go to the back: they serve to refresh metrics,
        // not to carry traffic
        candidates.extend(resampled);
        candidates
    }

    fn snapshot(&self, upstream: &UpstreamId, method: &str) -> MetricsSnapshot {
        if self.config.eval_per_method {
            self.tracker.snapshot(&TrackerKey {
                upstream: upstream.clone(),
                network: self.network.clone(),
                method: method.to_owned(),
            })
        } else {
            self.tracker.snapshot_upstream(upstream, &self.network)
        }
    }

    /// Evaluates the policy, reusing the cached result within the eval
    /// interval. Returns `None` when no policy is installed.
    fn policy_allowed(&self, method: &str) -> Option<HashSet<UpstreamId>> {
        let policy = self.policy.as_ref()?;
        let eval_key = if self.config.eval_per_method { method.to_owned() } else { String::new() };

        let mut evals = self.evals.lock();
        if let Some(cached) = evals.get(&eval_key) {
            if cached.at.elapsed() < self.config.eval_interval {
                return Some(cached.allowed.clone())
            }
        }

        let snapshots: Vec<PolicyUpstream> = self
            .upstreams
            .iter()
            .map(|upstream| PolicyUpstream {
                id: upstream.id().clone(),
                group: upstream.config().group,
                metrics: self.snapshot(upstream.id(), method),
            })
            .collect();
        let input = PolicyInput {
            method: self.config.eval_per_method.then_some(method),
            upstreams: &snapshots,
        };
        let allowed: HashSet<UpstreamId> = policy.select(&input).into_iter().collect();

        debug!(
            target: "network::selector",
            network = %self.network,
            method = %eval_key,
            allowed = allowed.len(),
            total = self.upstreams.len(),
            "re-evaluated selection policy"
        );
        evals.insert(eval_key, CachedEval { allowed: allowed.clone(), at: Instant::now() });
        Some(allowed)
    }

    /// Admission control for policy-excluded upstreams: up to
    /// `resample_count` requests per `resample_interval`.
    fn admit_resample(&self, upstream: &UpstreamId) -> bool {
        if !self.config.resample_excluded {
            return false
        }
        let mut resamples = self.resamples.lock();
        let state = resamples
            .entry(upstream.clone())
            .or_insert_with(|| ResampleState { window_started: Instant::now(), admitted: 0 });
        if state.window_started.elapsed() >= self.config.resample_interval {
            state.window_started = Instant::now();
            state.admitted = 0;
        }
        if state.admitted < self.config.resample_count {
            state.admitted += 1;
            return true
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_config::UpstreamConfig;
    use manifold_primitives::{ErrorKind, Pattern};
    use manifold_upstream::{HttpTransport, JsonRpcTransport};
    use std::time::Duration;

    fn upstream(id: &str, group: UpstreamGroup) -> Arc<Upstream> {
        let mut config = UpstreamConfig::new(id, "http://unused.example");
        config.group = group;
        let transport: Arc<dyn JsonRpcTransport> =
            Arc::new(HttpTransport::new(&config).unwrap());
        Arc::new(Upstream::with_transport(config, transport, None))
    }

    fn selector(
        upstreams: Vec<Arc<Upstream>>,
        tracker: Arc<MetricsTracker>,
        policy: Option<Arc<dyn SelectionPolicy>>,
        config: SelectionPolicyConfig,
    ) -> Selector {
        Selector::new(
            NetworkId::new("evm:1"),
            upstreams,
            tracker,
            Arc::new(MisbehaviorTracker::new(None)),
            policy,
            config,
        )
    }

    fn record_errors(tracker: &MetricsTracker, upstream: &str, errors: u64, successes: u64) {
        let key = TrackerKey {
            upstream: UpstreamId::new(upstream),
            network: NetworkId::new("evm:1"),
            method: "eth_call".to_owned(),
        };
        for _ in 0..errors {
            tracker.record_error(&key, ErrorKind::UpstreamServerError);
        }
        for _ in 0..successes {
            tracker.record_success(&key, Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn ranks_by_score() {
        let tracker = Arc::new(MetricsTracker::new());
        record_errors(&tracker, "bad", 8, 2);
        record_errors(&tracker, "good", 0, 10);

        let selector = selector(
            vec![upstream("bad", UpstreamGroup::Default), upstream("good", UpstreamGroup::Default)],
            tracker,
            None,
            SelectionPolicyConfig::default(),
        );
        let candidates = selector.select("eth_call", &RequestDirectives::default());
        assert_eq!(candidates[0].id(), &UpstreamId::new("good"));
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn default_policy_promotes_fallback() {
        let tracker = Arc::new(MetricsTracker::new());
        // both defaults are above the error threshold, the fallback is clean
        record_errors(&tracker, "d1", 9, 1);
        record_errors(&tracker, "d2", 8, 2);
        record_errors(&tracker, "fb", 0, 10);

        let selector = selector(
            vec![
                upstream("d1", UpstreamGroup::Default),
                upstream("d2", UpstreamGroup::Default),
                upstream("fb", UpstreamGroup::Fallback),
            ],
            tracker,
            Some(Arc::new(DefaultPolicy { min_healthy_threshold: 1 })),
            SelectionPolicyConfig { resample_excluded: false, ..Default::default() },
        );

        let candidates = selector.select("eth_call", &RequestDirectives::default());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id(), &UpstreamId::new("fb"));
    }

    #[tokio::test]
    async fn nothing_healthy_returns_full_set() {
        let tracker = Arc::new(MetricsTracker::new());
        record_errors(&tracker, "d1", 9, 1);
        record_errors(&tracker, "fb", 9, 1);

        let selector = selector(
            vec![upstream("d1", UpstreamGroup::Default), upstream("fb", UpstreamGroup::Fallback)],
            tracker,
            Some(Arc::new(DefaultPolicy { min_healthy_threshold: 1 })),
            SelectionPolicyConfig { resample_excluded: false, ..Default::default() },
        );
        let candidates = selector.select("eth_call", &RequestDirectives::default());
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn directive_pins_upstreams() {
        let tracker = Arc::new(MetricsTracker::new());
        let selector = selector(
            vec![upstream("a-1", UpstreamGroup::Default), upstream("b-1", UpstreamGroup::Default)],
            tracker,
            None,
            SelectionPolicyConfig::default(),
        );
        let directives = RequestDirectives {
            use_upstream: Some(Pattern::new("a-*")),
            ..Default::default()
        };
        let candidates = selector.select("eth_call", &directives);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id(), &UpstreamId::new("a-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn excluded_upstreams_are_resampled() {
        let tracker = Arc::new(MetricsTracker::new());
        record_errors(&tracker, "bad", 10, 0);
        record_errors(&tracker, "good", 0, 10);

        let config = SelectionPolicyConfig {
            resample_excluded: true,
            resample_count: 2,
            resample_interval: Duration::from_secs(300),
            ..Default::default()
        };
        let selector = selector(
            vec![upstream("bad", UpstreamGroup::Default), upstream("good", UpstreamGroup::Default)],
            tracker,
            Some(Arc::new(DefaultPolicy { min_healthy_threshold: 1 })),
            config,
        );

        // two admissions per window, at the back of the list
        for _ in 0..2 {
            let candidates = selector.select("eth_call", &RequestDirectives::default());
            assert_eq!(candidates.len(), 2);
            assert_eq!(candidates.last().unwrap().id(), &UpstreamId::new("bad"));
        }
        let candidates = selector.select("eth_call", &RequestDirectives::default());
        assert_eq!(candidates.len(), 1);

        // a new window re-admits
        tokio::time::sleep(Duration::from_secs(301)).await;
        let candidates = selector.select("eth_call", &RequestDirectives::default());
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn policy_eval_is_cached_between_intervals() {
        #[derive(Debug)]
        struct CountingPolicy(std::sync::atomic::AtomicU64);
        impl SelectionPolicy for CountingPolicy {
            fn select(&self, input: &PolicyInput<'_>) -> Vec<UpstreamId> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                input.upstreams.iter().map(|u| u.id.clone()).collect()
            }
        }

        let policy = Arc::new(CountingPolicy(std::sync::atomic::AtomicU64::new(0)));
        let selector = selector(
            vec![upstream("a", UpstreamGroup::Default)],
            Arc::new(MetricsTracker::new()),
            Some(policy.clone()),
            SelectionPolicyConfig::default(),
        );

        for _ in 0..5 {
            selector.select("eth_call", &RequestDirectives::default());
        }
        assert_eq!(policy.0.load(std::sync::atomic::Ordering::Acquire), 1);
    }
}
