use manifold_primitives::{Finality, NetworkId, Pattern, UpstreamId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of one logical network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Network id, e.g. `evm:1`.
    pub id: NetworkId,
    /// Ids of the upstreams serving this network.
    pub upstreams: Vec<UpstreamId>,
    /// Failsafe rules, matched in declaration order per request.
    pub failsafe: Vec<FailsafeRuleConfig>,
    /// Consensus settings. Requires at least two upstreams.
    pub consensus: Option<ConsensusConfig>,
    /// Selection policy evaluation settings.
    pub selection_policy: Option<SelectionPolicyConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: NetworkId::new(""),
            upstreams: Vec::new(),
            failsafe: vec![FailsafeRuleConfig::default()],
            consensus: None,
            selection_policy: None,
        }
    }
}

/// One failsafe rule: a match section plus the policy stages to compose.
///
/// Pipeline order, outermost first: timeout, retry, hedge, circuit breaker
/// (owned by the upstream), consensus. Absent stages are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FailsafeRuleConfig {
    /// Method glob this rule applies to.
    pub match_method: Pattern,
    /// Finality states this rule applies to. Empty means all.
    pub match_finality: Vec<Finality>,
    /// Whole-request deadline.
    pub timeout: Option<TimeoutConfig>,
    /// Retry stage.
    pub retry: Option<RetryConfig>,
    /// Hedge stage.
    pub hedge: Option<HedgeConfig>,
}

impl Default for FailsafeRuleConfig {
    fn default() -> Self {
        Self {
            match_method: Pattern::new("*"),
            match_finality: Vec::new(),
            timeout: Some(TimeoutConfig::default()),
            retry: Some(RetryConfig::default()),
            hedge: None,
        }
    }
}

impl FailsafeRuleConfig {
    /// Returns `true` if this rule matches the method and finality.
    pub fn matches(&self, method: &str, finality: Finality) -> bool {
        self.match_method.matches(method) &&
            (self.match_finality.is_empty() || self.match_finality.contains(&finality))
    }
}

/// Whole-request deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Deadline relative to request entry.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { duration: Duration::from_secs(15) }
    }
}

/// Retry stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts, including the first.
    ///
    /// Default: 3
    pub max_attempts: u32,
    /// Base delay before the second attempt.
    ///
    /// Default: 100ms
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Exponential backoff factor.
    ///
    /// Default: 1.2
    pub backoff_factor: f64,
    /// Upper bound on the computed backoff delay.
    ///
    /// Default: 3s
    #[serde(with = "humantime_serde")]
    pub backoff_max_delay: Duration,
    /// Uniform jitter added to every delay.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff_factor: 1.2,
            backoff_max_delay: Duration::from_secs(3),
            jitter: Duration::ZERO,
        }
    }
}

/// Hedge stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HedgeConfig {
    /// Fixed delay before the hedge fires. When unset, the observed
    /// `quantile` latency of recent successes is used instead.
    #[serde(default, with = "humantime_serde::option")]
    pub delay: Option<Duration>,
    /// Latency quantile driving the dynamic delay, e.g. `0.9`.
    pub quantile: Option<f64>,
    /// Lower clamp on the dynamic delay.
    ///
    /// Default: 100ms
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    /// Upper clamp on the dynamic delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Maximum hedges fired on top of the primary attempt.
    pub max_count: u32,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            delay: None,
            quantile: Some(0.9),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3600),
            max_count: 1,
        }
    }
}

/// What the consensus engine does when no group reaches the agreement
/// threshold, or when too few participants are healthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisputeBehavior {
    /// Surface a dispute error.
    #[default]
    ReturnError,
    /// Return the largest group's representative response.
    AcceptMostCommonValidResult,
    /// Return the block-head leader's response, falling back to the most
    /// common result on ties.
    PreferBlockHeadLeader,
    /// Return the block-head leader's response or error.
    OnlyBlockHeadLeader,
}

/// Consensus engine configuration. Network level only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsensusConfig {
    /// Upstreams fanned out to per round.
    pub required_participants: usize,
    /// Identical responses required for agreement.
    pub agreement_threshold: usize,
    /// Behavior when no group reaches the threshold.
    pub dispute_behavior: DisputeBehavior,
    /// Behavior when fewer than `required_participants` are healthy.
    pub low_participants_behavior: DisputeBehavior,
    /// Methods participating in consensus. Empty means all.
    pub match_method: Option<Pattern>,
    /// Punishment for upstreams that disagree with the winning group.
    pub punish_misbehavior: Option<PunishMisbehaviorConfig>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            required_participants: 2,
            agreement_threshold: 2,
            dispute_behavior: DisputeBehavior::ReturnError,
            low_participants_behavior: DisputeBehavior::AcceptMostCommonValidResult,
            match_method: None,
            punish_misbehavior: None,
        }
    }
}

/// Dispute accrual and cordoning parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PunishMisbehaviorConfig {
    /// Disputes within `dispute_window` that trigger a cordon.
    pub dispute_threshold: u32,
    /// Window over which disputes accrue.
    #[serde(with = "humantime_serde")]
    pub dispute_window: Duration,
    /// How long a cordoned upstream is excluded from selection.
    #[serde(with = "humantime_serde")]
    pub sit_out_penalty: Duration,
}

impl Default for PunishMisbehaviorConfig {
    fn default() -> Self {
        Self {
            dispute_threshold: 3,
            dispute_window: Duration::from_secs(600),
            sit_out_penalty: Duration::from_secs(300),
        }
    }
}

/// Selection policy evaluation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectionPolicyConfig {
    /// How often the policy function is re-evaluated.
    ///
    /// Default: 1m
    #[serde(with = "humantime_serde")]
    pub eval_interval: Duration,
    /// Evaluate per (network, method) instead of per network.
    pub eval_per_method: bool,
    /// Healthy default-group upstreams required before fallbacks are left
    /// out of the candidate set.
    pub min_healthy_threshold: usize,
    /// Re-admit excluded upstreams periodically so their metrics can
    /// recover.
    pub resample_excluded: bool,
    /// Requests admitted per resample round.
    ///
    /// Default: 10
    pub resample_count: u32,
    /// Interval between resample rounds.
    ///
    /// Default: 5m
    #[serde(with = "humantime_serde")]
    pub resample_interval: Duration,
}

impl Default for SelectionPolicyConfig {
    fn default() -> Self {
        Self {
            eval_interval: Duration::from_secs(60),
            eval_per_method: false,
            min_healthy_threshold: 1,
            resample_excluded: true,
            resample_count: 10,
            resample_interval: Duration::from_secs(300),
        }
    }
}
