use manifold_primitives::Pattern;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A named token-bucket budget. Budgets are process-wide and shared by every
/// entity referencing the name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitBudgetConfig {
    /// Budget name.
    pub name: String,
    /// Rules, first match by method glob wins.
    pub rules: Vec<BudgetRuleConfig>,
    /// Optional auto-tuning of rule capacities.
    pub auto_tune: Option<AutoTuneConfig>,
}

/// One budget rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BudgetRuleConfig {
    /// Methods this rule governs.
    pub method: Pattern,
    /// Tokens issued per period.
    pub max_count: u64,
    /// Window length.
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// How long a caller may wait for a token before failing.
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,
}

impl Default for BudgetRuleConfig {
    fn default() -> Self {
        Self {
            method: Pattern::new("*"),
            max_count: 100,
            period: Duration::from_secs(1),
            wait_time: Duration::ZERO,
        }
    }
}

/// Auto-tune parameters: capacities grow while throttle feedback stays below
/// the threshold and shrink when it rises above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoTuneConfig {
    /// How often capacities are adjusted.
    ///
    /// Default: 1m
    #[serde(with = "humantime_serde")]
    pub adjustment_period: Duration,
    /// Throttled-response rate above which capacity shrinks.
    ///
    /// Default: 0.1
    pub error_rate_threshold: f64,
    /// Growth factor applied below the threshold.
    ///
    /// Default: 1.05
    pub increase_factor: f64,
    /// Shrink factor applied above the threshold.
    ///
    /// Default: 0.95
    pub decrease_factor: f64,
    /// Hard cap on any tuned capacity.
    ///
    /// Default: 100k
    pub max_budget: u64,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        Self {
            adjustment_period: Duration::from_secs(60),
            error_rate_threshold: 0.1,
            increase_factor: 1.05,
            decrease_factor: 0.95,
            max_budget: 100_000,
        }
    }
}
