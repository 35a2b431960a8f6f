use serde::{Deserialize, Serialize};

/// Weights applied to normalized metric terms when scoring an upstream.
///
/// Error rate, latency, throttle rate and the lag terms are costs (higher is
/// worse); total requests is a soft preference for proven upstreams. Lower
/// scores rank better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoreMultiplierConfig {
    /// Weight of the windowed error rate.
    pub error_rate: f64,
    /// Weight of the p90 latency.
    pub p90_latency: f64,
    /// Weight of the throttled-response rate.
    pub throttled_rate: f64,
    /// Weight of the block-head lag behind the best upstream.
    pub block_head_lag: f64,
    /// Weight of the total request count preference term.
    pub total_requests: f64,
    /// Weight of the finalization lag.
    pub finalization_lag: f64,
    /// Multiplier applied to the final sum.
    pub overall: f64,
}

impl Default for ScoreMultiplierConfig {
    fn default() -> Self {
        Self {
            error_rate: 8.0,
            p90_latency: 4.0,
            throttled_rate: 3.0,
            block_head_lag: 2.0,
            total_requests: 1.0,
            finalization_lag: 1.0,
            overall: 1.0,
        }
    }
}
