use crate::ScoreMultiplierConfig;
use manifold_primitives::{PatternSet, UpstreamId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which pool an upstream belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamGroup {
    /// Preferred upstreams, used while healthy.
    #[default]
    Default,
    /// Promoted only when too few default upstreams are healthy.
    Fallback,
}

/// How much chain history the node behind an endpoint retains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Full history.
    #[default]
    Archive,
    /// Recent blocks only; see `max_available_recent_blocks`.
    Full,
}

/// Configuration of a single upstream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Unique id within the project.
    pub id: UpstreamId,
    /// JSON-RPC endpoint URL.
    pub endpoint: String,
    /// Selection pool.
    pub group: UpstreamGroup,
    /// History retention of the backing node.
    pub node_type: NodeType,
    /// For `full` nodes: how many recent blocks are queryable.
    ///
    /// Default: 128
    pub max_available_recent_blocks: Option<u64>,
    /// Vendor-specific behavior.
    pub vendor: VendorConfig,
    /// Methods explicitly served. When set and `ignore_methods` was left
    /// untouched, everything else is ignored.
    pub allow_methods: PatternSet,
    /// Methods never sent to this upstream.
    pub ignore_methods: PatternSet,
    /// Cache methods that answered "method not found" as unsupported.
    pub auto_ignore_unsupported_methods: bool,
    /// Named rate limit budget shared with other referents.
    pub rate_limit_budget: Option<String>,
    /// Outbound JSON-RPC framing options.
    pub json_rpc: JsonRpcOptions,
    /// Circuit breaker tuning.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Chain state poller tuning.
    pub poller: PollerConfig,
    /// Scoring weights used when ranking this upstream.
    pub score_multipliers: ScoreMultiplierConfig,
    /// Enable gzip on outbound requests.
    pub compression: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            id: UpstreamId::new(""),
            endpoint: String::new(),
            group: UpstreamGroup::Default,
            node_type: NodeType::Archive,
            max_available_recent_blocks: None,
            vendor: VendorConfig::default(),
            allow_methods: PatternSet::default(),
            ignore_methods: PatternSet::default(),
            auto_ignore_unsupported_methods: true,
            rate_limit_budget: None,
            json_rpc: JsonRpcOptions::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            poller: PollerConfig::default(),
            score_multipliers: ScoreMultiplierConfig::default(),
            compression: true,
        }
    }
}

impl UpstreamConfig {
    /// Creates a config with the given id and endpoint and defaults for the
    /// rest.
    pub fn new(id: impl Into<UpstreamId>, endpoint: impl Into<String>) -> Self {
        Self { id: id.into(), endpoint: endpoint.into(), ..Default::default() }
    }

    /// Applies per-upstream defaulting rules.
    pub(crate) fn apply_defaults(&mut self) {
        if !self.allow_methods.is_empty() && self.ignore_methods.is_empty() {
            self.ignore_methods = PatternSet::match_all();
        }
        if self.node_type == NodeType::Full && self.max_available_recent_blocks.is_none() {
            self.max_available_recent_blocks = Some(128);
        }
    }
}

/// Vendor-specific quirks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VendorConfig {
    /// Vendor name, informational.
    pub name: Option<String>,
    /// Extra headers injected into every request.
    pub headers: Vec<(String, String)>,
    /// RPC error codes this vendor emits for transient conditions; treated
    /// as retryable server errors.
    pub retryable_codes: Vec<i64>,
    /// Query parameter appended to the endpoint URL, e.g. an API key.
    pub url_query: Option<(String, String)>,
}

/// Outbound JSON-RPC framing options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JsonRpcOptions {
    /// Whether outbound calls may be coalesced into wire batches.
    pub supports_batch: bool,
    /// Maximum calls per batch.
    pub batch_max_size: usize,
    /// Window during which calls wait to be coalesced.
    #[serde(with = "humantime_serde")]
    pub batch_max_wait: Duration,
    /// Per-attempt HTTP timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for JsonRpcOptions {
    fn default() -> Self {
        Self {
            supports_batch: false,
            batch_max_size: 10,
            batch_max_wait: Duration::from_millis(50),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the sample window that opens the breaker.
    pub failure_ratio: f64,
    /// Outcomes tracked in the rolling sample window.
    pub sample_window: usize,
    /// Minimum outcomes before the ratio is meaningful.
    pub min_samples: usize,
    /// Time in `open` before a half-open probe is admitted.
    ///
    /// Default: 5m
    #[serde(with = "humantime_serde")]
    pub half_open_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.8,
            sample_window: 100,
            min_samples: 10,
            half_open_after: Duration::from_secs(300),
        }
    }
}

/// Chain state poller tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollerConfig {
    /// Poll interval for the latest block number.
    ///
    /// Default: 30s
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Blocks subtracted from the latest block as a conservative finalized
    /// estimate when the upstream cannot serve the `finalized` tag.
    ///
    /// Default: 1024
    pub fallback_finality_depth: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), fallback_finality_depth: 1024 }
    }
}
