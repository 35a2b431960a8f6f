use manifold_primitives::{Finality, Pattern};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache configuration: connectors plus policies matched in declaration
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Storage connectors addressable from policies.
    pub connectors: Vec<ConnectorConfig>,
    /// Policies; for any `(method, finality)` the first match wins.
    pub policies: Vec<CachePolicyConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { connectors: vec![ConnectorConfig::default()], policies: Vec::new() }
    }
}

/// Storage driver behind a connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorDriver {
    /// Bounded in-process LRU.
    #[default]
    Memory,
}

/// One addressable storage connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Connector id referenced by policies.
    pub id: String,
    /// Backing driver.
    pub driver: ConnectorDriver,
    /// Maximum items held by the memory driver.
    ///
    /// Default: 100k
    pub max_items: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self { id: "memory".to_owned(), driver: ConnectorDriver::Memory, max_items: 100_000 }
    }
}

/// One cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CachePolicyConfig {
    /// Method glob.
    pub method: Pattern,
    /// Network glob.
    pub network: Pattern,
    /// Finality states this policy covers.
    pub finality: Vec<Finality>,
    /// Entry time-to-live. `None` means no expiry.
    #[serde(default, with = "humantime_serde::option")]
    pub ttl: Option<Duration>,
    /// Smallest serialized item the policy stores, in bytes.
    pub min_item_size: usize,
    /// Largest serialized item the policy stores, in bytes.
    pub max_item_size: usize,
    /// Connector storing matched entries.
    pub connector: String,
    /// Whether symbolic block tags may be resolved to numbers when
    /// fingerprinting requests matched by this policy.
    pub resolve_block_tags: bool,
}

impl Default for CachePolicyConfig {
    fn default() -> Self {
        Self {
            method: Pattern::new("*"),
            network: Pattern::new("*"),
            finality: vec![Finality::Finalized],
            ttl: None,
            min_item_size: 0,
            max_item_size: 1024 * 1024,
            connector: "memory".to_owned(),
            resolve_block_tags: false,
        }
    }
}
