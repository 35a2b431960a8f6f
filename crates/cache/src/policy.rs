use manifold_config::CachePolicyConfig;
use manifold_primitives::{Finality, NetworkId};

/// A compiled cache policy.
///
/// Policies are evaluated in declaration order; for any `(method, network,
/// finality)` the first match wins, so the order in configuration is part of
/// the contract.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    config: CachePolicyConfig,
}

impl CachePolicy {
    /// Wraps a policy config.
    pub fn new(config: CachePolicyConfig) -> Self {
        Self { config }
    }

    /// The underlying configuration.
    pub fn config(&self) -> &CachePolicyConfig {
        &self.config
    }

    /// Returns `true` if this policy covers the method and network at all,
    /// regardless of finality. Used on the read path, where finality is only
    /// known once an entry is found.
    pub fn matches_request(&self, network: &NetworkId, method: &str) -> bool {
        self.config.method.matches(method) && self.config.network.matches(network.as_str())
    }

    /// Returns `true` if this policy covers the finality state.
    pub fn matches_finality(&self, finality: Finality) -> bool {
        self.config.finality.is_empty() || self.config.finality.contains(&finality)
    }

    /// Returns `true` if a serialized item of `size` bytes is storable.
    pub fn accepts_size(&self, size: usize) -> bool {
        size >= self.config.min_item_size && size <= self.config.max_item_size
    }

    /// Whether fingerprinting may resolve symbolic block tags for requests
    /// matched by this policy.
    pub fn resolves_block_tags(&self) -> bool {
        self.config.resolve_block_tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_primitives::Pattern;

    #[test]
    fn matching() {
        let policy = CachePolicy::new(CachePolicyConfig {
            method: Pattern::new("eth_get*"),
            network: Pattern::new("evm:*"),
            finality: vec![Finality::Finalized, Finality::Unknown],
            ..Default::default()
        });

        assert!(policy.matches_request(&NetworkId::new("evm:1"), "eth_getLogs"));
        assert!(!policy.matches_request(&NetworkId::new("evm:1"), "net_version"));
        assert!(!policy.matches_request(&NetworkId::new("solana:1"), "eth_getLogs"));
        assert!(policy.matches_finality(Finality::Finalized));
        assert!(!policy.matches_finality(Finality::Realtime));
    }

    #[test]
    fn size_bounds() {
        let policy = CachePolicy::new(CachePolicyConfig {
            min_item_size: 10,
            max_item_size: 100,
            ..Default::default()
        });
        assert!(!policy.accepts_size(9));
        assert!(policy.accepts_size(10));
        assert!(policy.accepts_size(100));
        assert!(!policy.accepts_size(101));
    }
}
