use crate::{policy::CachePolicy, store::KVStore, MemoryStore};
use bytes::Bytes;
use manifold_config::{CacheConfig, ConnectorDriver};
use manifold_primitives::{
    canonical_params, BlockRef, BlockTag, BlockTagResolver, Finality, FinalityClass, Fingerprint,
    JsonRpcRequest, JsonRpcResponse, MethodCatalog, NetworkId,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, trace, warn};

/// What the cache stores per key: the response payload plus the finality it
/// was computed with, so the read path can re-check policy coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    /// Finality at write time.
    pub finality: Finality,
    /// The cached response.
    pub response: JsonRpcResponse,
}

/// Addressing for one request, computed once per request.
///
/// The fingerprint doubles as the single-flight key; the storage key is
/// `(network, fingerprint, block ref)`. Both are derived from the same
/// canonical params so tag resolution can never make them disagree.
#[derive(Debug, Clone)]
pub struct CacheKey {
    /// The request fingerprint.
    pub fingerprint: Fingerprint,
    /// Block reference extracted from the canonical params, if any.
    pub block_ref: Option<BlockRef>,
    storage_key: String,
}

/// The finality-scoped response cache.
///
/// Owned by a network; holds the compiled policies, the connector registry
/// and the method catalog driving finality classification.
#[derive(Debug)]
pub struct CacheLayer {
    catalog: Arc<MethodCatalog>,
    policies: Vec<CachePolicy>,
    connectors: HashMap<String, Arc<dyn KVStore>>,
}

impl CacheLayer {
    /// Builds the layer from configuration. Connector construction is
    /// infallible for the in-repo drivers.
    pub fn new(config: &CacheConfig, catalog: Arc<MethodCatalog>) -> Self {
        let connectors = config
            .connectors
            .iter()
            .map(|connector| {
                let store: Arc<dyn KVStore> = match connector.driver {
                    ConnectorDriver::Memory => Arc::new(MemoryStore::new(connector.max_items)),
                };
                (connector.id.clone(), store)
            })
            .collect();
        Self {
            catalog,
            policies: config.policies.iter().cloned().map(CachePolicy::new).collect(),
            connectors,
        }
    }

    /// The method catalog backing this layer.
    pub fn catalog(&self) -> &Arc<MethodCatalog> {
        &self.catalog
    }

    /// Computes the request's cache addressing.
    ///
    /// Symbolic block tags are resolved through `resolver` only when the
    /// first matching policy opted in; otherwise tags stay literal so
    /// distinct tags never alias.
    pub fn key(
        &self,
        network: &NetworkId,
        request: &JsonRpcRequest,
        resolver: Option<&dyn BlockTagResolver>,
    ) -> CacheKey {
        let resolve = resolver.filter(|_| {
            self.policies
                .iter()
                .find(|policy| policy.matches_request(network, &request.method))
                .is_some_and(|policy| policy.resolves_block_tags())
        });
        let canonical = canonical_params(&request.params, resolve);
        let fingerprint = Fingerprint::compute(network, &request.method, &canonical);
        let block_ref = self.catalog.request_block_ref(&request.method, &canonical);
        let block_part =
            block_ref.as_ref().map_or_else(|| "*".to_owned(), ToString::to_string);
        CacheKey {
            fingerprint,
            block_ref,
            storage_key: format!("{network}:{fingerprint}:{block_part}"),
        }
    }

    /// Cache lookup. Policies are probed in declaration order; an entry only
    /// hits if the policy that found it also covers the entry's stored
    /// finality. Backend errors degrade to a miss.
    pub async fn get(
        &self,
        network: &NetworkId,
        request: &JsonRpcRequest,
        key: &CacheKey,
    ) -> Option<JsonRpcResponse> {
        for policy in self.policies.iter().filter(|p| p.matches_request(network, &request.method))
        {
            let Some(store) = self.connectors.get(&policy.config().connector) else { continue };
            let found = match store.get(&key.storage_key).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(
                        target: "cache",
                        key = %key.storage_key,
                        %err,
                        "backend read failed, degrading to miss"
                    );
                    metrics::counter!("manifold_cache_backend_errors_total", "op" => "get")
                        .increment(1);
                    continue
                }
            };
            let Some(bytes) = found else { continue };
            let Ok(entry) = serde_json::from_slice::<CachedEntry>(&bytes) else {
                debug!(target: "cache", key = %key.storage_key, "dropping undecodable entry");
                let _ = store.delete(&key.storage_key).await;
                continue
            };
            if policy.matches_finality(entry.finality) {
                trace!(target: "cache", key = %key.storage_key, finality = %entry.finality, "hit");
                return Some(entry.response)
            }
        }
        None
    }

    /// Best-effort cache write.
    ///
    /// Finality is derived from the method class: static methods are
    /// `finalized`, realtime methods stay `realtime`, block-referencing
    /// methods compare their block against the serving upstream's finalized
    /// block, and hash-keyed methods stay `unknown`. Responses carrying
    /// nothing are not written.
    pub async fn set(
        &self,
        network: &NetworkId,
        request: &JsonRpcRequest,
        key: &CacheKey,
        response: &JsonRpcResponse,
        upstream_finalized_block: Option<u64>,
    ) {
        if !response.is_success() || response.is_empty_result() {
            return
        }

        let finality = self.classify_finality(request, key, response, upstream_finalized_block);
        let entry = CachedEntry { finality, response: response.clone() };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!(target: "cache", %err, "entry serialization failed");
                return
            }
        };

        let Some(policy) = self.policies.iter().find(|policy| {
            policy.matches_request(network, &request.method) &&
                policy.matches_finality(finality) &&
                policy.accepts_size(bytes.len())
        }) else {
            return
        };
        let Some(store) = self.connectors.get(&policy.config().connector) else { return };

        // finalized entries live until evicted unless the policy says
        // otherwise; everything else expires by policy ttl
        let ttl = policy.config().ttl;
        trace!(target: "cache", key = %key.storage_key, finality = %finality, ?ttl, "write");
        if let Err(err) = store.set(&key.storage_key, bytes, ttl).await {
            warn!(target: "cache", key = %key.storage_key, %err, "backend write failed");
            metrics::counter!("manifold_cache_backend_errors_total", "op" => "set").increment(1);
        }
    }

    fn classify_finality(
        &self,
        request: &JsonRpcRequest,
        key: &CacheKey,
        response: &JsonRpcResponse,
        upstream_finalized_block: Option<u64>,
    ) -> Finality {
        let class = self.catalog.finality_class(&request.method);
        match class {
            FinalityClass::Static | FinalityClass::Realtime | FinalityClass::Special => {
                class.default_finality()
            }
            FinalityClass::WithBlock => {
                let referenced = key
                    .block_ref
                    .as_ref()
                    .and_then(BlockRef::as_number)
                    .or_else(|| {
                        response.result.as_ref().and_then(|result| {
                            self.catalog
                                .response_block_ref(&request.method, result)
                                .and_then(|block| block.as_number())
                        })
                    });
                match (referenced, upstream_finalized_block) {
                    (Some(block), Some(finalized)) if block <= finalized => Finality::Finalized,
                    (Some(_), _) => Finality::Unfinalized,
                    (None, _) => Finality::Unknown,
                }
            }
        }
    }
}

/// Resolver view over a concrete chain state, used when a policy allows tag
/// resolution.
#[derive(Debug, Clone, Copy)]
pub struct StateTagResolver {
    /// Latest block of the best upstream.
    pub latest: Option<u64>,
    /// Finalized block of the best upstream.
    pub finalized: Option<u64>,
}

impl BlockTagResolver for StateTagResolver {
    fn resolve(&self, tag: BlockTag) -> Option<u64> {
        match tag {
            BlockTag::Latest => self.latest,
            BlockTag::Finalized | BlockTag::Safe => self.finalized,
            BlockTag::Earliest => Some(0),
            BlockTag::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_config::{CachePolicyConfig, ConnectorConfig};
    use manifold_primitives::Pattern;
    use serde_json::json;
    use std::time::Duration;

    fn layer(policies: Vec<CachePolicyConfig>) -> CacheLayer {
        let config = CacheConfig { connectors: vec![ConnectorConfig::default()], policies };
        CacheLayer::new(&config, Arc::new(MethodCatalog::default()))
    }

    fn network() -> NetworkId {
        NetworkId::new("evm:1")
    }

    #[tokio::test]
    async fn static_method_round_trips_as_finalized() {
        let layer = layer(vec![CachePolicyConfig {
            method: Pattern::new("eth_chainId"),
            finality: vec![Finality::Finalized],
            ..Default::default()
        }]);
        let request = JsonRpcRequest::new(json!(1), "eth_chainId", json!([]));
        let key = layer.key(&network(), &request, None);

        assert!(layer.get(&network(), &request, &key).await.is_none());

        let response = JsonRpcResponse::success(json!(1), json!("0x1"));
        layer.set(&network(), &request, &key, &response, None).await;

        let hit = layer.get(&network(), &request, &key).await.unwrap();
        assert_eq!(hit, response);
    }

    #[tokio::test]
    async fn unmatched_method_is_not_cached() {
        let layer = layer(vec![CachePolicyConfig {
            method: Pattern::new("eth_chainId"),
            ..Default::default()
        }]);
        let request = JsonRpcRequest::new(json!(1), "eth_blockNumber", json!([]));
        let key = layer.key(&network(), &request, None);
        let response = JsonRpcResponse::success(json!(1), json!("0x10"));
        layer.set(&network(), &request, &key, &response, None).await;
        assert!(layer.get(&network(), &request, &key).await.is_none());
    }

    #[tokio::test]
    async fn with_block_finality_split() {
        let layer = layer(vec![CachePolicyConfig {
            method: Pattern::new("eth_getLogs"),
            finality: vec![Finality::Finalized],
            ..Default::default()
        }]);
        let finalized_request = JsonRpcRequest::new(
            json!(1),
            "eth_getLogs",
            json!([{ "fromBlock": "0x1", "toBlock": "0x10" }]),
        );
        let pending_request = JsonRpcRequest::new(
            json!(1),
            "eth_getLogs",
            json!([{ "fromBlock": "0x1", "toBlock": "0x2000" }]),
        );
        let response = JsonRpcResponse::success(json!(1), json!([{"address": "0xabc"}]));

        // upstream finalized block is 0x100: the first request is below it
        let key = layer.key(&network(), &finalized_request, None);
        layer.set(&network(), &finalized_request, &key, &response, Some(0x100)).await;
        assert!(layer.get(&network(), &finalized_request, &key).await.is_some());

        // the second reaches past finality and the policy rejects it
        let key = layer.key(&network(), &pending_request, None);
        layer.set(&network(), &pending_request, &key, &response, Some(0x100)).await;
        assert!(layer.get(&network(), &pending_request, &key).await.is_none());
    }

    #[tokio::test]
    async fn unknown_finality_entries_are_written_with_ttl() {
        let layer = layer(vec![CachePolicyConfig {
            method: Pattern::new("eth_getTransactionReceipt"),
            finality: vec![Finality::Unknown],
            ttl: Some(Duration::from_secs(300)),
            ..Default::default()
        }]);
        let request = JsonRpcRequest::new(
            json!(1),
            "eth_getTransactionReceipt",
            json!([format!("0x{}", "ab".repeat(32))]),
        );
        let key = layer.key(&network(), &request, None);
        let response =
            JsonRpcResponse::success(json!(1), json!({"blockNumber": "0x10", "status": "0x1"}));
        layer.set(&network(), &request, &key, &response, None).await;
        assert!(layer.get(&network(), &request, &key).await.is_some());
    }

    #[tokio::test]
    async fn empty_results_are_not_written() {
        let layer = layer(vec![CachePolicyConfig {
            method: Pattern::new("*"),
            finality: vec![],
            ..Default::default()
        }]);
        let request = JsonRpcRequest::new(json!(1), "eth_getTransactionReceipt", json!(["0xab"]));
        let key = layer.key(&network(), &request, None);
        let response = JsonRpcResponse::success(json!(1), serde_json::Value::Null);
        layer.set(&network(), &request, &key, &response, None).await;
        assert!(layer.get(&network(), &request, &key).await.is_none());
    }

    #[test]
    fn tag_resolution_respects_policy_opt_in() {
        let literal_layer = layer(vec![CachePolicyConfig {
            method: Pattern::new("*"),
            resolve_block_tags: false,
            ..Default::default()
        }]);
        let resolving_layer = layer(vec![CachePolicyConfig {
            method: Pattern::new("*"),
            resolve_block_tags: true,
            ..Default::default()
        }]);
        let resolver = StateTagResolver { latest: Some(0x2000), finalized: Some(0x1f00) };

        let tagged = JsonRpcRequest::new(json!(1), "eth_getBlockByNumber", json!(["latest", false]));
        let numbered =
            JsonRpcRequest::new(json!(1), "eth_getBlockByNumber", json!(["0x2000", false]));

        // without opt-in the tag stays literal and the fingerprints differ
        assert_ne!(
            literal_layer.key(&network(), &tagged, Some(&resolver)).fingerprint,
            literal_layer.key(&network(), &numbered, Some(&resolver)).fingerprint,
        );
        // with opt-in `latest` aliases the concrete number, storage key and all
        let resolved = resolving_layer.key(&network(), &tagged, Some(&resolver));
        let direct = resolving_layer.key(&network(), &numbered, Some(&resolver));
        assert_eq!(resolved.fingerprint, direct.fingerprint);
        assert_eq!(resolved.storage_key, direct.storage_key);
        assert_eq!(resolved.block_ref, Some(BlockRef::Number(0x2000)));
    }
}
