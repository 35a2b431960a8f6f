use crate::selector::Selector;
use manifold_cache::{CacheLayer, SingleFlight, StateTagResolver};
use manifold_failsafe::{ConsensusEngine, FailsafeExecutor, Served};
use manifold_primitives::{
    BlockRef, BlockTag, Finality, FinalityClass, Fingerprint, GatewayError, JsonRpcRequest,
    JsonRpcResponse, NetworkId, RequestDirectives,
};
use manifold_upstream::Upstream;
use std::sync::Arc;
use tracing::{debug, trace};

/// One logical chain served by a set of upstreams.
///
/// Cheap to clone; the inner state is shared.
#[derive(Debug, Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

#[derive(Debug)]
struct NetworkInner {
    id: NetworkId,
    upstreams: Vec<Arc<Upstream>>,
    cache: CacheLayer,
    selector: Selector,
    executor: FailsafeExecutor,
    consensus: Option<ConsensusEngine>,
    single_flight: SingleFlight<Fingerprint, Result<JsonRpcResponse, GatewayError>>,
}

impl Network {
    /// Binds the network's parts together.
    pub fn new(
        id: NetworkId,
        upstreams: Vec<Arc<Upstream>>,
        cache: CacheLayer,
        selector: Selector,
        executor: FailsafeExecutor,
        consensus: Option<ConsensusEngine>,
    ) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                id,
                upstreams,
                cache,
                selector,
                executor,
                consensus,
                single_flight: SingleFlight::new(),
            }),
        }
    }

    /// The network id.
    pub fn id(&self) -> &NetworkId {
        &self.inner.id
    }

    /// The network's upstreams.
    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.inner.upstreams
    }

    /// The request lifecycle: cache lookup, selection, failsafe execution,
    /// cache write.
    ///
    /// Concurrent misses on one fingerprint are deduplicated network-wide;
    /// only the leading request reaches an upstream on the cache path.
    pub async fn forward(
        &self,
        request: &JsonRpcRequest,
        directives: &RequestDirectives,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let this = &self.inner;
        let resolver = self.tag_resolver();
        let key = this.cache.key(&this.id, request, Some(&resolver));

        if !directives.skip_cache {
            if let Some(mut cached) = this.cache.get(&this.id, request, &key).await {
                metrics::counter!("manifold_cache_lookups_total", "network" => this.id.to_string(), "outcome" => "hit")
                    .increment(1);
                trace!(target: "network", network = %this.id, method = %request.method, "cache hit");
                cached.id = request.id.clone();
                return Ok(cached)
            }
            metrics::counter!("manifold_cache_lookups_total", "network" => this.id.to_string(), "outcome" => "miss")
                .increment(1);
        }

        let result = if directives.skip_cache {
            // an explicit cache bypass also opts out of miss deduplication
            self.execute_uncached(request.clone(), directives.clone(), key.clone()).await
        } else {
            let network = self.clone();
            let request = request.clone();
            let directives = directives.clone();
            let flight_key = key.fingerprint;
            let key = key.clone();
            let (result, joined) = this
                .single_flight
                .run(flight_key, move || async move {
                    network.execute_uncached(request, directives, key).await
                })
                .await;
            if joined {
                trace!(target: "network", network = %this.id, "joined in-flight request");
            }
            result
        };

        result.map(|mut response| {
            response.id = request.id.clone();
            response
        })
    }

    /// Runs the non-cached path and commits the winner to the cache.
    async fn execute_uncached(
        &self,
        request: JsonRpcRequest,
        directives: RequestDirectives,
        key: manifold_cache::CacheKey,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let this = &self.inner;
        let candidates = this.selector.select(&request.method, &directives);
        if candidates.is_empty() {
            return Err(GatewayError::new(
                manifold_primitives::ErrorKind::PolicyExcluded,
                format!("no upstream of network {} may serve {}", this.id, request.method),
            ))
        }

        let finality = self.finality_hint(&request, &key);
        let served = match &this.consensus {
            Some(consensus) if consensus.applies_to(&request.method) => {
                this.executor
                    .execute_consensus(&request, finality, consensus, candidates)
                    .await?
            }
            _ => this.executor.execute(&request, finality, &directives, candidates).await?,
        };

        let Served { response, upstream } = served;
        debug!(
            target: "network",
            network = %this.id,
            method = %request.method,
            upstream = %upstream.id(),
            "request served"
        );

        let finalized = upstream.chain_state().finalized_block;
        this.cache.set(&this.id, &request, &key, &response, finalized).await;
        Ok(response)
    }

    /// Resolves symbolic tags against the network's best-known chain state.
    fn tag_resolver(&self) -> StateTagResolver {
        let mut latest = None;
        let mut finalized = None;
        for upstream in &self.inner.upstreams {
            let state = upstream.chain_state();
            latest = latest.max(state.latest_block);
            finalized = finalized.max(state.finalized_block);
        }
        StateTagResolver { latest, finalized }
    }

    /// Finality used for failsafe rule matching, derived before any
    /// upstream is contacted.
    fn finality_hint(&self, request: &JsonRpcRequest, key: &manifold_cache::CacheKey) -> Finality {
        let class = self.inner.cache.catalog().finality_class(&request.method);
        match class {
            FinalityClass::Static | FinalityClass::Realtime | FinalityClass::Special => {
                class.default_finality()
            }
            FinalityClass::WithBlock => match &key.block_ref {
                Some(BlockRef::Number(block)) => {
                    match self.tag_resolver().finalized {
                        Some(finalized) if *block <= finalized => Finality::Finalized,
                        _ => Finality::Unfinalized,
                    }
                }
                Some(BlockRef::Tag(BlockTag::Finalized | BlockTag::Safe | BlockTag::Earliest)) => {
                    Finality::Finalized
                }
                Some(BlockRef::Tag(_)) => Finality::Unfinalized,
                Some(BlockRef::Hash(_)) | None => Finality::Unknown,
            },
        }
    }
}
