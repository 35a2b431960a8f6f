use crate::{
    batch::{spawn_coalescer, BatchHandle},
    circuit_breaker::CircuitBreaker,
    classify::{classify_reply, classify_response, classify_transport_error},
    poller::ChainState,
    rate_limit::RateLimitBudget,
    transport::{HttpTransport, JsonRpcTransport},
};
use bytes::Bytes;
use manifold_config::UpstreamConfig;
use manifold_primitives::{
    ErrorKind, GatewayError, JsonRpcRequest, JsonRpcResponse, UpstreamId,
};
use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Upper bound on methods remembered as unsupported per upstream.
const UNSUPPORTED_CACHE_SIZE: u32 = 512;

/// A single provider endpoint and everything protecting it.
///
/// The upstream exclusively owns its rate limiter handle, circuit breaker
/// and batch coalescer; chain state is published by the poller through a
/// watch channel so readers never observe a torn snapshot.
#[derive(Debug)]
pub struct Upstream {
    config: UpstreamConfig,
    transport: Arc<dyn JsonRpcTransport>,
    breaker: CircuitBreaker,
    budget: Option<Arc<RateLimitBudget>>,
    batch: Option<BatchHandle>,
    chain_state: watch::Sender<ChainState>,
    unsupported: Mutex<LruMap<String, (), ByLength>>,
}

impl Upstream {
    /// Creates an upstream with an HTTP transport built from its config.
    pub fn new(
        config: UpstreamConfig,
        budget: Option<Arc<RateLimitBudget>>,
    ) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config)
            .map_err(|err| GatewayError::transport(err.to_string()))?;
        Ok(Self::with_transport(config, Arc::new(transport), budget))
    }

    /// Creates an upstream over an explicit transport. Tests script replies
    /// through this seam.
    pub fn with_transport(
        config: UpstreamConfig,
        transport: Arc<dyn JsonRpcTransport>,
        budget: Option<Arc<RateLimitBudget>>,
    ) -> Self {
        let batch = config.json_rpc.supports_batch.then(|| {
            spawn_coalescer(config.id.clone(), config.json_rpc.clone(), Arc::clone(&transport))
        });
        let (chain_state, _) = watch::channel(ChainState::default());
        Self {
            breaker: CircuitBreaker::new(config.id.clone(), config.circuit_breaker.clone()),
            unsupported: Mutex::new(LruMap::new(ByLength::new(UNSUPPORTED_CACHE_SIZE))),
            config,
            transport,
            budget,
            batch,
            chain_state,
        }
    }

    /// The upstream's id.
    pub fn id(&self) -> &UpstreamId {
        &self.config.id
    }

    /// The upstream's configuration.
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// The circuit breaker, exposed for selectors to peek at.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The latest published chain state snapshot.
    pub fn chain_state(&self) -> ChainState {
        self.chain_state.borrow().clone()
    }

    /// Publishes a new chain state snapshot. Called by the poller.
    pub(crate) fn publish_chain_state(&self, state: ChainState) {
        self.chain_state.send_replace(state);
    }

    /// Direct chain state publication for tests that have no poller.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn set_chain_state(&self, state: ChainState) {
        self.publish_chain_state(state);
    }

    /// Returns `true` if the method may be sent to this upstream.
    ///
    /// Allow patterns win over ignore patterns; methods remembered as
    /// unsupported through `auto_ignore_unsupported_methods` are refused
    /// regardless.
    pub fn supports(&self, method: &str) -> bool {
        if self.config.auto_ignore_unsupported_methods &&
            self.unsupported.lock().peek(method).is_some()
        {
            return false
        }
        if self.config.allow_methods.matches(method) {
            return true
        }
        !self.config.ignore_methods.matches(method)
    }

    /// Serializes, dispatches and classifies one request.
    ///
    /// The rate limiter and circuit breaker are both consulted before any
    /// bytes leave the process; the breaker observes the outcome afterwards.
    pub async fn forward(
        &self,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, GatewayError> {
        if !self.supports(&request.method) {
            return Err(GatewayError::unsupported_method(&request.method))
        }

        let is_probe = self.breaker.try_acquire()?;
        // if this future is dropped mid-flight, a half-open probe slot must
        // not stay occupied forever
        let mut probe_guard = ProbeGuard { breaker: &self.breaker, armed: is_probe };

        let outcome = self.dispatch(request).await;
        // a local budget rejection never reached the upstream and records no
        // breaker outcome; the guard hands back the probe slot in that case
        let rate_limited =
            matches!(&outcome, Err(err) if err.kind == ErrorKind::RateLimitExceeded);
        probe_guard.armed = is_probe && rate_limited;
        drop(probe_guard);

        match &outcome {
            Ok(_) => {
                self.breaker.record_success();
                if let Some(budget) = &self.budget {
                    budget.note_outcome(false);
                }
            }
            Err(err) => {
                self.observe_failure(&request.method, err);
            }
        }
        outcome
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError> {
        if let Some(budget) = &self.budget {
            budget.acquire(&request.method).await?;
        }

        trace!(
            target: "upstream",
            upstream = %self.config.id,
            method = %request.method,
            batched = self.batch.is_some(),
            "dispatching request"
        );

        match &self.batch {
            Some(batch) => {
                let response = batch.dispatch(request.clone()).await?;
                classify_response(&self.config.id, &self.config.vendor, response)
            }
            None => {
                let body = serde_json::to_vec(request)
                    .map_err(|err| GatewayError::transport(err.to_string()))?;
                let reply = self
                    .transport
                    .send(Bytes::from(body))
                    .await
                    .map_err(classify_transport_error)?;
                classify_reply(&self.config.id, &self.config.vendor, reply)
            }
        }
    }

    fn observe_failure(&self, method: &str, err: &GatewayError) {
        match err.kind {
            ErrorKind::UnsupportedMethod => {
                // the endpoint is healthy, it just does not serve the method
                self.breaker.record_success();
                if self.config.auto_ignore_unsupported_methods {
                    debug!(
                        target: "upstream",
                        upstream = %self.config.id,
                        method,
                        "caching method as unsupported"
                    );
                    self.unsupported.lock().insert(method.to_owned(), ());
                }
            }
            ErrorKind::UpstreamClientError => self.breaker.record_success(),
            ErrorKind::RateLimitExceeded => {}
            ErrorKind::Throttled => {
                self.breaker.record_failure();
                if let Some(budget) = &self.budget {
                    budget.note_outcome(true);
                }
            }
            _ => self.breaker.record_failure(),
        }
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportReply};
    use async_trait::async_trait;
    use manifold_primitives::PatternSet;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Transport answering every call with a fixed JSON body.
    #[derive(Debug)]
    struct ScriptedTransport {
        status: u16,
        body: &'static str,
        calls: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self { status, body, calls: AtomicU64::new(0) })
        }
    }

    #[async_trait]
    impl JsonRpcTransport for ScriptedTransport {
        async fn send(&self, _body: Bytes) -> Result<TransportReply, TransportError> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            Ok(TransportReply { status: self.status, body: Bytes::from_static(self.body.as_bytes()) })
        }
    }

    fn request(method: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(json!(1), method, json!([]))
    }

    #[tokio::test]
    async fn forwards_and_classifies_success() {
        let transport = ScriptedTransport::new(200, r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#);
        let upstream = Upstream::with_transport(
            UpstreamConfig::new("a", "http://unused.example"),
            transport.clone(),
            None,
        );
        let response = upstream.forward(&request("eth_chainId")).await.unwrap();
        assert_eq!(response.result, Some(json!("0x1")));
        assert_eq!(transport.calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn throttled_reply_surfaces_as_throttled() {
        let transport = ScriptedTransport::new(429, "");
        let upstream = Upstream::with_transport(
            UpstreamConfig::new("a", "http://unused.example"),
            transport,
            None,
        );
        let err = upstream.forward(&request("eth_chainId")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Throttled);
    }

    #[tokio::test]
    async fn unsupported_method_is_remembered() {
        let transport = ScriptedTransport::new(
            200,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        );
        let upstream = Upstream::with_transport(
            UpstreamConfig::new("a", "http://unused.example"),
            transport.clone(),
            None,
        );

        let err = upstream.forward(&request("trace_block")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedMethod);
        // the second call never reaches the transport
        let err = upstream.forward(&request("trace_block")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedMethod);
        assert_eq!(transport.calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn allow_list_wins_over_ignore_list() {
        let mut config = UpstreamConfig::new("a", "http://unused.example");
        config.allow_methods = PatternSet::new(["eth_getLogs"]);
        config.ignore_methods = PatternSet::match_all();
        let upstream = Upstream::with_transport(
            config,
            ScriptedTransport::new(200, r#"{"jsonrpc":"2.0","id":1,"result":[]}"#),
            None,
        );

        assert!(upstream.supports("eth_getLogs"));
        assert!(!upstream.supports("eth_chainId"));
        let err = upstream.forward(&request("eth_chainId")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedMethod);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits() {
        let transport = ScriptedTransport::new(500, "");
        let mut config = UpstreamConfig::new("a", "http://unused.example");
        config.circuit_breaker.min_samples = 2;
        config.circuit_breaker.failure_ratio = 0.5;
        let upstream = Upstream::with_transport(config, transport.clone(), None);

        for _ in 0..2 {
            let err = upstream.forward(&request("eth_chainId")).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::UpstreamServerError);
        }
        let err = upstream.forward(&request("eth_chainId")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(transport.calls.load(Ordering::Acquire), 2);
    }
}
