//! Scripted upstreams for executor and consensus tests.

use async_trait::async_trait;
use bytes::Bytes;
use manifold_config::UpstreamConfig;
use manifold_upstream::{JsonRpcTransport, TransportError, TransportReply, Upstream};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

/// A canned reply with an optional artificial latency.
#[derive(Debug, Clone)]
pub(crate) struct Script {
    status: u16,
    body: Value,
    latency: Duration,
}

impl Script {
    pub(crate) fn success(result: &str) -> Self {
        Self::success_value(json!(result))
    }

    pub(crate) fn success_value(result: Value) -> Self {
        Self {
            status: 200,
            body: json!({"jsonrpc": "2.0", "id": 1, "result": result}),
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn error_body(code: i64, message: &str) -> Self {
        Self {
            status: 200,
            body: json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": code, "message": message},
            }),
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn server_error() -> Self {
        Self { status: 500, body: Value::Null, latency: Duration::ZERO }
    }

    pub(crate) fn client_error() -> Self {
        Self { status: 400, body: Value::Null, latency: Duration::ZERO }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[derive(Debug)]
struct ScriptedTransport {
    script: Script,
}

#[async_trait]
impl JsonRpcTransport for ScriptedTransport {
    async fn send(&self, _body: Bytes) -> Result<TransportReply, TransportError> {
        if !self.script.latency.is_zero() {
            tokio::time::sleep(self.script.latency).await;
        }
        Ok(TransportReply {
            status: self.script.status,
            body: Bytes::from(serde_json::to_vec(&self.script.body).unwrap()),
        })
    }
}

/// Builds an upstream whose transport always replies with `script`.
pub(crate) fn scripted_upstream(id: &str, script: Script) -> Arc<Upstream> {
    let config = UpstreamConfig::new(id, "http://unused.example");
    Arc::new(Upstream::with_transport(config, Arc::new(ScriptedTransport { script }), None))
}

/// Builds an upstream that reports the given head block through its chain
/// state, for block-head leader tests.
pub(crate) fn scripted_upstream_at_head(id: &str, script: Script, head: u64) -> Arc<Upstream> {
    let upstream = scripted_upstream(id, script);
    let mut state = upstream.chain_state();
    state.latest_block = Some(head);
    upstream.set_chain_state(state);
    upstream
}
