use async_trait::async_trait;
use bytes::Bytes;
use manifold_config::UpstreamConfig;
use std::fmt;
use url::Url;

/// Raw reply from an upstream endpoint, before JSON-RPC interpretation.
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

/// Errors below the JSON-RPC layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection, TLS or protocol failure.
    #[error("transport failure: {0}")]
    Connect(String),
    /// The per-attempt HTTP timeout expired.
    #[error("transport timed out")]
    Timeout,
}

/// The seam between an [`crate::Upstream`] and the wire.
///
/// Production uses [`HttpTransport`]; tests script replies and latencies
/// without a socket.
#[async_trait]
pub trait JsonRpcTransport: Send + Sync + fmt::Debug {
    /// Sends one serialized JSON-RPC payload (single or batch) and returns
    /// the raw reply.
    async fn send(&self, body: Bytes) -> Result<TransportReply, TransportError>;
}

/// HTTP transport backed by a pooled [`reqwest::Client`].
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    /// Builds the transport for an upstream: applies the vendor URL
    /// decoration, header injection, gzip and the per-attempt timeout.
    pub fn new(config: &UpstreamConfig) -> Result<Self, TransportError> {
        let mut url =
            Url::parse(&config.endpoint).map_err(|err| TransportError::Connect(err.to_string()))?;
        if let Some((key, value)) = &config.vendor.url_query {
            url.query_pairs_mut().append_pair(key, value);
        }

        let client = reqwest::Client::builder()
            .gzip(config.compression)
            .timeout(config.json_rpc.request_timeout)
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        Ok(Self { client, url, headers: config.vendor.headers.clone() })
    }
}

#[async_trait]
impl JsonRpcTransport for HttpTransport {
    async fn send(&self, body: Bytes) -> Result<TransportReply, TransportError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header("content-type", "application/json")
            .body(body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify_reqwest)?;
        Ok(TransportReply { status, body })
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(err.to_string())
    }
}
