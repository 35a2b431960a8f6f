//! The HTTP JSON-RPC surface.
//!
//! A deliberately thin layer: it parses envelopes and directive headers,
//! calls [`App::forward`] and maps gateway errors onto wire error objects.
//! Everything interesting happens below the `Forward` seam.

use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use manifold_config::{CorsConfig, ServerConfig};
use manifold_network::App;
use manifold_primitives::{
    GatewayError, JsonRpcError, JsonRpcRequest, JsonRpcResponse, NetworkId, Pattern,
    RequestDirectives,
};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Directive headers understood by the surface.
const HEADER_SKIP_CACHE: &str = "x-manifold-skip-cache";
const HEADER_RETRY_EMPTY: &str = "x-manifold-retry-empty";
const HEADER_USE_UPSTREAM: &str = "x-manifold-use-upstream";

/// Serves the JSON-RPC surface until ctrl-c.
pub(crate) async fn serve(app: App, config: ServerConfig) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(target: "manifold", %addr, "JSON-RPC surface listening");

    let app = Arc::new(app);
    let max_body = config.max_body_size;

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!(target: "manifold", "shutting down");
                return Ok(())
            }
        };

        let app = Arc::clone(&app);
        tokio::spawn(async move {
            let service =
                service_fn(move |request| handle(Arc::clone(&app), max_body, request));
            if let Err(err) =
                http1::Builder::new().serve_connection(TokioIo::new(stream), service).await
            {
                debug!(target: "manifold", %peer, %err, "connection error");
            }
        });
    }
}

async fn handle(
    app: Arc<App>,
    max_body: usize,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let network = NetworkId::new(request.uri().path().trim_start_matches('/').to_owned());
    // CORS is scoped per project, resolved through the target network
    let cors = app.cors_for(&network).cloned().unwrap_or_default();

    if request.method() == Method::OPTIONS {
        return Ok(preflight(&cors))
    }
    if request.method() == Method::GET && request.uri().path() == "/healthcheck" {
        return Ok(plain(StatusCode::OK, "OK"))
    }
    if request.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "POST only"))
    }

    let directives = parse_directives(&request);

    let body = request.into_body().collect().await?.to_bytes();
    if body.len() > max_body {
        return Ok(plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))
    }

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(target: "manifold", %err, "unparseable request body");
            let response = JsonRpcResponse::error(
                Value::Null,
                JsonRpcError::new(-32700, format!("parse error: {err}")),
            );
            return Ok(json_response(&cors, serde_json::to_value(response).unwrap_or_default()))
        }
    };

    let reply = match parsed {
        Value::Array(batch) => {
            let mut replies = Vec::with_capacity(batch.len());
            for envelope in batch {
                replies.push(forward_one(&app, &network, &directives, envelope).await);
            }
            Value::Array(replies)
        }
        single => forward_one(&app, &network, &directives, single).await,
    };

    Ok(json_response(&cors, reply))
}

async fn forward_one(
    app: &App,
    network: &NetworkId,
    directives: &RequestDirectives,
    envelope: Value,
) -> Value {
    let request: JsonRpcRequest = match serde_json::from_value(envelope) {
        Ok(request) => request,
        Err(err) => {
            let response = JsonRpcResponse::error(
                Value::Null,
                JsonRpcError::new(-32600, format!("invalid request: {err}")),
            );
            return serde_json::to_value(response).unwrap_or_default()
        }
    };

    let id = request.id.clone();
    let response = match app.forward(network, &request, directives).await {
        Ok(response) => response,
        Err(err) => gateway_error_response(id, &err),
    };
    serde_json::to_value(response).unwrap_or_default()
}

/// Maps a gateway error to the wire. Cause chains go to logs, not clients.
fn gateway_error_response(id: Value, err: &GatewayError) -> JsonRpcResponse {
    debug!(
        target: "manifold",
        kind = err.kind.as_ref(),
        attempts = err.attempts.len(),
        "request failed: {err}"
    );
    JsonRpcResponse::error(id, err.to_json_rpc_error())
}

fn parse_directives(request: &Request<Incoming>) -> RequestDirectives {
    let header_flag = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
    };
    RequestDirectives {
        skip_cache: header_flag(HEADER_SKIP_CACHE),
        retry_empty: header_flag(HEADER_RETRY_EMPTY),
        use_upstream: request
            .headers()
            .get(HEADER_USE_UPSTREAM)
            .and_then(|value| value.to_str().ok())
            .map(Pattern::new),
    }
}

fn preflight(cors: &CorsConfig) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
    builder = builder
        .header("access-control-allow-origin", cors.allowed_origins.join(","))
        .header("access-control-allow-methods", cors.allowed_methods.join(","))
        .header("access-control-allow-headers", cors.allowed_headers.join(","))
        .header("access-control-max-age", cors.max_age.to_string());
    builder.body(Full::new(Bytes::new())).expect("static response")
}

fn json_response(cors: &CorsConfig, value: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("access-control-allow-origin", cors.allowed_origins.join(","))
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("static response")
}

fn plain(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(message.as_bytes())))
        .expect("static response")
}
