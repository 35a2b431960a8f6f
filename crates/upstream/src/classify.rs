//! Reply classification.
//!
//! Maps raw transport replies onto the gateway's failure taxonomy. Execution
//! reverts are deterministic outcomes of the requested call and flow through
//! as responses; every other RPC-level error becomes a typed failure so the
//! retry stage can decide what to do with it.

use crate::transport::{TransportError, TransportReply};
use manifold_config::VendorConfig;
use manifold_primitives::{ErrorKind, GatewayError, JsonRpcResponse, UpstreamId};

pub(crate) fn classify_transport_error(err: TransportError) -> GatewayError {
    match err {
        TransportError::Timeout => {
            GatewayError::new(ErrorKind::Timeout, "upstream attempt timed out")
        }
        TransportError::Connect(message) => GatewayError::transport(message),
    }
}

/// Classifies the HTTP status before the body is interpreted.
pub(crate) fn classify_status(upstream: &UpstreamId, status: u16) -> Result<(), GatewayError> {
    match status {
        200..=299 => Ok(()),
        429 => Err(GatewayError::throttled(upstream)),
        400..=499 => Err(GatewayError::new(
            ErrorKind::UpstreamClientError,
            format!("upstream {upstream} rejected the request with status {status}"),
        )),
        _ => Err(GatewayError::new(
            ErrorKind::UpstreamServerError,
            format!("upstream {upstream} failed with status {status}"),
        )),
    }
}

/// Interprets a parsed single response.
pub(crate) fn classify_response(
    upstream: &UpstreamId,
    vendor: &VendorConfig,
    response: JsonRpcResponse,
) -> Result<JsonRpcResponse, GatewayError> {
    let Some(error) = &response.error else { return Ok(response) };

    if response.is_execution_reverted() {
        return Ok(response)
    }
    if error.is_method_not_found() {
        return Err(GatewayError::new(
            ErrorKind::UnsupportedMethod,
            format!("upstream {upstream} does not serve this method"),
        ))
    }
    if vendor.retryable_codes.contains(&error.code) {
        return Err(GatewayError::new(
            ErrorKind::UpstreamServerError,
            format!("upstream {upstream} transient error {}: {}", error.code, error.message),
        ))
    }
    match error.code {
        // throttling surfaced at the RPC layer
        -32005 | -32097 => Err(GatewayError::throttled(upstream)),
        // request-shaped problems are the caller's fault
        -32600 | -32602 | -32700 => Err(GatewayError::new(
            ErrorKind::UpstreamClientError,
            format!("upstream {upstream} rejected params: {}", error.message),
        )),
        _ => Err(GatewayError::new(
            ErrorKind::UpstreamServerError,
            format!("upstream {upstream} error {}: {}", error.code, error.message),
        )),
    }
}

/// Full classification of a raw reply carrying a single response.
pub(crate) fn classify_reply(
    upstream: &UpstreamId,
    vendor: &VendorConfig,
    reply: TransportReply,
) -> Result<JsonRpcResponse, GatewayError> {
    classify_status(upstream, reply.status)?;
    let response: JsonRpcResponse = serde_json::from_slice(&reply.body).map_err(|err| {
        GatewayError::new(
            ErrorKind::UpstreamServerError,
            format!("upstream {upstream} returned malformed JSON-RPC: {err}"),
        )
    })?;
    classify_response(upstream, vendor, response)
}
