//! Commonly used types for the manifold JSON-RPC gateway.
//!
//! This crate contains the request/response envelope, the request fingerprint
//! and its canonicalization rules, the method catalog that drives finality
//! classification, and the shared error taxonomy.

mod catalog;
mod directives;
mod error;
mod finality;
mod fingerprint;
mod id;
mod jsonrpc;
mod pattern;

pub use catalog::{FinalityClass, MethodCatalog, MethodEntry, RefPath, RefSegment};
pub use directives::RequestDirectives;
pub use error::{Attempt, ErrorKind, GatewayError, GatewayResult};
pub use finality::Finality;
pub use fingerprint::{
    canonical_params, canonical_result_hash, normalize_hex_quantity, BlockRef, BlockTag,
    BlockTagResolver, Fingerprint,
};
pub use id::{NetworkId, UpstreamId};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use pattern::{Pattern, PatternSet};
