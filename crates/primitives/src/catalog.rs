//! The method catalog.
//!
//! Each entry maps a JSON-RPC method to the reference paths used to extract a
//! block number or hash from its request/response, and to a finality class
//! that drives cacheability.

use crate::{BlockRef, Finality};
use serde_json::Value;
use std::collections::HashMap;

/// How a method's responses relate to chain finality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalityClass {
    /// Responses never change, e.g. `eth_chainId`. Always `Finalized`.
    Static,
    /// Responses describe the live head, e.g. `eth_blockNumber`.
    Realtime,
    /// Responses reference a block; finality is derived by comparing that
    /// block against the upstream's finalized block.
    WithBlock,
    /// Responses are identified by an out-of-band key the caller owns (tx
    /// hashes); finality is `Unknown`.
    Special,
}

impl FinalityClass {
    /// Finality of a response when no block comparison is possible.
    pub const fn default_finality(&self) -> Finality {
        match self {
            Self::Static => Finality::Finalized,
            Self::Realtime => Finality::Realtime,
            Self::WithBlock => Finality::Unfinalized,
            Self::Special => Finality::Unknown,
        }
    }
}

/// One segment of a JSON path into a request's params or a response's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSegment {
    /// Positional index into an array.
    Index(usize),
    /// Named key in an object.
    Key(&'static str),
    /// Matches anything; the whole params value identifies the request.
    Any,
}

/// A path of segments. Evaluated left to right from the params/result root.
pub type RefPath = Vec<RefSegment>;

/// Catalog entry for one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEntry {
    /// Finality class of the method.
    pub finality: FinalityClass,
    /// Paths into the request params that may hold a block reference.
    pub req_refs: Vec<RefPath>,
    /// Paths into the response result that may hold a block reference.
    pub resp_refs: Vec<RefPath>,
}

impl MethodEntry {
    fn new(finality: FinalityClass) -> Self {
        Self { finality, req_refs: Vec::new(), resp_refs: Vec::new() }
    }

    fn req(mut self, path: RefPath) -> Self {
        self.req_refs.push(path);
        self
    }

    fn resp(mut self, path: RefPath) -> Self {
        self.resp_refs.push(path);
        self
    }
}

fn lookup<'a>(root: &'a Value, path: &[RefSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match segment {
            RefSegment::Index(i) => current.get(*i)?,
            RefSegment::Key(k) => current.get(*k)?,
            RefSegment::Any => return Some(current),
        };
    }
    Some(current)
}

/// The process-wide method catalog. Built once at startup and shared.
#[derive(Debug, Clone)]
pub struct MethodCatalog {
    entries: HashMap<String, MethodEntry>,
}

impl MethodCatalog {
    /// Creates an empty catalog.
    pub fn empty() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Registers or replaces a catalog entry.
    pub fn register(&mut self, method: impl Into<String>, entry: MethodEntry) {
        self.entries.insert(method.into(), entry);
    }

    /// Looks up the entry for a method.
    pub fn entry(&self, method: &str) -> Option<&MethodEntry> {
        self.entries.get(method)
    }

    /// Finality class for a method. Unknown methods are treated as `Special`
    /// so they are never cached unless a policy opts into `Unknown` finality.
    pub fn finality_class(&self, method: &str) -> FinalityClass {
        self.entry(method).map_or(FinalityClass::Special, |entry| entry.finality)
    }

    /// Extracts the most specific block reference from request params.
    ///
    /// Paths are probed in declaration order; the first one that parses into
    /// a [`BlockRef`] wins. A `*` path means the whole params value is the
    /// identity and yields no block reference.
    pub fn request_block_ref(&self, method: &str, params: &Value) -> Option<BlockRef> {
        let entry = self.entry(method)?;
        entry
            .req_refs
            .iter()
            .filter(|path| !matches!(path.first(), Some(RefSegment::Any)))
            .find_map(|path| lookup(params, path).and_then(BlockRef::from_value))
    }

    /// Extracts a block reference from a response result.
    pub fn response_block_ref(&self, method: &str, result: &Value) -> Option<BlockRef> {
        let entry = self.entry(method)?;
        entry.resp_refs.iter().find_map(|path| lookup(result, path).and_then(BlockRef::from_value))
    }
}

impl Default for MethodCatalog {
    /// The catalog pre-populated with the common EVM surface.
    fn default() -> Self {
        use FinalityClass::{Realtime, Special, Static, WithBlock};
        use RefSegment::{Any, Index, Key};

        let mut catalog = Self::empty();

        for method in ["eth_chainId", "net_version", "web3_clientVersion", "eth_protocolVersion"] {
            catalog.register(method, MethodEntry::new(Static));
        }

        for method in [
            "eth_blockNumber",
            "eth_gasPrice",
            "eth_maxPriorityFeePerGas",
            "eth_blobBaseFee",
            "eth_syncing",
            "net_peerCount",
            "txpool_status",
            "txpool_content",
        ] {
            catalog.register(method, MethodEntry::new(Realtime));
        }

        // account/state reads keyed by a trailing block parameter
        catalog.register(
            "eth_getBalance",
            MethodEntry::new(WithBlock).req(vec![Index(1)]),
        );
        catalog.register(
            "eth_getTransactionCount",
            MethodEntry::new(WithBlock).req(vec![Index(1)]),
        );
        catalog.register("eth_getCode", MethodEntry::new(WithBlock).req(vec![Index(1)]));
        catalog.register("eth_call", MethodEntry::new(WithBlock).req(vec![Index(1)]));
        catalog.register(
            "eth_getStorageAt",
            MethodEntry::new(WithBlock).req(vec![Index(2)]),
        );

        catalog.register(
            "eth_getBlockByNumber",
            MethodEntry::new(WithBlock)
                .req(vec![Index(0)])
                .resp(vec![Key("number")])
                .resp(vec![Key("hash")]),
        );
        catalog.register(
            "eth_getBlockByHash",
            MethodEntry::new(WithBlock)
                .req(vec![Index(0)])
                .resp(vec![Key("number")])
                .resp(vec![Key("hash")]),
        );
        catalog.register(
            "eth_getBlockTransactionCountByNumber",
            MethodEntry::new(WithBlock).req(vec![Index(0)]),
        );
        catalog.register(
            "eth_getTransactionByBlockNumberAndIndex",
            MethodEntry::new(WithBlock).req(vec![Index(0)]),
        );
        catalog.register(
            "eth_getLogs",
            MethodEntry::new(WithBlock)
                .req(vec![Index(0), Key("toBlock")])
                .req(vec![Index(0), Key("fromBlock")])
                .req(vec![Index(0), Key("blockHash")]),
        );

        // tx-hash keyed methods: the caller owns the hash and accepts that a
        // reorg may invalidate the answer out-of-band
        catalog.register(
            "eth_getTransactionReceipt",
            MethodEntry::new(Special)
                .req(vec![Any])
                .resp(vec![Key("blockNumber")])
                .resp(vec![Key("blockHash")]),
        );
        catalog.register(
            "eth_getTransactionByHash",
            MethodEntry::new(Special).req(vec![Any]).resp(vec![Key("blockNumber")]),
        );
        catalog.register("debug_traceTransaction", MethodEntry::new(Special).req(vec![Any]));
        catalog.register("trace_transaction", MethodEntry::new(Special).req(vec![Any]));

        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockTag;
    use serde_json::json;

    #[test]
    fn get_logs_prefers_to_block() {
        let catalog = MethodCatalog::default();
        let params = json!([{ "fromBlock": "0x10", "toBlock": "0x20" }]);
        assert_eq!(
            catalog.request_block_ref("eth_getLogs", &params),
            Some(BlockRef::Number(0x20))
        );
    }

    #[test]
    fn get_block_by_number_tag() {
        let catalog = MethodCatalog::default();
        let params = json!(["finalized", false]);
        assert_eq!(
            catalog.request_block_ref("eth_getBlockByNumber", &params),
            Some(BlockRef::Tag(BlockTag::Finalized))
        );
    }

    #[test]
    fn receipt_is_special_with_response_refs() {
        let catalog = MethodCatalog::default();
        assert_eq!(catalog.finality_class("eth_getTransactionReceipt"), FinalityClass::Special);
        // the wildcard request ref yields no block reference
        let params = json!(["0xdeadbeef"]);
        assert_eq!(catalog.request_block_ref("eth_getTransactionReceipt", &params), None);
        let result = json!({ "blockNumber": "0x100", "blockHash": "0xff" });
        assert_eq!(
            catalog.response_block_ref("eth_getTransactionReceipt", &result),
            Some(BlockRef::Number(0x100))
        );
    }

    #[test]
    fn unknown_method_is_special() {
        let catalog = MethodCatalog::default();
        assert_eq!(catalog.finality_class("custom_thing"), FinalityClass::Special);
        assert_eq!(catalog.request_block_ref("custom_thing", &json!([])), None);
    }

    #[test]
    fn static_and_realtime_defaults() {
        assert_eq!(FinalityClass::Static.default_finality(), Finality::Finalized);
        assert_eq!(FinalityClass::Realtime.default_finality(), Finality::Realtime);
        assert_eq!(FinalityClass::Special.default_finality(), Finality::Unknown);
    }
}
