//! Request fingerprinting.
//!
//! The fingerprint is a deterministic hash over `(network, method,
//! canonical(params))` and doubles as the cache key and the single-flight
//! deduplication key. Canonicalization makes the hash stable under hex case,
//! quantity padding, and object key order.

use crate::NetworkId;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// Symbolic block tags accepted wherever a block number is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BlockTag {
    /// The most recent block.
    Latest,
    /// The most recent finalized block.
    Finalized,
    /// The most recent safe block.
    Safe,
    /// The block currently being built.
    Pending,
    /// The genesis block.
    Earliest,
}

/// Resolves symbolic block tags to concrete block numbers.
///
/// Resolution is only applied when the cache policy for the method declares
/// it safe; otherwise tags stay literal in the canonical form.
pub trait BlockTagResolver: Send + Sync {
    /// Returns the block number the tag currently refers to, if known.
    fn resolve(&self, tag: BlockTag) -> Option<u64>;
}

/// A reference to a block extracted from a request or response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockRef {
    /// A concrete block number.
    Number(u64),
    /// A block hash, normalized to lowercase.
    Hash(String),
    /// A still-symbolic tag.
    Tag(BlockTag),
}

impl BlockRef {
    /// Parses a block reference out of a JSON value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::Number),
            Value::String(s) => {
                if let Ok(tag) = BlockTag::from_str(s) {
                    return Some(Self::Tag(tag))
                }
                let stripped = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
                if s.len() == 66 {
                    return Some(Self::Hash(s.to_ascii_lowercase()))
                }
                u64::from_str_radix(stripped, 16).ok().map(Self::Number)
            }
            _ => None,
        }
    }

    /// Returns the block number if this is a numeric reference.
    pub const fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Hash(h) => f.write_str(h),
            Self::Tag(t) => write!(f, "{t}"),
        }
    }
}

/// A 32-byte request fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Computes the fingerprint for `(network, method, canonical params)`.
    ///
    /// Callers are expected to pass already-canonicalized params, see
    /// [`canonical_params`].
    pub fn compute(network: &NetworkId, method: &str, canonical: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(network.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(method.as_bytes());
        hasher.update([0u8]);
        // canonical form serializes deterministically: maps are rebuilt with
        // sorted keys and quantities are normalized before hashing
        hasher.update(canonical.to_string().as_bytes());
        Self(hasher.finalize().into())
    }

    /// The raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Normalizes a `0x`-prefixed hex quantity: lowercase, leading zeros stripped
/// down to a single digit, `0x0` preserved.
pub fn normalize_hex_quantity(raw: &str) -> String {
    let Some(stripped) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) else {
        return raw.to_owned()
    };
    let trimmed = stripped.trim_start_matches('0');
    if trimmed.is_empty() {
        return "0x0".to_owned()
    }
    format!("0x{}", trimmed.to_ascii_lowercase())
}

/// Lengths of hex strings that are identities rather than quantities:
/// addresses (20 bytes) and hashes (32 bytes). These keep their padding and
/// are only lowercased.
const FIXED_WIDTH_HEX_LENS: [usize; 2] = [42, 66];

fn canonical_string(s: &str, resolver: Option<&dyn BlockTagResolver>) -> Value {
    if let Some(resolver) = resolver {
        if let Ok(tag) = BlockTag::from_str(s) {
            if let Some(number) = resolver.resolve(tag) {
                return Value::String(format!("0x{number:x}"))
            }
        }
    }
    if s.starts_with("0x") || s.starts_with("0X") {
        if FIXED_WIDTH_HEX_LENS.contains(&s.len()) {
            return Value::String(s.to_ascii_lowercase())
        }
        if s[2..].bytes().all(|b| b.is_ascii_hexdigit()) {
            return Value::String(normalize_hex_quantity(s))
        }
    }
    Value::String(s.to_owned())
}

/// Produces the canonical form of request params.
///
/// When `resolver` is provided, symbolic block tags are resolved to numeric
/// references; the cache layer only passes a resolver when the method's
/// policy declares resolution safe.
pub fn canonical_params(params: &Value, resolver: Option<&dyn BlockTagResolver>) -> Value {
    match params {
        Value::String(s) => canonical_string(s, resolver),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| canonical_params(item, resolver)).collect())
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str());
            let mut out = Map::new();
            for (key, value) in entries {
                out.insert(key.clone(), canonical_params(value, resolver));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Canonical hash of a response result, used for consensus agreement.
///
/// Strips the `jsonrpc`/`id` envelope by hashing only the canonicalized
/// result value, so equal values hash identically regardless of upstream
/// formatting quirks.
pub fn canonical_result_hash(result: &Value) -> [u8; 32] {
    let canonical = canonical_params(result, None);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hasher.finalize().into()
}
