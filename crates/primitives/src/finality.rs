use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Classification of a response's durability.
///
/// Within a single fingerprint, finality is monotonic only once `Finalized`
/// has been reached; `Unfinalized` data may still be reorganized away.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Finality {
    /// The referenced data is at or below the chain's finalized block.
    Finalized,
    /// The referenced data is above the finalized block and may reorg.
    Unfinalized,
    /// The data describes the live head of the chain and goes stale quickly.
    Realtime,
    /// Durability cannot be derived from the request or response shape.
    Unknown,
}

impl Finality {
    /// All finality states, in a stable order.
    pub const ALL: [Self; 4] = [Self::Finalized, Self::Unfinalized, Self::Realtime, Self::Unknown];
}
