//! Per-request failsafe composition.
//!
//! For every request the network picks the first matching failsafe rule and
//! the executor composes its stages, outermost first: timeout, retry, hedge,
//! then the upstream's own circuit breaker inside each attempt. Methods
//! under consensus replace the single-upstream attempt with a fan-out round
//! over the best candidates.

mod consensus;
mod executor;
mod punish;

pub use consensus::ConsensusEngine;
pub use executor::{FailsafeExecutor, Served};
pub use punish::MisbehaviorTracker;

#[cfg(test)]
pub(crate) mod test_util;
