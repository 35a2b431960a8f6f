//! Upstream handling.
//!
//! An [`Upstream`] wraps a single provider endpoint and owns everything that
//! protects it: the rate limit budget it draws from, its circuit breaker,
//! vendor quirks, the outbound batch coalescer and the background chain
//! state poller. Everything above this crate talks to upstreams through
//! [`Upstream::forward`] and the published [`ChainState`].

mod batch;
mod circuit_breaker;
mod classify;
mod poller;
mod rate_limit;
mod registry;
mod transport;
mod upstream;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker};
pub use poller::{spawn_poller, ChainState};
pub use rate_limit::{AutoTuner, RateLimitBudget, RateLimiterRegistry};
pub use registry::UpstreamRegistry;
pub use transport::{HttpTransport, JsonRpcTransport, TransportError, TransportReply};
pub use upstream::Upstream;
