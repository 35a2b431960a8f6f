use crate::{JsonRpcError, UpstreamId};
use serde_json::json;
use std::{fmt, time::Duration};

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Machine readable classification of everything that can go wrong on the
/// request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// Network level failure talking to the upstream.
    Transport,
    /// The attempt or the whole request ran out of time.
    Timeout,
    /// The upstream answered 429 or an equivalent throttling signal.
    Throttled,
    /// The upstream rejected the request as malformed (4xx, bad params).
    UpstreamClientError,
    /// The upstream failed internally (5xx, internal RPC errors).
    UpstreamServerError,
    /// The method is not served by the selected upstream.
    UnsupportedMethod,
    /// The upstream's circuit breaker is open.
    CircuitOpen,
    /// A rate limit budget had no token within its wait window.
    RateLimitExceeded,
    /// Consensus round completed without the required agreement.
    ConsensusDispute,
    /// Not enough healthy upstreams to run the consensus round.
    ConsensusLowParticipants,
    /// The selection policy excluded every candidate.
    PolicyExcluded,
    /// Internal marker for a cache lookup that found nothing.
    CacheMiss,
    /// The normalized configuration is inconsistent.
    ConfigInvalid,
}

impl ErrorKind {
    /// Returns `true` if the retry stage may consume this error and try the
    /// next candidate.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport |
                Self::Timeout |
                Self::Throttled |
                Self::UpstreamServerError |
                Self::CircuitOpen |
                Self::RateLimitExceeded
        )
    }

    /// JSON-RPC error code. Gateway-originated kinds use a private namespace
    /// below the reserved implementation-defined range.
    pub const fn json_rpc_code(&self) -> i64 {
        match self {
            Self::Transport => -32020,
            Self::Timeout => -32021,
            Self::Throttled => -32022,
            Self::UpstreamClientError => -32023,
            Self::UpstreamServerError => -32024,
            Self::UnsupportedMethod => -32601,
            Self::CircuitOpen => -32025,
            Self::RateLimitExceeded => -32005,
            Self::ConsensusDispute => -32026,
            Self::ConsensusLowParticipants => -32027,
            Self::PolicyExcluded => -32028,
            Self::CacheMiss => -32029,
            Self::ConfigInvalid => -32030,
        }
    }
}

/// One failed attempt inside a request, kept for the causal chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// The upstream that served the attempt.
    pub upstream: UpstreamId,
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.upstream, self.kind.as_ref(), self.message)
    }
}

/// An error surfaced by the gateway request path.
///
/// Carries the terminal [`ErrorKind`], a message, and the causal chain of
/// attempts made before giving up. The chain is emitted to logs and metrics
/// but not leaked to clients.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    /// Terminal error classification.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
    /// All attempts made before this error became terminal.
    pub attempts: Vec<Attempt>,
}

impl GatewayError {
    /// Creates a new error with an empty attempt chain.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), attempts: Vec::new() }
    }

    /// Attaches the attempt chain accumulated by the retry loop.
    pub fn with_attempts(mut self, attempts: Vec<Attempt>) -> Self {
        self.attempts = attempts;
        self
    }

    /// Returns `true` if the retry stage may consume this error.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Network level transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Attempt or request deadline expired.
    pub fn timeout(elapsed: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("timed out after {elapsed:?}"))
    }

    /// Upstream throttled the request.
    pub fn throttled(upstream: &UpstreamId) -> Self {
        Self::new(ErrorKind::Throttled, format!("upstream {upstream} throttled the request"))
    }

    /// Method not served by the upstream.
    pub fn unsupported_method(method: &str) -> Self {
        Self::new(ErrorKind::UnsupportedMethod, format!("method {method} is not supported"))
    }

    /// Circuit breaker rejected the call.
    pub fn circuit_open(upstream: &UpstreamId) -> Self {
        Self::new(ErrorKind::CircuitOpen, format!("circuit breaker open for upstream {upstream}"))
    }

    /// Rate limit budget exhausted.
    pub fn rate_limited(budget: &str) -> Self {
        Self::new(ErrorKind::RateLimitExceeded, format!("rate limit budget {budget} exhausted"))
    }

    /// Converts into the wire error object. The attempt chain is summarized
    /// into a count so internals are not exposed to clients.
    pub fn to_json_rpc_error(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.kind.json_rpc_code(),
            message: self.message.clone(),
            data: (!self.attempts.is_empty())
                .then(|| json!({ "kind": self.kind.as_ref(), "attempts": self.attempts.len() })),
        }
    }
}
