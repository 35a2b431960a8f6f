use crate::Pattern;

/// Request-scoped overrides, parsed from transport headers by the server
/// surface and passed through the core unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDirectives {
    /// Bypass the cache read path. Successful responses are still written.
    pub skip_cache: bool,
    /// Treat empty results (`null`, `[]`, `0x`) as retryable misses.
    pub retry_empty: bool,
    /// Restrict candidate upstreams to ids matching this pattern.
    pub use_upstream: Option<Pattern>,
}

impl RequestDirectives {
    /// Returns `true` if the upstream id passes the `use_upstream` filter.
    pub fn allows_upstream(&self, id: &str) -> bool {
        self.use_upstream.as_ref().map_or(true, |p| p.matches(id))
    }
}
