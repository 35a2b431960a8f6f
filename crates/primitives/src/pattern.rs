use serde::{Deserialize, Serialize};
use std::fmt;

/// A simple glob pattern over method and network names.
///
/// Supports `*` (any run of characters, including none). Matching is
/// case-sensitive; method names are case-sensitive on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(String);

impl Pattern {
    /// Creates a new pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Returns the raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this pattern matches everything.
    pub fn is_match_all(&self) -> bool {
        self.0 == "*"
    }

    /// Returns `true` if the candidate matches this pattern.
    pub fn matches(&self, candidate: &str) -> bool {
        glob_match(self.0.as_bytes(), candidate.as_bytes())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.0)
    }
}

impl From<&str> for Pattern {
    fn from(pattern: &str) -> Self {
        Self(pattern.to_owned())
    }
}

/// An ordered set of patterns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternSet(Vec<Pattern>);

impl PatternSet {
    /// Creates a pattern set from raw pattern strings.
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(patterns.into_iter().map(|p| Pattern::new(p)).collect())
    }

    /// A set matching everything.
    pub fn match_all() -> Self {
        Self(vec![Pattern::new("*")])
    }

    /// Returns `true` if the set contains no patterns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if any pattern in the set matches the candidate.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.iter().any(|p| p.matches(candidate))
    }

    /// The patterns in declaration order.
    pub fn patterns(&self) -> &[Pattern] {
        &self.0
    }
}

impl From<Vec<Pattern>> for PatternSet {
    fn from(patterns: Vec<Pattern>) -> Self {
        Self(patterns)
    }
}

/// Iterative glob matcher with greedy `*` backtracking.
fn glob_match(pattern: &[u8], candidate: &[u8]) -> bool {
    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while c < candidate.len() {
        if p < pattern.len() && pattern[p] == candidate[c] {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, c));
            p += 1;
        } else if let Some((star_p, star_c)) = star {
            // backtrack: let the last `*` swallow one more byte
            p = star_p + 1;
            c = star_c + 1;
            star = Some((star_p, star_c + 1));
        } else {
            return false
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
