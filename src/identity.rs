use std::fmt;

use serde::{Deserialize, Serialize};

/// URI-shaped name of a peer reachable through the bus, e.g. `bus://hostA/agent`.
///
/// Equality is exact string match; no normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The well-known identity of the bus server itself, used for inventory
    /// requests.
    pub fn server() -> Self {
        Self("bus:///server".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Glob match against an inventory query pattern such as `bus://*/agent`.
    /// `*` matches any run of characters, including none.
    pub fn matches(&self, pattern: &str) -> bool {
        glob_match(self.0.as_bytes(), pattern.as_bytes())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// Iterative wildcard match with single-star backtracking
fn glob_match(text: &[u8], pattern: &[u8]) -> bool {
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
