//! Origin allow-list for browser WebSocket upgrades.
//!
//! Entries take three forms:
//!
//! | Entry                     | Matches                                      |
//! |---------------------------|----------------------------------------------|
//! | `"*"`                     | Any origin.                                  |
//! | `"localhost"`             | That host under any scheme and port.         |
//! | `"http://localhost:5173"` | Exactly that scheme, host and port.          |
//!
//! Requests without an `Origin` header are not browser requests and are
//! always admitted; the policy only rejects origins that are present and not
//! listed.

use crate::error::{BridgeError, BridgeResult};
use std::collections::HashSet;

/// Compiled origin allow-list.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allow_all: bool,
    exact: HashSet<String>,
    hosts: HashSet<String>,
}

impl Default for OriginPolicy {
    /// Loopback hosts only.
    fn default() -> Self {
        Self::new(&["localhost".into(), "127.0.0.1".into(), "[::1]".into()])
    }
}

impl OriginPolicy {
    pub fn new(entries: &[String]) -> Self {
        let mut policy = Self {
            allow_all: false,
            exact: HashSet::new(),
            hosts: HashSet::new(),
        };
        for entry in entries {
            let entry = normalize(entry);
            if entry == "*" {
                policy.allow_all = true;
            } else if entry.contains("://") {
                policy.exact.insert(entry);
            } else {
                policy.hosts.insert(entry);
            }
        }
        policy
    }

    /// Whether a present `Origin` header value is allowed.
    pub fn allows(&self, origin: &str) -> bool {
        if self.allow_all {
            return true;
        }
        let origin = normalize(origin);
        if self.exact.contains(&origin) {
            return true;
        }
        origin_host(&origin).is_some_and(|host| self.hosts.contains(host))
    }

    /// Admit a request given its (optional) `Origin` header.
    pub fn check(&self, origin: Option<&str>) -> BridgeResult<()> {
        match origin {
            None => Ok(()),
            Some(origin) if self.allows(origin) => Ok(()),
            Some(origin) => Err(BridgeError::UnauthorizedOrigin(origin.to_string())),
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Host part of `scheme://host[:port]`, keeping IPv6 brackets.
fn origin_host(origin: &str) -> Option<&str> {
    let (_, authority) = origin.split_once("://")?;
    let authority = authority.split('/').next()?;
    if authority.starts_with('[') {
        let end = authority.find(']')?;
        return Some(&authority[..=end]);
    }
    Some(authority.rsplit_once(':').map_or(authority, |(host, _)| host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_loopback_only() {
        let policy = OriginPolicy::default();
        assert!(policy.allows("http://localhost:5173"));
        assert!(policy.allows("https://127.0.0.1"));
        assert!(policy.allows("http://[::1]:3000"));
        assert!(!policy.allows("https://evil.example"));
        assert!(!policy.allows("null"));
    }

    #[test]
    fn missing_origin_is_admitted() {
        let policy = OriginPolicy::new(&[]);
        assert!(policy.check(None).is_ok());
        assert!(matches!(
            policy.check(Some("http://localhost")),
            Err(BridgeError::UnauthorizedOrigin(_))
        ));
    }

    #[test]
    fn exact_origin_entries() {
        let policy = OriginPolicy::new(&["https://dash.example.com/".into()]);
        assert!(policy.allows("https://dash.example.com"));
        assert!(policy.allows("HTTPS://DASH.EXAMPLE.COM"));
        assert!(!policy.allows("http://dash.example.com"));
        assert!(!policy.allows("https://dash.example.com:8443"));
    }

    #[test]
    fn wildcard_allows_everything() {
        let policy = OriginPolicy::new(&["*".into()]);
        assert!(policy.allows("https://anything.example"));
        assert!(policy.allows("null"));
    }
}
