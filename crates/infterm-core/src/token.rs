//! Short-lived auth tokens and random hex identifiers.
//!
//! A token is 32 random bytes, hex-encoded, mapped to the client it was
//! issued for. Tokens expire a fixed window after issuance; expired entries
//! are dropped when looked up and by [`TokenManager::sweep`].

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default token lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(600);

/// Number of random bytes behind every session id and token.
pub const ID_BYTES: usize = 32;

/// Generate a 64-character lowercase hex identifier from the OS RNG.
pub fn generate_hex_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Whether `s` has the shape of an id produced by [`generate_hex_id`].
pub fn is_hex_id(s: &str) -> bool {
    s.len() == ID_BYTES * 2 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug)]
struct TokenEntry {
    client_id: String,
    created_at: Instant,
}

/// Issues and validates auth tokens.
#[derive(Debug)]
pub struct TokenManager {
    ttl: Duration,
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new(TOKEN_TTL)
    }
}

impl TokenManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, TokenEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue a fresh token for `client_id`.
    pub fn issue(&self, client_id: &str) -> String {
        let mut entries = self.entries();
        let mut token = generate_hex_id();
        while entries.contains_key(&token) {
            token = generate_hex_id();
        }
        entries.insert(
            token.clone(),
            TokenEntry {
                client_id: client_id.to_string(),
                created_at: Instant::now(),
            },
        );
        token
    }

    /// Check a token. Missing, unknown and expired tokens are all invalid;
    /// an expired token is removed on the spot.
    pub fn validate(&self, token: Option<&str>) -> bool {
        self.client_id(token).is_some()
    }

    /// Client the token was issued for, if the token is still valid.
    pub fn client_id(&self, token: Option<&str>) -> Option<String> {
        let token = token?;
        let mut entries = self.entries();
        let entry = entries.get(token)?;
        if entry.created_at.elapsed() > self.ttl {
            entries.remove(token);
            return None;
        }
        Some(entry.client_id.clone())
    }

    /// How long an issued token stays valid.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop every expired token. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() <= ttl);
        before - entries.len()
    }

    /// Number of tokens currently held (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_64_lowercase_hex() {
        for _ in 0..16 {
            let id = generate_hex_id();
            assert_eq!(id.len(), 64);
            assert!(is_hex_id(&id), "bad id: {id}");
        }
    }

    #[test]
    fn hex_id_shape_check() {
        assert!(!is_hex_id("abc"));
        assert!(!is_hex_id(&"AB".repeat(32)));
        assert!(!is_hex_id(&"zz".repeat(32)));
        assert!(is_hex_id(&"0f".repeat(32)));
    }

    #[test]
    fn issue_and_validate() {
        let tokens = TokenManager::default();
        let token = tokens.issue("client-1");
        assert!(is_hex_id(&token));
        assert!(tokens.validate(Some(&token)));
        assert_eq!(tokens.client_id(Some(&token)).as_deref(), Some("client-1"));
    }

    #[test]
    fn missing_and_unknown_tokens_are_invalid() {
        let tokens = TokenManager::default();
        assert!(!tokens.validate(None));
        assert!(!tokens.validate(Some(&generate_hex_id())));
    }

    #[test]
    fn tokens_are_unique() {
        let tokens = TokenManager::default();
        let issued: HashSet<String> = (0..32).map(|i| tokens.issue(&format!("c{i}"))).collect();
        assert_eq!(issued.len(), 32);
    }

    #[test]
    fn expired_token_is_purged_lazily() {
        let tokens = TokenManager::new(Duration::from_millis(20));
        let token = tokens.issue("client-1");
        std::thread::sleep(Duration::from_millis(40));
        assert!(!tokens.validate(Some(&token)));
        assert!(tokens.is_empty());
    }

    #[test]
    fn sweep_drops_only_expired() {
        let tokens = TokenManager::new(Duration::from_millis(50));
        tokens.issue("old");
        std::thread::sleep(Duration::from_millis(80));
        let fresh = tokens.issue("new");
        assert_eq!(tokens.sweep(), 1);
        assert_eq!(tokens.len(), 1);
        assert!(tokens.validate(Some(&fresh)));
    }
}
