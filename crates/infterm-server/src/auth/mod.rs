//! Connection admission: rate limit, origin check, token check.

pub mod rate_limit;

pub use rate_limit::RateLimiter;

use infterm_core::{BridgeError, BridgeResult, OriginPolicy, TokenManager};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

const BOOTSTRAP_CLIENT_ID: &str = "bootstrap";

/// Decides whether an upgrade request may proceed.
pub struct ConnectionGate {
    origins: OriginPolicy,
    tokens: Arc<TokenManager>,
    require_token: bool,
    limiter: Mutex<RateLimiter<IpAddr>>,
    bootstrap: Mutex<Option<(String, Instant)>>,
}

impl ConnectionGate {
    pub fn new(
        origins: OriginPolicy,
        tokens: Arc<TokenManager>,
        require_token: bool,
        max_connects_per_minute: u32,
    ) -> Self {
        Self {
            origins,
            tokens,
            require_token,
            limiter: Mutex::new(RateLimiter::per_minute(max_connects_per_minute)),
            bootstrap: Mutex::new(None),
        }
    }

    /// Check a connection attempt, in order: rate limit, origin, token.
    pub fn admit(&self, peer: IpAddr, origin: Option<&str>, token: Option<&str>) -> BridgeResult<()> {
        if !self.limiter().check_and_record(&peer) {
            return Err(BridgeError::RateLimited(peer.to_string()));
        }
        self.origins.check(origin)?;
        if self.require_token && !self.tokens.validate(token) {
            return Err(BridgeError::AuthFailed(
                "missing, unknown or expired token".into(),
            ));
        }
        Ok(())
    }

    /// Keep a valid bootstrap token on hand while tokens are required.
    ///
    /// A new token is issued and logged once the current one is past half
    /// its TTL, so an operator always has one with at least half its life
    /// left. Older bootstrap tokens stay valid until they expire.
    pub fn refresh_bootstrap(&self) -> Option<String> {
        if !self.require_token {
            return None;
        }
        let ttl = self.tokens.ttl();
        let mut current = self.bootstrap.lock().unwrap_or_else(|e| e.into_inner());
        let stale = match current.as_ref() {
            Some((_, issued_at)) => issued_at.elapsed() >= ttl / 2,
            None => true,
        };
        if stale {
            let token = self.tokens.issue(BOOTSTRAP_CLIENT_ID);
            info!(token = %token, ttl_secs = ttl.as_secs(), "bootstrap token issued");
            *current = Some((token, Instant::now()));
        }
        current.as_ref().map(|(token, _)| token.clone())
    }

    /// The most recently issued bootstrap token, if any.
    pub fn bootstrap_token(&self) -> Option<String> {
        self.bootstrap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(token, _)| token.clone())
    }

    /// Drop expired tokens and idle limiter entries.
    pub fn sweep(&self) {
        let tokens = self.tokens.sweep();
        let peers = self.limiter().gc();
        if tokens > 0 || peers > 0 {
            debug!(tokens, peers, "swept expired auth state");
        }
    }

    fn limiter(&self) -> MutexGuard<'_, RateLimiter<IpAddr>> {
        self.limiter.lock().unwrap_or_else(|e| e.into_inner())
    }
}
