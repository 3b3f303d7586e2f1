//! Sliding-window limiter for connection attempts.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Per-key attempt counter over a rolling window.
#[derive(Debug)]
pub struct RateLimiter<K> {
    /// Zero disables limiting.
    max_attempts: u32,
    window: Duration,
    entries: HashMap<K, Vec<Instant>>,
}

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Limit of `max_attempts` per minute.
    pub fn per_minute(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::from_secs(60))
    }

    /// Record an attempt for `key` if it is allowed.
    ///
    /// Returns `false` once the key has used its allowance for the window.
    pub fn check_and_record(&mut self, key: &K) -> bool {
        if self.max_attempts == 0 {
            return true;
        }
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key.clone()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop keys with no attempts inside the window.
    pub fn gc(&mut self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.entries.len();
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
        before - self.entries.len()
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
