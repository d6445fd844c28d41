//! Per-account token bucket.
//!
//! The bucket is the admission mechanism for the hybrid strategy: one token
//! per dispatched request, regenerating continuously. Tokens are refunded
//! when a request dies before reaching upstream.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// Bucket parameters.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Bucket capacity; accounts start full.
    pub max_tokens: f64,
    /// Regeneration rate, tokens per minute.
    pub refill_per_minute: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50.0,
            refill_per_minute: 6.0,
        }
    }
}

#[derive(Debug, Clone)]
struct BucketState {
    tokens: f64,
    last_updated: Instant,
}

/// Tracks a token bucket per account email.
pub struct TokenBucketTracker {
    config: BucketConfig,
    buckets: RwLock<HashMap<String, BucketState>>,
}

impl TokenBucketTracker {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    fn current(&self, state: Option<&BucketState>) -> f64 {
        match state {
            Some(state) => {
                let minutes = state.last_updated.elapsed().as_secs_f64() / 60.0;
                (state.tokens + minutes * self.config.refill_per_minute)
                    .min(self.config.max_tokens)
            }
            None => self.config.max_tokens,
        }
    }

    /// Tokens currently available, after regeneration.
    pub fn tokens(&self, email: &str) -> f64 {
        let buckets = self.buckets.read().expect("bucket lock poisoned");
        self.current(buckets.get(email))
    }

    /// Whether at least one whole token is available.
    pub fn has_tokens(&self, email: &str) -> bool {
        self.tokens(email) >= 1.0
    }

    /// Take one token. Returns false (and takes nothing) when the bucket
    /// holds less than one token.
    pub fn consume(&self, email: &str) -> bool {
        let mut buckets = self.buckets.write().expect("bucket lock poisoned");
        let available = self.current(buckets.get(email));
        if available < 1.0 {
            return false;
        }
        buckets.insert(
            email.to_string(),
            BucketState {
                tokens: available - 1.0,
                last_updated: Instant::now(),
            },
        );
        true
    }

    /// Return one token (request never completed).
    pub fn refund(&self, email: &str) {
        let mut buckets = self.buckets.write().expect("bucket lock poisoned");
        let available = self.current(buckets.get(email));
        buckets.insert(
            email.to_string(),
            BucketState {
                tokens: (available + 1.0).min(self.config.max_tokens),
                last_updated: Instant::now(),
            },
        );
    }

    /// Milliseconds until one whole token is available; zero when it
    /// already is.
    pub fn wait_for_token_ms(&self, email: &str) -> u64 {
        let available = self.tokens(email);
        if available >= 1.0 {
            return 0;
        }
        let deficit = 1.0 - available;
        let minutes = deficit / self.config.refill_per_minute;
        (minutes * 60_000.0).ceil() as u64
    }
}

impl Default for TokenBucketTracker {
    fn default() -> Self {
        Self::new(BucketConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full() {
        let tracker = TokenBucketTracker::default();
        assert_eq!(tracker.tokens("a@example.com"), 50.0);
        assert!(tracker.has_tokens("a@example.com"));
    }

    #[test]
    fn test_consume_drains() {
        let tracker = TokenBucketTracker::default();
        for _ in 0..50 {
            assert!(tracker.consume("a@example.com"));
        }
        assert!(!tracker.has_tokens("a@example.com"));
        assert!(!tracker.consume("a@example.com"));
    }

    #[test]
    fn test_refund_restores() {
        let tracker = TokenBucketTracker::default();
        for _ in 0..50 {
            tracker.consume("a@example.com");
        }
        tracker.refund("a@example.com");
        assert!(tracker.has_tokens("a@example.com"));
    }

    #[test]
    fn test_wait_for_token_estimate() {
        let tracker = TokenBucketTracker::default();
        for _ in 0..50 {
            tracker.consume("a@example.com");
        }
        // At 6 tokens/minute one token takes ~10s.
        let wait = tracker.wait_for_token_ms("a@example.com");
        assert!((9_000..=10_500).contains(&wait), "wait was {wait}");
    }

    #[test]
    fn test_refund_caps_at_max() {
        let tracker = TokenBucketTracker::default();
        tracker.refund("a@example.com");
        assert_eq!(tracker.tokens("a@example.com"), 50.0);
    }

    #[test]
    fn test_regeneration() {
        let config = BucketConfig {
            max_tokens: 2.0,
            refill_per_minute: 6000.0, // 100 tokens/second for the test
        };
        let tracker = TokenBucketTracker::new(config);
        tracker.consume("a@example.com");
        tracker.consume("a@example.com");
        assert!(!tracker.has_tokens("a@example.com"));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(tracker.has_tokens("a@example.com"));
    }
}
