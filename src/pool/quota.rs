//! Per-account quota tracking.
//!
//! Mirrors each account's upstream quota diagnostics. Fresh data scores
//! directly off the remaining fraction; stale data keeps a reduced
//! confidence and never marks an account critical.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;

use crate::pool::account::QuotaState;

/// Quota scoring parameters.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Snapshots older than this are stale.
    pub stale_after: Duration,
    /// Score used when no data is available.
    pub unknown_score: f64,
    /// Confidence multiplier applied to stale data.
    pub stale_confidence: f64,
    /// Global critical threshold on the remaining fraction.
    pub global_threshold: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            unknown_score: 50.0,
            stale_confidence: 0.9,
            global_threshold: 0.1,
        }
    }
}

/// Tracks quota snapshots per account email.
pub struct QuotaTracker {
    config: QuotaConfig,
    snapshots: RwLock<HashMap<String, QuotaState>>,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Replace the snapshot for an account.
    pub fn update(&self, email: &str, state: QuotaState) {
        let mut snapshots = self.snapshots.write().expect("quota lock poisoned");
        snapshots.insert(email.to_string(), state);
    }

    /// Current snapshot, if any.
    pub fn snapshot(&self, email: &str) -> Option<QuotaState> {
        let snapshots = self.snapshots.read().expect("quota lock poisoned");
        snapshots.get(email).cloned()
    }

    fn freshness(&self, state: &QuotaState) -> Freshness {
        match state.last_checked {
            Some(checked) => {
                let age = Utc::now() - checked;
                if age.to_std().map(|a| a <= self.config.stale_after).unwrap_or(true) {
                    Freshness::Fresh
                } else {
                    Freshness::Stale
                }
            }
            None => Freshness::Unknown,
        }
    }

    /// Quota score for selection: `fraction x 100` when known, with a
    /// confidence penalty on stale data; unknown accounts sit mid-scale.
    pub fn score(&self, email: &str, model: &str) -> f64 {
        let snapshots = self.snapshots.read().expect("quota lock poisoned");
        let Some(state) = snapshots.get(email) else {
            return self.config.unknown_score;
        };
        let Some(quota) = state.models.get(model) else {
            return self.config.unknown_score;
        };
        match self.freshness(state) {
            Freshness::Fresh => quota.remaining_fraction * 100.0,
            Freshness::Stale => quota.remaining_fraction * 100.0 * self.config.stale_confidence,
            Freshness::Unknown => self.config.unknown_score,
        }
    }

    /// An account is quota-critical only on fresh data at or under the
    /// effective threshold.
    pub fn is_critical(&self, email: &str, model: &str, threshold: f64) -> bool {
        let snapshots = self.snapshots.read().expect("quota lock poisoned");
        let Some(state) = snapshots.get(email) else {
            return false;
        };
        let Some(quota) = state.models.get(model) else {
            return false;
        };
        matches!(self.freshness(state), Freshness::Fresh)
            && quota.remaining_fraction <= threshold
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(QuotaConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::account::ModelQuota;
    use chrono::Utc;

    fn state(fraction: f64, age_secs: i64) -> QuotaState {
        let mut models = HashMap::new();
        models.insert(
            "claude-sonnet-4-5".to_string(),
            ModelQuota {
                remaining_fraction: fraction,
                reset_time: None,
            },
        );
        QuotaState {
            models,
            last_checked: Some(Utc::now() - chrono::Duration::seconds(age_secs)),
        }
    }

    #[test]
    fn test_unknown_account_mid_scale() {
        let tracker = QuotaTracker::default();
        assert_eq!(tracker.score("a@example.com", "claude-sonnet-4-5"), 50.0);
        assert!(!tracker.is_critical("a@example.com", "claude-sonnet-4-5", 0.1));
    }

    #[test]
    fn test_fresh_score() {
        let tracker = QuotaTracker::default();
        tracker.update("a@example.com", state(0.8, 10));
        assert_eq!(tracker.score("a@example.com", "claude-sonnet-4-5"), 80.0);
    }

    #[test]
    fn test_stale_confidence_penalty() {
        let tracker = QuotaTracker::default();
        tracker.update("a@example.com", state(0.8, 3600));
        let score = tracker.score("a@example.com", "claude-sonnet-4-5");
        assert!((score - 72.0).abs() < 0.001, "score was {score}");
    }

    #[test]
    fn test_critical_requires_fresh() {
        let tracker = QuotaTracker::default();

        tracker.update("a@example.com", state(0.05, 10));
        assert!(tracker.is_critical("a@example.com", "claude-sonnet-4-5", 0.1));

        // Same fraction, stale data: not critical.
        tracker.update("a@example.com", state(0.05, 3600));
        assert!(!tracker.is_critical("a@example.com", "claude-sonnet-4-5", 0.1));
    }

    #[test]
    fn test_unknown_model_not_critical() {
        let tracker = QuotaTracker::default();
        tracker.update("a@example.com", state(0.05, 10));
        assert!(!tracker.is_critical("a@example.com", "gemini-3-pro", 0.1));
        assert_eq!(tracker.score("a@example.com", "gemini-3-pro"), 50.0);
    }
}
