//! Per-account health scoring.
//!
//! Scores move down on failures and rate limits, up on successes, and
//! passively recover over time so a briefly-bad account is not benched
//! forever. All operations are O(1) under a single lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// Tunable scoring parameters.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Score ceiling; accounts start here.
    pub max_score: f64,
    /// Accounts below this are skipped by the normal selection tier.
    pub min_usable: f64,
    /// Passive recovery rate, points per hour since last update.
    pub recovery_per_hour: f64,
    /// Score delta on success.
    pub success_reward: f64,
    /// Score delta on a rate limit (negative).
    pub rate_limit_penalty: f64,
    /// Score delta on a hard failure (negative).
    pub failure_penalty: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_score: 100.0,
            min_usable: 30.0,
            recovery_per_hour: 10.0,
            success_reward: 5.0,
            rate_limit_penalty: -20.0,
            failure_penalty: -10.0,
        }
    }
}

#[derive(Debug, Clone)]
struct HealthRecord {
    score: f64,
    last_updated: Instant,
    consecutive_failures: u32,
}

/// Tracks a health score per account email.
pub struct HealthTracker {
    config: HealthConfig,
    records: RwLock<HashMap<String, HealthRecord>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Effective score: stored score plus passive recovery since the last
    /// update, capped at the ceiling. Unknown accounts are at the ceiling.
    pub fn score(&self, email: &str) -> f64 {
        let records = self.records.read().expect("health lock poisoned");
        match records.get(email) {
            Some(record) => {
                let hours = record.last_updated.elapsed().as_secs_f64() / 3600.0;
                (record.score + hours * self.config.recovery_per_hour)
                    .min(self.config.max_score)
            }
            None => self.config.max_score,
        }
    }

    /// Whether the account clears the normal-tier health bar.
    pub fn is_healthy(&self, email: &str) -> bool {
        self.score(email) >= self.config.min_usable
    }

    pub fn consecutive_failures(&self, email: &str) -> u32 {
        let records = self.records.read().expect("health lock poisoned");
        records
            .get(email)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn record_success(&self, email: &str) {
        self.update(email, self.config.success_reward, true);
    }

    pub fn record_rate_limit(&self, email: &str) {
        self.update(email, self.config.rate_limit_penalty, false);
    }

    pub fn record_failure(&self, email: &str) {
        self.update(email, self.config.failure_penalty, false);
    }

    fn update(&self, email: &str, delta: f64, success: bool) {
        let mut records = self.records.write().expect("health lock poisoned");
        let current = match records.get(email) {
            Some(record) => {
                let hours = record.last_updated.elapsed().as_secs_f64() / 3600.0;
                (record.score + hours * self.config.recovery_per_hour)
                    .min(self.config.max_score)
            }
            None => self.config.max_score,
        };
        let failures = if success {
            0
        } else {
            records
                .get(email)
                .map(|r| r.consecutive_failures + 1)
                .unwrap_or(1)
        };
        records.insert(
            email.to_string(),
            HealthRecord {
                score: (current + delta).clamp(0.0, self.config.max_score),
                last_updated: Instant::now(),
                consecutive_failures: failures,
            },
        );
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
