//! Account-selection strategies.
//!
//! Three interchangeable strategies sit behind the pool's `select`:
//! sticky (stay on one account for prompt-cache continuity), round-robin
//! (rotate every call), and hybrid (scored selection over health, token
//! bucket, and quota trackers with layered fallback tiers).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::StrategyKind;
use crate::pool::account::Account;
use crate::pool::bucket::TokenBucketTracker;
use crate::pool::health::HealthTracker;
use crate::pool::quota::QuotaTracker;

/// Sticky keeps waiting on the current account when its rate limit resets
/// within this window, instead of breaking cache continuity.
const STICKY_WAIT_CEILING_MS: u64 = 2 * 60 * 1000;

/// Throttle hint attached to emergency-tier selections.
const EMERGENCY_THROTTLE_MS: u64 = 250;

/// Throttle hint attached to last-resort selections.
const LAST_RESORT_THROTTLE_MS: u64 = 500;

/// LRU bonus saturates at one hour.
const LRU_CAP_SECS: f64 = 3600.0;

/// Everything a strategy needs to know about the pool for one decision.
pub struct SelectionContext<'a> {
    pub model: &'a str,
    pub accounts: &'a [Account],
    /// Parallel to `accounts`: passes the base usability filter
    /// (enabled, not invalid, no active rate limit for the model).
    pub usable: &'a [bool],
    /// Parallel to `accounts`: remaining rate-limit wait for the model.
    pub rate_limit_wait_ms: &'a [Option<u64>],
}

/// The outcome of a selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Chosen account, if any.
    pub account: Option<Account>,
    /// When no account: how long the caller should wait before retrying.
    pub wait_ms: u64,
    /// When an account is present: a pre-dispatch throttle hint.
    pub throttle_ms: u64,
    /// Human-readable diagnosis when nothing was selectable.
    pub reason: Option<String>,
}

impl Selection {
    fn none(wait_ms: u64, reason: Option<String>) -> Self {
        Self {
            account: None,
            wait_ms,
            throttle_ms: 0,
            reason,
        }
    }

    fn pick(account: Account, throttle_ms: u64) -> Self {
        Self {
            account: Some(account),
            wait_ms: 0,
            throttle_ms,
            reason: None,
        }
    }
}

/// A configured strategy instance. The hybrid variant owns its trackers.
pub enum Strategy {
    Sticky(Mutex<usize>),
    RoundRobin(AtomicUsize),
    Hybrid(HybridStrategy),
}

impl Strategy {
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Sticky => Self::Sticky(Mutex::new(0)),
            StrategyKind::RoundRobin => Self::RoundRobin(AtomicUsize::new(0)),
            StrategyKind::Hybrid => Self::Hybrid(HybridStrategy::default()),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Sticky(_) => StrategyKind::Sticky,
            Self::RoundRobin(_) => StrategyKind::RoundRobin,
            Self::Hybrid(_) => StrategyKind::Hybrid,
        }
    }

    /// Select an account for the request.
    pub fn select(&self, ctx: &SelectionContext<'_>) -> Selection {
        if ctx.accounts.is_empty() {
            return Selection::none(0, Some("no accounts".to_string()));
        }
        match self {
            Self::Sticky(current) => select_sticky(current, ctx),
            Self::RoundRobin(cursor) => select_round_robin(cursor, ctx),
            Self::Hybrid(hybrid) => hybrid.select(ctx),
        }
    }

    pub fn on_success(&self, email: &str) {
        if let Self::Hybrid(hybrid) = self {
            hybrid.health.record_success(email);
        }
    }

    pub fn on_rate_limit(&self, email: &str) {
        if let Self::Hybrid(hybrid) = self {
            hybrid.health.record_rate_limit(email);
        }
    }

    pub fn on_failure(&self, email: &str) {
        if let Self::Hybrid(hybrid) = self {
            hybrid.health.record_failure(email);
            // The request never completed; give the admission token back.
            hybrid.bucket.refund(email);
        }
    }

    /// Health score snapshot for diagnostics surfaces.
    pub fn health_score(&self, email: &str) -> Option<f64> {
        match self {
            Self::Hybrid(hybrid) => Some(hybrid.health.score(email)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sticky
// ---------------------------------------------------------------------------

fn select_sticky(current: &Mutex<usize>, ctx: &SelectionContext<'_>) -> Selection {
    let mut index = current.lock().expect("sticky cursor poisoned");
    let n = ctx.accounts.len();
    if *index >= n {
        *index = 0;
    }

    if ctx.usable[*index] {
        return Selection::pick(ctx.accounts[*index].clone(), 0);
    }

    // Scan forward for the nearest usable account.
    for offset in 1..n {
        let candidate = (*index + offset) % n;
        if ctx.usable[candidate] {
            *index = candidate;
            return Selection::pick(ctx.accounts[candidate].clone(), 0);
        }
    }

    // Nobody is usable. Wait out a short reset on the current account
    // rather than losing its prompt cache.
    if let Some(wait) = ctx.rate_limit_wait_ms[*index] {
        if wait <= STICKY_WAIT_CEILING_MS {
            return Selection::none(wait, Some("current account resets shortly".to_string()));
        }
    }

    *index = (*index + 1) % n;
    Selection::none(0, Some("no usable account".to_string()))
}

// ---------------------------------------------------------------------------
// Round-robin
// ---------------------------------------------------------------------------

fn select_round_robin(cursor: &AtomicUsize, ctx: &SelectionContext<'_>) -> Selection {
    let n = ctx.accounts.len();
    let start = cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

    for offset in 0..n {
        let candidate = (start + offset) % n;
        if ctx.usable[candidate] {
            return Selection::pick(ctx.accounts[candidate].clone(), 0);
        }
    }
    Selection::none(0, Some("no usable account".to_string()))
}

// ---------------------------------------------------------------------------
// Hybrid
// ---------------------------------------------------------------------------

/// Scored selection over per-account trackers.
#[derive(Default)]
pub struct HybridStrategy {
    pub health: HealthTracker,
    pub bucket: TokenBucketTracker,
    pub quota: QuotaTracker,
}

/// Which filter tier produced the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Normal,
    QuotaFallback,
    Emergency,
    LastResort,
}

impl HybridStrategy {
    fn select(&self, ctx: &SelectionContext<'_>) -> Selection {
        for tier in [
            Tier::Normal,
            Tier::QuotaFallback,
            Tier::Emergency,
            Tier::LastResort,
        ] {
            if tier == Tier::LastResort && self.has_bucket_only_blockers(ctx) {
                // A healthy account is merely out of tokens: report the
                // refill wait instead of bypassing admission control.
                return self.diagnose(ctx);
            }

            let candidates = self.filter(ctx, tier);
            if candidates.is_empty() {
                continue;
            }

            match tier {
                Tier::Normal => {}
                Tier::QuotaFallback => {
                    warn!(model = ctx.model, "All accounts quota-critical, ignoring quota")
                }
                Tier::Emergency => {
                    warn!(model = ctx.model, "All accounts unhealthy, emergency selection")
                }
                Tier::LastResort => {
                    warn!(model = ctx.model, "Token buckets empty, last-resort selection")
                }
            }

            let best = candidates
                .into_iter()
                .max_by(|a, b| {
                    self.score(&ctx.accounts[*a], ctx.model)
                        .total_cmp(&self.score(&ctx.accounts[*b], ctx.model))
                })
                .expect("candidates non-empty");

            let account = ctx.accounts[best].clone();
            let throttle = match tier {
                Tier::Normal | Tier::QuotaFallback => 0,
                Tier::Emergency => EMERGENCY_THROTTLE_MS,
                Tier::LastResort => LAST_RESORT_THROTTLE_MS,
            };
            if tier != Tier::LastResort {
                self.bucket.consume(&account.email);
            }
            debug!(
                email = %account.email,
                model = ctx.model,
                tier = ?tier,
                "Hybrid selection"
            );
            return Selection::pick(account, throttle);
        }

        self.diagnose(ctx)
    }

    fn filter(&self, ctx: &SelectionContext<'_>, tier: Tier) -> Vec<usize> {
        (0..ctx.accounts.len())
            .filter(|&i| {
                if !ctx.usable[i] {
                    return false;
                }
                let account = &ctx.accounts[i];
                let email = account.email.as_str();

                let check_quota = tier == Tier::Normal;
                let check_health = matches!(tier, Tier::Normal | Tier::QuotaFallback);
                let check_bucket = tier != Tier::LastResort;

                if check_health && !self.health.is_healthy(email) {
                    return false;
                }
                if check_bucket && !self.bucket.has_tokens(email) {
                    return false;
                }
                if check_quota {
                    let threshold = account
                        .quota_threshold_for(ctx.model, self.quota.config().global_threshold);
                    if self.quota.is_critical(email, ctx.model, threshold) {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    /// Any usable, healthy account whose only blocker is an empty bucket.
    fn has_bucket_only_blockers(&self, ctx: &SelectionContext<'_>) -> bool {
        ctx.accounts.iter().enumerate().any(|(i, account)| {
            ctx.usable[i]
                && self.health.is_healthy(&account.email)
                && !self.bucket.has_tokens(&account.email)
        })
    }

    /// Weighted score: health, bucket fill, quota, and a least-recently-used
    /// bonus capped at one hour.
    fn score(&self, account: &Account, model: &str) -> f64 {
        let email = account.email.as_str();
        let health = self.health.score(email);
        let fill = self.bucket.tokens(email) / self.bucket.config().max_tokens * 100.0;
        let quota = self.quota.score(email, model);
        let idle_secs = ((Utc::now().timestamp_millis() - account.last_used).max(0) as f64
            / 1000.0)
            .min(LRU_CAP_SECS);

        2.0 * health + 5.0 * fill + 3.0 * quota + 0.1 * idle_secs
    }

    /// No tier produced a candidate: report why, and how long until a token
    /// bucket refills if that is the only blocker.
    fn diagnose(&self, ctx: &SelectionContext<'_>) -> Selection {
        let mut unusable = 0usize;
        let mut unhealthy = 0usize;
        let mut no_tokens = 0usize;
        let mut min_refill_ms: Option<u64> = None;

        for (i, account) in ctx.accounts.iter().enumerate() {
            let email = account.email.as_str();
            if !ctx.usable[i] {
                unusable += 1;
                continue;
            }
            let healthy = self.health.is_healthy(email);
            let has_tokens = self.bucket.has_tokens(email);
            if !has_tokens && healthy {
                no_tokens += 1;
                let wait = self.bucket.wait_for_token_ms(email);
                min_refill_ms = Some(min_refill_ms.map_or(wait, |m| m.min(wait)));
            } else if !healthy {
                unhealthy += 1;
            }
        }

        let mut parts = Vec::new();
        if no_tokens > 0 {
            parts.push(format!("{no_tokens} no tokens"));
        }
        if unhealthy > 0 {
            parts.push(format!("{unhealthy} unhealthy"));
        }
        if unusable > 0 {
            parts.push(format!("{unusable} unavailable"));
        }
        let reason = if parts.is_empty() {
            "no accounts".to_string()
        } else {
            parts.join(", ")
        };

        Selection::none(min_refill_ms.unwrap_or(0), Some(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts(n: usize) -> Vec<Account> {
        (0..n)
            .map(|i| Account::oauth(format!("acct{i}@example.com"), "tok"))
            .collect()
    }

    fn ctx<'a>(
        model: &'a str,
        accounts: &'a [Account],
        usable: &'a [bool],
        waits: &'a [Option<u64>],
    ) -> SelectionContext<'a> {
        SelectionContext {
            model,
            accounts,
            usable,
            rate_limit_wait_ms: waits,
        }
    }

    #[test]
    fn test_sticky_stays_on_current() {
        let strategy = Strategy::new(StrategyKind::Sticky);
        let pool = accounts(3);
        let usable = vec![true, true, true];
        let waits = vec![None, None, None];

        for _ in 0..3 {
            let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
            assert_eq!(
                selection.account.unwrap().email,
                "acct0@example.com"
            );
        }
    }

    #[test]
    fn test_sticky_advances_past_unusable() {
        let strategy = Strategy::new(StrategyKind::Sticky);
        let pool = accounts(3);
        let usable = vec![false, false, true];
        let waits = vec![None, None, None];

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert_eq!(selection.account.unwrap().email, "acct2@example.com");

        // Cursor moved: stays on 2 afterwards.
        let usable_all = vec![true, true, true];
        let selection = strategy.select(&ctx("m", &pool, &usable_all, &waits));
        assert_eq!(selection.account.unwrap().email, "acct2@example.com");
    }

    #[test]
    fn test_sticky_waits_for_short_reset() {
        let strategy = Strategy::new(StrategyKind::Sticky);
        let pool = accounts(2);
        let usable = vec![false, false];
        let waits = vec![Some(30_000), Some(300_000)];

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert!(selection.account.is_none());
        assert_eq!(selection.wait_ms, 30_000);
    }

    #[test]
    fn test_sticky_gives_up_on_long_reset() {
        let strategy = Strategy::new(StrategyKind::Sticky);
        let pool = accounts(2);
        let usable = vec![false, false];
        let waits = vec![Some(300_000), Some(300_000)];

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert!(selection.account.is_none());
        assert_eq!(selection.wait_ms, 0);
    }

    #[test]
    fn test_round_robin_rotates() {
        let strategy = Strategy::new(StrategyKind::RoundRobin);
        let pool = accounts(3);
        let usable = vec![true, true, true];
        let waits = vec![None, None, None];

        let first = strategy.select(&ctx("m", &pool, &usable, &waits));
        let second = strategy.select(&ctx("m", &pool, &usable, &waits));
        let third = strategy.select(&ctx("m", &pool, &usable, &waits));
        let emails: Vec<String> = [first, second, third]
            .into_iter()
            .map(|s| s.account.unwrap().email)
            .collect();
        assert_eq!(
            emails,
            vec![
                "acct1@example.com",
                "acct2@example.com",
                "acct0@example.com"
            ]
        );
    }

    #[test]
    fn test_round_robin_never_waits() {
        let strategy = Strategy::new(StrategyKind::RoundRobin);
        let pool = accounts(2);
        let usable = vec![false, false];
        let waits = vec![Some(5_000), Some(5_000)];

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert!(selection.account.is_none());
        assert_eq!(selection.wait_ms, 0);
    }

    #[test]
    fn test_hybrid_skips_rate_limited() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        let pool = accounts(2);
        let usable = vec![false, true];
        let waits = vec![Some(10_000), None];

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert_eq!(selection.account.unwrap().email, "acct1@example.com");
    }

    #[test]
    fn test_hybrid_prefers_healthy() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        let pool = accounts(2);
        let usable = vec![true, true];
        let waits = vec![None, None];

        // Degrade account 0 below the other.
        strategy.on_rate_limit("acct0@example.com");
        strategy.on_rate_limit("acct0@example.com");

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert_eq!(selection.account.unwrap().email, "acct1@example.com");
    }

    #[test]
    fn test_hybrid_emergency_tier_throttles() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        let pool = accounts(1);
        let usable = vec![true];
        let waits = vec![None];

        // Force health below the usable bar (100 - 4*20 = 20 < 30).
        for _ in 0..4 {
            strategy.on_rate_limit("acct0@example.com");
        }

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert!(selection.account.is_some());
        assert_eq!(selection.throttle_ms, EMERGENCY_THROTTLE_MS);
    }

    #[test]
    fn test_hybrid_no_tokens_diagnosis() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        let pool = accounts(1);
        let usable = vec![true];
        let waits = vec![None];

        if let Strategy::Hybrid(hybrid) = &strategy {
            while hybrid.bucket.consume("acct0@example.com") {}
        }

        // A healthy but drained account reports the refill wait (~10s at
        // 6 tokens/minute) rather than being handed out.
        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert!(selection.account.is_none());
        assert!(selection.reason.as_deref().unwrap().contains("no tokens"));
        assert!((9_000..=10_500).contains(&selection.wait_ms));
    }

    #[test]
    fn test_hybrid_last_resort_for_unhealthy_and_drained() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        let pool = accounts(1);
        let usable = vec![true];
        let waits = vec![None];

        if let Strategy::Hybrid(hybrid) = &strategy {
            while hybrid.bucket.consume("acct0@example.com") {}
            for _ in 0..4 {
                hybrid.health.record_rate_limit("acct0@example.com");
            }
        }

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert!(selection.account.is_some());
        assert_eq!(selection.throttle_ms, LAST_RESORT_THROTTLE_MS);
    }

    #[test]
    fn test_hybrid_diagnosis_when_nothing_usable() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        let pool = accounts(2);
        let usable = vec![false, false];
        let waits = vec![Some(10_000), Some(20_000)];

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert!(selection.account.is_none());
        assert!(selection.reason.unwrap().contains("unavailable"));
    }

    #[test]
    fn test_failure_refunds_token() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        if let Strategy::Hybrid(hybrid) = &strategy {
            while hybrid.bucket.consume("acct0@example.com") {}
            assert!(!hybrid.bucket.has_tokens("acct0@example.com"));
        }
        strategy.on_failure("acct0@example.com");
        if let Strategy::Hybrid(hybrid) = &strategy {
            assert!(hybrid.bucket.has_tokens("acct0@example.com"));
        }
    }

    #[test]
    fn test_lru_breaks_ties() {
        let strategy = Strategy::new(StrategyKind::Hybrid);
        let mut pool = accounts(2);
        let now = Utc::now().timestamp_millis();
        pool[0].last_used = now;
        pool[1].last_used = now - 600_000; // idle 10 minutes
        let usable = vec![true, true];
        let waits = vec![None, None];

        let selection = strategy.select(&ctx("m", &pool, &usable, &waits));
        assert_eq!(selection.account.unwrap().email, "acct1@example.com");
    }
}
