//! The account pool: identity CRUD, usability filtering, and selection.
//!
//! The pool owns the account vector; rate-limit entries are shared with the
//! dispatcher through the key-value store. Selection is delegated to the
//! configured [`Strategy`]. Long-running I/O happens outside the account
//! lock.

pub mod account;
pub mod bucket;
pub mod health;
pub mod quota;
pub mod strategy;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{Config, StrategyKind};
use crate::oauth::TokenRefresher;
use crate::store::{prefix, Store};

pub use account::{Account, AccountSource, RateLimitEntry, SubscriptionTier};
pub use strategy::{Selection, SelectionContext, Strategy};

/// Buffer added to rate-limit entry TTLs so entries outlive their reset.
const RATE_LIMIT_TTL_BUFFER: Duration = Duration::from_secs(60);

/// Usage counters are retained for 30 days.
const STATS_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Development seed file consulted in `DEV_MODE`.
const DEV_SEED_FILE: &str = "accounts.json";

/// Multi-account pool with pluggable selection.
pub struct AccountPool {
    accounts: Mutex<Vec<Account>>,
    strategy: Strategy,
    store: Arc<Store>,
    refresher: Arc<TokenRefresher>,
}

impl AccountPool {
    /// Load persisted accounts and build the pool. A strategy override
    /// takes precedence over the configured kind.
    pub async fn initialize(
        config: &Config,
        store: Arc<Store>,
        refresher: Arc<TokenRefresher>,
        strategy_override: Option<StrategyKind>,
    ) -> Self {
        let kind = strategy_override.unwrap_or(config.strategy);
        let mut accounts = Vec::new();

        for key in store.keys(prefix::ACCT).await {
            if let Some(account) = store.get_json::<Account>(&key).await {
                accounts.push(account);
            }
        }

        if config.dev_mode {
            match tokio::fs::read_to_string(DEV_SEED_FILE).await {
                Ok(raw) => match serde_json::from_str::<Vec<Account>>(&raw) {
                    Ok(seeded) => {
                        info!(count = seeded.len(), "Seeded accounts from {DEV_SEED_FILE}");
                        for account in seeded {
                            if !accounts.iter().any(|a| a.email == account.email) {
                                accounts.push(account);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed {DEV_SEED_FILE}"),
                },
                Err(_) => {}
            }
        }

        info!(
            count = accounts.len(),
            strategy = ?kind,
            "Account pool initialized"
        );

        Self {
            accounts: Mutex::new(accounts),
            strategy: Strategy::new(kind),
            store,
            refresher,
        }
    }

    /// Pool over explicit accounts (tests, imports).
    pub fn with_accounts(
        accounts: Vec<Account>,
        kind: StrategyKind,
        store: Arc<Store>,
        refresher: Arc<TokenRefresher>,
    ) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            strategy: Strategy::new(kind),
            store,
            refresher,
        }
    }

    // -- CRUD ---------------------------------------------------------------

    pub async fn list(&self) -> Vec<Account> {
        self.accounts.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.accounts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.lock().await.is_empty()
    }

    pub async fn get(&self, email: &str) -> Option<Account> {
        self.accounts
            .lock()
            .await
            .iter()
            .find(|a| a.email == email)
            .cloned()
    }

    /// Insert or replace an account, persisting it.
    pub async fn add_or_update(&self, account: Account) {
        {
            let mut accounts = self.accounts.lock().await;
            match accounts.iter_mut().find(|a| a.email == account.email) {
                Some(existing) => *existing = account.clone(),
                None => accounts.push(account.clone()),
            }
        }
        self.persist(&account).await;
    }

    pub async fn remove(&self, email: &str) -> bool {
        let removed = {
            let mut accounts = self.accounts.lock().await;
            let before = accounts.len();
            accounts.retain(|a| a.email != email);
            accounts.len() != before
        };
        if removed {
            self.store.delete(&format!("{}{email}", prefix::ACCT)).await;
        }
        removed
    }

    pub async fn set_enabled(&self, email: &str, enabled: bool) -> bool {
        let updated = self
            .mutate(email, |account| account.enabled = enabled)
            .await;
        if updated {
            info!(email, enabled, "Account enabled state changed");
        }
        updated
    }

    /// Mark an account permanently unusable until re-onboarded.
    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        let updated = self
            .mutate(email, |account| account.mark_invalid(reason))
            .await;
        if updated {
            warn!(email, reason, "Account marked invalid");
            self.refresher.clear_token_cache(email).await;
        }
    }

    pub async fn get_invalid_accounts(&self) -> Vec<Account> {
        self.accounts
            .lock()
            .await
            .iter()
            .filter(|a| a.is_invalid)
            .cloned()
            .collect()
    }

    /// Update an account's quota snapshot (and the hybrid quota tracker).
    pub async fn update_quota(&self, email: &str, quota: account::QuotaState) {
        if let Strategy::Hybrid(hybrid) = &self.strategy {
            hybrid.quota.update(email, quota.clone());
        }
        self.mutate(email, |account| account.quota = Some(quota.clone()))
            .await;
        self.store
            .put_json(
                &format!("{}{email}", prefix::QUOTA),
                &quota,
                Some(Duration::from_secs(5 * 60)),
            )
            .await;
    }

    async fn mutate(&self, email: &str, f: impl FnOnce(&mut Account)) -> bool {
        let changed = {
            let mut accounts = self.accounts.lock().await;
            match accounts.iter_mut().find(|a| a.email == email) {
                Some(account) => {
                    f(account);
                    Some(account.clone())
                }
                None => None,
            }
        };
        match changed {
            Some(account) => {
                self.persist(&account).await;
                true
            }
            None => false,
        }
    }

    async fn persist(&self, account: &Account) {
        self.store
            .put_json(&format!("{}{}", prefix::ACCT, account.email), account, None)
            .await;
    }

    // -- Rate limits --------------------------------------------------------

    fn rate_limit_key(email: &str, model: &str) -> String {
        format!("{}{email}:{model}", prefix::RL)
    }

    /// Record a model rate limit for an account. The entry expires shortly
    /// after its reset time.
    pub async fn mark_rate_limited(&self, email: &str, model: &str, duration: Duration) {
        let entry = RateLimitEntry {
            is_limited: true,
            reset_time: Utc::now().timestamp_millis() + duration.as_millis() as i64,
            actual_reset_ms: duration.as_millis() as u64,
        };
        warn!(
            email,
            model,
            reset_ms = entry.actual_reset_ms,
            "Account rate limited"
        );
        self.store
            .put_json(
                &Self::rate_limit_key(email, model),
                &entry,
                Some(duration + RATE_LIMIT_TTL_BUFFER),
            )
            .await;
    }

    /// Drop every rate-limit entry.
    pub async fn reset_rate_limits(&self) {
        self.store.delete_prefix(prefix::RL).await;
        info!("Rate limits reset");
    }

    async fn rate_limit_wait_ms(&self, email: &str, model: &str) -> Option<u64> {
        let entry: RateLimitEntry = self
            .store
            .get_json(&Self::rate_limit_key(email, model))
            .await?;
        entry.is_active().then(|| entry.remaining_ms())
    }

    /// Accounts passing the base usability filter for a model.
    pub async fn available_accounts(&self, model: &str) -> Vec<Account> {
        let accounts = self.accounts.lock().await.clone();
        let mut available = Vec::new();
        for account in accounts {
            if self.is_usable(&account, model).await {
                available.push(account);
            }
        }
        available
    }

    async fn is_usable(&self, account: &Account, model: &str) -> bool {
        !account.is_invalid
            && account.enabled
            && self
                .rate_limit_wait_ms(&account.email, model)
                .await
                .is_none()
    }

    /// Whether every enabled, valid account is rate limited for the model.
    pub async fn all_rate_limited(&self, model: &str) -> bool {
        let accounts = self.accounts.lock().await.clone();
        let mut any_candidate = false;
        for account in &accounts {
            if account.is_invalid || !account.enabled {
                continue;
            }
            any_candidate = true;
            if self
                .rate_limit_wait_ms(&account.email, model)
                .await
                .is_none()
            {
                return false;
            }
        }
        any_candidate
    }

    /// Smallest remaining rate-limit wait across enabled, valid accounts.
    pub async fn min_wait_ms(&self, model: &str) -> u64 {
        let accounts = self.accounts.lock().await.clone();
        let mut min_wait: Option<u64> = None;
        for account in &accounts {
            if account.is_invalid || !account.enabled {
                continue;
            }
            if let Some(wait) = self.rate_limit_wait_ms(&account.email, model).await {
                min_wait = Some(min_wait.map_or(wait, |m| m.min(wait)));
            }
        }
        min_wait.unwrap_or(0)
    }

    // -- Selection ----------------------------------------------------------

    /// Select an account for a request on `model`.
    pub async fn select(&self, model: &str) -> Selection {
        let accounts = self.accounts.lock().await.clone();

        let mut usable = Vec::with_capacity(accounts.len());
        let mut waits = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let wait = self.rate_limit_wait_ms(&account.email, model).await;
            usable.push(!account.is_invalid && account.enabled && wait.is_none());
            waits.push(wait);
        }

        let ctx = SelectionContext {
            model,
            accounts: &accounts,
            usable: &usable,
            rate_limit_wait_ms: &waits,
        };
        let selection = self.strategy.select(&ctx);

        if let Some(account) = &selection.account {
            self.mutate(&account.email, |a| {
                a.last_used = Utc::now().timestamp_millis();
            })
            .await;
        }
        selection
    }

    // -- Event notifications ------------------------------------------------

    pub async fn notify_success(&self, email: &str, model: &str) {
        self.strategy.on_success(email);
        let date = Utc::now().format("%Y-%m-%d");
        self.store
            .incr(&format!("{}{email}:{model}:{date}", prefix::STATS), STATS_TTL)
            .await;
    }

    pub async fn notify_rate_limit(&self, email: &str) {
        self.strategy.on_rate_limit(email);
    }

    pub async fn notify_failure(&self, email: &str) {
        self.strategy.on_failure(email);
    }

    // -- Credentials --------------------------------------------------------

    /// Obtain an access token for the account via the credential refresher.
    pub async fn get_access_token(
        &self,
        account: &Account,
    ) -> Result<String, crate::oauth::RefreshError> {
        let result = self.refresher.access_token(account).await;
        if let Err(e) = &result {
            if e.is_permanent() {
                self.mark_invalid(
                    &account.email,
                    "Token revoked - re-authentication required",
                )
                .await;
            }
        }
        result
    }

    /// Strategy diagnostics for the health surface.
    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool_with(n: usize, kind: StrategyKind) -> AccountPool {
        let store = Arc::new(Store::in_memory());
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        let accounts = (0..n)
            .map(|i| Account::oauth(format!("acct{i}@example.com"), "tok"))
            .collect();
        AccountPool::with_accounts(accounts, kind, store, refresher)
    }

    #[tokio::test]
    async fn test_add_update_remove() {
        let pool = pool_with(0, StrategyKind::RoundRobin).await;
        assert!(pool.is_empty().await);

        pool.add_or_update(Account::oauth("a@example.com", "tok")).await;
        assert_eq!(pool.len().await, 1);

        let mut updated = pool.get("a@example.com").await.unwrap();
        updated.project_id = Some("proj".into());
        pool.add_or_update(updated).await;
        assert_eq!(pool.len().await, 1);
        assert_eq!(
            pool.get("a@example.com").await.unwrap().project_id.as_deref(),
            Some("proj")
        );

        assert!(pool.remove("a@example.com").await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_selection_skips_disabled_and_invalid() {
        let pool = pool_with(3, StrategyKind::RoundRobin).await;
        pool.set_enabled("acct1@example.com", false).await;
        pool.mark_invalid("acct2@example.com", "revoked").await;

        for _ in 0..5 {
            let selection = pool.select("claude-sonnet-4-5").await;
            assert_eq!(selection.account.unwrap().email, "acct0@example.com");
        }
    }

    #[tokio::test]
    async fn test_rate_limit_lifecycle() {
        let pool = pool_with(2, StrategyKind::RoundRobin).await;
        let model = "claude-sonnet-4-5";

        pool.mark_rate_limited("acct0@example.com", model, Duration::from_secs(60))
            .await;

        let available = pool.available_accounts(model).await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].email, "acct1@example.com");
        assert!(!pool.all_rate_limited(model).await);

        pool.mark_rate_limited("acct1@example.com", model, Duration::from_secs(120))
            .await;
        assert!(pool.all_rate_limited(model).await);

        let min_wait = pool.min_wait_ms(model).await;
        assert!(min_wait > 0 && min_wait <= 60_000, "min_wait was {min_wait}");

        pool.reset_rate_limits().await;
        assert_eq!(pool.available_accounts(model).await.len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_entry_expires() {
        let pool = pool_with(1, StrategyKind::RoundRobin).await;
        let model = "m";
        pool.mark_rate_limited("acct0@example.com", model, Duration::from_millis(20))
            .await;
        assert!(pool.all_rate_limited(model).await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!pool.all_rate_limited(model).await);
    }

    #[tokio::test]
    async fn test_selection_updates_last_used() {
        let pool = pool_with(1, StrategyKind::Sticky).await;
        let before = pool.get("acct0@example.com").await.unwrap().last_used;
        let _ = pool.select("m").await;
        let after = pool.get("acct0@example.com").await.unwrap().last_used;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_invalid_listing() {
        let pool = pool_with(2, StrategyKind::RoundRobin).await;
        pool.mark_invalid(
            "acct0@example.com",
            "Token revoked - re-authentication required",
        )
        .await;

        let invalid = pool.get_invalid_accounts().await;
        assert_eq!(invalid.len(), 1);
        assert_eq!(
            invalid[0].invalid_reason.as_deref(),
            Some("Token revoked - re-authentication required")
        );
    }

    #[tokio::test]
    async fn test_accounts_persist_to_store() {
        let store = Arc::new(Store::in_memory());
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        let pool = AccountPool::with_accounts(
            Vec::new(),
            StrategyKind::RoundRobin,
            store.clone(),
            refresher.clone(),
        );
        pool.add_or_update(Account::oauth("persist@example.com", "tok"))
            .await;

        // A fresh pool over the same store sees the account.
        let config = Config::default();
        let reloaded = AccountPool::initialize(&config, store, refresher, None).await;
        assert!(reloaded.get("persist@example.com").await.is_some());
    }
}
