//! skypool — multi-account reverse proxy for an Anthropic-style Messages
//! API over Google Cloud Code identities.
//!
//! Clients authenticate once to the proxy; each request is routed to one
//! healthy upstream identity, translated between the Anthropic and Google
//! message shapes, and failed over to other identities on rate-limit,
//! capacity, auth, or transient server errors.

pub mod api;
pub mod auth;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod oauth;
pub mod pool;
pub mod ratelimit;
pub mod store;

use std::sync::Arc;

use crate::api::models::ModelCatalog;
use crate::config::Config;
use crate::convert::SignatureCache;
use crate::dispatch::Dispatcher;
use crate::oauth::TokenRefresher;
use crate::pool::AccountPool;
use crate::store::Store;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub pool: Arc<AccountPool>,
    pub refresher: Arc<TokenRefresher>,
    pub dispatcher: Arc<Dispatcher>,
    pub models: Arc<ModelCatalog>,
}

impl AppState {
    /// Wire up the full component graph from configuration.
    pub async fn build(config: Config) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(
            Store::connect(config.redis_addr.as_deref(), config.redis_password.as_deref()).await,
        );
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        let pool = Arc::new(
            AccountPool::initialize(&config, store.clone(), refresher.clone(), None).await,
        );
        let signatures = SignatureCache::new(store.clone());
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), pool.clone(), signatures));

        Self {
            config,
            store,
            pool,
            refresher,
            dispatcher,
            models: Arc::new(ModelCatalog::new()),
        }
    }
}

#[doc(hidden)]
pub mod test_support {
    //! State constructors shared by unit and integration tests.

    use super::*;

    /// An empty-pool, memory-store state.
    pub fn test_state() -> AppState {
        state_with(Config::default(), Vec::new())
    }

    /// A state over the given accounts and config, memory store only.
    pub fn state_with(config: Config, accounts: Vec<pool::Account>) -> AppState {
        let config = Arc::new(config);
        let store = Arc::new(Store::in_memory());
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        let pool = Arc::new(AccountPool::with_accounts(
            accounts,
            config.strategy,
            store.clone(),
            refresher.clone(),
        ));
        let signatures = SignatureCache::new(store.clone());
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), pool.clone(), signatures));

        AppState {
            config,
            store,
            pool,
            refresher,
            dispatcher,
            models: Arc::new(ModelCatalog::new()),
        }
    }

    /// Same as [`state_with`] but with a custom token endpoint for the
    /// refresher (wiremock tests).
    pub fn state_with_token_url(
        config: Config,
        accounts: Vec<pool::Account>,
        token_url: String,
    ) -> AppState {
        let config = Arc::new(config);
        let store = Arc::new(Store::in_memory());
        let refresher = Arc::new(TokenRefresher::with_token_url(store.clone(), token_url));
        let pool = Arc::new(AccountPool::with_accounts(
            accounts,
            config.strategy,
            store.clone(),
            refresher.clone(),
        ));
        let signatures = SignatureCache::new(store.clone());
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), pool.clone(), signatures));

        AppState {
            config,
            store,
            pool,
            refresher,
            dispatcher,
            models: Arc::new(ModelCatalog::new()),
        }
    }
}
