//! HTTP surface assembly.

pub mod health;
pub mod messages;
pub mod models;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::require_api_key;
use crate::AppState;

/// Build the full application router.
///
/// Route layout:
/// ```text
/// POST /v1/messages               (API key gated)
/// POST /v1/messages/count_tokens  (API key gated, 501)
/// GET  /v1/models                 (API key gated)
/// GET  /health
/// GET  /account-limits
/// POST /refresh-token
/// POST /                          (CLI-compat sink)
/// POST /api/event_logging/batch   (CLI-compat sink)
/// ```
pub fn build_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/v1/messages", post(messages::create_message))
        .route("/v1/messages/count_tokens", post(messages::count_tokens))
        .route("/v1/models", get(models::list_models))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let open = Router::new()
        .route("/health", get(health::health))
        .route("/account-limits", get(health::account_limits))
        .route("/refresh-token", post(health::refresh_token))
        .route("/", post(health::event_sink))
        .route("/api/event_logging/batch", post(health::event_sink));

    Router::new().merge(gated).merge(open).with_state(state)
}
