//! Client-facing API-key gate.
//!
//! When `API_KEY` is configured, requests to the `/v1/*` surface must carry
//! it as `Authorization: Bearer <key>` or `X-API-Key: <key>`, matched
//! exactly. Without the variable the gate is open.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;
use crate::AppState;

/// Axum middleware enforcing the API key on gated routes.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    if bearer == Some(expected) || header_key == Some(expected) {
        return Ok(next.run(request).await);
    }

    Err(AppError::Unauthorized(
        "Missing or invalid API key".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::middleware;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn app(api_key: Option<&str>) -> Router {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.api_key = api_key.map(String::from);
        state.config = std::sync::Arc::new(config);

        Router::new()
            .route("/v1/ping", get(ok_handler))
            .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_open_gate_without_key() {
        let app = app(None);
        let response = app
            .oneshot(HttpRequest::get("/v1/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejects_missing_key() {
        let app = app(Some("secret"));
        let response = app
            .oneshot(HttpRequest::get("/v1/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_accepts_bearer() {
        let app = app(Some("secret"));
        let response = app
            .oneshot(
                HttpRequest::get("/v1/ping")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_accepts_x_api_key() {
        let app = app(Some("secret"));
        let response = app
            .oneshot(
                HttpRequest::get("/v1/ping")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejects_wrong_key() {
        let app = app(Some("secret"));
        let response = app
            .oneshot(
                HttpRequest::get("/v1/ping")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
