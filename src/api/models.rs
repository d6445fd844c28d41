//! `GET /v1/models` and the model-validation cache.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::convert::google::UpstreamModel;
use crate::error::AppError;
use crate::AppState;

/// Catalog entries are reused for this long.
const CATALOG_TTL: Duration = Duration::from_secs(5 * 60);

/// Cached upstream model catalog; doubles as the model validator.
#[derive(Default)]
pub struct ModelCatalog {
    cached: Mutex<Option<(Instant, Vec<UpstreamModel>)>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current catalog, refreshed through the dispatcher when stale. An
    /// unavailable upstream yields an empty catalog (validation is then
    /// permissive).
    pub async fn models(&self, state: &AppState) -> Vec<UpstreamModel> {
        {
            let cached = self.cached.lock().await;
            if let Some((at, models)) = cached.as_ref() {
                if at.elapsed() < CATALOG_TTL {
                    return models.clone();
                }
            }
        }

        let fetched = self.fetch(state).await.unwrap_or_default();
        let mut cached = self.cached.lock().await;
        *cached = Some((Instant::now(), fetched.clone()));
        fetched
    }

    async fn fetch(&self, state: &AppState) -> Option<Vec<UpstreamModel>> {
        // Any usable identity can list models.
        let account = state.pool.list().await.into_iter().find(|a| {
            !a.is_invalid && a.enabled
        })?;
        let token = state.pool.get_access_token(&account).await.ok()?;
        state.dispatcher.upstream().fetch_models(&token).await
    }

    /// Whether a model id should be accepted. Permissive when the catalog
    /// is unknown.
    pub async fn is_valid(&self, state: &AppState, model: &str) -> bool {
        let models = self.models(state).await;
        models.is_empty() || models.iter().any(|m| m.id == model)
    }

    /// Drop the cached catalog.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// GET /v1/models
///
/// Anthropic-compatible model listing, populated from the upstream catalog.
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, AppError> {
    let models = state.models.models(&state).await;
    let created = Utc::now().timestamp();

    let data = models
        .into_iter()
        .map(|model| ModelInfo {
            id: model.id,
            object: "model",
            created,
            owned_by: "anthropic",
            description: model.description.or(model.display_name),
        })
        .collect();

    Ok(Json(ModelsResponse {
        object: "list",
        data,
    }))
}
