//! Health and diagnostics surface.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AppError;
use crate::pool::account::Account;
use crate::pool::RateLimitEntry;
use crate::store::prefix;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub counts: HealthCounts,
    pub accounts: Vec<AccountHealth>,
}

#[derive(Debug, Serialize)]
pub struct HealthCounts {
    pub total: usize,
    pub available: usize,
    #[serde(rename = "rateLimited")]
    pub rate_limited: usize,
    pub invalid: usize,
}

#[derive(Debug, Serialize)]
pub struct AccountHealth {
    pub email: String,
    pub status: String,
    #[serde(rename = "modelRateLimits")]
    pub model_rate_limits: HashMap<String, u64>,
    pub models: HashMap<String, ModelQuotaView>,
    #[serde(rename = "rateLimitCooldownRemaining")]
    pub rate_limit_cooldown_remaining: u64,
    #[serde(rename = "healthScore", skip_serializing_if = "Option::is_none")]
    pub health_score: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ModelQuotaView {
    pub remaining: u64,
    #[serde(rename = "remainingFraction")]
    pub remaining_fraction: f64,
    #[serde(rename = "resetTime", skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
}

/// GET /health
///
/// Detailed per-account health: availability counts, active model rate
/// limits, and quota snapshots.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let accounts = state.pool.list().await;
    let limits = active_rate_limits(&state).await;

    let mut available = 0usize;
    let mut rate_limited = 0usize;
    let mut invalid = 0usize;
    let mut views = Vec::with_capacity(accounts.len());

    for account in &accounts {
        let account_limits: HashMap<String, u64> = limits
            .get(&account.email)
            .cloned()
            .unwrap_or_default();
        let cooldown = account_limits.values().copied().max().unwrap_or(0);

        let status = if account.is_invalid {
            invalid += 1;
            "invalid"
        } else if !account.enabled {
            "disabled"
        } else if cooldown > 0 {
            rate_limited += 1;
            "rateLimited"
        } else {
            available += 1;
            "ok"
        };

        views.push(AccountHealth {
            email: account.email.clone(),
            status: status.to_string(),
            model_rate_limits: account_limits,
            models: quota_views(account),
            rate_limit_cooldown_remaining: cooldown,
            health_score: state.pool.strategy().health_score(&account.email),
        });
    }

    Json(HealthResponse {
        status: if available > 0 { "ok" } else { "degraded" },
        counts: HealthCounts {
            total: accounts.len(),
            available,
            rate_limited,
            invalid,
        },
        accounts: views,
    })
}

fn quota_views(account: &Account) -> HashMap<String, ModelQuotaView> {
    let Some(quota) = &account.quota else {
        return HashMap::new();
    };
    quota
        .models
        .iter()
        .map(|(model, entry)| {
            (
                model.clone(),
                ModelQuotaView {
                    remaining: (entry.remaining_fraction * 100.0).round() as u64,
                    remaining_fraction: entry.remaining_fraction,
                    reset_time: entry.reset_time.map(|t| t.to_rfc3339()),
                },
            )
        })
        .collect()
}

/// Active rate-limit entries grouped by email, values in remaining millis.
async fn active_rate_limits(state: &AppState) -> HashMap<String, HashMap<String, u64>> {
    let mut limits: HashMap<String, HashMap<String, u64>> = HashMap::new();
    for key in state.store.keys(prefix::RL).await {
        let Some(entry) = state.store.get_json::<RateLimitEntry>(&key).await else {
            continue;
        };
        if !entry.is_active() {
            continue;
        }
        // Key shape: rl:<email>:<model>
        let rest = key.trim_start_matches(prefix::RL);
        let Some((email, model)) = rest.split_once(':') else {
            continue;
        };
        limits
            .entry(email.to_string())
            .or_default()
            .insert(model.to_string(), entry.remaining_ms());
    }
    limits
}

// ---------------------------------------------------------------------------
// Account limits
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AccountLimitsQuery {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, rename = "includeHistory")]
    pub include_history: Option<bool>,
}

/// GET /account-limits
///
/// Live-queries each account's upstream quota diagnostics and returns a
/// JSON document or an ASCII table of model-vs-account remainings.
pub async fn account_limits(
    State(state): State<AppState>,
    Query(query): Query<AccountLimitsQuery>,
) -> Result<Response, AppError> {
    let accounts = state.pool.list().await;
    let mut rows: Vec<serde_json::Value> = Vec::new();
    let mut models_seen: Vec<String> = Vec::new();
    let mut fractions: HashMap<(String, String), f64> = HashMap::new();

    for account in &accounts {
        if account.is_invalid || !account.enabled {
            continue;
        }
        let Ok(token) = state.pool.get_access_token(account).await else {
            continue;
        };
        let project = account.effective_project_id().unwrap_or_default();
        let Some(diagnostics) = state
            .dispatcher
            .upstream()
            .fetch_quota(&token, &project)
            .await
        else {
            continue;
        };

        state
            .pool
            .update_quota(&account.email, diagnostics.quota.clone())
            .await;

        let mut models = serde_json::Map::new();
        for (model, quota) in &diagnostics.quota.models {
            if !models_seen.contains(model) {
                models_seen.push(model.clone());
            }
            fractions.insert(
                (account.email.clone(), model.clone()),
                quota.remaining_fraction,
            );
            models.insert(
                model.clone(),
                json!({
                    "remainingFraction": quota.remaining_fraction,
                    "resetTime": quota.reset_time.map(|t| t.to_rfc3339()),
                }),
            );
        }

        let mut row = json!({
            "email": account.email,
            "tier": diagnostics.tier,
            "models": models,
        });
        if query.include_history.unwrap_or(false) {
            row["history"] = request_history(&state, &account.email).await;
        }
        rows.push(row);
    }

    if query.format.as_deref() == Some("table") {
        models_seen.sort();
        let table = render_table(&rows, &models_seen, &fractions);
        return Ok(table.into_response());
    }

    Ok(Json(json!({"accounts": rows})).into_response())
}

/// Daily request counters for one account, newest first.
async fn request_history(state: &AppState, email: &str) -> serde_json::Value {
    let wanted = format!("{}{email}:", prefix::STATS);
    let mut entries: Vec<(String, i64)> = Vec::new();
    for key in state.store.keys(prefix::STATS).await {
        if !key.starts_with(&wanted) {
            continue;
        }
        let count = state
            .store
            .get_raw(&key)
            .await
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        entries.push((key.trim_start_matches(&wanted).to_string(), count));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    json!(entries
        .into_iter()
        .map(|(key, count)| json!({"key": key, "requests": count}))
        .collect::<Vec<_>>())
}

fn render_table(
    rows: &[serde_json::Value],
    models: &[String],
    fractions: &HashMap<(String, String), f64>,
) -> String {
    let email_width = rows
        .iter()
        .filter_map(|r| r["email"].as_str())
        .map(str::len)
        .max()
        .unwrap_or(5)
        .max(7);

    let mut out = String::new();
    out.push_str(&format!("{:email_width$}", "account"));
    for model in models {
        out.push_str(&format!("  {model:>24}"));
    }
    out.push('\n');
    out.push_str(&"-".repeat(email_width + models.len() * 26));
    out.push('\n');

    for row in rows {
        let email = row["email"].as_str().unwrap_or("?");
        out.push_str(&format!("{email:email_width$}"));
        for model in models {
            let cell = fractions
                .get(&(email.to_string(), model.clone()))
                .map(|f| format!("{:.0}%", f * 100.0))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("  {cell:>24}"));
        }
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Cache management and CLI-compat sinks
// ---------------------------------------------------------------------------

/// POST /refresh-token — drop all cached access tokens and project ids.
pub async fn refresh_token(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.refresher.clear_all_caches().await;
    state.models.invalidate().await;
    tracing::info!("Token and project caches cleared");
    Json(json!({"status": "ok"}))
}

/// POST / and POST /api/event_logging/batch — silently accepted for CLI
/// compatibility.
pub async fn event_sink() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_table() {
        let rows = vec![json!({"email": "a@example.com"})];
        let models = vec!["claude-sonnet-4-5".to_string()];
        let mut fractions = HashMap::new();
        fractions.insert(
            ("a@example.com".to_string(), "claude-sonnet-4-5".to_string()),
            0.42,
        );

        let table = render_table(&rows, &models, &fractions);
        assert!(table.contains("a@example.com"));
        assert!(table.contains("claude-sonnet-4-5"));
        assert!(table.contains("42%"));
    }

    #[test]
    fn test_render_table_missing_cell() {
        let rows = vec![json!({"email": "b@example.com"})];
        let models = vec!["gemini-3-pro".to_string()];
        let table = render_table(&rows, &models, &HashMap::new());
        assert!(table.contains('-'));
    }

    #[tokio::test]
    async fn test_health_empty_pool() {
        let state = crate::test_support::test_state();
        let Json(response) = health(axum::extract::State(state)).await;
        assert_eq!(response.counts.total, 0);
        assert_eq!(response.status, "degraded");
    }
}
