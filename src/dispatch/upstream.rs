//! Cloud Code upstream client: endpoints, wrapper body, and headers.

use serde_json::Value;
use std::time::Duration;

use crate::convert::google::{
    is_thinking_model, model_family, CloudCodeRequest, GoogleRequest, ModelFamily, UpstreamModel,
};
use crate::pool::account::{ModelQuota, QuotaState, SubscriptionTier};

/// Upstream bases, tried in order.
pub const DEFAULT_ENDPOINTS: [&str; 2] = [
    "https://daily-cloudcode-pa.googleapis.com",
    "https://cloudcode-pa.googleapis.com",
];

pub const PATH_GENERATE: &str = "/v1internal:generateContent";
pub const PATH_STREAM: &str = "/v1internal:streamGenerateContent?alt=sse";
pub const PATH_LOAD_CODE_ASSIST: &str = "/v1internal:loadCodeAssist";
pub const PATH_FETCH_MODELS: &str = "/v1internal:fetchAvailableModels";

/// Hard cap on one upstream request.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Beta header required for Claude thinking models.
const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

/// Thin wrapper over reqwest with the Cloud Code header set.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl UpstreamClient {
    pub fn new(endpoint_override: Option<Vec<String>>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(user_agent())
            .connect_timeout(Duration::from_secs(10))
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .unwrap_or_default();
        let endpoints = endpoint_override
            .unwrap_or_else(|| DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect());
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// POST a wrapped request to one endpoint.
    pub async fn post(
        &self,
        endpoint: &str,
        path: &str,
        token: &str,
        body: &CloudCodeRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .http
            .post(format!("{endpoint}{path}"))
            .bearer_auth(token)
            .header("X-Goog-Api-Client", "google-cloud-sdk vscode_cloudshelleditor/0.1")
            .header("Client-Metadata", client_metadata())
            .json(body);

        if model_family(&body.model) == ModelFamily::Claude && is_thinking_model(&body.model) {
            request = request.header("anthropic-beta", INTERLEAVED_THINKING_BETA);
        }

        request.send().await
    }

    /// POST a bare JSON body to one endpoint (diagnostics calls).
    async fn post_json(
        &self,
        endpoint: &str,
        path: &str,
        token: &str,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.http
            .post(format!("{endpoint}{path}"))
            .bearer_auth(token)
            .header("X-Goog-Api-Client", "google-cloud-sdk vscode_cloudshelleditor/0.1")
            .header("Client-Metadata", client_metadata())
            .json(body)
            .send()
            .await
    }

    /// Fetch the upstream model catalog, trying each endpoint.
    pub async fn fetch_models(&self, token: &str) -> Option<Vec<UpstreamModel>> {
        for endpoint in &self.endpoints {
            match self
                .post_json(endpoint, PATH_FETCH_MODELS, token, &serde_json::json!({}))
                .await
            {
                Ok(response) if response.status().is_success() => {
                    let value: Value = response.json().await.ok()?;
                    return Some(parse_model_catalog(&value));
                }
                Ok(response) => {
                    tracing::debug!(
                        endpoint,
                        status = response.status().as_u16(),
                        "Model catalog fetch rejected"
                    );
                }
                Err(e) => {
                    tracing::debug!(endpoint, error = %e, "Model catalog fetch failed");
                }
            }
        }
        None
    }

    /// Fetch per-model quota diagnostics for one identity.
    pub async fn fetch_quota(&self, token: &str, project: &str) -> Option<QuotaDiagnostics> {
        let body = serde_json::json!({
            "cloudaicompanionProject": project,
            "metadata": {"ideType": "IDE_UNSPECIFIED", "pluginType": "GEMINI"},
        });
        for endpoint in &self.endpoints {
            match self
                .post_json(endpoint, PATH_LOAD_CODE_ASSIST, token, &body)
                .await
            {
                Ok(response) if response.status().is_success() => {
                    let value: Value = response.json().await.ok()?;
                    return Some(QuotaDiagnostics::parse(&value));
                }
                Ok(response) => {
                    tracing::debug!(
                        endpoint,
                        status = response.status().as_u16(),
                        "Quota fetch rejected"
                    );
                }
                Err(e) => {
                    tracing::debug!(endpoint, error = %e, "Quota fetch failed");
                }
            }
        }
        None
    }
}

/// Wrap an inner Google request in the Cloud Code envelope.
pub fn wrap_request(project: &str, model: &str, request: GoogleRequest) -> CloudCodeRequest {
    CloudCodeRequest {
        project: project.to_string(),
        model: model.to_string(),
        request,
        user_agent: "antigravity".to_string(),
        request_type: "agent".to_string(),
        request_id: format!("agent-{}", uuid::Uuid::new_v4()),
    }
}

fn user_agent() -> String {
    format!(
        "antigravity/1.16.5 {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

fn client_metadata() -> String {
    serde_json::json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": platform_name(),
        "pluginType": "GEMINI",
    })
    .to_string()
}

fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "DARWIN",
        "windows" => "WINDOWS",
        _ => "LINUX",
    }
}

fn parse_model_catalog(value: &Value) -> Vec<UpstreamModel> {
    let list = value
        .get("models")
        .or_else(|| value.get("availableModels"))
        .and_then(Value::as_array);
    match list {
        Some(entries) => entries
            .iter()
            .filter_map(|entry| serde_json::from_value::<UpstreamModel>(entry.clone()).ok())
            .collect(),
        None => Vec::new(),
    }
}

/// Parsed `loadCodeAssist` diagnostics.
#[derive(Debug, Clone, Default)]
pub struct QuotaDiagnostics {
    pub tier: SubscriptionTier,
    pub project_id: Option<String>,
    pub quota: QuotaState,
}

impl QuotaDiagnostics {
    /// Pull the fields we use out of the diagnostics payload; anything
    /// missing stays at its default.
    pub fn parse(value: &Value) -> Self {
        let tier = value
            .get("currentTier")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(SubscriptionTier::parse)
            .unwrap_or_default();

        let project_id = value
            .get("cloudaicompanionProject")
            .and_then(Value::as_str)
            .map(String::from);

        let mut quota = QuotaState {
            last_checked: Some(chrono::Utc::now()),
            ..QuotaState::default()
        };
        if let Some(entries) = value.get("modelQuotas").and_then(Value::as_array) {
            for entry in entries {
                let Some(model) = entry.get("model").and_then(Value::as_str) else {
                    continue;
                };
                let fraction = entry
                    .get("remainingFraction")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0)
                    .clamp(0.0, 1.0);
                let reset_time = entry
                    .get("resetTime")
                    .and_then(Value::as_str)
                    .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc));
                quota.models.insert(
                    model.to_string(),
                    ModelQuota {
                        remaining_fraction: fraction,
                        reset_time,
                    },
                );
            }
        }

        Self {
            tier,
            project_id,
            quota,
        }
    }
}
