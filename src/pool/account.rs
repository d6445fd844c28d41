//! Account (identity) model and persisted entry shapes.
//!
//! An account is one upstream credential set addressable by email: either a
//! composite OAuth refresh token (`token|project|managed_project`) or a
//! manual API key, never both.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the account entered the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    #[default]
    Oauth,
    Manual,
    Database,
}

/// Subscription tier detected from upstream onboarding data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Ultra,
    #[default]
    Unknown,
}

impl SubscriptionTier {
    /// Map an upstream tier id. `standard-tier` ids count as pro.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("ultra") {
            Self::Ultra
        } else if lower.contains("pro") || lower.contains("standard-tier") {
            Self::Pro
        } else if lower.contains("free") {
            Self::Free
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Subscription {
    pub tier: SubscriptionTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
}

/// Remaining quota for one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelQuota {
    /// Fraction of quota remaining, in `[0, 1]`.
    pub remaining_fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
}

/// Per-account quota snapshot, refreshed from upstream diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuotaState {
    #[serde(default)]
    pub models: HashMap<String, ModelQuota>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

/// A pooled upstream identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    #[serde(default)]
    pub source: AccountSource,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Composite refresh token: `token|project|managed_project`, projects
    /// optional. Empty when the account uses an API key.
    #[serde(default)]
    pub refresh_token: String,
    /// Manual API key; mutually exclusive with `refresh_token`.
    #[serde(default)]
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaState>,
    /// Per-account quota threshold override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_threshold: Option<f64>,
    /// Per-model quota threshold overrides.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_quota_thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<DateTime<Utc>>,
    /// Last selection time, Unix millis.
    #[serde(default)]
    pub last_used: i64,
}

fn default_enabled() -> bool {
    true
}

impl Account {
    /// A fresh OAuth account.
    pub fn oauth(email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            source: AccountSource::Oauth,
            enabled: true,
            refresh_token: refresh_token.into(),
            api_key: String::new(),
            project_id: None,
            subscription: None,
            quota: None,
            quota_threshold: None,
            model_quota_thresholds: HashMap::new(),
            is_invalid: false,
            invalid_reason: None,
            invalid_at: None,
            last_used: 0,
        }
    }

    /// A fresh manual (API key) account.
    pub fn manual(email: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            source: AccountSource::Manual,
            api_key: api_key.into(),
            ..Self::oauth(email, "")
        }
    }

    /// Exactly one of refresh_token / api_key must be set for the account
    /// to be dispatchable.
    pub fn has_credentials(&self) -> bool {
        self.refresh_token.is_empty() != self.api_key.is_empty()
    }

    /// Split the composite refresh token into
    /// `(base_token, project_id, managed_project_id)`.
    pub fn refresh_parts(&self) -> (String, Option<String>, Option<String>) {
        let parts: Vec<&str> = self.refresh_token.split('|').collect();
        let base = parts.first().copied().unwrap_or("").to_string();
        let project = parts
            .get(1)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let managed = parts
            .get(2)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        (base, project, managed)
    }

    /// Project id for the Cloud Code wrapper: explicit field first, then
    /// the composite token, then the subscription record.
    pub fn effective_project_id(&self) -> Option<String> {
        if let Some(id) = &self.project_id {
            return Some(id.clone());
        }
        let (_, project, managed) = self.refresh_parts();
        managed.or(project).or_else(|| {
            self.subscription
                .as_ref()
                .and_then(|s| s.project_id.clone())
        })
    }

    /// The quota threshold that applies to `model`: per-model override,
    /// then per-account, then the caller's global default.
    pub fn quota_threshold_for(&self, model: &str, global: f64) -> f64 {
        if let Some(threshold) = self.model_quota_thresholds.get(model) {
            return *threshold;
        }
        self.quota_threshold.unwrap_or(global)
    }

    /// Mark invalid with a reason.
    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.is_invalid = true;
        self.invalid_reason = Some(reason.into());
        self.invalid_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Persisted rate-limit entries
// ---------------------------------------------------------------------------

/// Persisted rate-limit entry, keyed by `(email, model)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitEntry {
    pub is_limited: bool,
    /// Absolute reset time, Unix millis.
    pub reset_time: i64,
    /// The originally-parsed delay, millis.
    pub actual_reset_ms: u64,
}

impl RateLimitEntry {
    /// An entry whose reset time has passed is logically absent.
    pub fn is_active(&self) -> bool {
        self.is_limited && self.reset_time > Utc::now().timestamp_millis()
    }

    /// Millis until the reset, zero if already past.
    pub fn remaining_ms(&self) -> u64 {
        (self.reset_time - Utc::now().timestamp_millis()).max(0) as u64
    }
}
