//! Rate-limit parsing, classification, and client-side backoff.
//!
//! Upstream 429/5xx responses carry their reset hints in half a dozen
//! shapes: standard headers, `quotaResetDelay`/`quotaResetTimeStamp` body
//! fields, prose ("retry after 30 seconds"), compound durations ("1h30m"),
//! or bare ISO timestamps. [`parse_reset_time`] normalizes all of them to a
//! duration; [`classify`] buckets the failure; [`smart_backoff`] picks the
//! cooldown; [`BackoffTracker`] deduplicates 429 bursts per (email, model)
//! so concurrent requests fail over instead of hammering one identity.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use reqwest::header::HeaderMap;

/// Window within which a repeated 429 on the same key is a duplicate.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Consecutive-429 counters reset after this much inactivity.
const IDLE_RESET: Duration = Duration::from_secs(120);

/// Base delay for the dedup escalation schedule.
const BASE_BACKOFF: Duration = Duration::from_secs(2);

/// Ceiling for the dedup escalation schedule.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Cooldown threshold separating in-place retry from account failover.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Progressive backoff for transient capacity exhaustion, indexed by retry.
pub const CAPACITY_TIERS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// Quota-exhaustion escalation tiers, indexed by consecutive failures.
const QUOTA_TIERS: [Duration; 4] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(2 * 60 * 60),
];

/// Floor applied to parsed reset values.
const MIN_RESET: Duration = Duration::from_millis(500);

/// Parsed values below this get a small cushion added.
const SHORT_RESET_CUSHION: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Why an upstream call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    RateLimitExceeded,
    QuotaExhausted,
    ModelCapacityExhausted,
    ServerError,
    Unknown,
}

impl std::fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimitExceeded => write!(f, "rate_limit_exceeded"),
            Self::QuotaExhausted => write!(f, "quota_exhausted"),
            Self::ModelCapacityExhausted => write!(f, "model_capacity_exhausted"),
            Self::ServerError => write!(f, "server_error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

const QUOTA_MARKERS: &[&str] = &[
    "quota_exhausted",
    "quotaresetdelay",
    "quotaresettimestamp",
    "resource_exhausted",
    "daily limit",
    "quota exceeded",
];

const CAPACITY_MARKERS: &[&str] = &[
    "model_capacity_exhausted",
    "capacity_exhausted",
    "model is currently overloaded",
    "service temporarily unavailable",
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate_limit_exceeded",
    "rate limit",
    "too many requests",
    "throttl",
];

const SERVER_MARKERS: &[&str] = &["internal server error", "server error", "503", "502", "504"];

/// Classify an upstream rejection from its status code and body.
pub fn classify(body: &str, status: u16) -> RateLimitKind {
    match status {
        503 | 529 => return RateLimitKind::ModelCapacityExhausted,
        500 => return RateLimitKind::ServerError,
        _ => {}
    }

    let lower = body.to_ascii_lowercase();
    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        RateLimitKind::QuotaExhausted
    } else if CAPACITY_MARKERS.iter().any(|m| lower.contains(m)) {
        RateLimitKind::ModelCapacityExhausted
    } else if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        RateLimitKind::RateLimitExceeded
    } else if SERVER_MARKERS.iter().any(|m| lower.contains(m)) {
        RateLimitKind::ServerError
    } else {
        RateLimitKind::Unknown
    }
}

// ---------------------------------------------------------------------------
// Reset-time parsing
// ---------------------------------------------------------------------------

static QUOTA_RESET_DELAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)quotaResetDelay"?\s*[:=]?\s*"?([\d.]+)\s*(ms|s)"#).expect("valid regex")
});

static QUOTA_RESET_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)quotaResetTimeStamp"?\s*[:=]?\s*"?(\d{4}-\d{2}-\d{2}[T ][\d:.]+(?:Z|[+-]\d{2}:?\d{2})?)"#,
    )
    .expect("valid regex")
});

static RETRY_DELAY: LazyLock<Regex> = LazyLock::new(|| {
    // Matches both `retryDelay: 0.5s` and `retry-after-ms: 500` forms.
    Regex::new(r#"(?i)(?:retry-after-ms|retryDelay)"?\s*[:=]?\s*"?([\d.]+)\s*(ms|s)?"#)
        .expect("valid regex")
});

static RETRY_AFTER_PROSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry after (\d+) seconds?").expect("valid regex"));

static COMPOUND_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)\b").expect("valid regex")
});

static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T[\d:.]+(?:Z|[+-]\d{2}:?\d{2})").expect("valid regex")
});

/// Extract a reset duration from response headers and body, in priority
/// order. Returns `None` when nothing parseable is present.
pub fn parse_reset_time(headers: &HeaderMap, body: &str) -> Option<Duration> {
    let raw = raw_reset_time(headers, body)?;
    Some(apply_floor(raw))
}

/// Values under 500 ms get a cushion; zero or negative inputs become the
/// 500 ms floor (negative values arrive as `None` from the extractors and
/// are clamped before this point).
fn apply_floor(value: Duration) -> Duration {
    if value.is_zero() {
        MIN_RESET
    } else if value < MIN_RESET {
        value + SHORT_RESET_CUSHION
    } else {
        value
    }
}

fn raw_reset_time(headers: &HeaderMap, body: &str) -> Option<Duration> {
    // 1. Retry-After: seconds or an RFC-1123 date.
    if let Some(value) = header_str(headers, "retry-after") {
        if let Ok(secs) = value.trim().parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(when) = DateTime::parse_from_rfc2822(value.trim()) {
            return duration_until(when.with_timezone(&Utc));
        }
    }

    // 2. x-ratelimit-reset: absolute Unix seconds.
    if let Some(value) = header_str(headers, "x-ratelimit-reset") {
        if let Ok(epoch) = value.trim().parse::<i64>() {
            if let Some(when) = DateTime::from_timestamp(epoch, 0) {
                return duration_until(when);
            }
        }
    }

    // 3. x-ratelimit-reset-after: relative seconds.
    if let Some(value) = header_str(headers, "x-ratelimit-reset-after") {
        if let Ok(secs) = value.trim().parse::<f64>() {
            if secs > 0.0 {
                return Some(Duration::from_secs_f64(secs));
            }
        }
    }

    // 4. Body fields, most specific first.
    if let Some(caps) = QUOTA_RESET_DELAY.captures(body) {
        return parse_unit_value(&caps[1], caps.get(2).map(|m| m.as_str()));
    }
    if let Some(caps) = QUOTA_RESET_TIMESTAMP.captures(body) {
        if let Some(duration) = parse_timestamp(&caps[1]) {
            return Some(duration);
        }
    }
    if let Some(caps) = RETRY_DELAY.captures(body) {
        return parse_unit_value(&caps[1], caps.get(2).map(|m| m.as_str()));
    }
    if let Some(caps) = RETRY_AFTER_PROSE.captures(body) {
        if let Ok(secs) = caps[1].parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
    }
    if let Some(caps) = COMPOUND_DURATION.captures(body) {
        let hours: u64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let minutes: u64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let seconds: f64 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
        let total = Duration::from_secs(hours * 3600 + minutes * 60)
            + Duration::from_secs_f64(seconds);
        if !total.is_zero() {
            return Some(total);
        }
    }
    if let Some(found) = ISO_TIMESTAMP.find(body) {
        if let Some(duration) = parse_timestamp(found.as_str()) {
            return Some(duration);
        }
    }

    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `754.431528` + `ms` -> 754 ms; `0.5` + `s` -> 500 ms; unitless values
/// are milliseconds (the `retry-after-ms` form).
fn parse_unit_value(value: &str, unit: Option<&str>) -> Option<Duration> {
    let number: f64 = value.parse().ok()?;
    if number < 0.0 {
        return None;
    }
    let millis = match unit {
        Some("s") => number * 1000.0,
        _ => number,
    };
    Some(Duration::from_millis(millis as u64))
}

fn parse_timestamp(raw: &str) -> Option<Duration> {
    let normalized = raw.replace(' ', "T");
    let when = DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })?;
    duration_until(when)
}

fn duration_until(when: DateTime<Utc>) -> Option<Duration> {
    let delta = when - Utc::now();
    delta.to_std().ok()
}

// ---------------------------------------------------------------------------
// Smart backoff
// ---------------------------------------------------------------------------

/// Pick a cooldown for a classified failure. A server-provided reset always
/// wins (with a 2 s floor); otherwise the kind chooses the schedule.
pub fn smart_backoff(
    kind: RateLimitKind,
    server_reset: Option<Duration>,
    consecutive: u32,
) -> Duration {
    if let Some(reset) = server_reset {
        if !reset.is_zero() {
            return reset.max(Duration::from_secs(2));
        }
    }

    match kind {
        RateLimitKind::QuotaExhausted => {
            QUOTA_TIERS[(consecutive as usize).min(QUOTA_TIERS.len() - 1)]
        }
        RateLimitKind::RateLimitExceeded => Duration::from_secs(30),
        RateLimitKind::ModelCapacityExhausted => {
            let jitter = rand::rng().random_range(0..10_000);
            Duration::from_secs(15) + Duration::from_millis(jitter)
        }
        RateLimitKind::ServerError => Duration::from_secs(20),
        RateLimitKind::Unknown => Duration::from_secs(60),
    }
}

// ---------------------------------------------------------------------------
// 429 dedup / escalation tracker
// ---------------------------------------------------------------------------

/// Outcome of registering a 429 with the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// Consecutive 429 count for this key, including this one.
    pub attempt: u32,
    /// Escalated delay for this attempt.
    pub delay: Duration,
    /// Whether this 429 landed inside the dedup window of the previous one.
    pub is_duplicate: bool,
}

struct BackoffEntry {
    consecutive: u32,
    last_at: Instant,
}

/// Per-(email, model) 429 bookkeeping. Within the dedup window at most one
/// caller retries in place; the rest switch accounts.
#[derive(Default)]
pub struct BackoffTracker {
    entries: Mutex<HashMap<(String, String), BackoffEntry>>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a 429 for the key and compute the escalated delay.
    pub fn register(&self, email: &str, model: &str) -> BackoffResult {
        let mut entries = self.entries.lock().expect("backoff lock poisoned");
        let key = (email.to_string(), model.to_string());
        let now = Instant::now();

        let (attempt, is_duplicate) = match entries.get(&key) {
            Some(entry) if now.duration_since(entry.last_at) < IDLE_RESET => {
                let duplicate = now.duration_since(entry.last_at) < DEDUP_WINDOW;
                (entry.consecutive + 1, duplicate)
            }
            _ => (1, false),
        };

        entries.insert(
            key,
            BackoffEntry {
                consecutive: attempt,
                last_at: now,
            },
        );

        let exp = BASE_BACKOFF
            .saturating_mul(1u32 << (attempt - 1).min(5));
        let delay = exp.max(BASE_BACKOFF).min(MAX_BACKOFF);

        BackoffResult {
            attempt,
            delay,
            is_duplicate,
        }
    }

    /// Forget a key after a successful request.
    pub fn clear(&self, email: &str, model: &str) {
        let mut entries = self.entries.lock().expect("backoff lock poisoned");
        entries.remove(&(email.to_string(), model.to_string()));
    }
}
