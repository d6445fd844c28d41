//! The request dispatcher: per-request retry loop, endpoint failover,
//! cooldown bookkeeping, and streaming recovery.
//!
//! One dispatch walks up to `max(retries, pool + 1)` account attempts. Each
//! attempt selects an identity, refreshes its credentials, and tries the
//! upstream endpoints in order. Rate limits and capacity stalls are handled
//! inside the loop (cooldown + failover); permanent auth failures
//! invalidate the account and move on; schema errors are fatal for the
//! request but never for an account.

pub mod upstream;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::convert::anthropic::{
    Delta, MessageDelta, MessagesRequest, MessagesResponse, ResponseBlock, StreamEvent,
    StreamMessage, Usage,
};
use crate::convert::google::{is_thinking_model, CloudCodeRequest, GoogleResponse};
use crate::convert::response::generate_message_id;
use crate::convert::{
    accumulate_events, convert_request, convert_response, translate_stream, SignatureCache,
    StreamError,
};
use crate::error::AppError;
use crate::pool::{Account, AccountPool};
use crate::ratelimit::{
    classify, parse_reset_time, smart_backoff, BackoffTracker, RateLimitKind, CAPACITY_TIERS,
    DEFAULT_COOLDOWN,
};

use upstream::{wrap_request, UpstreamClient, PATH_GENERATE, PATH_STREAM};

/// Baseline retry budget; pools larger than this get one attempt per
/// account plus one.
const MAX_RETRIES: usize = 3;

/// Re-issue budget for upstream streams that never produce content.
const MAX_EMPTY_RESPONSE_RETRIES: u32 = 2;

/// When every account is rate limited for longer than this, the request
/// either falls back to another model or fails hard.
const ALL_LIMITED_WAIT_CEILING_MS: u64 = 120_000;

/// Slack added to rate-limit waits to absorb clock skew.
const WAIT_SLACK: Duration = Duration::from_millis(500);

/// Body text of the synthetic reply after empty-response retries run out.
const EMPTY_RESPONSE_FALLBACK_TEXT: &str = "[No response after retries - please try again]";

/// 401 bodies matching these are unrecoverable for the account.
const PERMANENT_AUTH_MARKERS: &[&str] = &[
    "invalid_grant",
    "token revoked",
    "token_revoked",
    "invalid_client",
    "credentials are invalid",
];

/// A dispatched request's result: a complete response or a translated
/// event stream.
pub enum DispatchOutcome {
    Json(MessagesResponse),
    Stream(EventStream),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

/// Why the dispatcher is moving to the next account.
enum FailoverReason {
    RateLimited,
    Auth,
    Server(String),
    Network(String),
}

enum AttemptOutcome {
    Done(DispatchOutcome),
    Failover(FailoverReason),
    Fatal(AppError),
}

/// The multi-account request dispatcher.
pub struct Dispatcher {
    config: Arc<Config>,
    pool: Arc<AccountPool>,
    signatures: SignatureCache,
    backoff: BackoffTracker,
    upstream: UpstreamClient,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, pool: Arc<AccountPool>, signatures: SignatureCache) -> Self {
        let upstream = UpstreamClient::new(config.upstream_endpoints.clone());
        Self {
            config,
            pool,
            signatures,
            backoff: BackoffTracker::new(),
            upstream,
        }
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// Dispatch a request, consulting the fallback model when the primary
    /// is exhausted.
    pub async fn dispatch(
        &self,
        request: &MessagesRequest,
        fallback_enabled: bool,
    ) -> Result<DispatchOutcome, AppError> {
        let model = request.model.clone();
        match self.dispatch_model(request, &model).await {
            Ok(outcome) => Ok(outcome),
            Err((error, fallback_eligible)) => {
                let fallback = self.config.fallback_model.clone();
                match fallback {
                    Some(fallback)
                        if fallback_enabled && fallback_eligible && fallback != model =>
                    {
                        warn!(
                            primary = %model,
                            fallback = %fallback,
                            "Primary model exhausted, switching to fallback"
                        );
                        self.dispatch_model(request, &fallback)
                            .await
                            .map_err(|(e, _)| e)
                    }
                    _ => Err(error),
                }
            }
        }
    }

    /// Run the retry loop against one model. The boolean in the error marks
    /// whether a fallback model may still be consulted.
    async fn dispatch_model(
        &self,
        request: &MessagesRequest,
        model: &str,
    ) -> Result<DispatchOutcome, (AppError, bool)> {
        let pool_size = self.pool.len().await;
        if pool_size == 0 {
            return Err((AppError::NoAccounts, false));
        }

        let max_attempts = MAX_RETRIES.max(pool_size + 1);
        let mut attempt = 0usize;
        // Uncounted iterations (waits, token refresh hiccups) get their own
        // budget so a degenerate pool cannot spin forever.
        let mut uncounted = 0usize;
        let mut last_failure: Option<FailoverReason> = None;

        while attempt < max_attempts && uncounted < max_attempts * 4 {
            // 1. Anyone available? If everyone is rate limited, wait out a
            // short reset or give up toward the fallback model.
            let available = self.pool.available_accounts(model).await;
            if available.is_empty() && self.pool.all_rate_limited(model).await {
                let min_wait = self.pool.min_wait_ms(model).await;
                if min_wait > ALL_LIMITED_WAIT_CEILING_MS {
                    let error = AppError::AllRateLimited {
                        model: model.to_string(),
                        reset: format_wait(min_wait),
                    };
                    return Err((error, true));
                }
                debug!(model, min_wait, "All accounts rate limited, waiting");
                tokio::time::sleep(Duration::from_millis(min_wait) + WAIT_SLACK).await;
                uncounted += 1;
                continue;
            }

            // 2. Pick an identity.
            let selection = self.pool.select(model).await;
            let Some(account) = selection.account else {
                if selection.wait_ms > 0 {
                    debug!(
                        model,
                        wait_ms = selection.wait_ms,
                        reason = selection.reason.as_deref().unwrap_or(""),
                        "Strategy asked to wait"
                    );
                    tokio::time::sleep(Duration::from_millis(selection.wait_ms) + WAIT_SLACK)
                        .await;
                    uncounted += 1;
                    continue;
                }
                attempt += 1;
                uncounted += 1;
                continue;
            };
            if selection.throttle_ms > 0 {
                tokio::time::sleep(Duration::from_millis(selection.throttle_ms)).await;
            }

            // 3. Credentials.
            let token = match self.pool.get_access_token(&account).await {
                Ok(token) => token,
                Err(e) => {
                    debug!(email = %account.email, error = %e, "Token acquisition failed");
                    if e.is_permanent() {
                        last_failure = Some(FailoverReason::Auth);
                    }
                    uncounted += 1;
                    continue;
                }
            };

            // 4. The upstream attempt.
            match self.attempt_account(request, model, &account, &token).await {
                AttemptOutcome::Done(outcome) => return Ok(outcome),
                AttemptOutcome::Fatal(error) => return Err((error, false)),
                AttemptOutcome::Failover(reason) => {
                    match &reason {
                        FailoverReason::RateLimited => {
                            self.pool.notify_rate_limit(&account.email).await;
                        }
                        FailoverReason::Auth => {}
                        FailoverReason::Server(detail) => {
                            debug!(email = %account.email, detail, "Server failure, next account");
                            self.pool.notify_failure(&account.email).await;
                        }
                        FailoverReason::Network(detail) => {
                            debug!(email = %account.email, detail, "Network failure, next account");
                            self.pool.notify_failure(&account.email).await;
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                    last_failure = Some(reason);
                    attempt += 1;
                }
            }
        }

        let error = match last_failure {
            Some(FailoverReason::RateLimited) => {
                let min_wait = self.pool.min_wait_ms(model).await;
                AppError::QuotaExhausted {
                    model: model.to_string(),
                    reset: format_wait(min_wait.max(1_000)),
                }
            }
            Some(FailoverReason::Auth) => {
                AppError::Unauthorized("All accounts failed authentication".to_string())
            }
            Some(FailoverReason::Server(detail)) | Some(FailoverReason::Network(detail)) => {
                AppError::MaxRetriesExceeded {
                    model: model.to_string(),
                    detail,
                }
            }
            None => AppError::MaxRetriesExceeded {
                model: model.to_string(),
                detail: "no usable accounts".to_string(),
            },
        };
        Err((error, true))
    }

    /// One account's attempt: walk the endpoint fallback list.
    async fn attempt_account(
        &self,
        request: &MessagesRequest,
        model: &str,
        account: &Account,
        token: &str,
    ) -> AttemptOutcome {
        let email = account.email.as_str();
        let google_request = convert_request(request, &self.signatures).await;
        let project = account.effective_project_id().unwrap_or_default();
        let wrapped = wrap_request(&project, model, google_request);

        // Thinking models stream even for non-streaming clients so the
        // reasoning blocks arrive intact.
        let use_sse = request.stream || is_thinking_model(model);
        let path = if use_sse { PATH_STREAM } else { PATH_GENERATE };

        let endpoints: Vec<String> = self.upstream.endpoints().to_vec();
        let mut endpoint_idx = 0usize;
        let mut capacity_retries = 0usize;
        let mut last_failure: Option<FailoverReason> = None;

        while endpoint_idx < endpoints.len() {
            let endpoint = endpoints[endpoint_idx].as_str();
            let response = match self.upstream.post(endpoint, path, token, &wrapped).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(endpoint, error = %e, "Endpoint unreachable");
                    last_failure = Some(FailoverReason::Network(e.to_string()));
                    endpoint_idx += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if (200..300).contains(&status) {
                return self
                    .handle_success(request, model, account, token, endpoint, path, &wrapped, response, use_sse)
                    .await;
            }

            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();

            match status {
                401 => {
                    if is_permanent_auth_failure(&body) {
                        self.pool
                            .mark_invalid(email, "Token revoked - re-authentication required")
                            .await;
                        return AttemptOutcome::Failover(FailoverReason::Auth);
                    }
                    debug!(email, "Transient 401, trying next endpoint");
                    last_failure = Some(FailoverReason::Server(snippet(&body)));
                    endpoint_idx += 1;
                }
                400 => {
                    return AttemptOutcome::Fatal(AppError::BadRequest(snippet(&body)));
                }
                429 => {
                    let reset = parse_reset_time(&headers, &body);
                    let kind = classify(&body, status);

                    if kind == RateLimitKind::ModelCapacityExhausted
                        && capacity_retries < CAPACITY_TIERS.len()
                    {
                        let pause = CAPACITY_TIERS[capacity_retries];
                        capacity_retries += 1;
                        info!(email, model, pause_s = pause.as_secs(), "Capacity stall, retrying");
                        tokio::time::sleep(pause).await;
                        continue;
                    }

                    let backoff = self.backoff.register(email, model);
                    let smart =
                        smart_backoff(kind, reset, backoff.attempt.saturating_sub(1));

                    if backoff.is_duplicate {
                        // Another request already retried this identity
                        // inside the window; switch accounts.
                        self.pool.mark_rate_limited(email, model, smart).await;
                        return AttemptOutcome::Failover(FailoverReason::RateLimited);
                    }
                    if backoff.attempt == 1 && smart <= DEFAULT_COOLDOWN {
                        self.pool
                            .mark_rate_limited(email, model, backoff.delay)
                            .await;
                        tokio::time::sleep(backoff.delay).await;
                        continue;
                    }
                    if smart > DEFAULT_COOLDOWN {
                        // Long cooldown (typically quota exhaustion): park
                        // the account and move on after a short pause.
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        self.pool.mark_rate_limited(email, model, smart).await;
                        return AttemptOutcome::Failover(FailoverReason::RateLimited);
                    }
                    self.pool
                        .mark_rate_limited(email, model, backoff.delay)
                        .await;
                    tokio::time::sleep(backoff.delay).await;
                }
                503 | 529 => {
                    if capacity_retries < CAPACITY_TIERS.len() {
                        let pause = CAPACITY_TIERS[capacity_retries];
                        capacity_retries += 1;
                        info!(email, model, pause_s = pause.as_secs(), "Capacity stall, retrying");
                        tokio::time::sleep(pause).await;
                        continue;
                    }
                    last_failure = Some(FailoverReason::Server(snippet(&body)));
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    endpoint_idx += 1;
                }
                s if s >= 500 => {
                    debug!(endpoint, status = s, "Server error, trying next endpoint");
                    last_failure = Some(FailoverReason::Server(snippet(&body)));
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    endpoint_idx += 1;
                }
                s => {
                    return AttemptOutcome::Fatal(AppError::Upstream {
                        status: s,
                        message: snippet(&body),
                    });
                }
            }
        }

        AttemptOutcome::Failover(last_failure.unwrap_or_else(|| {
            FailoverReason::Network("all endpoints failed".to_string())
        }))
    }

    /// A 2xx upstream response: parse, translate, and wire up streaming
    /// recovery.
    #[allow(clippy::too_many_arguments)]
    async fn handle_success(
        &self,
        request: &MessagesRequest,
        model: &str,
        account: &Account,
        token: &str,
        endpoint: &str,
        path: &str,
        wrapped: &CloudCodeRequest,
        response: reqwest::Response,
        use_sse: bool,
    ) -> AttemptOutcome {
        let email = account.email.as_str();
        self.backoff.clear(email, model);
        self.pool.notify_success(email, model).await;

        if !use_sse {
            let value: Value = match response.json().await {
                Ok(value) => value,
                Err(e) => {
                    return AttemptOutcome::Failover(FailoverReason::Server(format!(
                        "unparseable upstream body: {e}"
                    )))
                }
            };
            let google = match GoogleResponse::from_json(&value) {
                Ok(google) => google,
                Err(e) => {
                    return AttemptOutcome::Failover(FailoverReason::Server(format!(
                        "malformed upstream response: {e}"
                    )))
                }
            };
            let converted = convert_response(&google, model, &self.signatures).await;
            return AttemptOutcome::Done(DispatchOutcome::Json(converted));
        }

        if request.stream {
            let stream = self.recovering_stream(
                response,
                endpoint.to_string(),
                path.to_string(),
                token.to_string(),
                wrapped.clone(),
                model.to_string(),
            );
            return AttemptOutcome::Done(DispatchOutcome::Stream(stream));
        }

        // Thinking model, non-streaming client: accumulate the stream, with
        // the same empty-response retry budget.
        let mut response = Some(response);
        for retry in 0..=MAX_EMPTY_RESPONSE_RETRIES {
            let current = match response.take() {
                Some(current) => current,
                None => match self.upstream.post(endpoint, path, token, wrapped).await {
                    Ok(r) if r.status().is_success() => r,
                    Ok(r) => {
                        return AttemptOutcome::Failover(FailoverReason::Server(format!(
                            "re-issue failed with {}",
                            r.status()
                        )))
                    }
                    Err(e) => {
                        return AttemptOutcome::Failover(FailoverReason::Network(e.to_string()))
                    }
                },
            };
            let translated = translate_stream(
                current.bytes_stream(),
                model.to_string(),
                self.signatures.clone(),
            );
            match accumulate_events(translated, model).await {
                Ok(converted) => return AttemptOutcome::Done(DispatchOutcome::Json(converted)),
                Err(StreamError::EmptyResponse) if retry < MAX_EMPTY_RESPONSE_RETRIES => {
                    let pause = Duration::from_millis(500u64 << retry);
                    warn!(email, model, retry, "Empty upstream response, re-issuing");
                    tokio::time::sleep(pause).await;
                }
                Err(StreamError::EmptyResponse) => break,
                Err(StreamError::Http(e)) => {
                    return AttemptOutcome::Failover(FailoverReason::Network(e.to_string()))
                }
            }
        }

        AttemptOutcome::Done(DispatchOutcome::Json(synthetic_response(model)))
    }

    /// Streaming with empty-response recovery: if the upstream stream ends
    /// before `message_start`, re-issue the identical request with
    /// exponential pauses, and synthesize a fallback stream when the budget
    /// runs out.
    fn recovering_stream(
        &self,
        initial: reqwest::Response,
        endpoint: String,
        path: String,
        token: String,
        wrapped: CloudCodeRequest,
        model: String,
    ) -> EventStream {
        let upstream = self.upstream.clone();
        let signatures = self.signatures.clone();

        Box::pin(async_stream::stream! {
            let mut response = Some(initial);
            for retry in 0..=MAX_EMPTY_RESPONSE_RETRIES {
                let current = match response.take() {
                    Some(current) => current,
                    None => match upstream.post(&endpoint, &path, &token, &wrapped).await {
                        Ok(r) if r.status().is_success() => r,
                        _ => break,
                    },
                };

                let mut translated = Box::pin(translate_stream(
                    current.bytes_stream(),
                    model.clone(),
                    signatures.clone(),
                ));
                let mut emitted = false;

                while let Some(event) = translated.next().await {
                    match event {
                        Ok(event) => {
                            emitted = true;
                            yield Ok(event);
                        }
                        Err(StreamError::EmptyResponse) => break,
                        Err(error) => {
                            if emitted {
                                yield Err(error);
                                return;
                            }
                            // Errors before any content count as empty.
                            break;
                        }
                    }
                }

                if emitted {
                    return;
                }
                warn!(model = %model, retry, "Empty upstream stream, re-issuing");
                tokio::time::sleep(Duration::from_millis(500u64 << retry)).await;
            }

            for event in synthetic_fallback_events(&model) {
                yield Ok(event);
            }
        })
    }
}

/// The synthetic stream emitted when every re-issue came back empty.
fn synthetic_fallback_events(model: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            message: StreamMessage {
                id: generate_message_id(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: model.to_string(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ResponseBlock::Text {
                text: String::new(),
            },
        },
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::TextDelta {
                text: EMPTY_RESPONSE_FALLBACK_TEXT.to_string(),
            },
        },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                stop_sequence: None,
            },
            usage: Usage::default(),
        },
        StreamEvent::MessageStop,
    ]
}

/// The synthetic JSON response for the non-streaming empty-response path.
fn synthetic_response(model: &str) -> MessagesResponse {
    MessagesResponse {
        id: generate_message_id(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content: vec![ResponseBlock::Text {
            text: EMPTY_RESPONSE_FALLBACK_TEXT.to_string(),
        }],
        stop_reason: Some("end_turn".to_string()),
        stop_sequence: None,
        usage: Usage::default(),
    }
}

fn is_permanent_auth_failure(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    PERMANENT_AUTH_MARKERS.iter().any(|m| lower.contains(m))
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 300 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(300).collect();
        format!("{cut}…")
    }
}

/// Render a wait in a human-readable unit for error messages.
fn format_wait(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
