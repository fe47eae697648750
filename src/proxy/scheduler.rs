// Account scheduling: executes one logical request against the upstream,
// with sticky-account preference, wait-vs-switch decisions on rate limits,
// per-attempt endpoint fallback, and a single fallback-model re-entry.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::proxy::accounts::AccountStore;
use crate::proxy::common::model_mapping;
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::proxy::mappers::claude::models::ClaudeRequest;
use crate::proxy::mappers::claude::translate_request_in;
use crate::proxy::project_resolver;
use crate::proxy::rate_limit::parse_reset_time;
use crate::proxy::sticky::{SchedulingConfig, StickyPins};
use crate::proxy::upstream::{UpstreamCallError, UpstreamClient};

const MAX_RETRIES: usize = 5;

/// Extra slack added after a rate-limit wait so the upstream clock has
/// definitely rolled over.
const WAIT_SLACK_MS: u64 = 500;

const JITTER_FACTOR: f64 = 0.2;

pub struct Scheduler {
    store: Arc<AccountStore>,
    pins: Arc<StickyPins>,
    upstream: Arc<UpstreamClient>,
    fallback_model: Option<String>,
    request_timeout: Duration,
    stream_timeout: Duration,
    /// Longest tolerated block on a rate-limited pool before failing fast.
    max_wait_ms: i64,
}

/// A successful upstream response plus the identity that produced it.
pub struct ScheduledResponse {
    pub response: reqwest::Response,
    pub email: String,
    /// Canonical model that actually served the request (the fallback model
    /// when the primary pool was exhausted).
    pub model: String,
}

/// Classified upstream failure, decoupled from the HTTP layer for testing.
#[derive(Debug, PartialEq)]
enum FailureClass {
    /// Token rejected: invalidate it and retry (refresh happens on the way).
    Auth,
    /// Account rejected outright: invalidate the account, move on.
    Permission,
    /// Rate limited: mark and move on.
    RateLimited,
    /// Upstream broke after both endpoints: worth another attempt.
    Server,
    /// The request itself is bad: do not retry.
    Invalid,
}

fn classify_upstream_failure(status: u16, body: &str) -> FailureClass {
    match status {
        401 => FailureClass::Auth,
        403 => FailureClass::Permission,
        429 => FailureClass::RateLimited,
        408 | 500..=599 => FailureClass::Server,
        _ if body.contains("AUTH_INVALID") || body.contains("UNAUTHENTICATED") => {
            FailureClass::Auth
        }
        _ if body.contains("PERMISSION_DENIED") => FailureClass::Permission,
        _ => FailureClass::Invalid,
    }
}

/// Client-safe message for an upstream 4xx: the upstream's own error text
/// when it parses, with nothing proxy-internal attached.
fn sanitized_upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "upstream rejected the request".to_string())
}

fn apply_jitter(delay_ms: u64) -> u64 {
    let jitter_range = (delay_ms as f64 * JITTER_FACTOR) as i64;
    if jitter_range == 0 {
        return delay_ms;
    }
    let jitter: i64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    ((delay_ms as i64) + jitter).max(1) as u64
}

impl Scheduler {
    pub fn new(
        store: Arc<AccountStore>,
        pins: Arc<StickyPins>,
        upstream: Arc<UpstreamClient>,
        fallback_model: Option<String>,
        request_timeout: Duration,
        stream_timeout: Duration,
        scheduling: &SchedulingConfig,
    ) -> Self {
        Self {
            store,
            pins,
            upstream,
            fallback_model,
            request_timeout,
            stream_timeout,
            max_wait_ms: (scheduling.max_wait_seconds as i64).saturating_mul(1000),
        }
    }

    pub fn pins(&self) -> Arc<StickyPins> {
        Arc::clone(&self.pins)
    }

    pub fn store(&self) -> Arc<AccountStore> {
        Arc::clone(&self.store)
    }

    /// Run the full retry pipeline for a model; on pool exhaustion, re-enter
    /// once with the configured fallback model.
    pub async fn execute(
        &self,
        request: &ClaudeRequest,
        model: &str,
        trace_id: &str,
    ) -> ProxyResult<ScheduledResponse> {
        match self.run_attempts(request, model, trace_id).await {
            Ok(response) => Ok(response),
            Err(primary_err) if self.fallback_applies(&primary_err, model) => {
                let fallback = self.fallback_model.clone().unwrap_or_default();
                warn!(
                    "[{}] Pool exhausted for {} ({}); retrying once with fallback model {}",
                    trace_id, model, primary_err, fallback
                );
                self.run_attempts(request, &fallback, trace_id).await
            }
            Err(e) => Err(e),
        }
    }

    fn fallback_applies(&self, error: &ProxyError, model: &str) -> bool {
        let retryable = matches!(
            error,
            ProxyError::NoAccounts
                | ProxyError::RateLimit { .. }
                | ProxyError::ServiceUnavailable
                | ProxyError::Timeout
        );

        retryable
            && self
                .fallback_model
                .as_deref()
                .map(|fb| !fb.is_empty() && fb != model)
                .unwrap_or(false)
    }

    async fn run_attempts(
        &self,
        request: &ClaudeRequest,
        model: &str,
        trace_id: &str,
    ) -> ProxyResult<ScheduledResponse> {
        let max_attempts = MAX_RETRIES.max(self.store.len() + 1);
        let mut attempted: HashSet<String> = HashSet::new();
        let mut last_error: Option<ProxyError> = None;

        for attempt in 0..max_attempts {
            let account = match self.select_account(model, &attempted).await {
                Ok(account) => account,
                // A rate-limit fast-fail carries the reset time; anything
                // else defers to the more specific per-attempt error
                Err(e @ ProxyError::RateLimit { .. }) => return Err(e),
                Err(e) => return Err(last_error.unwrap_or(e)),
            };
            let email = account.email.clone();

            debug!(
                "[{}] Attempt {}/{} using account {} for {}",
                trace_id,
                attempt + 1,
                max_attempts,
                email,
                model
            );

            // Token acquisition (proactive-refresh aware)
            let token = match self.store.get_access_token(&email).await {
                Ok(token) => token,
                Err(e) => {
                    attempted.insert(email.clone());
                    self.release_pin_if_held(model, &email);
                    last_error = Some(e);
                    continue;
                }
            };

            // Project discovery for accounts enrolled without one
            let project_id = match account.project_id.clone() {
                Some(project_id) => project_id,
                None => {
                    match project_resolver::fetch_project_id(&self.upstream, &token).await {
                        Ok(project_id) => {
                            self.store.set_project_id(&email, &project_id);
                            project_id
                        }
                        Err(e) => {
                            warn!("[{}] Project discovery failed for {}: {}", trace_id, email, e);
                            attempted.insert(email.clone());
                            self.release_pin_if_held(model, &email);
                            last_error = Some(ProxyError::ServiceUnavailable);
                            continue;
                        }
                    }
                }
            };

            // Translation errors are the client's problem; no retry
            let payload = translate_request_in(request, model, &project_id)?;

            // Thinking models speak SSE even on the non-streaming path
            let sse_path = request.stream || model_mapping::is_thinking_model(model);
            let (method, query) = if sse_path {
                ("streamGenerateContent", Some("alt=sse"))
            } else {
                ("generateContent", None)
            };
            let timeout = if request.stream {
                self.stream_timeout
            } else {
                self.request_timeout
            };

            let result = self
                .upstream
                .call_v1_internal(method, &token, &payload, query, timeout)
                .await;

            let response = match result {
                Ok(response) => response,
                Err(UpstreamCallError::Timeout) => {
                    warn!("[{}] Upstream timed out on {}", trace_id, email);
                    last_error = Some(ProxyError::Timeout);
                    continue;
                }
                Err(UpstreamCallError::Network(e)) => {
                    warn!("[{}] Network failure on {}: {}", trace_id, email, e);
                    last_error = Some(ProxyError::ServiceUnavailable);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                self.store.mark_success(&email, model);
                self.pins.pin(model, &email);
                info!("[{}] ✓ Upstream accepted via {} ({})", trace_id, email, model);
                return Ok(ScheduledResponse {
                    response,
                    email,
                    model: model.to_string(),
                });
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string());
            let body = response.text().await.unwrap_or_default();

            debug!(
                "[{}] Upstream {} from {}: {}",
                trace_id,
                status,
                email,
                body.chars().take(400).collect::<String>()
            );

            match classify_upstream_failure(status.as_u16(), &body) {
                FailureClass::Auth => {
                    // Refresh on the next pass; the account itself survives
                    self.store.invalidate_token(&email);
                    last_error = Some(ProxyError::Auth);
                }
                FailureClass::Permission => {
                    self.store.mark_invalid(&email, "permission denied by upstream");
                    self.pins.release_account(&email);
                    attempted.insert(email.clone());
                    last_error = Some(ProxyError::Permission);
                }
                FailureClass::RateLimited => {
                    let reset_at = parse_reset_time(retry_after.as_deref(), &body);
                    self.store.mark_rate_limited(&email, model, reset_at);
                    last_error = Some(ProxyError::RateLimit { reset_at });
                }
                FailureClass::Server => {
                    last_error = Some(ProxyError::ServiceUnavailable);
                }
                FailureClass::Invalid => {
                    return Err(ProxyError::InvalidRequest(sanitized_upstream_message(&body)));
                }
            }
        }

        Err(last_error.unwrap_or(ProxyError::ServiceUnavailable))
    }

    /// Sticky-or-next selection with the wait-vs-switch policy.
    async fn select_account(
        &self,
        model: &str,
        attempted: &HashSet<String>,
    ) -> ProxyResult<crate::proxy::accounts::AccountState> {
        if self.store.emails().is_empty() {
            return Err(ProxyError::NoAccounts);
        }

        // 1. Sticky preference: the last account that succeeded for this
        // model, unless it already failed this request
        if let Some(pinned_email) = self.pins.get(model) {
            if !attempted.contains(&pinned_email) {
                match self.store.get(&pinned_email) {
                    Some(account) if account.is_usable() => {
                        match self.store.rate_limits().remaining_ms(&pinned_email, model) {
                            None => return Ok(account),
                            Some(wait_ms) if wait_ms <= self.max_wait_ms => {
                                // Short limit on the pinned account: waiting
                                // preserves the upstream prompt cache
                                info!(
                                    "[Scheduler] Waiting {}ms on sticky account for {}",
                                    wait_ms, model
                                );
                                tokio::time::sleep(Duration::from_millis(apply_jitter(
                                    wait_ms as u64 + WAIT_SLACK_MS,
                                )))
                                .await;
                                self.store.clear_expired_rate_limits();

                                if !self.store.is_rate_limited(&pinned_email, model) {
                                    if let Some(account) = self.store.get(&pinned_email) {
                                        if account.is_usable() {
                                            return Ok(account);
                                        }
                                    }
                                }
                                // Still limited after the wait: fall through
                            }
                            Some(_) => {
                                // Limit outlasts the wait budget: unpin
                                self.pins.release(model);
                            }
                        }
                    }
                    _ => self.pins.release(model),
                }
            }
        }

        // 2. Round-robin over the rest
        if let Some(account) = self.store.pick_next(model, attempted) {
            return Ok(account);
        }

        // 3. Everyone is limited: wait if the window is short, fail fast if
        // it is not
        if self.store.is_all_rate_limited(model) {
            let wait_ms = self.store.min_wait_ms(model).unwrap_or(0);

            if wait_ms > self.max_wait_ms {
                let reset_at = Utc::now() + ChronoDuration::milliseconds(wait_ms);
                info!(
                    "[Scheduler] All accounts limited for {}; failing fast ({}s until reset)",
                    model,
                    wait_ms / 1000
                );
                return Err(ProxyError::RateLimit { reset_at });
            }

            info!(
                "[Scheduler] All accounts limited for {}; waiting {}ms for the soonest reset",
                model, wait_ms
            );
            tokio::time::sleep(Duration::from_millis(wait_ms as u64 + WAIT_SLACK_MS)).await;
            self.store.clear_expired_rate_limits();

            if let Some(account) = self.store.pick_next(model, attempted) {
                return Ok(account);
            }

            // Clock skew or a stale table: clear and try once more
            self.store.reset_all_rate_limits(model);
            if let Some(account) = self.store.pick_next(model, attempted) {
                return Ok(account);
            }
        }

        Err(ProxyError::NoAccounts)
    }

    fn release_pin_if_held(&self, model: &str, email: &str) {
        if self.pins.get(model).as_deref() == Some(email) {
            self.pins.release(model);
        }
    }
}
