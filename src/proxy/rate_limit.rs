// Per-(account, model) rate-limit state and 429 reset-time extraction.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Reset deltas are clamped into this window: a reset in the past still
/// blocks for one second, a malformed year-long reset caps at a day.
const MIN_RESET_SECS: i64 = 1;
const MAX_RESET_SECS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub reset_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl RateLimitInfo {
    pub fn is_active(&self) -> bool {
        self.reset_at > Utc::now()
    }

    pub fn remaining_ms(&self) -> i64 {
        (self.reset_at - Utc::now()).num_milliseconds().max(0)
    }
}

/// Tracks active limits keyed by `email::model`.
pub struct RateLimitTracker {
    limits: DashMap<String, RateLimitInfo>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            limits: DashMap::new(),
        }
    }

    fn make_key(email: &str, model: &str) -> String {
        format!("{}::{}", email, model)
    }

    pub fn mark(&self, email: &str, model: &str, reset_at: DateTime<Utc>) {
        let info = RateLimitInfo {
            reset_at,
            observed_at: Utc::now(),
        };
        self.limits.insert(Self::make_key(email, model), info);

        tracing::warn!(
            "[RateLimit] {} limited on {} for {}s",
            email,
            model,
            (reset_at - Utc::now()).num_seconds().max(0)
        );
    }

    /// Lazily drops an expired entry on read.
    pub fn is_rate_limited(&self, email: &str, model: &str) -> bool {
        let key = Self::make_key(email, model);
        match self.limits.get(&key).map(|info| *info) {
            Some(info) if info.is_active() => true,
            Some(_) => {
                self.limits.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn remaining_ms(&self, email: &str, model: &str) -> Option<i64> {
        self.limits
            .get(&Self::make_key(email, model))
            .map(|info| *info)
            .filter(|info| info.is_active())
            .map(|info| info.remaining_ms())
    }

    pub fn get(&self, email: &str, model: &str) -> Option<RateLimitInfo> {
        self.limits
            .get(&Self::make_key(email, model))
            .map(|info| *info)
            .filter(|info| info.is_active())
    }

    pub fn clear(&self, email: &str, model: &str) -> bool {
        self.limits.remove(&Self::make_key(email, model)).is_some()
    }

    pub fn clear_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.limits.len();
        self.limits.retain(|_, info| info.reset_at > now);
        before - self.limits.len()
    }

    /// Last-resort escape hatch when every account reads limited but a wait
    /// already elapsed: forget everything recorded for the model.
    pub fn reset_model(&self, model: &str) -> usize {
        let suffix = format!("::{}", model);
        let before = self.limits.len();
        self.limits.retain(|key, _| !key.ends_with(&suffix));
        before - self.limits.len()
    }

    /// Active limits for one account, as (model, info) pairs.
    pub fn limits_for(&self, email: &str) -> Vec<(String, RateLimitInfo)> {
        let prefix = format!("{}::", email);
        self.limits
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter(|entry| entry.value().is_active())
            .map(|entry| (entry.key()[prefix.len()..].to_string(), *entry.value()))
            .collect()
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Reset-time extraction =====

/// Extract the absolute reset time from a 429 response. Priority:
/// `Retry-After` header (seconds or HTTP-date), then
/// `error.details[*].retryDelay` (duration string), then
/// `error.metadata.quotaResetTime` (ISO 8601), then a 60 s default.
pub fn parse_reset_time(retry_after_header: Option<&str>, body: &str) -> DateTime<Utc> {
    let now = Utc::now();

    let delta_secs = parse_retry_after(retry_after_header, now)
        .or_else(|| parse_retry_delay_from_body(body))
        .or_else(|| parse_quota_reset_time(body, now))
        .unwrap_or(DEFAULT_RESET_SECS);

    now + ChronoDuration::seconds(delta_secs.clamp(MIN_RESET_SECS, MAX_RESET_SECS))
}

fn parse_retry_after(header: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
    let value = header?.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return Some(seconds);
    }

    // HTTP-date form (RFC 7231 IMF-fixdate parses as RFC 2822)
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some((date.with_timezone(&Utc) - now).num_seconds());
    }

    None
}

fn parse_retry_delay_from_body(body: &str) -> Option<i64> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return None;
    }

    let json: Value = serde_json::from_str(trimmed).ok()?;
    let details = json.get("error")?.get("details")?.as_array()?;

    details
        .iter()
        .filter_map(|d| d.get("retryDelay").and_then(|v| v.as_str()))
        .filter_map(parse_duration_string)
        .next()
}

fn parse_quota_reset_time(body: &str, now: DateTime<Utc>) -> Option<i64> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return None;
    }

    let json: Value = serde_json::from_str(trimmed).ok()?;
    let reset = json
        .get("error")?
        .get("metadata")?
        .get("quotaResetTime")?
        .as_str()?;

    let parsed = DateTime::parse_from_rfc3339(reset).ok()?;
    Some((parsed.with_timezone(&Utc) - now).num_seconds())
}

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)?(?:(\d+)ms)?$").unwrap());

/// Parse protobuf-style duration strings: "42s", "1h30m", "2h1m1.5s", "500ms".
fn parse_duration_string(s: &str) -> Option<i64> {
    let caps = DURATION_RE.captures(s.trim())?;

    let hours: i64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let minutes: i64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let seconds: f64 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
    let millis: i64 = caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);

    let total = hours * 3600 + minutes * 60 + seconds.ceil() as i64 + (millis + 999) / 1000;

    if total == 0 {
        None
    } else {
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_strings() {
        assert_eq!(parse_duration_string("42s"), Some(42));
        assert_eq!(parse_duration_string("1h30m"), Some(5400));
        assert_eq!(parse_duration_string("2h1m1.5s"), Some(7262));
        assert_eq!(parse_duration_string("500ms"), Some(1));
        assert_eq!(parse_duration_string("garbage"), None);
        assert_eq!(parse_duration_string(""), None);
    }

    #[test]
    fn test_retry_after_seconds_takes_priority() {
        let body = r#"{"error":{"details":[{"retryDelay":"300s"}]}}"#;
        let reset = parse_reset_time(Some("30"), body);
        let wait = (reset - Utc::now()).num_seconds();
        assert!((28..=30).contains(&wait), "wait={}", wait);
    }

    #[test]
    fn test_retry_after_http_date() {
        let future = Utc::now() + ChronoDuration::seconds(90);
        let header = future.to_rfc2822();
        let reset = parse_reset_time(Some(&header), "");
        let wait = (reset - Utc::now()).num_seconds();
        assert!((85..=91).contains(&wait), "wait={}", wait);
    }

    #[test]
    fn test_body_retry_delay() {
        let body = r#"{
            "error": {
                "code": 429,
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.ErrorInfo"},
                    {"retryDelay": "42s"}
                ]
            }
        }"#;
        let reset = parse_reset_time(None, body);
        let wait = (reset - Utc::now()).num_seconds();
        assert!((40..=42).contains(&wait), "wait={}", wait);
    }

    #[test]
    fn test_body_quota_reset_time() {
        let future = (Utc::now() + ChronoDuration::seconds(120)).to_rfc3339();
        let body = format!(r#"{{"error":{{"metadata":{{"quotaResetTime":"{}"}}}}}}"#, future);
        let reset = parse_reset_time(None, &body);
        let wait = (reset - Utc::now()).num_seconds();
        assert!((115..=121).contains(&wait), "wait={}", wait);
    }

    #[test]
    fn test_default_and_clamping() {
        // No parseable information falls back to 60 s
        let reset = parse_reset_time(None, "plain text error");
        let wait = (reset - Utc::now()).num_seconds();
        assert!((58..=60).contains(&wait), "wait={}", wait);

        // A reset in the past clamps to the 1 s floor (immediately clear soon)
        let reset = parse_reset_time(Some("-300"), "");
        assert!(reset > Utc::now() - ChronoDuration::seconds(1));
        assert!(reset <= Utc::now() + ChronoDuration::seconds(2));

        // Absurd resets cap at 24 h
        let reset = parse_reset_time(Some("999999999"), "");
        let wait = (reset - Utc::now()).num_seconds();
        assert!(wait <= MAX_RESET_SECS, "wait={}", wait);
    }

    #[test]
    fn test_tracker_mark_and_expiry() {
        let tracker = RateLimitTracker::new();

        tracker.mark("a@x.com", "claude-sonnet-4-5", Utc::now() + ChronoDuration::seconds(30));
        assert!(tracker.is_rate_limited("a@x.com", "claude-sonnet-4-5"));
        assert!(!tracker.is_rate_limited("a@x.com", "gemini-2.5-flash"));
        assert!(!tracker.is_rate_limited("b@x.com", "claude-sonnet-4-5"));

        // Expired entries read as clear and are dropped lazily
        tracker.mark("b@x.com", "claude-sonnet-4-5", Utc::now() - ChronoDuration::seconds(5));
        assert!(!tracker.is_rate_limited("b@x.com", "claude-sonnet-4-5"));
        assert!(tracker.get("b@x.com", "claude-sonnet-4-5").is_none());
    }

    #[test]
    fn test_clear_expired_and_reset_model() {
        let tracker = RateLimitTracker::new();
        tracker.mark("a@x.com", "m1", Utc::now() - ChronoDuration::seconds(5));
        tracker.mark("b@x.com", "m1", Utc::now() + ChronoDuration::seconds(300));
        tracker.mark("b@x.com", "m2", Utc::now() + ChronoDuration::seconds(300));

        assert_eq!(tracker.clear_expired(), 1);
        assert_eq!(tracker.reset_model("m1"), 1);
        assert!(tracker.is_rate_limited("b@x.com", "m2"));
    }

    #[test]
    fn test_limits_for_account() {
        let tracker = RateLimitTracker::new();
        tracker.mark("a@x.com", "m1", Utc::now() + ChronoDuration::seconds(60));
        tracker.mark("a@x.com", "m2", Utc::now() + ChronoDuration::seconds(120));
        tracker.mark("b@x.com", "m1", Utc::now() + ChronoDuration::seconds(60));

        let limits = tracker.limits_for("a@x.com");
        assert_eq!(limits.len(), 2);
        assert!(limits.iter().any(|(m, _)| m == "m1"));
        assert!(limits.iter().any(|(m, _)| m == "m2"));
    }
}
