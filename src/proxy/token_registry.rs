// Access-token lifetime metadata and proactive refresh scheduling. The
// registry never holds token material, only timing: the account store owns
// the tokens themselves.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Refresh this long before expiry so no request ever dispatches with a
/// token about to lapse mid-flight.
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

/// Lifetimes shorter than this are upstream anomalies; tracking them would
/// put the account into a permanent refresh loop.
const MIN_TRACKED_LIFETIME_SECS: i64 = 5 * 60;

const BACKOFF_BASE_SECS: i64 = 60;
const BACKOFF_CAP_SECS: i64 = 15 * 60;

const TICK_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy)]
struct TokenMeta {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid { expires_in: i64 },
    ExpiringSoon { expires_in: i64 },
    Expired,
    Unknown,
}

pub struct TokenRegistry {
    entries: DashMap<String, TokenMeta>,
    /// Guard set enforcing one in-flight refresh per email across the
    /// background tick and request-path refreshes.
    refreshing: DashMap<String, ()>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            refreshing: DashMap::new(),
        }
    }

    /// Record a freshly issued token's lifetime.
    pub fn note_issued(&self, email: &str, expires_in_secs: i64) {
        if expires_in_secs < MIN_TRACKED_LIFETIME_SECS {
            tracing::warn!(
                "[TokenRegistry] Ignoring anomalous token lifetime of {}s for {}",
                expires_in_secs,
                email
            );
            return;
        }

        let now = Utc::now();
        self.entries.insert(
            email.to_string(),
            TokenMeta {
                issued_at: now,
                expires_at: now + ChronoDuration::seconds(expires_in_secs),
                consecutive_failures: 0,
                last_failure_at: None,
            },
        );
    }

    pub fn note_refresh_failure(&self, email: &str) {
        let now = Utc::now();
        self.entries
            .entry(email.to_string())
            .and_modify(|meta| {
                meta.consecutive_failures += 1;
                meta.last_failure_at = Some(now);
            })
            .or_insert(TokenMeta {
                issued_at: now,
                expires_at: now,
                consecutive_failures: 1,
                last_failure_at: Some(now),
            });
    }

    /// Eager invalidation: the upstream rejected the token, treat it as
    /// expired so the next use forces a refresh.
    pub fn invalidate(&self, email: &str) {
        if let Some(mut meta) = self.entries.get_mut(email) {
            meta.expires_at = Utc::now();
        }
        tracing::info!("[TokenRegistry] Token invalidated for account (upstream auth reject)");
    }

    pub fn forget(&self, email: &str) {
        self.entries.remove(email);
    }

    /// Whether the token is inside the refresh buffer and the failure
    /// backoff window has elapsed.
    pub fn should_refresh(&self, email: &str) -> bool {
        let Some(meta) = self.entries.get(email).map(|m| *m) else {
            // Untracked accounts refresh on first use
            return true;
        };

        let now = Utc::now();
        let inside_buffer =
            (meta.expires_at - now).num_seconds() <= REFRESH_BUFFER_SECS;

        if !inside_buffer {
            return false;
        }

        backoff_elapsed(&meta, now)
    }

    pub fn status(&self, email: &str) -> TokenStatus {
        let Some(meta) = self.entries.get(email).map(|m| *m) else {
            return TokenStatus::Unknown;
        };

        let expires_in = (meta.expires_at - Utc::now()).num_seconds();
        if expires_in <= 0 {
            TokenStatus::Expired
        } else if expires_in <= REFRESH_BUFFER_SECS {
            TokenStatus::ExpiringSoon { expires_in }
        } else {
            TokenStatus::Valid { expires_in }
        }
    }

    pub fn consecutive_failures(&self, email: &str) -> u32 {
        self.entries
            .get(email)
            .map(|m| m.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn issued_at(&self, email: &str) -> Option<DateTime<Utc>> {
        self.entries.get(email).map(|m| m.issued_at)
    }

    /// Try to claim the refresh slot for an email. Returns a guard that
    /// releases the slot on drop, or None if a refresh is already running.
    pub fn begin_refresh(self: &Arc<Self>, email: &str) -> Option<RefreshGuard> {
        use dashmap::mapref::entry::Entry;
        match self.refreshing.entry(email.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(RefreshGuard {
                    registry: Arc::clone(self),
                    email: email.to_string(),
                })
            }
        }
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RefreshGuard {
    registry: Arc<TokenRegistry>,
    email: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.registry.refreshing.remove(&self.email);
    }
}

fn backoff_elapsed(meta: &TokenMeta, now: DateTime<Utc>) -> bool {
    if meta.consecutive_failures == 0 {
        return true;
    }

    let Some(last_failure) = meta.last_failure_at else {
        return true;
    };

    let exponent = meta.consecutive_failures.saturating_sub(1).min(10);
    let delay = (BACKOFF_BASE_SECS << exponent).min(BACKOFF_CAP_SECS);

    (now - last_failure).num_seconds() >= delay
}

/// Background tick: every 30 s, proactively refresh tokens nearing expiry
/// and run the idle-time housekeeping (rate-limit table and signature-cache
/// sweeps).
pub fn spawn_background_tick(
    store: Arc<crate::proxy::accounts::AccountStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            store.clear_expired_rate_limits();
            crate::proxy::signature_cache::SignatureCache::global().sweep();

            let registry = store.registry();
            for email in store.emails() {
                if !registry.should_refresh(&email) {
                    continue;
                }

                let Some(guard) = registry.begin_refresh(&email) else {
                    continue;
                };

                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let _guard = guard;
                    match store.get_access_token(&email).await {
                        Ok(_) => {
                            tracing::debug!("[TokenRegistry] Proactive refresh completed");
                        }
                        Err(e) => {
                            tracing::warn!("[TokenRegistry] Proactive refresh failed: {}", e);
                        }
                    }
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_lifetimes_ignored() {
        let registry = TokenRegistry::new();
        registry.note_issued("a@x.com", 120);
        assert_eq!(registry.status("a@x.com"), TokenStatus::Unknown);
    }

    #[test]
    fn test_status_transitions() {
        let registry = TokenRegistry::new();

        registry.note_issued("a@x.com", 3600);
        assert!(matches!(registry.status("a@x.com"), TokenStatus::Valid { .. }));
        assert!(!registry.should_refresh("a@x.com"));

        // 400 s lifetime is tracked and sits just above the refresh buffer
        registry.note_issued("b@x.com", 400);
        assert!(matches!(registry.status("b@x.com"), TokenStatus::Valid { .. }));

        registry.invalidate("a@x.com");
        assert_eq!(registry.status("a@x.com"), TokenStatus::Expired);
        assert!(registry.should_refresh("a@x.com"));
    }

    #[test]
    fn test_unknown_account_refreshes_on_first_use() {
        let registry = TokenRegistry::new();
        assert_eq!(registry.status("never@seen.com"), TokenStatus::Unknown);
        assert!(registry.should_refresh("never@seen.com"));
    }

    #[test]
    fn test_failure_backoff_blocks_refresh() {
        let registry = TokenRegistry::new();

        registry.note_issued("a@x.com", 3600);
        registry.invalidate("a@x.com");
        assert!(registry.should_refresh("a@x.com"));

        // A fresh failure opens a 60 s backoff window
        registry.note_refresh_failure("a@x.com");
        assert!(!registry.should_refresh("a@x.com"));
        assert_eq!(registry.consecutive_failures("a@x.com"), 1);

        // Success resets the counter
        registry.note_issued("a@x.com", 3600);
        assert_eq!(registry.consecutive_failures("a@x.com"), 0);
    }

    #[test]
    fn test_backoff_delay_caps() {
        let now = Utc::now();
        let meta = TokenMeta {
            issued_at: now,
            expires_at: now,
            consecutive_failures: 20,
            last_failure_at: Some(now - ChronoDuration::seconds(BACKOFF_CAP_SECS)),
        };
        // Even at 20 failures the window caps at 15 min, which has elapsed
        assert!(backoff_elapsed(&meta, now));

        let meta_recent = TokenMeta {
            last_failure_at: Some(now - ChronoDuration::seconds(BACKOFF_CAP_SECS - 5)),
            ..meta
        };
        assert!(!backoff_elapsed(&meta_recent, now));
    }

    #[test]
    fn test_refresh_guard_exclusive() {
        let registry = Arc::new(TokenRegistry::new());

        let guard = registry.begin_refresh("a@x.com");
        assert!(guard.is_some());
        assert!(registry.begin_refresh("a@x.com").is_none());
        // Another email is unaffected
        assert!(registry.begin_refresh("b@x.com").is_some());

        drop(guard);
        assert!(registry.begin_refresh("a@x.com").is_some());
    }
}
