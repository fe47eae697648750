// In-memory account pool: identity + mutable state, the access-token cache,
// and the rate-limit table. All scheduler decisions read through here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;

use crate::modules::{oauth, store};
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::proxy::rate_limit::{RateLimitInfo, RateLimitTracker};
use crate::proxy::token_registry::{TokenRegistry, REFRESH_BUFFER_SECS};

#[derive(Debug, Clone)]
pub struct AccountState {
    pub email: String,
    pub refresh_token: String,
    pub project_id: Option<String>,
    pub enabled: bool,
    /// Terminal: once set, the account only leaves the pool by removal.
    pub invalid: bool,
    pub invalid_reason: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
}

impl AccountState {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.invalid
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct AccountStore {
    accounts: DashMap<String, AccountState>,
    /// Insertion order for deterministic round-robin; DashMap iteration
    /// order is not stable across calls.
    order: Vec<String>,
    cursor: AtomicUsize,
    tokens: DashMap<String, CachedToken>,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    registry: Arc<TokenRegistry>,
    rate_limits: Arc<RateLimitTracker>,
}

impl AccountStore {
    pub fn from_document(doc: &store::AccountsDocument) -> Self {
        let accounts = DashMap::new();
        let mut order = Vec::new();

        for stored in &doc.accounts {
            let state = AccountState {
                email: stored.email.clone(),
                refresh_token: stored.refresh_token.clone(),
                project_id: stored.project_id.clone(),
                enabled: true,
                invalid: stored.disabled,
                invalid_reason: stored.disabled_reason.clone(),
                last_used: stored
                    .last_used
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            };

            if state.invalid {
                tracing::warn!(
                    "[AccountStore] Loaded invalidated account ({})",
                    state.invalid_reason.as_deref().unwrap_or("no reason recorded")
                );
            }

            order.push(stored.email.clone());
            accounts.insert(stored.email.clone(), state);
        }

        tracing::info!(
            "[AccountStore] Loaded {} accounts ({} usable)",
            order.len(),
            accounts.iter().filter(|e| e.value().is_usable()).count()
        );

        Self {
            accounts,
            order,
            cursor: AtomicUsize::new(0),
            tokens: DashMap::new(),
            refresh_locks: DashMap::new(),
            registry: Arc::new(TokenRegistry::new()),
            rate_limits: Arc::new(RateLimitTracker::new()),
        }
    }

    pub fn registry(&self) -> Arc<TokenRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn rate_limits(&self) -> Arc<RateLimitTracker> {
        Arc::clone(&self.rate_limits)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, email: &str) -> Option<AccountState> {
        self.accounts.get(email).map(|a| a.clone())
    }

    /// Usable account emails in pool order.
    pub fn emails(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|email| {
                self.accounts
                    .get(email.as_str())
                    .map(|a| a.is_usable())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn all_states(&self) -> Vec<AccountState> {
        self.order
            .iter()
            .filter_map(|email| self.accounts.get(email.as_str()).map(|a| a.clone()))
            .collect()
    }

    // ===== Rate-limit state =====

    pub fn mark_rate_limited(&self, email: &str, model: &str, reset_at: DateTime<Utc>) {
        self.rate_limits.mark(email, model, reset_at);
    }

    pub fn is_rate_limited(&self, email: &str, model: &str) -> bool {
        self.rate_limits.is_rate_limited(email, model)
    }

    pub fn clear_expired_rate_limits(&self) -> usize {
        self.rate_limits.clear_expired()
    }

    pub fn is_all_rate_limited(&self, model: &str) -> bool {
        let emails = self.emails();
        !emails.is_empty()
            && emails
                .iter()
                .all(|email| self.rate_limits.is_rate_limited(email, model))
    }

    /// Milliseconds until the soonest limit for the model resets, across
    /// usable accounts.
    pub fn min_wait_ms(&self, model: &str) -> Option<i64> {
        self.emails()
            .iter()
            .filter_map(|email| self.rate_limits.remaining_ms(email, model))
            .min()
    }

    pub fn reset_all_rate_limits(&self, model: &str) -> usize {
        let cleared = self.rate_limits.reset_model(model);
        if cleared > 0 {
            tracing::warn!(
                "[AccountStore] Force-cleared {} rate-limit records for {}",
                cleared,
                model
            );
        }
        cleared
    }

    pub fn limits_for(&self, email: &str) -> Vec<(String, RateLimitInfo)> {
        self.rate_limits.limits_for(email)
    }

    // ===== Account state transitions =====

    /// Terminal invalidation. Drops cached credentials and persists the flag
    /// so restarts skip the account.
    pub fn mark_invalid(&self, email: &str, reason: &str) {
        let mut newly_invalid = false;

        if let Some(mut account) = self.accounts.get_mut(email) {
            if !account.invalid {
                account.invalid = true;
                account.invalid_reason = Some(reason.to_string());
                newly_invalid = true;
            }
        }

        if !newly_invalid {
            return;
        }

        self.tokens.remove(email);
        self.registry.forget(email);
        tracing::error!("[AccountStore] Account invalidated: {}", reason);

        // Persistence is best-effort and only possible on a live runtime
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let email = email.to_string();
            let reason = reason.to_string();
            handle.spawn(async move {
                if let Err(e) = store::mark_account_disabled(&email, &reason).await {
                    tracing::warn!("[AccountStore] Failed to persist invalidation: {}", e);
                }
            });
        }
    }

    /// Success bookkeeping: stamp last_used, clear the model's limit entry,
    /// persist the timestamp.
    pub fn mark_success(&self, email: &str, model: &str) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.last_used = Some(Utc::now());
        }
        self.rate_limits.clear(email, model);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let email = email.to_string();
            handle.spawn(async move {
                if let Err(e) = store::mark_account_used(&email).await {
                    tracing::debug!("[AccountStore] Failed to persist last_used: {}", e);
                }
            });
        }
    }

    /// Drop the cached access token after an upstream 401 so the next
    /// attempt refreshes before dispatch.
    pub fn invalidate_token(&self, email: &str) {
        self.tokens.remove(email);
        self.registry.invalidate(email);
    }

    /// Cache the discovered project id (memory only; the persisted document
    /// is owned by enrollment).
    pub fn set_project_id(&self, email: &str, project_id: &str) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.project_id = Some(project_id.to_string());
        }
    }

    // ===== Selection support =====

    /// Next usable, non-limited account in round-robin order, skipping
    /// anything in `exclude`.
    pub fn pick_next(
        &self,
        model: &str,
        exclude: &std::collections::HashSet<String>,
    ) -> Option<AccountState> {
        let total = self.order.len();
        if total == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::SeqCst) % total;
        for offset in 0..total {
            let email = &self.order[(start + offset) % total];
            if exclude.contains(email.as_str()) {
                continue;
            }
            let Some(account) = self.accounts.get(email.as_str()) else {
                continue;
            };
            if !account.is_usable() {
                continue;
            }
            if self.rate_limits.is_rate_limited(email, model) {
                continue;
            }
            return Some(account.clone());
        }

        None
    }

    // ===== Token acquisition =====

    /// Access token for an account, refreshing through the OAuth grant when
    /// stale. Concurrent callers for the same email coalesce onto one
    /// in-flight refresh via the per-email lock.
    pub async fn get_access_token(&self, email: &str) -> ProxyResult<String> {
        let account = self
            .get(email)
            .ok_or_else(|| ProxyError::Internal("account vanished from pool".into()))?;

        if !account.is_usable() {
            return Err(ProxyError::NoAccounts);
        }

        if let Some(token) = self.fresh_cached_token(email) {
            return Ok(token);
        }

        let lock = self
            .refresh_locks
            .entry(email.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have completed the refresh while we waited
        if let Some(token) = self.fresh_cached_token(email) {
            tracing::debug!("[AccountStore] Token refreshed by concurrent caller, reusing");
            return Ok(token);
        }

        match oauth::refresh_access_token(&account.refresh_token).await {
            Ok(response) => {
                let expires_at = Utc::now() + ChronoDuration::seconds(response.expires_in);
                self.tokens.insert(
                    email.to_string(),
                    CachedToken {
                        access_token: response.access_token.clone(),
                        expires_at,
                    },
                );
                self.registry.note_issued(email, response.expires_in);
                tracing::debug!("[AccountStore] Token refreshed ({}s lifetime)", response.expires_in);
                Ok(response.access_token)
            }
            Err(e) => {
                self.registry.note_refresh_failure(email);
                // Full detail (with email) stays in the log
                tracing::error!("[AccountStore] Token refresh failed for {}: {}", email, e);

                if oauth::is_invalid_grant(&e) {
                    self.mark_invalid(email, "invalid_grant: refresh token revoked or expired");
                }

                Err(ProxyError::Auth)
            }
        }
    }

    fn fresh_cached_token(&self, email: &str) -> Option<String> {
        let token = self.tokens.get(email)?;
        let remaining = (token.expires_at - Utc::now()).num_seconds();

        // Proactive boundary: anything inside the refresh buffer is treated
        // as stale at dispatch time
        if remaining > REFRESH_BUFFER_SECS {
            Some(token.access_token.clone())
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn insert_test_account(&mut self, email: &str, project_id: Option<&str>) {
        self.order.push(email.to_string());
        self.accounts.insert(
            email.to_string(),
            AccountState {
                email: email.to_string(),
                refresh_token: format!("rt-{}", email),
                project_id: project_id.map(|s| s.to_string()),
                enabled: true,
                invalid: false,
                invalid_reason: None,
                last_used: None,
            },
        );
    }

    #[cfg(test)]
    pub fn insert_test_token(&self, email: &str, access_token: &str, expires_in_secs: i64) {
        self.tokens.insert(
            email.to_string(),
            CachedToken {
                access_token: access_token.to_string(),
                expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            },
        );
    }
}
