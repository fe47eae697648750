// Operational endpoints: pool health, per-account limit status, forced
// token refresh. These expose account emails (the operator's own) but never
// any token material.

use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde_json::{json, Value};

use crate::proxy::server::AppState;

/// GET /health
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.scheduler.store();
    let registry = store.registry();

    let accounts = store.all_states();
    let total = accounts.len();
    let available = accounts.iter().filter(|a| a.is_usable()).count();

    let list: Vec<Value> = accounts
        .iter()
        .map(|account| {
            let limited_models: Vec<String> = store
                .limits_for(&account.email)
                .into_iter()
                .map(|(model, _)| model)
                .collect();

            json!({
                "email": account.email,
                "usable": account.is_usable(),
                "invalid": account.invalid,
                "invalid_reason": account.invalid_reason,
                "last_used": account.last_used.map(|t| t.to_rfc3339()),
                "token_status": format!("{:?}", registry.status(&account.email)),
                "token_issued_at": registry.issued_at(&account.email).map(|t| t.to_rfc3339()),
                "refresh_failures": registry.consecutive_failures(&account.email),
                "rate_limited_models": limited_models,
            })
        })
        .collect();

    let status = if available > 0 { "ok" } else { "degraded" };

    Json(json!({
        "status": status,
        "accounts": {
            "total": total,
            "available": available,
            "list": list,
        }
    }))
}

/// GET /account-limits
pub async fn handle_account_limits(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.scheduler.store();

    let accounts: Vec<Value> = store
        .all_states()
        .iter()
        .map(|account| {
            let limits: Vec<Value> = store
                .limits_for(&account.email)
                .into_iter()
                .map(|(model, info)| {
                    json!({
                        "model": model,
                        "reset_at": info.reset_at.to_rfc3339(),
                        "observed_at": info.observed_at.to_rfc3339(),
                        "remaining_seconds": info.remaining_ms() / 1000,
                    })
                })
                .collect();

            json!({
                "email": account.email,
                "usable": account.is_usable(),
                "limits": limits,
            })
        })
        .collect();

    Json(json!({ "accounts": accounts }))
}

/// POST /refresh-token — force-refresh every usable account's access token.
/// The response confirms completion only; no portion of any token leaves
/// the process.
pub async fn handle_refresh_token(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.scheduler.store();

    let mut refreshed = 0usize;
    let mut failed = 0usize;

    for email in store.emails() {
        store.invalidate_token(&email);
        match store.get_access_token(&email).await {
            Ok(_) => refreshed += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!("[RefreshToken] Refresh failed for {}: {}", email, e);
            }
        }
    }

    tracing::info!(
        "[RefreshToken] Forced refresh complete: {} ok, {} failed",
        refreshed,
        failed
    );

    Json(json!({
        "status": "ok",
        "refreshed": refreshed,
        "failed": failed,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
