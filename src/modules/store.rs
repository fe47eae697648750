// Persisted account state. The document is owned by the enrollment tooling;
// the proxy reads it at startup and is only permitted to write back
// last-used timestamps and invalidation flags.

use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::proxy::config::ProxyConfig;

/// Serializes all writers of the document so concurrent write-backs cannot
/// interleave and corrupt the file.
static STORE_WRITE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const DATA_DIR: &str = ".cloudbridge";
const ACCOUNTS_FILE: &str = "accounts.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAccount {
    pub email: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub added_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<i64>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountsDocument {
    #[serde(default)]
    pub accounts: Vec<StoredAccount>,
    #[serde(default)]
    pub settings: ProxyConfig,
    #[serde(default)]
    pub active_index: usize,
}

pub fn data_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("failed to resolve user home directory")?;
    let dir = home.join(DATA_DIR);

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("failed to create data directory: {}", e))?;
    }

    Ok(dir)
}

fn document_path() -> Result<PathBuf, String> {
    Ok(data_dir()?.join(ACCOUNTS_FILE))
}

/// Load the persisted document. A missing file is not an error: the proxy
/// starts with an empty pool and serves NoAccounts until enrollment adds one.
pub fn load_document() -> Result<AccountsDocument, String> {
    let path = document_path()?;

    if !path.exists() {
        tracing::warn!("[Store] {} not found, starting with an empty account pool", path.display());
        return Ok(AccountsDocument::default());
    }

    let content =
        fs::read_to_string(&path).map_err(|e| format!("failed to read account store: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("failed to parse account store: {}", e))
}

/// Atomic write: temp file + rename, under the global write lock.
pub fn save_document(doc: &AccountsDocument) -> Result<(), String> {
    let _lock = STORE_WRITE_LOCK
        .lock()
        .map_err(|e| format!("store lock poisoned: {}", e))?;

    let path = document_path()?;
    let temp_path = path.with_extension("json.tmp");

    let content = serde_json::to_string_pretty(doc)
        .map_err(|e| format!("failed to serialize account store: {}", e))?;

    fs::write(&temp_path, content)
        .map_err(|e| format!("failed to write temporary store file: {}", e))?;

    fs::rename(&temp_path, &path).map_err(|e| format!("failed to replace store file: {}", e))
}

fn update_account<F>(email: &str, mutate: F) -> Result<(), String>
where
    F: FnOnce(&mut StoredAccount),
{
    let mut doc = load_document()?;

    match doc.accounts.iter_mut().find(|a| a.email == email) {
        Some(account) => {
            mutate(account);
            save_document(&doc)
        }
        None => Err("account not present in store".to_string()),
    }
}

/// Write-back hook: stamp last_used after a successful upstream call.
pub async fn mark_account_used(email: &str) -> Result<(), String> {
    let email = email.to_string();
    let now = chrono::Utc::now().timestamp();

    tokio::task::spawn_blocking(move || update_account(&email, |a| a.last_used = Some(now)))
        .await
        .map_err(|e| format!("store task failed: {}", e))?
}

/// Write-back hook: persist terminal invalidation so restarts skip the account.
pub async fn mark_account_disabled(email: &str, reason: &str) -> Result<(), String> {
    let email = email.to_string();
    let reason = truncate_reason(reason, 800);

    tokio::task::spawn_blocking(move || {
        update_account(&email, |a| {
            a.disabled = true;
            a.disabled_reason = Some(reason);
        })
    })
    .await
    .map_err(|e| format!("store task failed: {}", e))?
}

fn truncate_reason(reason: &str, max_len: usize) -> String {
    if reason.chars().count() <= max_len {
        return reason.to_string();
    }
    let mut s: String = reason.chars().take(max_len).collect();
    s.push('…');
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_roundtrip_defaults() {
        let raw = r#"{
            "accounts": [
                {"email": "a@example.com", "refreshToken": "rt-1", "addedAt": 1700000000},
                {"email": "b@example.com", "refreshToken": "rt-2", "projectId": "proj-b",
                 "addedAt": 1700000001, "lastUsed": 1700000500, "disabled": true,
                 "disabledReason": "invalid_grant"}
            ],
            "activeIndex": 1
        }"#;

        let doc: AccountsDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.accounts.len(), 2);
        assert_eq!(doc.active_index, 1);
        assert!(doc.accounts[0].project_id.is_none());
        assert!(!doc.accounts[0].disabled);
        assert!(doc.accounts[1].disabled);

        // Round-trip keeps camelCase field names
        let out = serde_json::to_string(&doc).unwrap();
        assert!(out.contains("refreshToken"));
        assert!(out.contains("addedAt"));
        assert!(!out.contains("refresh_token"));
    }

    #[test]
    fn test_truncate_reason() {
        assert_eq!(truncate_reason("short", 10), "short");
        let long = "x".repeat(900);
        let truncated = truncate_reason(&long, 800);
        assert_eq!(truncated.chars().count(), 801);
        assert!(truncated.ends_with('…'));
    }
}
