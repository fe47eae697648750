// Content-addressed signature memoization. The upstream signs every thought
// part it emits and rejects resumed thinking blocks whose signature is
// missing, so the proxy remembers (normalized text -> signature) and
// restores dropped signatures before forwarding.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

const SIGNATURE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const MIN_SIGNATURE_LENGTH: usize = 50;
const CACHE_CAPACITY: usize = 500;

/// Prefix keys cover clients that truncate or re-wrap long thinking text:
/// the first 500 normalized chars are stable even when the tail differs.
const PREFIX_KEY_CHARS: usize = 500;

#[derive(Clone, Debug)]
struct CacheEntry {
    signature: String,
    inserted_at: SystemTime,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed().unwrap_or(Duration::ZERO) > SIGNATURE_TTL
    }
}

pub struct SignatureCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
}

impl SignatureCache {
    fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn global() -> &'static SignatureCache {
        static INSTANCE: OnceLock<SignatureCache> = OnceLock::new();
        INSTANCE.get_or_init(SignatureCache::new)
    }

    /// Remember the signature for a thinking text under both its full-content
    /// hash and its prefix hash. Signatures below the minimum length are
    /// rejected (the upstream never issues short ones; anything shorter is
    /// client corruption).
    pub fn record(&self, text: &str, signature: &str) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            tracing::debug!(
                "[SignatureCache] Rejecting signature below minimum length ({} < {})",
                signature.len(),
                MIN_SIGNATURE_LENGTH
            );
            return;
        }

        let normalized = normalize_thinking_text(text);
        if normalized.is_empty() {
            return;
        }

        let full_key = content_hash(&normalized);
        let prefix_key = content_hash(&prefix_of(&normalized));
        let now = SystemTime::now();

        let Ok(mut entries) = self.entries.lock() else { return };

        for key in [full_key, prefix_key] {
            if entries.len() >= self.capacity && !entries.contains_key(&key) {
                evict_oldest(&mut entries);
            }
            entries.insert(
                key,
                CacheEntry {
                    signature: signature.to_string(),
                    inserted_at: now,
                },
            );
        }

        tracing::debug!(
            "[SignatureCache] Recorded signature (len={}) for {} normalized chars",
            signature.len(),
            normalized.chars().count()
        );
    }

    /// Look up a signature for a replayed thinking text: exact content hash
    /// first, prefix hash as fallback. Expired entries are dropped on read.
    pub fn lookup(&self, text: &str) -> Option<String> {
        let normalized = normalize_thinking_text(text);
        if normalized.is_empty() {
            return None;
        }

        let full_key = content_hash(&normalized);
        let prefix_key = content_hash(&prefix_of(&normalized));

        let mut entries = self.entries.lock().ok()?;

        for (key, kind) in [(full_key, "full"), (prefix_key, "prefix")] {
            match entries.get(&key) {
                Some(entry) if !entry.is_expired() => {
                    tracing::debug!("[SignatureCache] Hit ({} key)", kind);
                    return Some(entry.signature.clone());
                }
                Some(_) => {
                    entries.remove(&key);
                }
                None => {}
            }
        }

        None
    }

    /// Periodic purge of expired entries, driven from the background tick.
    pub fn sweep(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else { return 0 };

        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();

        if removed > 0 {
            tracing::debug!("[SignatureCache] Sweep removed {} expired entries", removed);
        }

        removed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[cfg(test)]
    fn backdate_all(&self, age: Duration) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            entry.inserted_at = SystemTime::now() - age;
        }
    }
}

/// Trim and collapse internal whitespace runs to single spaces, so that
/// re-wrapped or re-indented replays of the same thinking text hash alike.
fn normalize_thinking_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn prefix_of(normalized: &str) -> String {
    normalized.chars().take(PREFIX_KEY_CHARS).collect()
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn evict_oldest(entries: &mut HashMap<String, CacheEntry>) {
    let oldest_key = entries
        .iter()
        .min_by_key(|(_, entry)| entry.inserted_at)
        .map(|(key, _)| key.clone());

    if let Some(key) = oldest_key {
        entries.remove(&key);
    }
}
