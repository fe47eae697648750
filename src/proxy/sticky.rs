// Sticky account pinning. A pin binds a model to the last account that
// served it successfully so consecutive requests land on the same upstream
// prompt cache. The pin is an observer, never an owner: the account lives in
// the store and may vanish or go invalid underneath it.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Rate-limited sticky accounts are waited on up to this long before the
/// scheduler switches away or fails fast.
pub const MAX_WAIT_BEFORE_ERROR_MS: i64 = 120_000;

/// A pin untouched for this long no longer reflects a live session.
const PIN_IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Seconds the scheduler will block on a rate-limited sticky account
    /// before switching.
    pub max_wait_seconds: u64,
    /// Sticky pin idle expiry in seconds.
    pub pin_idle_seconds: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_wait_seconds: (MAX_WAIT_BEFORE_ERROR_MS / 1000) as u64,
            pin_idle_seconds: PIN_IDLE_EXPIRY.as_secs(),
        }
    }
}

#[derive(Debug, Clone)]
struct Pin {
    email: String,
    touched_at: Instant,
}

pub struct StickyPins {
    pins: DashMap<String, Pin>,
    idle_expiry: Duration,
}

impl StickyPins {
    pub fn new() -> Self {
        Self::with_idle_expiry(PIN_IDLE_EXPIRY)
    }

    pub fn with_idle_expiry(idle_expiry: Duration) -> Self {
        Self {
            pins: DashMap::new(),
            idle_expiry,
        }
    }

    /// Pinned account for a model, if the pin is still fresh. Expired pins
    /// are dropped on read.
    pub fn get(&self, model: &str) -> Option<String> {
        // Copy out before mutating: holding the map ref across remove()
        // would deadlock on the shard lock
        let expired = match self.pins.get(model) {
            Some(pin) if pin.touched_at.elapsed() <= self.idle_expiry => {
                return Some(pin.email.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.pins.remove(model);
            tracing::debug!("[Sticky] Pin for {} expired after idle window", model);
        }

        None
    }

    /// Record a successful (model, account) pairing and refresh the idle
    /// clock.
    pub fn pin(&self, model: &str, email: &str) {
        self.pins.insert(
            model.to_string(),
            Pin {
                email: email.to_string(),
                touched_at: Instant::now(),
            },
        );
    }

    /// Explicit invalidation: zero-byte failures and account invalidation
    /// release the pin.
    pub fn release(&self, model: &str) {
        if self.pins.remove(model).is_some() {
            tracing::debug!("[Sticky] Pin for {} released", model);
        }
    }

    /// Drop every pin pointing at an account that left the pool.
    pub fn release_account(&self, email: &str) {
        self.pins.retain(|_, pin| pin.email != email);
    }
}

impl Default for StickyPins {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_roundtrip() {
        let pins = StickyPins::new();
        assert_eq!(pins.get("m"), None);

        pins.pin("m", "a@x.com");
        assert_eq!(pins.get("m"), Some("a@x.com".to_string()));

        pins.pin("m", "b@x.com");
        assert_eq!(pins.get("m"), Some("b@x.com".to_string()));
    }

    #[test]
    fn test_idle_expiry_drops_pin() {
        let pins = StickyPins::with_idle_expiry(Duration::from_millis(0));
        pins.pin("m", "a@x.com");
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(pins.get("m"), None);
    }

    #[test]
    fn test_release() {
        let pins = StickyPins::new();
        pins.pin("m1", "a@x.com");
        pins.pin("m2", "a@x.com");
        pins.pin("m3", "b@x.com");

        pins.release("m1");
        assert_eq!(pins.get("m1"), None);
        assert!(pins.get("m2").is_some());

        pins.release_account("a@x.com");
        assert_eq!(pins.get("m2"), None);
        assert_eq!(pins.get("m3"), Some("b@x.com".to_string()));
    }
}
