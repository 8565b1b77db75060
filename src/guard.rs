//! Time-windowed duplicate suppression
//!
//! A [`DedupGuard`] remembers when each key was last let through. A key seen
//! again inside the window is suppressed. Memory is process-local; running
//! more than one server instance needs a shared TTL store instead.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct GuardState {
    entries: HashMap<String, Instant>,
    last_sweep: Instant,
}

pub struct DedupGuard {
    name: &'static str,
    window: Duration,
    horizon: Duration,
    state: Mutex<GuardState>,
}

impl DedupGuard {
    /// `horizon` is how long entries are retained; it is raised to `window`
    /// if shorter.
    pub fn new(name: &'static str, window: Duration, horizon: Duration) -> Self {
        Self {
            name,
            window,
            horizon: horizon.max(window),
            state: Mutex::new(GuardState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Returns `true` if `key` was let through less than one window ago.
    /// Otherwise records the key and returns `false`.
    pub fn should_suppress(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.last_sweep) >= self.horizon {
            let horizon = self.horizon;
            let before = state.entries.len();
            state
                .entries
                .retain(|_, seen| now.saturating_duration_since(*seen) < horizon);
            state.last_sweep = now;
            tracing::trace!(
                guard = self.name,
                evicted = before - state.entries.len(),
                "Swept dedup entries"
            );
        }

        if let Some(seen) = state.entries.get(key) {
            if now.saturating_duration_since(*seen) < self.window {
                return true;
            }
        }

        state.entries.insert(key.to_string(), now);
        false
    }

    /// Drop a recorded key so the next call with it passes. Used when the
    /// work a passed call guarded did not take effect.
    pub fn forget(&self, key: &str) {
        self.state.lock().entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stable digest of a sequence of parts.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
