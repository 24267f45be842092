//! Sliding-window per-principal admission control, 1-minute resolution.
//!
//! Each user gets an append-only ring of admission timestamps; expired
//! entries are pruned lazily on every call, and a ring that prunes to empty
//! is removed from the registry so idle users cost nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    /// Admissions per window; 0 or negative disables limiting.
    limit: AtomicI64,
    window: Duration,
    entries: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: i64) -> Self {
        Self::with_window(limit, WINDOW)
    }

    /// Custom window, used by tests.
    pub fn with_window(limit: i64, window: Duration) -> Self {
        Self {
            limit: AtomicI64::new(limit),
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Change the limit at runtime (hot reload). Existing rings keep their
    /// timestamps; only the admission threshold moves.
    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::SeqCst)
    }

    /// Admit iff strictly fewer than `limit` prior admissions fall within
    /// the window.
    pub fn allow(&self, user_id: &str) -> bool {
        let limit = self.limit();
        if limit <= 0 {
            return true;
        }
        let now = Instant::now();
        let window = self.window;
        let mut entries = self.entries.lock().unwrap();
        let ring = entries.entry(user_id.to_string()).or_default();
        ring.retain(|t| now.duration_since(*t) < window);
        if ring.len() as i64 >= limit {
            return false;
        }
        ring.push(now);
        true
    }

    /// Admissions left in the current window; -1 when limiting is disabled.
    pub fn remaining(&self, user_id: &str) -> i64 {
        let limit = self.limit();
        if limit <= 0 {
            return -1;
        }
        let now = Instant::now();
        let window = self.window;
        let mut entries = self.entries.lock().unwrap();
        let Some(ring) = entries.get_mut(user_id) else {
            return limit;
        };
        ring.retain(|t| now.duration_since(*t) < window);
        let used = ring.len() as i64;
        if ring.is_empty() {
            entries.remove(user_id);
        }
        (limit - used).max(0)
    }

    pub fn reset(&self, user_id: &str) {
        self.entries.lock().unwrap().remove(user_id);
    }

    pub fn reset_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
