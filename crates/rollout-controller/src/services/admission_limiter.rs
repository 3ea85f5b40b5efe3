//! Per-caller admission limiter.
//!
//! Fixed one-minute window per identity. The first request in a window
//! starts it with a count of one; later requests increment the count and are
//! denied once it exceeds the limit. A denied request still counts. The
//! window resets only when it has elapsed, never because the limit was hit.
//!
//! Existing identities are updated under the map read lock and their own
//! entry mutex, so callers with different identities do not contend. The
//! map write lock is taken only to insert a new identity or to sweep.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Length of the counting window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Counter for one identity.
#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) > WINDOW
    }

    /// Count one request and report whether it is within `limit`.
    fn record(&mut self, now: Instant, limit: u32) -> bool {
        if self.is_expired(now) {
            *self = Self::new(now);
            return true;
        }
        self.count = self.count.saturating_add(1);
        self.count <= limit
    }
}

/// Fixed-window request counter keyed by caller identity.
#[derive(Debug)]
pub struct AdmissionLimiter {
    limit: u32,
    entries: RwLock<HashMap<String, Mutex<RateLimitEntry>>>,
}

impl AdmissionLimiter {
    /// Create a limiter admitting `limit` requests per identity per window.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Count a request from `identity` and decide whether to admit it.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    /// `allow` with an explicit clock reading.
    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(identity) {
                return entry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(now, self.limit);
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(identity) {
            // Inserted by another caller between the two locks.
            Some(entry) => entry
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .record(now, self.limit),
            None => {
                entries.insert(identity.to_string(), Mutex::new(RateLimitEntry::new(now)));
                self.limit >= 1
            }
        }
    }

    /// Drop every entry whose window has elapsed, returning how many were removed.
    ///
    /// An evicted identity starts a fresh window on its next request, which
    /// is what an expired entry would have done anyway.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| {
            !entry
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .is_expired(now)
        });
        before - entries.len()
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_limit_of_three_denies_fourth_call() {
        let limiter = AdmissionLimiter::new(3);
        let now = Instant::now();

        assert!(limiter.allow_at("10.0.0.1", now));
        assert!(limiter.allow_at("10.0.0.1", now));
        assert!(limiter.allow_at("10.0.0.1", now));
        assert!(!limiter.allow_at("10.0.0.1", now));
    }

    #[test]
    fn test_window_resets_after_elapsing() {
        let limiter = AdmissionLimiter::new(3);
        let start = Instant::now();

        for _ in 0..4 {
            limiter.allow_at("10.0.0.1", start);
        }
        assert!(!limiter.allow_at("10.0.0.1", start + Duration::from_secs(30)));

        let later = start + WINDOW + Duration::from_secs(1);
        assert!(limiter.allow_at("10.0.0.1", later));
        // Count restarted at one, so two more fit in the new window.
        assert!(limiter.allow_at("10.0.0.1", later));
        assert!(limiter.allow_at("10.0.0.1", later));
        assert!(!limiter.allow_at("10.0.0.1", later));
    }

    #[test]
    fn test_window_does_not_reset_exactly_at_boundary() {
        let limiter = AdmissionLimiter::new(1);
        let start = Instant::now();

        assert!(limiter.allow_at("10.0.0.1", start));
        assert!(!limiter.allow_at("10.0.0.1", start + WINDOW));
    }

    #[test]
    fn test_denied_calls_still_count() {
        let limiter = AdmissionLimiter::new(1);
        let start = Instant::now();

        assert!(limiter.allow_at("10.0.0.1", start));
        for _ in 0..10 {
            assert!(!limiter.allow_at("10.0.0.1", start + Duration::from_secs(5)));
        }
        // The window is still measured from the first request.
        assert!(limiter.allow_at("10.0.0.1", start + WINDOW + Duration::from_millis(1)));
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = AdmissionLimiter::new(1);
        let now = Instant::now();

        assert!(limiter.allow_at("10.0.0.1", now));
        assert!(!limiter.allow_at("10.0.0.1", now));
        assert!(limiter.allow_at("10.0.0.2", now));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_evict_stale_removes_only_expired_entries() {
        let limiter = AdmissionLimiter::new(3);
        let start = Instant::now();

        limiter.allow_at("old", start);
        limiter.allow_at("fresh", start + Duration::from_secs(50));

        let removed = limiter.evict_stale(start + WINDOW + Duration::from_secs(1));

        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);
        assert!(!limiter.is_empty());
    }

    #[test]
    fn test_eviction_does_not_change_decisions() {
        let limiter = AdmissionLimiter::new(1);
        let start = Instant::now();
        let later = start + WINDOW + Duration::from_secs(1);

        limiter.allow_at("10.0.0.1", start);
        limiter.evict_stale(later);

        assert!(limiter.allow_at("10.0.0.1", later));
        assert!(!limiter.allow_at("10.0.0.1", later));
    }

    #[test]
    fn test_concurrent_callers_share_one_counter() {
        let limiter = Arc::new(AdmissionLimiter::new(50));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.allow_at("10.0.0.1", now))
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 50);
        assert_eq!(limiter.len(), 1);
    }
}
