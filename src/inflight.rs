//! In-flight request accounting.
//!
//! Two counter maps per pair: `regular` traffic, bounded by the backend's
//! concurrency cap, and `bypass` traffic (recovery probes), which is not.
//! The admission decision and the increment happen in one critical section;
//! a zero counter deletes its key so idle pairs cost nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::PairKey;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    regular: u32,
    bypass: u32,
}

impl Counters {
    fn is_zero(&self) -> bool {
        self.regular == 0 && self.bypass == 0
    }
}

#[derive(Debug, Default)]
struct Inner {
    pairs: HashMap<PairKey, Counters>,
}

impl Inner {
    fn backend_regular(&self, backend_id: &str) -> u32 {
        self.pairs
            .iter()
            .filter(|(k, _)| k.backend_id == backend_id)
            .map(|(_, c)| c.regular)
            .sum()
    }
}

/// Shared in-flight tracker.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<Mutex<Inner>>,
}

/// Releases its slot when dropped, so a panicking or cancelled request path
/// cannot leak a counter.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: InFlightTracker,
    key: PairKey,
    bypass: bool,
    released: bool,
}

impl InFlightGuard {
    /// Explicit release; further drops are no-ops.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.tracker.decrement(&self.key, self.bypass);
    }

    pub fn key(&self) -> &PairKey {
        &self.key
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit one regular request for the pair: succeeds iff the
    /// backend's regular in-flight total is below `max_concurrency`.
    pub fn try_admit(&self, key: &PairKey, max_concurrency: u32) -> Option<InFlightGuard> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.backend_regular(&key.backend_id) >= max_concurrency {
            return None;
        }
        inner.pairs.entry(key.clone()).or_default().regular += 1;
        Some(InFlightGuard {
            tracker: self.clone(),
            key: key.clone(),
            bypass: false,
            released: false,
        })
    }

    /// Admit a probe/recovery request. Not bound by the concurrency cap.
    pub fn admit_bypass(&self, key: &PairKey) -> InFlightGuard {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pairs.entry(key.clone()).or_default().bypass += 1;
        InFlightGuard {
            tracker: self.clone(),
            key: key.clone(),
            bypass: true,
            released: false,
        }
    }

    fn decrement(&self, key: &PairKey, bypass: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(counters) = inner.pairs.get_mut(key) {
            if bypass {
                counters.bypass = counters.bypass.saturating_sub(1);
            } else {
                counters.regular = counters.regular.saturating_sub(1);
            }
            if counters.is_zero() {
                inner.pairs.remove(key);
            }
        }
    }

    /// Public in-flight for a pair: regular + bypass.
    pub fn pair_in_flight(&self, key: &PairKey) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .pairs
            .get(key)
            .map(|c| c.regular + c.bypass)
            .unwrap_or(0)
    }

    /// Regular in-flight across all models of one backend (the number the
    /// concurrency cap binds).
    pub fn backend_in_flight(&self, backend_id: &str) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.backend_regular(backend_id)
    }

    /// Snapshot of all non-zero pairs as `(pair, regular, bypass)`.
    pub fn snapshot(&self) -> Vec<(PairKey, u32, u32)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<(PairKey, u32, u32)> = inner
            .pairs
            .iter()
            .map(|(k, c)| (k.clone(), c.regular, c.bypass))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn total_in_flight(&self) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pairs.values().map(|c| c.regular + c.bypass).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(model: &str) -> PairKey {
        PairKey::new("a", model)
    }

    #[test]
    fn admission_respects_backend_cap_across_models() {
        let tracker = InFlightTracker::new();
        let g1 = tracker.try_admit(&key("m1"), 2).unwrap();
        let g2 = tracker.try_admit(&key("m2"), 2).unwrap();
        // The cap is per backend, summed across models.
        assert!(tracker.try_admit(&key("m3"), 2).is_none());
        assert_eq!(tracker.backend_in_flight("a"), 2);
        drop(g1);
        assert!(tracker.try_admit(&key("m3"), 2).is_some());
        drop(g2);
    }

    #[test]
    fn bypass_ignores_cap_and_counts_in_pair_total() {
        let tracker = InFlightTracker::new();
        let _g = tracker.try_admit(&key("m"), 1).unwrap();
        assert!(tracker.try_admit(&key("m"), 1).is_none());
        let probe = tracker.admit_bypass(&key("m"));
        assert_eq!(tracker.pair_in_flight(&key("m")), 2);
        // Bypass traffic does not count toward the regular cap.
        assert_eq!(tracker.backend_in_flight("a"), 1);
        drop(probe);
        assert_eq!(tracker.pair_in_flight(&key("m")), 1);
    }

    #[test]
    fn zero_counters_delete_their_key() {
        let tracker = InFlightTracker::new();
        {
            let guard = tracker.try_admit(&key("m"), 4).unwrap();
            guard.release();
        }
        assert_eq!(tracker.pair_in_flight(&key("m")), 0);
        assert!(tracker.snapshot().is_empty());
        assert_eq!(tracker.total_in_flight(), 0);
    }

    #[test]
    fn double_release_is_harmless() {
        let tracker = InFlightTracker::new();
        let guard = tracker.try_admit(&key("m"), 4).unwrap();
        guard.release();
        // Drop after release must not underflow another request's slot.
        let _other = tracker.try_admit(&key("m"), 4).unwrap();
        assert_eq!(tracker.pair_in_flight(&key("m")), 1);
    }
}
