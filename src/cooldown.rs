//! Short-term cooldowns and permanent bans per pair.
//!
//! A cooldown suppresses a pair for a fixed window after a failure and is
//! distinct from the breaker's `open` state. A ban is a permanent operator
//! or policy exclusion that survives restarts.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::backend::PairKey;

/// Per-pair failure cooldowns.
#[derive(Debug)]
pub struct CooldownTracker {
    last_failure: RwLock<HashMap<PairKey, Instant>>,
    window: Duration,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            last_failure: RwLock::new(HashMap::new()),
            window,
        }
    }

    /// Record a failure timestamp for the pair.
    pub async fn mark(&self, key: &PairKey) {
        self.last_failure
            .write()
            .await
            .insert(key.clone(), Instant::now());
    }

    pub async fn in_cooldown(&self, key: &PairKey) -> bool {
        let map = self.last_failure.read().await;
        map.get(key)
            .map(|at| at.elapsed() < self.window)
            .unwrap_or(false)
    }

    pub async fn clear(&self, key: &PairKey) {
        self.last_failure.write().await.remove(key);
    }

    /// Drop entries whose window has elapsed; called from the sweep task to
    /// keep the map from accumulating dead pairs.
    pub async fn prune(&self) {
        let mut map = self.last_failure.write().await;
        map.retain(|_, at| at.elapsed() < self.window);
    }

    pub async fn remaining(&self, key: &PairKey) -> Option<Duration> {
        let map = self.last_failure.read().await;
        map.get(key).and_then(|at| {
            let elapsed = at.elapsed();
            (elapsed < self.window).then(|| self.window - elapsed)
        })
    }
}

/// Permanent per-pair exclusions, persisted as `serverId:model` strings.
#[derive(Debug, Default)]
pub struct BanStore {
    banned: RwLock<HashSet<PairKey>>,
}

impl BanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the pair was already banned.
    pub async fn ban(&self, key: PairKey) -> bool {
        let inserted = self.banned.write().await.insert(key.clone());
        if inserted {
            tracing::warn!(pair = %key, "Pair banned");
        }
        inserted
    }

    pub async fn unban(&self, key: &PairKey) -> bool {
        self.banned.write().await.remove(key)
    }

    pub async fn is_banned(&self, key: &PairKey) -> bool {
        self.banned.read().await.contains(key)
    }

    pub async fn list(&self) -> Vec<PairKey> {
        let mut keys: Vec<PairKey> = self.banned.read().await.iter().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn clear(&self) -> usize {
        let mut banned = self.banned.write().await;
        let n = banned.len();
        banned.clear();
        n
    }

    /// Storage form for `bans.json`.
    pub async fn persistable(&self) -> Vec<String> {
        self.list().await.iter().map(|k| k.storage_key()).collect()
    }

    pub async fn restore(&self, keys: Vec<String>) {
        let mut banned = self.banned.write().await;
        for raw in keys {
            match PairKey::from_storage_key(&raw) {
                Some(key) => {
                    banned.insert(key);
                }
                None => tracing::warn!(key = %raw, "Skipping malformed ban entry"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PairKey {
        PairKey::new("a", "m")
    }

    #[tokio::test]
    async fn cooldown_window_expires() {
        let tracker = CooldownTracker::new(Duration::from_millis(30));
        assert!(!tracker.in_cooldown(&key()).await);
        tracker.mark(&key()).await;
        assert!(tracker.in_cooldown(&key()).await);
        assert!(tracker.remaining(&key()).await.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tracker.in_cooldown(&key()).await);
        tracker.prune().await;
        assert!(tracker.last_failure.read().await.is_empty());
    }

    #[tokio::test]
    async fn cooldown_clear_is_immediate() {
        let tracker = CooldownTracker::new(Duration::from_secs(60));
        tracker.mark(&key()).await;
        tracker.clear(&key()).await;
        assert!(!tracker.in_cooldown(&key()).await);
    }

    #[tokio::test]
    async fn bans_round_trip_through_storage_form() {
        let store = BanStore::new();
        assert!(store.ban(key()).await);
        assert!(!store.ban(key()).await);
        assert!(store.is_banned(&key()).await);

        let saved = store.persistable().await;
        assert_eq!(saved, vec!["a:m".to_string()]);

        let restored = BanStore::new();
        restored
            .restore(vec!["a:m".into(), "garbage".into()])
            .await;
        assert!(restored.is_banned(&key()).await);
        assert_eq!(restored.list().await.len(), 1);

        assert!(store.unban(&key()).await);
        assert!(!store.is_banned(&key()).await);
    }
}
