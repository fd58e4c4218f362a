//! Bounded admission queue.
//!
//! Requests that cannot be admitted immediately wait here for capacity.
//! Entries are woken best-first, where "best" is the configured priority
//! boosted by elapsed wait time, oldest first on ties. Pausing halts wakes
//! without rejecting new enqueues; a low-frequency sweeper times out entries
//! past their deadline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub timeout_ms: u64,
    pub priority_boost_interval_ms: u64,
    pub priority_boost_amount: u32,
    pub max_priority: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            timeout_ms: 60_000,
            priority_boost_interval_ms: 10_000,
            priority_boost_amount: 1,
            max_priority: 100,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("timed out waiting in queue")]
    Timeout,
}

struct Entry {
    id: Uuid,
    model: String,
    priority: u32,
    enqueued_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<()>,
}

/// Handle returned to the waiting request task.
#[derive(Debug)]
pub struct QueueWaiter {
    pub id: Uuid,
    rx: oneshot::Receiver<()>,
    deadline: Instant,
}

impl QueueWaiter {
    /// Resolve when woken for a capacity slot, or fail at the deadline.
    pub async fn wait(self) -> Result<(), QueueError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.rx).await {
            Ok(Ok(())) => Ok(()),
            // Sender dropped: swept as expired or queue shut down.
            Ok(Err(_)) => Err(QueueError::Timeout),
            Err(_) => Err(QueueError::Timeout),
        }
    }
}

/// Control-plane view of one waiting entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryInfo {
    pub id: Uuid,
    pub model: String,
    pub priority: u32,
    pub effective_priority: u32,
    pub waited_ms: u64,
    pub expires_in_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub size: usize,
    pub max_size: usize,
    pub paused: bool,
    pub entries: Vec<QueueEntryInfo>,
}

struct Inner {
    entries: HashMap<Uuid, Entry>,
    paused: bool,
}

/// Shared request queue. All operations are totally ordered under one lock.
pub struct RequestQueue {
    inner: Mutex<Inner>,
    config: QueueConfig,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                paused: false,
            }),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Priority after the elapsed-wait boost, capped at `max_priority`.
    fn effective_priority(&self, priority: u32, enqueued_at: Instant, now: Instant) -> u32 {
        if self.config.priority_boost_interval_ms == 0 {
            return priority.min(self.config.max_priority);
        }
        let waited = now.duration_since(enqueued_at).as_millis() as u64;
        let boosts = (waited / self.config.priority_boost_interval_ms) as u32;
        priority
            .saturating_add(boosts.saturating_mul(self.config.priority_boost_amount))
            .min(self.config.max_priority)
    }

    /// Add a waiter. `enqueued_at` is the original arrival time so a waiter
    /// that re-enters after a lost admission race keeps its aging credit.
    pub fn enqueue(
        &self,
        model: &str,
        priority: u32,
        enqueued_at: Instant,
    ) -> Result<QueueWaiter, QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.len() >= self.config.max_size {
            return Err(QueueError::Full);
        }
        let id = Uuid::new_v4();
        let deadline = enqueued_at + Duration::from_millis(self.config.timeout_ms);
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(
            id,
            Entry {
                id,
                model: model.to_string(),
                priority,
                enqueued_at,
                deadline,
                tx,
            },
        );
        Ok(QueueWaiter { id, rx, deadline })
    }

    /// Remove a waiter that no longer needs its slot (admitted elsewhere or
    /// its request aborted).
    pub fn remove(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(&id);
    }

    /// Wake the best non-expired waiter for `model`. Returns whether one was
    /// woken. No-op while paused.
    pub fn wake_for_model(&self, model: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.paused {
            return false;
        }
        let now = Instant::now();
        loop {
            let best = inner
                .entries
                .values()
                .filter(|e| e.model == model && e.deadline > now)
                .max_by(|a, b| {
                    let pa = self.effective_priority(a.priority, a.enqueued_at, now);
                    let pb = self.effective_priority(b.priority, b.enqueued_at, now);
                    pa.cmp(&pb)
                        .then_with(|| b.enqueued_at.cmp(&a.enqueued_at))
                })
                .map(|e| e.id);
            let Some(id) = best else {
                return false;
            };
            let entry = inner.entries.remove(&id).expect("entry present");
            // A dropped receiver means the waiter went away; try the next.
            if entry.tx.send(()).is_ok() {
                return true;
            }
        }
    }

    /// Wake every waiter (used on resume). Waiters re-race admission.
    pub fn wake_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.paused {
            return;
        }
        for (_, entry) in inner.entries.drain() {
            let _ = entry.tx.send(());
        }
    }

    /// Drop expired entries; their waiters observe a timeout. Returns the
    /// number removed.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.deadline > now);
        before - inner.entries.len()
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.paused {
            inner.paused = true;
            tracing::info!("Request queue paused");
        }
    }

    /// Resume and wake all waiters so none sleeps through reopened capacity.
    pub fn resume(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.paused {
                return;
            }
            inner.paused = false;
        }
        tracing::info!("Request queue resumed");
        self.wake_all();
    }

    pub fn is_paused(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .paused
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut entries: Vec<QueueEntryInfo> = inner
            .entries
            .values()
            .map(|e| QueueEntryInfo {
                id: e.id,
                model: e.model.clone(),
                priority: e.priority,
                effective_priority: self.effective_priority(e.priority, e.enqueued_at, now),
                waited_ms: now.duration_since(e.enqueued_at).as_millis() as u64,
                expires_in_ms: e.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect();
        entries.sort_by(|a, b| {
            b.effective_priority
                .cmp(&a.effective_priority)
                .then_with(|| b.waited_ms.cmp(&a.waited_ms))
        });
        QueueStatus {
            size: entries.len(),
            max_size: self.config.max_size,
            paused: inner.paused,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_size: usize) -> RequestQueue {
        RequestQueue::new(QueueConfig {
            max_size,
            timeout_ms: 1_000,
            ..QueueConfig::default()
        })
    }

    #[tokio::test]
    async fn rejects_when_full() {
        let q = queue(2);
        let _a = q.enqueue("m", 0, Instant::now()).unwrap();
        let _b = q.enqueue("m", 0, Instant::now()).unwrap();
        assert_eq!(
            q.enqueue("m", 0, Instant::now()).unwrap_err(),
            QueueError::Full
        );
    }

    #[tokio::test]
    async fn wakes_highest_effective_priority_first() {
        let q = queue(10);
        let low = q.enqueue("m", 1, Instant::now()).unwrap();
        let high = q.enqueue("m", 5, Instant::now()).unwrap();
        assert!(q.wake_for_model("m"));
        // High-priority waiter resolves; the low one is still queued.
        high.wait().await.unwrap();
        assert_eq!(q.len(), 1);
        assert!(q.wake_for_model("m"));
        low.wait().await.unwrap();
    }

    #[tokio::test]
    async fn wait_boost_promotes_old_entries() {
        let q = RequestQueue::new(QueueConfig {
            max_size: 10,
            timeout_ms: 60_000,
            priority_boost_interval_ms: 10,
            priority_boost_amount: 5,
            max_priority: 100,
            ..QueueConfig::default()
        });
        let old = q
            .enqueue("m", 0, Instant::now() - Duration::from_millis(100))
            .unwrap();
        let _fresh = q.enqueue("m", 3, Instant::now()).unwrap();
        assert!(q.wake_for_model("m"));
        // The aged zero-priority entry outranks the fresh priority-3 one.
        old.wait().await.unwrap();
    }

    #[tokio::test]
    async fn boost_caps_at_max_priority() {
        let q = RequestQueue::new(QueueConfig {
            priority_boost_interval_ms: 1,
            priority_boost_amount: 50,
            max_priority: 60,
            ..QueueConfig::default()
        });
        let p = q.effective_priority(10, Instant::now() - Duration::from_millis(100), Instant::now());
        assert_eq!(p, 60);
    }

    #[tokio::test]
    async fn wake_matches_model() {
        let q = queue(10);
        let _other = q.enqueue("other", 0, Instant::now()).unwrap();
        assert!(!q.wake_for_model("m"));
        let target = q.enqueue("m", 0, Instant::now()).unwrap();
        assert!(q.wake_for_model("m"));
        target.wait().await.unwrap();
    }

    #[tokio::test]
    async fn pause_halts_wakes_but_accepts_enqueues() {
        let q = queue(10);
        q.pause();
        let waiter = q.enqueue("m", 0, Instant::now()).unwrap();
        assert!(!q.wake_for_model("m"));
        assert_eq!(q.len(), 1);
        q.resume();
        // Resume wakes everyone.
        waiter.wait().await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_swept_and_time_out() {
        let q = RequestQueue::new(QueueConfig {
            timeout_ms: 20,
            ..QueueConfig::default()
        });
        let waiter = q.enqueue("m", 0, Instant::now()).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(q.sweep_expired(), 1);
        assert_eq!(waiter.wait().await.unwrap_err(), QueueError::Timeout);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn removed_waiters_free_their_slot() {
        let q = queue(1);
        let waiter = q.enqueue("m", 0, Instant::now()).unwrap();
        q.remove(waiter.id);
        assert!(q.enqueue("m", 0, Instant::now()).is_ok());
    }

    #[tokio::test]
    async fn status_reports_entries_best_first() {
        let q = queue(10);
        let _a = q.enqueue("m", 1, Instant::now()).unwrap();
        let _b = q.enqueue("m", 9, Instant::now()).unwrap();
        let status = q.status();
        assert_eq!(status.size, 2);
        assert!(!status.paused);
        assert_eq!(status.entries[0].priority, 9);
    }
}
