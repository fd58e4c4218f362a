//! Adaptive per-pair timeouts.
//!
//! Each pair learns its own timeout budget from observed response times:
//! successes reseed the base and let the current value relax back toward it,
//! timeouts grow the current value multiplicatively. Streaming requests get
//! a larger activity budget. The manager consumes metrics only; it never
//! reads breaker state, which keeps the learning loop acyclic.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::backend::PairKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Budget used before any sample exists.
    pub default_timeout_ms: u64,
    /// Headroom over the observed response time when reseeding the base.
    pub headroom_multiplier: f64,
    /// Extra budget for streaming activity gaps.
    pub streaming_multiplier: f64,
    /// Growth factor applied to the current budget after a timeout.
    pub failure_backoff_multiplier: f64,
    /// Consecutive successes before the current budget snaps back to base.
    pub success_shrink_threshold: u32,
    /// Wall-clock budget for upstream connection establishment.
    pub connect_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: 5_000,
            max_timeout_ms: 600_000,
            default_timeout_ms: 30_000,
            headroom_multiplier: 3.0,
            streaming_multiplier: 2.0,
            failure_backoff_multiplier: 1.5,
            success_shrink_threshold: 3,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Learned state for one pair; also the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutState {
    pub base_timeout_ms: u64,
    pub current_timeout_ms: u64,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl TimeoutState {
    fn fresh(default_ms: u64) -> Self {
        Self {
            base_timeout_ms: default_ms,
            current_timeout_ms: default_ms,
            last_updated_at: Utc::now(),
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }
}

/// Both budgets for one upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Dispatch until response headers.
    pub connect: Duration,
    /// Reset on every received chunk once headers arrived.
    pub activity: Duration,
}

/// Persisted file shape for `timeouts.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTimeouts {
    pub timeouts: HashMap<String, TimeoutState>,
    pub version: u32,
}

pub const TIMEOUTS_FILE_VERSION: u32 = 1;

#[derive(Debug)]
pub struct TimeoutManager {
    states: RwLock<HashMap<PairKey, TimeoutState>>,
    config: TimeoutConfig,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    fn clamp(&self, ms: u64) -> u64 {
        ms.clamp(self.config.min_timeout_ms, self.config.max_timeout_ms)
    }

    /// Budgets for one call against this pair.
    pub async fn timeouts_for(&self, key: &PairKey, streaming: bool) -> CallTimeouts {
        let states = self.states.read().await;
        let current = states
            .get(key)
            .map(|s| s.current_timeout_ms)
            .unwrap_or(self.config.default_timeout_ms);
        let multiplier = if streaming {
            self.config.streaming_multiplier
        } else {
            1.0
        };
        let activity = self.clamp((current as f64 * multiplier) as u64);
        CallTimeouts {
            connect: Duration::from_millis(self.config.connect_timeout_ms),
            activity: Duration::from_millis(activity),
        }
    }

    /// Current/min/max for load-balancer scoring.
    pub async fn scoring_view(&self, key: &PairKey) -> (u64, u64, u64) {
        let states = self.states.read().await;
        let current = states
            .get(key)
            .map(|s| s.current_timeout_ms)
            .unwrap_or(self.config.default_timeout_ms);
        (
            current,
            self.config.min_timeout_ms,
            self.config.max_timeout_ms,
        )
    }

    /// Learn from a successful response. Reseeds the base with headroom and
    /// relaxes the current budget once enough consecutive successes accrue.
    pub async fn record_success(&self, key: &PairKey, observed_ms: u64) {
        let mut states = self.states.write().await;
        let state = states
            .entry(key.clone())
            .or_insert_with(|| TimeoutState::fresh(self.config.default_timeout_ms));
        let reseeded = (observed_ms as f64 * self.config.headroom_multiplier) as u64;
        state.base_timeout_ms = self.clamp(reseeded);
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.consecutive_failures = 0;
        state.current_timeout_ms = if state.consecutive_successes
            >= self.config.success_shrink_threshold
        {
            state.base_timeout_ms
        } else {
            // Move halfway back toward base while confidence builds.
            self.clamp((state.current_timeout_ms + state.base_timeout_ms) / 2)
        };
        state.last_updated_at = Utc::now();
    }

    /// Learn from a timed-out call: grow the current budget.
    pub async fn record_timeout(&self, key: &PairKey) {
        let mut states = self.states.write().await;
        let state = states
            .entry(key.clone())
            .or_insert_with(|| TimeoutState::fresh(self.config.default_timeout_ms));
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.consecutive_successes = 0;
        state.current_timeout_ms = self.clamp(
            (state.current_timeout_ms as f64 * self.config.failure_backoff_multiplier) as u64,
        );
        state.last_updated_at = Utc::now();
    }

    pub async fn state(&self, key: &PairKey) -> Option<TimeoutState> {
        self.states.read().await.get(key).cloned()
    }

    pub async fn forget(&self, key: &PairKey) {
        self.states.write().await.remove(key);
    }

    pub async fn persistable(&self) -> PersistedTimeouts {
        let states = self.states.read().await;
        PersistedTimeouts {
            timeouts: states
                .iter()
                .map(|(k, v)| (k.storage_key(), v.clone()))
                .collect(),
            version: TIMEOUTS_FILE_VERSION,
        }
    }

    pub async fn restore(&self, persisted: PersistedTimeouts) {
        let mut states = self.states.write().await;
        for (raw, mut state) in persisted.timeouts {
            let Some(key) = PairKey::from_storage_key(&raw) else {
                tracing::warn!(key = %raw, "Skipping malformed timeout entry");
                continue;
            };
            state.current_timeout_ms = self.clamp(state.current_timeout_ms);
            state.base_timeout_ms = self.clamp(state.base_timeout_ms);
            states.insert(key, state);
        }
    }
}
