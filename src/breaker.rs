//! Per-(backend, model) circuit breakers.
//!
//! Each pair owns an independent state machine (`closed → open → half-open`)
//! driven by classified failures. Opening backoff depends on the dominant
//! error kind; recovery runs a bounded number of concurrent probes. An
//! optional escalation layer blocks a whole backend when too many of its
//! pairs are open at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::backend::PairKey;
use crate::classifier::{Classification, ErrorType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Breaker tuning. Mirrors the `circuit_breaker` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    pub enabled: bool,
    pub base_failure_threshold: u32,
    pub min_failure_threshold: u32,
    pub max_failure_threshold: u32,
    pub adaptive_thresholds: bool,
    pub adaptive_threshold_adjustment: u32,
    /// Default open backoff for transient and unclassified failures.
    pub open_timeout_ms: u64,
    /// Cap on time spent in half-open with no probe traffic before
    /// re-opening.
    pub half_open_timeout_ms: u64,
    pub half_open_max_requests: u32,
    pub recovery_success_threshold: u32,
    /// EWMA error-rate trip threshold in (0, 1].
    pub error_rate_threshold: f64,
    /// EWMA smoothing factor α in (0, 1).
    pub error_rate_smoothing: f64,
    /// Minimum events before the EWMA alone may trip the breaker.
    pub error_rate_min_events: u32,
    pub model_escalation: EscalationConfig,
    /// Classifier pattern lists; extensible at runtime by additive update.
    pub error_patterns: crate::classifier::ErrorPatterns,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_failure_threshold: 5,
            min_failure_threshold: 2,
            max_failure_threshold: 10,
            adaptive_thresholds: true,
            adaptive_threshold_adjustment: 2,
            open_timeout_ms: 2 * 60 * 1000,
            half_open_timeout_ms: 5 * 60 * 1000,
            half_open_max_requests: 2,
            recovery_success_threshold: 3,
            error_rate_threshold: 0.5,
            error_rate_smoothing: 0.2,
            error_rate_min_events: 5,
            model_escalation: EscalationConfig::default(),
            error_patterns: crate::classifier::ErrorPatterns::default(),
        }
    }
}

/// Pair→backend escalation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EscalationConfig {
    pub enabled: bool,
    /// Fraction of a backend's pairs that must be open to escalate.
    pub ratio_threshold: f64,
    /// The ratio must hold for this long before escalating (or healing).
    pub duration_threshold_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ratio_threshold: 0.5,
            duration_threshold_ms: 60_000,
            check_interval_ms: 15_000,
        }
    }
}

/// Error-kind-aware backoff for entering `open`.
///
/// `episodes` counts consecutive failed open episodes and only paces the
/// rate-limited bucket.
fn open_backoff(config: &BreakerConfig, kind: Option<ErrorType>, episodes: u32) -> Duration {
    match kind {
        Some(ErrorType::Permanent) => Duration::from_secs(24 * 60 * 60),
        Some(ErrorType::NonRetryable) => Duration::from_secs(48 * 60 * 60),
        Some(ErrorType::Retryable) => Duration::from_secs(12 * 60 * 60),
        Some(ErrorType::RateLimited) => {
            let base = Duration::from_secs(5 * 60);
            let cap = Duration::from_secs(60 * 60);
            let factor = 3u32.saturating_pow(episodes.saturating_sub(1).min(8));
            std::cmp::min(base.saturating_mul(factor), cap)
        }
        Some(ErrorType::Transient) | None => Duration::from_millis(config.open_timeout_ms),
    }
}

/// Mutable state of one pair's breaker.
#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    consecutive_successes: u32,
    total_requests: u64,
    blocked_requests: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    error_rate: f64,
    errors_by_category: HashMap<String, u64>,
    errors_by_kind: HashMap<ErrorType, u64>,
    last_error_kind: Option<ErrorType>,
    last_failure_reason: Option<String>,
    half_open_started_at: Option<DateTime<Utc>>,
    half_open_attempts: u32,
    active_probe_count: u32,
    /// Consecutive failed open episodes; cleared when the breaker closes.
    open_episodes: u32,
    /// `should_circuit_break` flags of the most recent failures.
    recent_break_flags: VecDeque<bool>,
    total_events: u64,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_successes: 0,
            total_requests: 0,
            blocked_requests: 0,
            last_failure_at: None,
            last_success_at: None,
            next_retry_at: None,
            error_rate: 0.0,
            errors_by_category: HashMap::new(),
            errors_by_kind: HashMap::new(),
            last_error_kind: None,
            last_failure_reason: None,
            half_open_started_at: None,
            half_open_attempts: 0,
            active_probe_count: 0,
            open_episodes: 0,
            recent_break_flags: VecDeque::new(),
            total_events: 0,
        }
    }
}

impl BreakerEntry {
    fn record_rate(&mut self, alpha: f64, failed: bool) {
        let instant = if failed { 1.0 } else { 0.0 };
        self.error_rate = alpha * instant + (1.0 - alpha) * self.error_rate;
        self.total_events += 1;
    }

    fn dominant_kind(&self) -> Option<ErrorType> {
        self.errors_by_kind
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(kind, _)| *kind)
    }

    fn enter_open(&mut self, config: &BreakerConfig, kind: Option<ErrorType>) {
        self.state = CircuitState::Open;
        self.open_episodes = self.open_episodes.saturating_add(1);
        self.consecutive_successes = 0;
        self.half_open_started_at = None;
        self.half_open_attempts = 0;
        self.active_probe_count = 0;
        let backoff = open_backoff(config, kind, self.open_episodes);
        let candidate = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
        // Monotone within one open episode: never pull the retry point in.
        self.next_retry_at = match self.next_retry_at {
            Some(existing) if existing > candidate => Some(existing),
            _ => Some(candidate),
        };
    }

    fn enter_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_started_at = Some(Utc::now());
        self.half_open_attempts = 0;
        self.active_probe_count = 0;
        self.consecutive_successes = 0;
    }

    fn enter_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.consecutive_successes = 0;
        self.next_retry_at = None;
        self.half_open_started_at = None;
        self.half_open_attempts = 0;
        self.active_probe_count = 0;
        self.open_episodes = 0;
        self.recent_break_flags.clear();
    }
}

/// Why an `allow` call rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Pair breaker is open and the retry point has not been reached.
    CircuitOpen,
    /// Pair breaker is half-open and the probe budget is in use. This
    /// rejection is not counted against the breaker.
    HalfOpenExhausted,
    /// The backend-level escalation breaker blocks all models.
    BackendCircuitOpen,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowDecision {
    /// Regular admission.
    Admit,
    /// Admitted as a recovery probe; bypasses in-flight caps.
    Probe,
    Reject(RejectReason),
}

impl AllowDecision {
    pub fn admitted(&self) -> bool {
        matches!(self, Self::Admit | Self::Probe)
    }

    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Probe)
    }
}

/// Serializable view of one pair's breaker, also the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub blocked_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_rate: f64,
    pub errors_by_category: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_started_at: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
    pub active_probe_count: u32,
    #[serde(default)]
    pub open_episodes: u32,
}

impl From<&BreakerEntry> for BreakerSnapshot {
    fn from(e: &BreakerEntry) -> Self {
        Self {
            state: e.state,
            failure_count: e.failure_count,
            success_count: e.success_count,
            consecutive_successes: e.consecutive_successes,
            total_requests: e.total_requests,
            blocked_requests: e.blocked_requests,
            last_failure_at: e.last_failure_at,
            last_success_at: e.last_success_at,
            next_retry_at: e.next_retry_at,
            error_rate: e.error_rate,
            errors_by_category: e.errors_by_category.clone(),
            last_error_kind: e.last_error_kind,
            last_failure_reason: e.last_failure_reason.clone(),
            half_open_started_at: e.half_open_started_at,
            half_open_attempts: e.half_open_attempts,
            active_probe_count: e.active_probe_count,
            open_episodes: e.open_episodes,
        }
    }
}

/// Per-backend escalation bookkeeping.
#[derive(Debug, Default)]
struct EscalationTrack {
    above_since: Option<Instant>,
    below_since: Option<Instant>,
}

/// Registry of all pair breakers plus the escalation layer.
///
/// All state transitions for one pair are linearized under the registry's
/// write lock.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    entries: RwLock<HashMap<PairKey, BreakerEntry>>,
    escalation: RwLock<HashMap<String, EscalationTrack>>,
    backend_blocked: RwLock<HashSet<String>>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            escalation: RwLock::new(HashMap::new()),
            backend_blocked: RwLock::new(HashSet::new()),
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Admission check for one pair. Handles the lazy `open → half-open`
    /// transition and the half-open probe budget.
    pub async fn allow(&self, key: &PairKey) -> AllowDecision {
        if !self.config.enabled {
            return AllowDecision::Admit;
        }
        if self.config.model_escalation.enabled
            && self.backend_blocked.read().await.contains(&key.backend_id)
        {
            return AllowDecision::Reject(RejectReason::BackendCircuitOpen);
        }

        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        let now = Utc::now();

        if entry.state == CircuitState::Open {
            match entry.next_retry_at {
                Some(at) if now >= at => {
                    tracing::info!(pair = %key, "Circuit retry window reached, probing");
                    entry.enter_half_open();
                }
                _ => {
                    entry.blocked_requests += 1;
                    return AllowDecision::Reject(RejectReason::CircuitOpen);
                }
            }
        }

        if entry.state == CircuitState::HalfOpen {
            // A half-open phase that has gone stale with no outstanding
            // probes re-opens rather than staying permeable forever.
            if entry.active_probe_count == 0 {
                if let Some(started) = entry.half_open_started_at {
                    let stale = chrono::Duration::milliseconds(
                        self.config.half_open_timeout_ms as i64,
                    );
                    if entry.half_open_attempts > 0 && now - started > stale {
                        entry.enter_open(&self.config, entry.last_error_kind);
                        entry.blocked_requests += 1;
                        return AllowDecision::Reject(RejectReason::CircuitOpen);
                    }
                }
            }
            if entry.active_probe_count >= self.config.half_open_max_requests {
                return AllowDecision::Reject(RejectReason::HalfOpenExhausted);
            }
            entry.active_probe_count += 1;
            entry.half_open_attempts += 1;
            entry.total_requests += 1;
            return AllowDecision::Probe;
        }

        entry.total_requests += 1;
        AllowDecision::Admit
    }

    /// Record a successful call. `probe` must reflect the `allow` decision
    /// that admitted it.
    pub async fn on_success(&self, key: &PairKey, latency_ms: u64, probe: bool) {
        if !self.config.enabled {
            return;
        }
        let _ = latency_ms;
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        entry.record_rate(self.config.error_rate_smoothing, false);
        entry.success_count += 1;
        entry.consecutive_successes = entry.consecutive_successes.saturating_add(1);
        entry.last_success_at = Some(Utc::now());
        if probe {
            entry.active_probe_count = entry.active_probe_count.saturating_sub(1);
        }
        match entry.state {
            CircuitState::Closed => {
                entry.failure_count = 0;
                entry.recent_break_flags.clear();
            }
            CircuitState::HalfOpen => {
                if entry.consecutive_successes >= self.config.recovery_success_threshold {
                    tracing::info!(pair = %key, "Circuit recovered, closing");
                    entry.enter_closed();
                }
            }
            CircuitState::Open => {
                // A background-tracked call can finish after the breaker
                // opened; it does not reopen the admission path by itself.
            }
        }
    }

    /// Record a classified failure.
    pub async fn on_failure(
        &self,
        key: &PairKey,
        classification: &Classification,
        reason: &str,
        probe: bool,
    ) {
        if !self.config.enabled {
            return;
        }
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        entry.record_rate(self.config.error_rate_smoothing, true);
        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.consecutive_successes = 0;
        entry.last_failure_at = Some(Utc::now());
        entry.last_error_kind = Some(classification.error_type);
        entry.last_failure_reason = Some(truncate(reason, 300));
        *entry
            .errors_by_category
            .entry(classification.category.to_string())
            .or_insert(0) += 1;
        *entry
            .errors_by_kind
            .entry(classification.error_type)
            .or_insert(0) += 1;
        entry
            .recent_break_flags
            .push_back(classification.should_circuit_break);
        while entry.recent_break_flags.len() > self.config.max_failure_threshold as usize {
            entry.recent_break_flags.pop_front();
        }
        if probe {
            entry.active_probe_count = entry.active_probe_count.saturating_sub(1);
        }

        match entry.state {
            CircuitState::HalfOpen => {
                tracing::warn!(pair = %key, reason = %truncate(reason, 120), "Probe failed, re-opening circuit");
                entry.enter_open(&self.config, Some(classification.error_type));
            }
            CircuitState::Closed => {
                let threshold = self.effective_threshold(entry);
                let count_trip = entry.failure_count >= threshold
                    && !entry.recent_break_flags.is_empty()
                    && entry.recent_break_flags.iter().all(|flag| *flag);
                let rate_trip = entry.total_events >= self.config.error_rate_min_events as u64
                    && entry.error_rate >= self.config.error_rate_threshold;
                if count_trip || rate_trip {
                    tracing::warn!(
                        pair = %key,
                        failures = entry.failure_count,
                        error_rate = entry.error_rate,
                        kind = ?classification.error_type,
                        "Circuit opened"
                    );
                    entry.enter_open(&self.config, Some(classification.error_type));
                }
            }
            CircuitState::Open => {
                // Late failures from in-flight calls while open: already
                // counted above, no transition.
            }
        }
    }

    /// Threshold after the adaptive adjustment, clamped to `[min, max]`.
    fn effective_threshold(&self, entry: &BreakerEntry) -> u32 {
        let base = self.config.base_failure_threshold;
        if !self.config.adaptive_thresholds {
            return base;
        }
        let adjusted = match entry.dominant_kind() {
            Some(ErrorType::NonRetryable) | Some(ErrorType::Permanent) => {
                base.saturating_sub(self.config.adaptive_threshold_adjustment)
            }
            Some(ErrorType::Transient) => {
                base.saturating_add(self.config.adaptive_threshold_adjustment)
            }
            _ => base,
        };
        adjusted.clamp(
            self.config.min_failure_threshold,
            self.config.max_failure_threshold,
        )
    }

    pub async fn force_open(&self, key: &PairKey) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        entry.enter_open(&self.config, entry.last_error_kind);
    }

    pub async fn force_close(&self, key: &PairKey) {
        let mut entries = self.entries.write().await;
        entries.entry(key.clone()).or_default().enter_closed();
    }

    pub async fn force_half_open(&self, key: &PairKey) {
        let mut entries = self.entries.write().await;
        entries.entry(key.clone()).or_default().enter_half_open();
    }

    /// Reset clears all counters and closes the breaker.
    pub async fn reset(&self, key: &PairKey) {
        let mut entries = self.entries.write().await;
        entries.insert(key.clone(), BreakerEntry::default());
    }

    pub async fn forget(&self, key: &PairKey) {
        self.entries.write().await.remove(key);
    }

    pub async fn state(&self, key: &PairKey) -> CircuitState {
        self.entries
            .read()
            .await
            .get(key)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub async fn snapshot(&self, key: &PairKey) -> Option<BreakerSnapshot> {
        self.entries.read().await.get(key).map(BreakerSnapshot::from)
    }

    pub async fn all(&self) -> HashMap<PairKey, BreakerSnapshot> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, e)| (k.clone(), BreakerSnapshot::from(e)))
            .collect()
    }

    /// Whether the escalation layer currently blocks a backend.
    pub async fn backend_blocked(&self, backend_id: &str) -> bool {
        self.config.model_escalation.enabled
            && self.backend_blocked.read().await.contains(backend_id)
    }

    /// One escalation sweep: block backends whose open-pair ratio has
    /// exceeded the threshold for the configured duration, heal those that
    /// have stayed below it equally long. Escalation gates new admissions
    /// only; in-flight requests run to completion.
    pub async fn run_escalation_sweep(&self) {
        if !self.config.model_escalation.enabled {
            return;
        }
        let ratios: HashMap<String, (usize, usize)> = {
            let entries = self.entries.read().await;
            let mut per_backend: HashMap<String, (usize, usize)> = HashMap::new();
            for (key, entry) in entries.iter() {
                let slot = per_backend.entry(key.backend_id.clone()).or_insert((0, 0));
                slot.1 += 1;
                if entry.state == CircuitState::Open {
                    slot.0 += 1;
                }
            }
            per_backend
        };

        let now = Instant::now();
        let hold = Duration::from_millis(self.config.model_escalation.duration_threshold_ms);
        let mut tracks = self.escalation.write().await;
        let mut blocked = self.backend_blocked.write().await;

        for (backend_id, (open, total)) in &ratios {
            if *total == 0 {
                continue;
            }
            let ratio = *open as f64 / *total as f64;
            let track = tracks.entry(backend_id.clone()).or_default();
            if ratio >= self.config.model_escalation.ratio_threshold {
                track.below_since = None;
                let since = *track.above_since.get_or_insert(now);
                if now.duration_since(since) >= hold && blocked.insert(backend_id.clone()) {
                    tracing::warn!(backend = %backend_id, ratio, "Escalated to backend-level circuit");
                }
            } else {
                track.above_since = None;
                let since = *track.below_since.get_or_insert(now);
                if now.duration_since(since) >= hold && blocked.remove(backend_id) {
                    tracing::info!(backend = %backend_id, ratio, "Backend-level circuit healed");
                }
            }
        }
        tracks.retain(|backend_id, _| ratios.contains_key(backend_id));
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Snapshot everything, keyed by storage key, for
    /// `circuit-breakers.json`.
    pub async fn persistable(&self) -> HashMap<String, BreakerSnapshot> {
        self.all()
            .await
            .into_iter()
            .map(|(k, v)| (k.storage_key(), v))
            .collect()
    }

    /// Restore persisted breaker state. Counters and the open retry point
    /// survive a restart; probe bookkeeping does not.
    pub async fn restore(&self, snapshots: HashMap<String, BreakerSnapshot>) {
        let mut entries = self.entries.write().await;
        for (storage_key, snap) in snapshots {
            let Some(key) = PairKey::from_storage_key(&storage_key) else {
                tracing::warn!(key = %storage_key, "Skipping malformed breaker key");
                continue;
            };
            let mut entry = BreakerEntry {
                state: snap.state,
                failure_count: snap.failure_count,
                success_count: snap.success_count,
                consecutive_successes: snap.consecutive_successes,
                total_requests: snap.total_requests,
                blocked_requests: snap.blocked_requests,
                last_failure_at: snap.last_failure_at,
                last_success_at: snap.last_success_at,
                next_retry_at: snap.next_retry_at,
                error_rate: snap.error_rate,
                errors_by_category: snap.errors_by_category,
                last_error_kind: snap.last_error_kind,
                last_failure_reason: snap.last_failure_reason,
                half_open_started_at: None,
                half_open_attempts: 0,
                active_probe_count: 0,
                open_episodes: snap.open_episodes,
                recent_break_flags: VecDeque::new(),
                errors_by_kind: HashMap::new(),
                total_events: snap.total_requests,
            };
            // A persisted half-open phase restarts as open at its retry
            // point, which may already be in the past.
            if entry.state == CircuitState::HalfOpen {
                entry.state = CircuitState::Open;
                if entry.next_retry_at.is_none() {
                    entry.next_retry_at = Some(Utc::now());
                }
            }
            entries.insert(key, entry);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorClassifier;

    fn key() -> PairKey {
        PairKey::new("a", "m")
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            base_failure_threshold: 3,
            min_failure_threshold: 1,
            max_failure_threshold: 10,
            recovery_success_threshold: 3,
            half_open_max_requests: 2,
            error_rate_threshold: 1.1, // count-based trips only, in tests
            ..BreakerConfig::default()
        }
    }

    fn breaking_failure() -> Classification {
        ErrorClassifier::default().classify("", Some(500))
    }

    #[tokio::test]
    async fn closed_admits_and_counts() {
        let reg = CircuitBreakerRegistry::new(config());
        assert_eq!(reg.allow(&key()).await, AllowDecision::Admit);
        let snap = reg.snapshot(&key()).await.unwrap();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_breaking_failures() {
        let reg = CircuitBreakerRegistry::new(config());
        let classification = breaking_failure();
        for _ in 0..3 {
            reg.on_failure(&key(), &classification, "boom", false).await;
        }
        assert_eq!(reg.state(&key()).await, CircuitState::Open);
        assert_eq!(
            reg.allow(&key()).await,
            AllowDecision::Reject(RejectReason::CircuitOpen)
        );
        let snap = reg.snapshot(&key()).await.unwrap();
        assert_eq!(snap.blocked_requests, 1);
        assert!(snap.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn non_breaking_failures_do_not_open() {
        let reg = CircuitBreakerRegistry::new(config());
        let transient = ErrorClassifier::default().classify("connection refused", None);
        for _ in 0..10 {
            reg.on_failure(&key(), &transient, "connection refused", false)
                .await;
        }
        assert_eq!(reg.state(&key()).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_budget_and_recovery() {
        let reg = CircuitBreakerRegistry::new(config());
        let classification = breaking_failure();
        for _ in 0..3 {
            reg.on_failure(&key(), &classification, "boom", false).await;
        }
        // Force the retry point into the past.
        {
            let mut entries = reg.entries.write().await;
            entries.get_mut(&key()).unwrap().next_retry_at =
                Some(Utc::now() - chrono::Duration::seconds(1));
        }
        assert_eq!(reg.allow(&key()).await, AllowDecision::Probe);
        assert_eq!(reg.allow(&key()).await, AllowDecision::Probe);
        // Budget of 2 exhausted.
        assert_eq!(
            reg.allow(&key()).await,
            AllowDecision::Reject(RejectReason::HalfOpenExhausted)
        );

        reg.on_success(&key(), 10, true).await;
        reg.on_success(&key(), 10, true).await;
        assert_eq!(reg.state(&key()).await, CircuitState::HalfOpen);
        assert_eq!(reg.allow(&key()).await, AllowDecision::Probe);
        reg.on_success(&key(), 10, true).await;
        // Three consecutive successes close the circuit.
        assert_eq!(reg.state(&key()).await, CircuitState::Closed);
        let snap = reg.snapshot(&key()).await.unwrap();
        assert_eq!(snap.open_episodes, 0);
    }

    #[tokio::test]
    async fn probe_failure_reopens_with_grown_backoff() {
        let reg = CircuitBreakerRegistry::new(config());
        let rate_limited = ErrorClassifier::default().classify("rate limit exceeded", Some(429));
        for _ in 0..3 {
            reg.on_failure(&key(), &rate_limited, "rate limit", false)
                .await;
        }
        let first_retry = reg.snapshot(&key()).await.unwrap().next_retry_at.unwrap();
        {
            let mut entries = reg.entries.write().await;
            entries.get_mut(&key()).unwrap().next_retry_at =
                Some(Utc::now() - chrono::Duration::seconds(1));
        }
        assert_eq!(reg.allow(&key()).await, AllowDecision::Probe);
        reg.on_failure(&key(), &rate_limited, "rate limit", true).await;
        let snap = reg.snapshot(&key()).await.unwrap();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.open_episodes, 2);
        // Second rate-limited episode backs off 15min vs the first 5min.
        let second_retry = snap.next_retry_at.unwrap();
        assert!(second_retry - Utc::now() > first_retry - Utc::now());
    }

    #[tokio::test]
    async fn success_in_closed_resets_failure_count() {
        let reg = CircuitBreakerRegistry::new(config());
        let classification = breaking_failure();
        reg.on_failure(&key(), &classification, "boom", false).await;
        reg.on_failure(&key(), &classification, "boom", false).await;
        reg.on_success(&key(), 5, false).await;
        reg.on_failure(&key(), &classification, "boom", false).await;
        reg.on_failure(&key(), &classification, "boom", false).await;
        // Two failures since last success: below threshold of 3.
        assert_eq!(reg.state(&key()).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn forced_transitions_reset_probe_counters() {
        let reg = CircuitBreakerRegistry::new(config());
        reg.force_open(&key()).await;
        assert_eq!(reg.state(&key()).await, CircuitState::Open);
        reg.force_half_open(&key()).await;
        let snap = reg.snapshot(&key()).await.unwrap();
        assert_eq!(snap.active_probe_count, 0);
        assert_eq!(snap.half_open_attempts, 0);
        reg.force_close(&key()).await;
        assert_eq!(reg.state(&key()).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn adaptive_threshold_lowers_for_non_retryable() {
        let mut cfg = config();
        cfg.base_failure_threshold = 4;
        cfg.adaptive_threshold_adjustment = 2;
        let reg = CircuitBreakerRegistry::new(cfg);
        let fatal = ErrorClassifier::default().classify("model not found", None);
        reg.on_failure(&key(), &fatal, "model not found", false).await;
        reg.on_failure(&key(), &fatal, "model not found", false).await;
        // Threshold 4 adapts down to 2 for non-retryable-dominated errors.
        assert_eq!(reg.state(&key()).await, CircuitState::Open);
    }

    #[tokio::test]
    async fn disabled_breaker_always_admits() {
        let cfg = BreakerConfig {
            enabled: false,
            ..config()
        };
        let reg = CircuitBreakerRegistry::new(cfg);
        let classification = breaking_failure();
        for _ in 0..20 {
            reg.on_failure(&key(), &classification, "boom", false).await;
        }
        assert_eq!(reg.allow(&key()).await, AllowDecision::Admit);
    }

    #[tokio::test]
    async fn escalation_blocks_backend_after_sustained_ratio() {
        let mut cfg = config();
        cfg.model_escalation = EscalationConfig {
            enabled: true,
            ratio_threshold: 0.5,
            duration_threshold_ms: 0,
            check_interval_ms: 10,
        };
        let reg = CircuitBreakerRegistry::new(cfg);
        let classification = breaking_failure();
        for model in ["m1", "m2"] {
            let k = PairKey::new("a", model);
            for _ in 0..3 {
                reg.on_failure(&k, &classification, "boom", false).await;
            }
        }
        reg.run_escalation_sweep().await;
        assert!(reg.backend_blocked("a").await);
        assert_eq!(
            reg.allow(&PairKey::new("a", "m3")).await,
            AllowDecision::Reject(RejectReason::BackendCircuitOpen)
        );

        // Heal: close both pairs, sweep again.
        reg.force_close(&PairKey::new("a", "m1")).await;
        reg.force_close(&PairKey::new("a", "m2")).await;
        reg.run_escalation_sweep().await;
        assert!(!reg.backend_blocked("a").await);
    }

    #[tokio::test]
    async fn persistence_round_trip_preserves_state() {
        let reg = CircuitBreakerRegistry::new(config());
        let classification = breaking_failure();
        for _ in 0..3 {
            reg.on_failure(&key(), &classification, "boom", false).await;
        }
        let saved = reg.persistable().await;

        let restored = CircuitBreakerRegistry::new(config());
        restored.restore(saved).await;
        let snap = restored.snapshot(&key()).await.unwrap();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.failure_count, 3);
        assert!(snap.next_retry_at.is_some());
    }

    #[test]
    fn backoff_buckets_by_error_kind() {
        let cfg = BreakerConfig::default();
        assert_eq!(
            open_backoff(&cfg, Some(ErrorType::Permanent), 1),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            open_backoff(&cfg, Some(ErrorType::NonRetryable), 1),
            Duration::from_secs(48 * 3600)
        );
        assert_eq!(
            open_backoff(&cfg, Some(ErrorType::Retryable), 1),
            Duration::from_secs(12 * 3600)
        );
        assert_eq!(
            open_backoff(&cfg, Some(ErrorType::RateLimited), 1),
            Duration::from_secs(300)
        );
        assert_eq!(
            open_backoff(&cfg, Some(ErrorType::RateLimited), 2),
            Duration::from_secs(900)
        );
        // Capped at one hour.
        assert_eq!(
            open_backoff(&cfg, Some(ErrorType::RateLimited), 10),
            Duration::from_secs(3600)
        );
        assert_eq!(
            open_backoff(&cfg, Some(ErrorType::Transient), 1),
            Duration::from_millis(cfg.open_timeout_ms)
        );
    }
}
