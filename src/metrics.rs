//! Per-pair request metrics.
//!
//! Keeps a bounded ring of recent latencies plus fixed-duration rolling
//! windows (1m/5m/15m/1h/24h) per `(backend, model)` pair. Windows advance
//! lazily on access; there is no background sweeper. Streaming requests
//! additionally record time-to-first-token and end-to-end duration rings.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::backend::PairKey;

/// Default cap for the recent-latency ring.
pub const DEFAULT_RING_CAP: usize = 1000;

/// The five rolling window durations, shortest first.
const WINDOW_DURATIONS: [Duration; 5] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

const WINDOW_LABELS: [&str; 5] = ["1m", "5m", "15m", "1h", "24h"];

/// Aggregates for one window interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowAggregate {
    pub count: u64,
    pub errors: u64,
    pub latency_sum: u64,
    pub latency_sum_squares: u128,
    pub min_latency: u64,
    pub max_latency: u64,
    pub tokens_generated: u64,
    pub tokens_prompt: u64,
}

impl WindowAggregate {
    fn record(&mut self, latency_ms: u64, tokens_prompt: u64, tokens_generated: u64) {
        if self.count == 0 || latency_ms < self.min_latency {
            self.min_latency = latency_ms;
        }
        if latency_ms > self.max_latency {
            self.max_latency = latency_ms;
        }
        self.count += 1;
        self.latency_sum += latency_ms;
        self.latency_sum_squares += (latency_ms as u128) * (latency_ms as u128);
        self.tokens_prompt += tokens_prompt;
        self.tokens_generated += tokens_generated;
    }
}

/// One rolling window: a current interval plus the last sealed interval.
#[derive(Debug, Clone)]
struct RollingWindow {
    duration: Duration,
    started: Instant,
    current: WindowAggregate,
    sealed: Option<WindowAggregate>,
}

impl RollingWindow {
    fn new(duration: Duration, now: Instant) -> Self {
        Self {
            duration,
            started: now,
            current: WindowAggregate::default(),
            sealed: None,
        }
    }

    /// Seal the current interval if it has elapsed. If more than one full
    /// interval passed with no traffic, the sealed slot is cleared too.
    fn advance(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.started);
        if elapsed < self.duration {
            return;
        }
        if elapsed < self.duration * 2 {
            self.sealed = Some(std::mem::take(&mut self.current));
        } else {
            self.sealed = None;
            self.current = WindowAggregate::default();
        }
        // Align the new interval to the wall, not to the first write in it.
        let intervals = (elapsed.as_nanos() / self.duration.as_nanos()) as u32;
        self.started += self.duration * intervals;
    }
}

/// Per-pair state: rings plus the window set.
#[derive(Debug)]
struct PairMetrics {
    recent_latencies: VecDeque<u64>,
    ttft_ms: VecDeque<u64>,
    stream_duration_ms: VecDeque<u64>,
    windows: Vec<RollingWindow>,
    last_response_time_ms: Option<u64>,
    total_requests: u64,
    total_errors: u64,
    /// Last write of any kind; drives history retention.
    last_activity: Instant,
}

impl PairMetrics {
    fn new(now: Instant) -> Self {
        Self {
            recent_latencies: VecDeque::new(),
            ttft_ms: VecDeque::new(),
            stream_duration_ms: VecDeque::new(),
            windows: WINDOW_DURATIONS
                .iter()
                .map(|d| RollingWindow::new(*d, now))
                .collect(),
            last_response_time_ms: None,
            total_requests: 0,
            total_errors: 0,
            last_activity: now,
        }
    }

    fn advance_all(&mut self, now: Instant) {
        for w in &mut self.windows {
            w.advance(now);
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}

fn push_ring(ring: &mut VecDeque<u64>, value: u64, cap: usize) {
    if ring.len() == cap {
        ring.pop_front();
    }
    ring.push_back(value);
}

/// Percentile over a ring: sorted copy, index `⌈N·p⌉ − 1`. Empty ring → 0.
fn percentile(ring: &VecDeque<u64>, p: f64) -> u64 {
    if ring.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = ring.iter().copied().collect();
    sorted.sort_unstable();
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn average(ring: &VecDeque<u64>) -> f64 {
    if ring.is_empty() {
        return 0.0;
    }
    ring.iter().sum::<u64>() as f64 / ring.len() as f64
}

/// Read-only view of one pair's metrics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    /// `1 − errors/count` over the 1m window; 0 when the window is empty.
    pub success_rate: f64,
    /// Requests per minute projected from the most recent window.
    pub throughput_rpm: f64,
    pub avg_tokens_per_request: f64,
    pub last_response_time_ms: Option<u64>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub ttft_p95_ms: u64,
    pub ttft_avg_ms: f64,
    pub stream_duration_p95_ms: u64,
    pub stream_duration_avg_ms: f64,
    pub windows: HashMap<String, WindowAggregate>,
}

/// Fleet-wide rollup.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalMetrics {
    pub pairs: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub tokens_generated: u64,
    pub tokens_prompt: u64,
}

/// Shared aggregator. Writes for one pair serialize under the map's write
/// lock; reads copy out an immutable snapshot.
#[derive(Debug)]
pub struct MetricsAggregator {
    entries: RwLock<HashMap<PairKey, PairMetrics>>,
    ring_cap: usize,
    enabled: bool,
    /// Pairs idle longer than this are dropped from persisted history.
    retention: Duration,
}

impl MetricsAggregator {
    pub fn new(ring_cap: usize, enabled: bool, retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ring_cap: ring_cap.max(1),
            enabled,
            retention,
        }
    }

    /// Record one completed request.
    pub async fn record_request(
        &self,
        key: &PairKey,
        latency_ms: u64,
        tokens_prompt: u64,
        tokens_generated: u64,
    ) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| PairMetrics::new(now));
        entry.advance_all(now);
        entry.touch(now);
        push_ring(&mut entry.recent_latencies, latency_ms, self.ring_cap);
        for w in &mut entry.windows {
            w.current.record(latency_ms, tokens_prompt, tokens_generated);
        }
        entry.last_response_time_ms = Some(latency_ms);
        entry.total_requests += 1;
    }

    /// Record one failed request. Errors also count as requests within the
    /// windows so `errors ≤ count` holds.
    pub async fn record_error(&self, key: &PairKey, latency_ms: u64) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| PairMetrics::new(now));
        entry.advance_all(now);
        entry.touch(now);
        for w in &mut entry.windows {
            w.current.record(latency_ms, 0, 0);
            w.current.errors += 1;
        }
        entry.total_requests += 1;
        entry.total_errors += 1;
    }

    /// Record time-to-first-content for a streaming request. Called at most
    /// once per request.
    pub async fn record_first_token(&self, key: &PairKey, ttft_ms: u64) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| PairMetrics::new(now));
        entry.touch(now);
        push_ring(&mut entry.ttft_ms, ttft_ms, self.ring_cap);
    }

    /// Record end-to-end streaming duration. Called at most once per request.
    pub async fn record_stream_duration(&self, key: &PairKey, duration_ms: u64) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| PairMetrics::new(now));
        entry.touch(now);
        push_ring(&mut entry.stream_duration_ms, duration_ms, self.ring_cap);
    }

    pub async fn snapshot(&self, key: &PairKey) -> MetricsSnapshot {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return MetricsSnapshot::default();
        };
        entry.advance_all(now);
        build_snapshot(entry, now)
    }

    pub async fn all(&self) -> HashMap<PairKey, MetricsSnapshot> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries
            .iter_mut()
            .map(|(k, e)| {
                e.advance_all(now);
                (k.clone(), build_snapshot(e, now))
            })
            .collect()
    }

    pub async fn global(&self) -> GlobalMetrics {
        let entries = self.entries.read().await;
        let mut global = GlobalMetrics {
            pairs: entries.len(),
            ..GlobalMetrics::default()
        };
        for entry in entries.values() {
            global.total_requests += entry.total_requests;
            global.total_errors += entry.total_errors;
            // The 24h window is the widest aggregate we keep.
            if let Some(w) = entry.windows.last() {
                global.tokens_generated += w.current.tokens_generated;
                global.tokens_prompt += w.current.tokens_prompt;
            }
        }
        global
    }

    /// Drop all state for a pair (backend removed, ban, …).
    pub async fn forget(&self, key: &PairKey) {
        self.entries.write().await.remove(key);
    }

    /// Serializable per-pair snapshots keyed by storage key, for
    /// `metrics.json`. Applies retention first: pairs idle beyond the
    /// history window are dropped rather than persisted forever.
    pub async fn persistable(&self) -> HashMap<String, MetricsSnapshot> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|key, entry| {
            let keep = now.duration_since(entry.last_activity) < self.retention;
            if !keep {
                tracing::debug!(pair = %key, "Dropping idle pair from metrics history");
            }
            keep
        });
        entries
            .iter_mut()
            .map(|(k, e)| {
                e.advance_all(now);
                (k.storage_key(), build_snapshot(e, now))
            })
            .collect()
    }
}

fn build_snapshot(entry: &PairMetrics, now: Instant) -> MetricsSnapshot {
    let one_minute = &entry.windows[0];
    let success_rate = if one_minute.current.count == 0 {
        0.0
    } else {
        1.0 - one_minute.current.errors as f64 / one_minute.current.count as f64
    };

    // Project throughput from the in-progress 1m interval; fall back to the
    // sealed one when the current interval has just opened.
    let throughput_rpm = {
        let elapsed = now.duration_since(one_minute.started).as_secs_f64();
        if one_minute.current.count > 0 && elapsed > 1.0 {
            one_minute.current.count as f64 * 60.0 / elapsed
        } else if let Some(sealed) = &one_minute.sealed {
            sealed.count as f64
        } else {
            0.0
        }
    };

    let avg_tokens_per_request = if one_minute.current.count > 0 {
        (one_minute.current.tokens_generated + one_minute.current.tokens_prompt) as f64
            / one_minute.current.count as f64
    } else {
        0.0
    };

    let windows = WINDOW_LABELS
        .iter()
        .zip(entry.windows.iter())
        .map(|(label, w)| ((*label).to_string(), w.current.clone()))
        .collect();

    MetricsSnapshot {
        p50_latency_ms: percentile(&entry.recent_latencies, 0.50),
        p95_latency_ms: percentile(&entry.recent_latencies, 0.95),
        p99_latency_ms: percentile(&entry.recent_latencies, 0.99),
        success_rate,
        throughput_rpm,
        avg_tokens_per_request,
        last_response_time_ms: entry.last_response_time_ms,
        total_requests: entry.total_requests,
        total_errors: entry.total_errors,
        ttft_p95_ms: percentile(&entry.ttft_ms, 0.95),
        ttft_avg_ms: average(&entry.ttft_ms),
        stream_duration_p95_ms: percentile(&entry.stream_duration_ms, 0.95),
        stream_duration_avg_ms: average(&entry.stream_duration_ms),
        windows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PairKey {
        PairKey::new("a", "m")
    }

    #[test]
    fn percentile_uses_ceil_rank() {
        let ring: VecDeque<u64> = (1..=10).collect();
        assert_eq!(percentile(&ring, 0.50), 5);
        assert_eq!(percentile(&ring, 0.95), 10);
        assert_eq!(percentile(&ring, 0.99), 10);
        assert_eq!(percentile(&VecDeque::new(), 0.95), 0);
    }

    #[test]
    fn ring_evicts_oldest_on_overflow() {
        let mut ring = VecDeque::new();
        for v in 0..5u64 {
            push_ring(&mut ring, v, 3);
        }
        assert_eq!(ring, VecDeque::from(vec![2, 3, 4]));
    }

    #[tokio::test]
    async fn request_counts_and_success_rate() {
        let m = MetricsAggregator::new(DEFAULT_RING_CAP, true, Duration::from_secs(3600));
        m.record_request(&key(), 100, 10, 20).await;
        m.record_request(&key(), 300, 10, 20).await;
        m.record_error(&key(), 50).await;

        let snap = m.snapshot(&key()).await;
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.total_errors, 1);
        let one_minute = &snap.windows["1m"];
        assert_eq!(one_minute.count, 3);
        assert_eq!(one_minute.errors, 1);
        assert!(one_minute.errors <= one_minute.count);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(one_minute.min_latency, 50);
        assert_eq!(one_minute.max_latency, 300);
    }

    #[tokio::test]
    async fn empty_pair_snapshot_is_zeroed() {
        let m = MetricsAggregator::new(DEFAULT_RING_CAP, true, Duration::from_secs(3600));
        let snap = m.snapshot(&key()).await;
        assert_eq!(snap.p95_latency_ms, 0);
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(snap.total_requests, 0);
    }

    #[tokio::test]
    async fn ttft_and_duration_rings_are_separate() {
        let m = MetricsAggregator::new(DEFAULT_RING_CAP, true, Duration::from_secs(3600));
        m.record_first_token(&key(), 40).await;
        m.record_stream_duration(&key(), 200).await;
        let snap = m.snapshot(&key()).await;
        assert_eq!(snap.ttft_p95_ms, 40);
        assert_eq!(snap.stream_duration_p95_ms, 200);
        assert!((snap.ttft_avg_ms - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn disabled_aggregator_records_nothing() {
        let m = MetricsAggregator::new(DEFAULT_RING_CAP, false, Duration::from_secs(3600));
        m.record_request(&key(), 100, 0, 0).await;
        let snap = m.snapshot(&key()).await;
        assert_eq!(snap.total_requests, 0);
    }

    #[test]
    fn window_advance_seals_and_clears() {
        let start = Instant::now() - Duration::from_secs(150);
        let mut w = RollingWindow::new(Duration::from_secs(60), start);
        w.current.record(10, 0, 0);
        // 150s elapsed: more than two intervals, so history is stale.
        w.advance(Instant::now());
        assert!(w.sealed.is_none());
        assert_eq!(w.current.count, 0);

        let start = Instant::now() - Duration::from_secs(90);
        let mut w = RollingWindow::new(Duration::from_secs(60), start);
        w.current.record(10, 0, 0);
        w.advance(Instant::now());
        assert_eq!(w.sealed.as_ref().map(|s| s.count), Some(1));
        assert_eq!(w.current.count, 0);
    }

    #[tokio::test]
    async fn persistable_drops_pairs_idle_past_retention() {
        let m = MetricsAggregator::new(DEFAULT_RING_CAP, true, Duration::from_millis(30));
        m.record_request(&PairKey::new("idle", "m"), 10, 0, 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        m.record_request(&PairKey::new("busy", "m"), 10, 0, 0).await;

        let persisted = m.persistable().await;
        assert!(persisted.contains_key("busy:m"));
        assert!(!persisted.contains_key("idle:m"));
        // The idle pair is gone from live state too, not just the file.
        assert_eq!(m.snapshot(&PairKey::new("idle", "m")).await.total_requests, 0);
    }

    #[tokio::test]
    async fn global_rollup_sums_pairs() {
        let m = MetricsAggregator::new(DEFAULT_RING_CAP, true, Duration::from_secs(3600));
        m.record_request(&PairKey::new("a", "m"), 10, 1, 2).await;
        m.record_request(&PairKey::new("b", "m"), 10, 3, 4).await;
        let g = m.global().await;
        assert_eq!(g.pairs, 2);
        assert_eq!(g.total_requests, 2);
        assert_eq!(g.tokens_prompt, 4);
        assert_eq!(g.tokens_generated, 6);
    }
}
