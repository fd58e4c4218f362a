//! Backend selection.
//!
//! Candidates arrive prefiltered (healthy, advertising the model, not
//! drained/banned/cooling, breaker willing); the balancer only ranks them.
//! Selection is a pure function of the candidate snapshots except for the
//! round-robin cursor and sticky-session table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    FastestResponse,
    RoundRobin,
    LeastConnections,
    Weighted,
    Random,
    StreamingOptimized,
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::FastestResponse
    }
}

/// Score component weights; must sum to 1 ± 1e-3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoreWeights {
    pub latency: f64,
    pub success_rate: f64,
    pub load: f64,
    pub capacity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            success_rate: 0.3,
            load: 0.2,
            capacity: 0.1,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.latency + self.success_rate + self.load + self.capacity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoreThresholds {
    /// Latency that maps to a latency score of zero.
    pub max_p95_latency_ms: u64,
    /// Success rate at or below which the success score is zero.
    pub min_success_rate: f64,
    pub latency_penalty: f64,
    pub error_penalty: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            max_p95_latency_ms: 30_000,
            min_success_rate: 0.5,
            latency_penalty: 0.5,
            error_penalty: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingScoring {
    pub ttft_weight: f64,
    pub duration_weight: f64,
    pub ttft_blend_avg: f64,
    pub ttft_blend_p95: f64,
    pub duration_estimate_multiplier: f64,
}

impl Default for StreamingScoring {
    fn default() -> Self {
        Self {
            ttft_weight: 0.6,
            duration_weight: 0.4,
            ttft_blend_avg: 0.5,
            ttft_blend_p95: 0.5,
            duration_estimate_multiplier: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoundRobinOptions {
    pub skip_unhealthy: bool,
    pub check_capacity: bool,
    pub sticky_sessions_ttl_ms: u64,
}

impl Default for RoundRobinOptions {
    fn default() -> Self {
        Self {
            skip_unhealthy: true,
            check_capacity: true,
            sticky_sessions_ttl_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeastConnectionsOptions {
    pub skip_unhealthy: bool,
    pub consider_capacity: bool,
    pub consider_failure_rate: bool,
    pub failure_rate_penalty: f64,
}

impl Default for LeastConnectionsOptions {
    fn default() -> Self {
        Self {
            skip_unhealthy: true,
            consider_capacity: true,
            consider_failure_rate: true,
            failure_rate_penalty: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BalancerConfig {
    pub algorithm: Algorithm,
    pub weights: ScoreWeights,
    pub thresholds: ScoreThresholds,
    pub latency_blend_recent: f64,
    pub latency_blend_historical: f64,
    pub load_factor_multiplier: f64,
    /// Latency assumed for a backend with no samples yet.
    pub default_latency_ms: u64,
    pub default_max_concurrency: u32,
    pub streaming: StreamingScoring,
    pub round_robin: RoundRobinOptions,
    pub least_connections: LeastConnectionsOptions,
    /// External weights for the `weighted` algorithm, by backend id.
    pub backend_weights: HashMap<String, f64>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            weights: ScoreWeights::default(),
            thresholds: ScoreThresholds::default(),
            latency_blend_recent: 0.6,
            latency_blend_historical: 0.4,
            load_factor_multiplier: 50.0,
            default_latency_ms: 1000,
            default_max_concurrency: 4,
            streaming: StreamingScoring::default(),
            round_robin: RoundRobinOptions::default(),
            least_connections: LeastConnectionsOptions::default(),
            backend_weights: HashMap::new(),
        }
    }
}

/// Everything the balancer may look at for one backend. Assembled by the
/// orchestrator from inventory, metrics, breaker and in-flight snapshots so
/// scoring itself stays lock-free and testable.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub backend_id: String,
    pub healthy: bool,
    pub max_concurrency: u32,
    pub last_response_time_ms: Option<u64>,
    pub p95_latency_ms: u64,
    pub success_rate: f64,
    pub in_flight: u32,
    pub breaker_state: CircuitState,
    pub breaker_failures: u32,
    pub current_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub ttft_avg_ms: f64,
    pub ttft_p95_ms: u64,
    pub stream_duration_avg_ms: f64,
}

impl Candidate {
    fn at_capacity(&self) -> bool {
        self.in_flight >= self.max_concurrency
    }
}

#[derive(Debug)]
pub struct LoadBalancer {
    config: BalancerConfig,
    rr_cursors: Mutex<HashMap<String, usize>>,
    sticky: Mutex<HashMap<String, (String, Instant)>>,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            rr_cursors: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Pick one backend id from the candidate set, or None when empty.
    pub fn select(
        &self,
        model: &str,
        candidates: &[Candidate],
        streaming: bool,
        client_id: Option<&str>,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        match self.config.algorithm {
            Algorithm::FastestResponse => self.pick_by_score(candidates, false),
            Algorithm::Weighted => self.pick_by_score(candidates, true),
            Algorithm::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[idx].backend_id.clone())
            }
            Algorithm::RoundRobin => self.pick_round_robin(model, candidates, client_id),
            Algorithm::LeastConnections => self.pick_least_connections(candidates),
            Algorithm::StreamingOptimized => {
                if streaming {
                    self.pick_streaming(candidates)
                } else {
                    self.pick_by_score(candidates, false)
                }
            }
        }
    }

    /// The fastest-response composite score. Larger is better.
    pub fn score(&self, candidate: &Candidate, max_observed_concurrency: u32) -> f64 {
        let cfg = &self.config;
        let recent = candidate
            .last_response_time_ms
            .unwrap_or(cfg.default_latency_ms) as f64;
        let historical = if candidate.p95_latency_ms > 0 {
            candidate.p95_latency_ms as f64
        } else {
            cfg.default_latency_ms as f64
        };
        let blended = cfg.latency_blend_recent * recent
            + cfg.latency_blend_historical * historical
            + cfg.load_factor_multiplier * candidate.in_flight as f64;
        let latency_score =
            100.0 * (1.0 - blended / cfg.thresholds.max_p95_latency_ms as f64).clamp(0.0, 1.0);

        let min_sr = cfg.thresholds.min_success_rate;
        let success_score = if min_sr >= 1.0 {
            100.0
        } else {
            100.0 * ((candidate.success_rate - min_sr) / (1.0 - min_sr)).clamp(0.0, 1.0)
        };

        let max_conc = candidate.max_concurrency.max(1) as f64;
        let load_score = (100.0 * (1.0 - candidate.in_flight as f64 / max_conc)).max(0.0);

        let capacity_score =
            100.0 * candidate.max_concurrency as f64 / max_observed_concurrency.max(1) as f64;

        let breaker_bonus = match candidate.breaker_state {
            CircuitState::Closed => 100.0 - (candidate.breaker_failures.min(15) as f64),
            CircuitState::HalfOpen => 20.0,
            CircuitState::Open => 5.0,
        };

        let timeout_bonus = {
            let cur = candidate.current_timeout_ms;
            let min = candidate.min_timeout_ms;
            let max = candidate.max_timeout_ms.max(min + 1);
            if cur <= min {
                100.0
            } else if cur >= max {
                0.0
            } else {
                100.0 * (1.0 - (cur - min) as f64 / (max - min) as f64)
            }
        };

        cfg.weights.latency * latency_score
            + cfg.weights.success_rate * success_score
            + cfg.weights.load * load_score
            + cfg.weights.capacity * capacity_score
            + breaker_bonus
            + timeout_bonus
    }

    fn pick_by_score(&self, candidates: &[Candidate], external_weights: bool) -> Option<String> {
        let max_observed = candidates
            .iter()
            .map(|c| c.max_concurrency)
            .max()
            .unwrap_or(1);
        candidates
            .iter()
            .map(|c| {
                let mut score = self.score(c, max_observed);
                if external_weights {
                    score *= self
                        .config
                        .backend_weights
                        .get(&c.backend_id)
                        .copied()
                        .unwrap_or(1.0);
                }
                (c, score)
            })
            // Ties break toward the lexicographically smaller backend id.
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.backend_id.cmp(&a.backend_id))
            })
            .map(|(c, _)| c.backend_id.clone())
    }

    fn pick_round_robin(
        &self,
        model: &str,
        candidates: &[Candidate],
        client_id: Option<&str>,
    ) -> Option<String> {
        let opts = &self.config.round_robin;

        if opts.sticky_sessions_ttl_ms > 0 {
            if let Some(client) = client_id {
                let ttl = Duration::from_millis(opts.sticky_sessions_ttl_ms);
                let mut sticky = self.sticky.lock().unwrap_or_else(|e| e.into_inner());
                sticky.retain(|_, (_, at)| at.elapsed() < ttl);
                if let Some((backend_id, _)) = sticky.get(client) {
                    if candidates.iter().any(|c| &c.backend_id == backend_id) {
                        return Some(backend_id.clone());
                    }
                }
            }
        }

        let eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| !opts.skip_unhealthy || c.healthy)
            .filter(|c| !opts.check_capacity || !c.at_capacity())
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let picked = {
            let mut cursors = self.rr_cursors.lock().unwrap_or_else(|e| e.into_inner());
            let cursor = cursors.entry(model.to_string()).or_insert(0);
            let choice = eligible[*cursor % eligible.len()].backend_id.clone();
            *cursor = cursor.wrapping_add(1);
            choice
        };

        if opts.sticky_sessions_ttl_ms > 0 {
            if let Some(client) = client_id {
                self.sticky
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(client.to_string(), (picked.clone(), Instant::now()));
            }
        }
        Some(picked)
    }

    fn pick_least_connections(&self, candidates: &[Candidate]) -> Option<String> {
        let opts = &self.config.least_connections;
        candidates
            .iter()
            .filter(|c| !opts.skip_unhealthy || c.healthy)
            .map(|c| {
                let utilization = if opts.consider_capacity {
                    c.in_flight as f64 / c.max_concurrency.max(1) as f64
                } else {
                    c.in_flight as f64
                };
                let penalty = if opts.consider_failure_rate {
                    (1.0 - c.success_rate).max(0.0) * opts.failure_rate_penalty
                } else {
                    0.0
                };
                (c, utilization + penalty)
            })
            .min_by(|(a, ca), (b, cb)| {
                ca.partial_cmp(cb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.backend_id.cmp(&b.backend_id))
            })
            .map(|(c, _)| c.backend_id.clone())
    }

    /// Blend TTFT percentiles with estimated total duration; lower blended
    /// cost wins.
    fn pick_streaming(&self, candidates: &[Candidate]) -> Option<String> {
        let s = &self.config.streaming;
        candidates
            .iter()
            .map(|c| {
                let ttft = if c.ttft_avg_ms > 0.0 || c.ttft_p95_ms > 0 {
                    s.ttft_blend_avg * c.ttft_avg_ms + s.ttft_blend_p95 * c.ttft_p95_ms as f64
                } else {
                    self.config.default_latency_ms as f64
                };
                let duration = if c.stream_duration_avg_ms > 0.0 {
                    c.stream_duration_avg_ms * s.duration_estimate_multiplier
                } else {
                    self.config.default_latency_ms as f64 * s.duration_estimate_multiplier
                };
                let cost = s.ttft_weight * ttft + s.duration_weight * duration;
                (c, cost)
            })
            .min_by(|(a, ca), (b, cb)| {
                ca.partial_cmp(cb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.backend_id.cmp(&b.backend_id))
            })
            .map(|(c, _)| c.backend_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> Candidate {
        Candidate {
            backend_id: id.to_string(),
            healthy: true,
            max_concurrency: 4,
            last_response_time_ms: Some(100),
            p95_latency_ms: 200,
            success_rate: 1.0,
            in_flight: 0,
            breaker_state: CircuitState::Closed,
            breaker_failures: 0,
            current_timeout_ms: 30_000,
            min_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            ttft_avg_ms: 0.0,
            ttft_p95_ms: 0,
            stream_duration_avg_ms: 0.0,
        }
    }

    fn balancer(algorithm: Algorithm) -> LoadBalancer {
        LoadBalancer::new(BalancerConfig {
            algorithm,
            ..BalancerConfig::default()
        })
    }

    #[test]
    fn fastest_response_prefers_lower_latency() {
        let lb = balancer(Algorithm::FastestResponse);
        let slow = Candidate {
            last_response_time_ms: Some(5000),
            p95_latency_ms: 8000,
            ..candidate("slow")
        };
        let fast = candidate("fast");
        assert_eq!(
            lb.select("m", &[slow, fast], false, None),
            Some("fast".to_string())
        );
    }

    #[test]
    fn score_ties_break_lexicographically() {
        let lb = balancer(Algorithm::FastestResponse);
        let a = candidate("b");
        let b = candidate("a");
        assert_eq!(lb.select("m", &[a, b], false, None), Some("a".to_string()));
    }

    #[test]
    fn half_open_scores_below_closed() {
        let lb = balancer(Algorithm::FastestResponse);
        let closed = candidate("x");
        let half_open = Candidate {
            breaker_state: CircuitState::HalfOpen,
            ..candidate("x")
        };
        assert!(lb.score(&closed, 4) > lb.score(&half_open, 4));
        let open = Candidate {
            breaker_state: CircuitState::Open,
            ..candidate("x")
        };
        assert!(lb.score(&half_open, 4) > lb.score(&open, 4));
    }

    #[test]
    fn inflated_timeout_lowers_score() {
        let lb = balancer(Algorithm::FastestResponse);
        let calm = candidate("x");
        let strained = Candidate {
            current_timeout_ms: 300_000,
            ..candidate("x")
        };
        assert!(lb.score(&calm, 4) > lb.score(&strained, 4));
    }

    #[test]
    fn round_robin_cycles_per_model() {
        let lb = balancer(Algorithm::RoundRobin);
        let set = [candidate("a"), candidate("b")];
        let first = lb.select("m", &set, false, None).unwrap();
        let second = lb.select("m", &set, false, None).unwrap();
        let third = lb.select("m", &set, false, None).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn round_robin_skips_at_capacity() {
        let lb = balancer(Algorithm::RoundRobin);
        let busy = Candidate {
            in_flight: 4,
            ..candidate("busy")
        };
        let free = candidate("free");
        for _ in 0..3 {
            assert_eq!(
                lb.select("m", &[busy.clone(), free.clone()], false, None),
                Some("free".to_string())
            );
        }
    }

    #[test]
    fn sticky_sessions_pin_client_to_backend() {
        let mut cfg = BalancerConfig {
            algorithm: Algorithm::RoundRobin,
            ..BalancerConfig::default()
        };
        cfg.round_robin.sticky_sessions_ttl_ms = 60_000;
        let lb = LoadBalancer::new(cfg);
        let set = [candidate("a"), candidate("b")];
        let first = lb.select("m", &set, false, Some("client-1")).unwrap();
        for _ in 0..4 {
            assert_eq!(
                lb.select("m", &set, false, Some("client-1")).unwrap(),
                first
            );
        }
    }

    #[test]
    fn least_connections_minimizes_utilization() {
        let lb = balancer(Algorithm::LeastConnections);
        let busy = Candidate {
            in_flight: 3,
            ..candidate("busy")
        };
        let free = Candidate {
            in_flight: 1,
            ..candidate("free")
        };
        assert_eq!(
            lb.select("m", &[busy, free], false, None),
            Some("free".to_string())
        );
    }

    #[test]
    fn least_connections_penalizes_failure_rate() {
        let lb = balancer(Algorithm::LeastConnections);
        let flaky = Candidate {
            in_flight: 0,
            success_rate: 0.2,
            ..candidate("flaky")
        };
        let steady = Candidate {
            in_flight: 2,
            ..candidate("steady")
        };
        assert_eq!(
            lb.select("m", &[flaky, steady], false, None),
            Some("steady".to_string())
        );
    }

    #[test]
    fn weighted_applies_external_weights() {
        let mut cfg = BalancerConfig {
            algorithm: Algorithm::Weighted,
            ..BalancerConfig::default()
        };
        cfg.backend_weights.insert("a".into(), 0.1);
        cfg.backend_weights.insert("b".into(), 2.0);
        let lb = LoadBalancer::new(cfg);
        assert_eq!(
            lb.select("m", &[candidate("a"), candidate("b")], false, None),
            Some("b".to_string())
        );
    }

    #[test]
    fn streaming_optimized_uses_ttft_when_streaming() {
        let lb = balancer(Algorithm::StreamingOptimized);
        let quick_first_token = Candidate {
            ttft_avg_ms: 50.0,
            ttft_p95_ms: 80,
            stream_duration_avg_ms: 2000.0,
            ..candidate("quick")
        };
        let slow_first_token = Candidate {
            ttft_avg_ms: 900.0,
            ttft_p95_ms: 1500,
            stream_duration_avg_ms: 2000.0,
            ..candidate("slow")
        };
        assert_eq!(
            lb.select("m", &[slow_first_token, quick_first_token], true, None),
            Some("quick".to_string())
        );
    }

    #[test]
    fn random_picks_from_the_full_set() {
        let lb = balancer(Algorithm::Random);
        let set = [candidate("a"), candidate("b"), candidate("c")];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(lb.select("m", &set, false, None).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn empty_candidate_set_yields_none() {
        let lb = balancer(Algorithm::FastestResponse);
        assert_eq!(lb.select("m", &[], false, None), None);
    }
}
