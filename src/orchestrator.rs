//! The orchestrator facade.
//!
//! Owns every shared subsystem (inventory, breakers, metrics, queue,
//! in-flight, cooldowns, bans, balancer, timeouts, classifier, upstream
//! client) and implements the per-request loop: filter candidates, score
//! and pick, admit, proxy, record, fail over. All state is injected at
//! construction so tests can run isolated orchestrators.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, PairKey};
use crate::balancer::{Candidate, LoadBalancer};
use crate::breaker::{AllowDecision, BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
use crate::classifier::ErrorClassifier;
use crate::config::{Config, SharedConfig};
use crate::cooldown::{BanStore, CooldownTracker};
use crate::error::GatewayError;
use crate::health::HealthScheduler;
use crate::inflight::{InFlightGuard, InFlightTracker};
use crate::inventory::FleetInventory;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::persist;
use crate::proxy::{
    BackgroundObservation, BufferedResponse, CallBudgets, ProxyCall, ProxyError, StreamOutcome,
    StreamFailure, StreamingResponse, UpstreamClient,
};
use crate::queue::RequestQueue;
use crate::timeout::{PersistedTimeouts, TimeoutManager};

const SERVERS_FILE: &str = "servers.json";
const BANS_FILE: &str = "bans.json";
const TIMEOUTS_FILE: &str = "timeouts.json";
const BREAKERS_FILE: &str = "circuit-breakers.json";
const METRICS_FILE: &str = "metrics.json";

/// Persisted shape of `circuit-breakers.json`.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedBreakers {
    timestamp: DateTime<Utc>,
    breakers: std::collections::HashMap<String, BreakerSnapshot>,
}

/// Persisted shape of `metrics.json` (write-only history).
#[derive(Debug, Serialize)]
struct PersistedMetrics {
    timestamp: DateTime<Utc>,
    servers: std::collections::HashMap<String, MetricsSnapshot>,
}

/// One inbound inference call, already validated by the HTTP layer.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Upstream path, e.g. `/api/generate`.
    pub path: String,
    /// Body forwarded verbatim.
    pub body: Bytes,
    /// Normalized model name.
    pub model: String,
    pub streaming: bool,
    /// True for `/v1/*` calls; restricts candidates to backends that speak
    /// the OpenAI-compatible surface.
    pub openai_compat: bool,
    /// `model--<backendID>` pin, if any.
    pub pinned_backend: Option<String>,
    /// Opaque client id for sticky sessions.
    pub client_id: Option<String>,
    pub priority: u32,
}

/// Routing facts surfaced through the debug headers.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub backend_id: String,
    pub model: String,
    pub attempts: u32,
    pub available_servers: usize,
    pub server_circuit_state: CircuitState,
    pub model_circuit_state: CircuitState,
    pub routed_to_open_circuit: bool,
}

/// A completed routing decision plus the upstream response.
pub enum Dispatched {
    Buffered(BufferedResponse, RouteInfo),
    Streaming(StreamingResponse, RouteInfo),
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(response, info) => f
                .debug_struct("Buffered")
                .field("status", &response.status)
                .field("backend", &info.backend_id)
                .finish(),
            Self::Streaming(response, info) => f
                .debug_struct("Streaming")
                .field("status", &response.status)
                .field("backend", &info.backend_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Internal outcome of the selection + admission phase.
struct Admitted {
    backend: Backend,
    key: PairKey,
    guard: InFlightGuard,
    probe: bool,
}

enum AdmitFailure {
    /// Every candidate is at capacity; queueing may help.
    AllBusy,
    /// Every candidate was rejected by its breaker.
    AllCircuitBlocked { backend: String },
}

pub struct Orchestrator {
    pub settings: Config,
    pub shared_config: SharedConfig,
    pub inventory: Arc<FleetInventory>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub metrics: Arc<MetricsAggregator>,
    pub queue: Arc<RequestQueue>,
    pub inflight: InFlightTracker,
    pub cooldowns: Arc<CooldownTracker>,
    pub bans: Arc<BanStore>,
    pub balancer: Arc<LoadBalancer>,
    pub timeouts: Arc<TimeoutManager>,
    pub classifier: Arc<ErrorClassifier>,
    pub upstream: UpstreamClient,
    shutdown: CancellationToken,
    background_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<BackgroundObservation>>>,
}

impl Orchestrator {
    /// Wire every subsystem from one validated config. Does not spawn any
    /// background task and does not touch the disk unless persistence is
    /// enabled.
    pub fn new(mut config: Config) -> Arc<Self> {
        // Feature flags override the per-section switches.
        config.circuit_breaker.enabled &= config.enable_circuit_breaker;
        config.metrics.enabled &= config.enable_metrics;
        config.queue.enabled &= config.enable_queue;

        let inventory = if config.enable_persistence {
            Arc::new(FleetInventory::with_storage(
                config.persistence_path.join(SERVERS_FILE),
                config.max_backups,
            ))
        } else {
            Arc::new(FleetInventory::ephemeral())
        };

        let (background_tx, background_rx) = mpsc::unbounded_channel();
        let upstream = UpstreamClient::new(
            background_tx,
            config.streaming.background_tracking,
            Duration::from_millis(config.streaming.background_listen_ms),
        );

        Arc::new(Self {
            inventory,
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            metrics: Arc::new(MetricsAggregator::new(
                config.metrics.ring_capacity,
                config.metrics.enabled,
                Duration::from_secs(config.metrics.history_window_minutes.max(1) * 60),
            )),
            queue: Arc::new(RequestQueue::new(config.queue.clone())),
            inflight: InFlightTracker::new(),
            cooldowns: Arc::new(CooldownTracker::new(Duration::from_millis(
                config.cooldown.failure_cooldown_ms,
            ))),
            bans: Arc::new(BanStore::new()),
            balancer: Arc::new(LoadBalancer::new(config.load_balancer.clone())),
            timeouts: Arc::new(TimeoutManager::new(config.timeouts.clone())),
            classifier: Arc::new(ErrorClassifier::new(
                config.circuit_breaker.error_patterns.clone(),
            )),
            upstream,
            shutdown: CancellationToken::new(),
            background_rx: tokio::sync::Mutex::new(Some(background_rx)),
            shared_config: SharedConfig::new(config.clone()),
            settings: config,
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ── Request loop ─────────────────────────────────────────────────────

    /// Route one inference request: the full select → admit → proxy →
    /// record → fail-over loop.
    pub async fn dispatch(self: &Arc<Self>, mut request: InferenceRequest) -> Result<Dispatched, GatewayError> {
        let runtime = self.shared_config.get().await;
        if request.streaming && !runtime.enable_streaming {
            // Global streaming off-switch: serve the call buffered.
            request.streaming = false;
        }

        let arrived_at = Instant::now();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempts: u32 = 0;
        let mut routed_to_open_circuit = false;
        let mut max_attempts: Option<u32> = None;

        loop {
            let candidates = self
                .eligible_backends(
                    &request.model,
                    request.pinned_backend.as_deref(),
                    request.openai_compat,
                    &excluded,
                )
                .await;
            if candidates.is_empty() {
                return Err(self
                    .empty_candidate_error(&request.model, request.pinned_backend.as_deref())
                    .await);
            }
            // Retry budget is fixed by the first candidate set.
            let budget = max_attempts.get_or_insert_with(|| {
                1 + self
                    .settings
                    .retry
                    .max_retries_per_server
                    .min(candidates.len() as u32 - 1)
            });

            let admitted = match self.select_and_admit(&request, &candidates).await {
                Ok(admitted) => admitted,
                Err(AdmitFailure::AllBusy) => {
                    if !runtime.enable_queue || !self.settings.queue.enabled {
                        return Err(GatewayError::NoServerAvailable {
                            model: request.model.clone(),
                        });
                    }
                    let waiter = self
                        .queue
                        .enqueue(&request.model, request.priority, arrived_at)
                        .map_err(|_| GatewayError::QueueFull)?;
                    match waiter.wait().await {
                        Ok(()) => continue, // capacity opened, re-select
                        Err(_) => return Err(GatewayError::QueueTimeout),
                    }
                }
                Err(AdmitFailure::AllCircuitBlocked { backend }) => {
                    return Err(GatewayError::CircuitOpen {
                        backend,
                        model: request.model.clone(),
                    });
                }
            };

            attempts += 1;
            if admitted.probe {
                routed_to_open_circuit = true;
            }

            let key = admitted.key.clone();
            let budgets = self
                .call_budgets(&key, request.streaming)
                .await;
            let call = ProxyCall {
                key: key.clone(),
                path: request.path.clone(),
                method: Method::POST,
                body: Some(request.body.clone()),
                budgets,
                cancel: self.shutdown.child_token(),
            };

            if request.streaming {
                match self.upstream.execute_streaming(&admitted.backend, call).await {
                    Ok(mut response) => {
                        let info = self
                            .route_info(&admitted, attempts, candidates.len(), routed_to_open_circuit)
                            .await;
                        let outcome = response.take_outcome();
                        self.spawn_stream_watcher(admitted, outcome);
                        return Ok(Dispatched::Streaming(response, info));
                    }
                    Err(e) => {
                        let retry = self
                            .record_failure(&admitted, &e, arrived_at)
                            .await;
                        self.finish_admission(admitted).await;
                        if retry && attempts < *budget {
                            excluded.insert(key.backend_id.clone());
                            continue;
                        }
                        return Err(self.to_gateway_error(e, &key));
                    }
                }
            } else {
                match self.upstream.execute_buffered(&admitted.backend, call).await {
                    Ok(response) => {
                        self.record_success(&admitted, &response).await;
                        let info = self
                            .route_info(&admitted, attempts, candidates.len(), routed_to_open_circuit)
                            .await;
                        self.finish_admission(admitted).await;
                        return Ok(Dispatched::Buffered(response, info));
                    }
                    Err(e) => {
                        let retry = self
                            .record_failure(&admitted, &e, arrived_at)
                            .await;
                        self.finish_admission(admitted).await;
                        if retry && attempts < *budget {
                            excluded.insert(key.backend_id.clone());
                            continue;
                        }
                        return Err(self.to_gateway_error(e, &key));
                    }
                }
            }
        }
    }

    /// Candidate filter: advertises the model, accepts new requests, not
    /// banned, not cooling down, not excluded by earlier attempts.
    async fn eligible_backends(
        &self,
        model: &str,
        pinned: Option<&str>,
        openai_compat: bool,
        excluded: &HashSet<String>,
    ) -> Vec<Backend> {
        let mut backends = self.inventory.servers_for_model(model).await;
        if let Some(pin) = pinned {
            backends.retain(|b| b.id == pin);
        }
        backends.retain(|b| {
            b.accepts_new_requests()
                && !excluded.contains(&b.id)
                && if openai_compat {
                    b.supports_openai_compat
                } else {
                    b.supports_native
                }
        });
        let mut eligible = Vec::with_capacity(backends.len());
        for backend in backends {
            let key = PairKey::new(&backend.id, model);
            if self.bans.is_banned(&key).await {
                continue;
            }
            if self.cooldowns.in_cooldown(&key).await {
                continue;
            }
            eligible.push(backend);
        }
        eligible
    }

    /// The most specific error for an empty candidate set.
    async fn empty_candidate_error(&self, model: &str, pinned: Option<&str>) -> GatewayError {
        if let Some(pin) = pinned {
            if let Some(backend) = self.inventory.get(pin).await {
                if backend.draining || backend.maintenance.is_some() {
                    return GatewayError::AdmissionDrained {
                        backend: pin.to_string(),
                    };
                }
            }
        }
        GatewayError::NoServerAvailable {
            model: model.to_string(),
        }
    }

    /// Score candidates, pick one, run it through the breaker and the
    /// in-flight cap. Falls through to lower-ranked candidates when the
    /// favorite is blocked.
    async fn select_and_admit(
        &self,
        request: &InferenceRequest,
        candidates: &[Backend],
    ) -> Result<Admitted, AdmitFailure> {
        let mut pool: Vec<Backend> = candidates.to_vec();
        let mut saw_busy = false;
        let mut last_circuit_block: Option<String> = None;

        while !pool.is_empty() {
            let snapshots = self.candidate_snapshots(&pool, &request.model).await;
            let Some(backend_id) = self.balancer.select(
                &request.model,
                &snapshots,
                request.streaming,
                request.client_id.as_deref(),
            ) else {
                break;
            };
            let backend = pool
                .iter()
                .find(|b| b.id == backend_id)
                .cloned()
                .expect("selected backend comes from the pool");
            let key = PairKey::new(&backend.id, &request.model);

            match self.breakers.allow(&key).await {
                AllowDecision::Admit => {
                    match self.inflight.try_admit(&key, backend.max_concurrency) {
                        Some(guard) => {
                            return Ok(Admitted {
                                backend,
                                key,
                                guard,
                                probe: false,
                            });
                        }
                        None => {
                            saw_busy = true;
                            pool.retain(|b| b.id != backend_id);
                        }
                    }
                }
                AllowDecision::Probe => {
                    let guard = self.inflight.admit_bypass(&key);
                    return Ok(Admitted {
                        backend,
                        key,
                        guard,
                        probe: true,
                    });
                }
                AllowDecision::Reject(_) => {
                    last_circuit_block = Some(backend_id.clone());
                    pool.retain(|b| b.id != backend_id);
                }
            }
        }

        if saw_busy {
            Err(AdmitFailure::AllBusy)
        } else {
            Err(AdmitFailure::AllCircuitBlocked {
                backend: last_circuit_block.unwrap_or_default(),
            })
        }
    }

    /// Assemble the balancer's view of each candidate.
    async fn candidate_snapshots(&self, backends: &[Backend], model: &str) -> Vec<Candidate> {
        let mut snapshots = Vec::with_capacity(backends.len());
        for backend in backends {
            let key = PairKey::new(&backend.id, model);
            let metrics = self.metrics.snapshot(&key).await;
            let breaker = self.breakers.snapshot(&key).await;
            let (current_timeout, min_timeout, max_timeout) =
                self.timeouts.scoring_view(&key).await;
            snapshots.push(Candidate {
                backend_id: backend.id.clone(),
                healthy: backend.healthy,
                max_concurrency: backend.max_concurrency.max(1),
                last_response_time_ms: backend.last_response_time_ms,
                p95_latency_ms: metrics.p95_latency_ms,
                success_rate: if metrics.total_requests == 0 {
                    1.0
                } else {
                    metrics.success_rate
                },
                in_flight: self.inflight.backend_in_flight(&backend.id),
                breaker_state: breaker.as_ref().map(|b| b.state).unwrap_or(CircuitState::Closed),
                breaker_failures: breaker.map(|b| b.failure_count).unwrap_or(0),
                current_timeout_ms: current_timeout,
                min_timeout_ms: min_timeout,
                max_timeout_ms: max_timeout,
                ttft_avg_ms: metrics.ttft_avg_ms,
                ttft_p95_ms: metrics.ttft_p95_ms,
                stream_duration_avg_ms: metrics.stream_duration_avg_ms,
            });
        }
        snapshots
    }

    async fn call_budgets(&self, key: &PairKey, streaming: bool) -> CallBudgets {
        let t = self.timeouts.timeouts_for(key, streaming).await;
        CallBudgets {
            connect: t.connect,
            activity: t.activity,
        }
    }

    async fn route_info(
        &self,
        admitted: &Admitted,
        attempts: u32,
        available: usize,
        routed_to_open_circuit: bool,
    ) -> RouteInfo {
        let server_circuit_state = if self.breakers.backend_blocked(&admitted.key.backend_id).await
        {
            CircuitState::Open
        } else {
            CircuitState::Closed
        };
        RouteInfo {
            backend_id: admitted.key.backend_id.clone(),
            model: admitted.key.model.clone(),
            attempts,
            available_servers: available,
            server_circuit_state,
            model_circuit_state: self.breakers.state(&admitted.key).await,
            routed_to_open_circuit,
        }
    }

    // ── Outcome recording ────────────────────────────────────────────────

    async fn record_success(&self, admitted: &Admitted, response: &BufferedResponse) {
        let key = &admitted.key;
        self.metrics
            .record_request(
                key,
                response.latency_ms,
                response.prompt_eval_count.unwrap_or(0),
                response.eval_count.unwrap_or(0),
            )
            .await;
        self.breakers
            .on_success(key, response.latency_ms, admitted.probe)
            .await;
        self.timeouts.record_success(key, response.latency_ms).await;
        self.inventory
            .note_response_time(&key.backend_id, response.latency_ms)
            .await;
    }

    /// Record one failed upstream call. Returns whether fail-over to the
    /// next candidate is worthwhile.
    async fn record_failure(
        &self,
        admitted: &Admitted,
        error: &ProxyError,
        arrived_at: Instant,
    ) -> bool {
        let key = &admitted.key;
        if matches!(error, ProxyError::Cancelled) {
            // Cancelled before consuming upstream output: not a failure.
            return false;
        }
        let (message, status) = error.classifier_view();
        let classification = self.classifier.classify(&message, status);
        let elapsed_ms = arrived_at.elapsed().as_millis() as u64;

        tracing::warn!(
            pair = %key,
            status = ?status,
            kind = ?classification.error_type,
            error = %message,
            "Upstream call failed"
        );

        self.metrics.record_error(key, elapsed_ms).await;
        if error.is_timeout() {
            self.timeouts.record_timeout(key).await;
        }
        if classification.penalizes_breaker() {
            self.breakers
                .on_failure(key, &classification, &message, admitted.probe)
                .await;
        }
        if classification.permanent {
            self.cooldowns.mark(key).await;
        }
        classification.retryable
    }

    /// Release the admission slot and wake a queued waiter for the model.
    async fn finish_admission(&self, admitted: Admitted) {
        let model = admitted.key.model.clone();
        admitted.guard.release();
        self.queue.wake_for_model(&model);
    }

    fn to_gateway_error(&self, error: ProxyError, key: &PairKey) -> GatewayError {
        match error {
            ProxyError::ConnectTimeout | ProxyError::ActivityTimeout => {
                GatewayError::UpstreamTimeout {
                    backend: Some(key.backend_id.clone()),
                    details: None,
                }
            }
            ProxyError::Cancelled => GatewayError::Internal("request cancelled".into()),
            ProxyError::Network(message) => GatewayError::Upstream {
                status: None,
                message,
            },
            ProxyError::UpstreamStatus { status, message } => GatewayError::Upstream {
                status: Some(status),
                message,
            },
        }
    }

    /// Watch a streaming response to completion and record its outcome.
    /// The in-flight guard rides along and releases when the stream ends,
    /// however it ends.
    fn spawn_stream_watcher(
        self: &Arc<Self>,
        admitted: Admitted,
        outcome: tokio::sync::oneshot::Receiver<StreamOutcome>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Admitted {
                key, guard, probe, ..
            } = admitted;
            let received = outcome.await;
            match received {
                Ok(outcome) => {
                    this.record_stream_outcome(&key, probe, outcome).await;
                }
                Err(_) => {
                    // Guarded sender can only vanish on process teardown.
                    tracing::debug!(pair = %key, "Stream outcome channel dropped");
                }
            }
            let model = key.model.clone();
            guard.release();
            this.queue.wake_for_model(&model);
        });
    }

    async fn record_stream_outcome(&self, key: &PairKey, probe: bool, outcome: StreamOutcome) {
        match &outcome.result {
            Ok(()) => {
                self.metrics
                    .record_request(
                        key,
                        outcome.duration_ms,
                        outcome.prompt_eval_count.unwrap_or(0),
                        outcome.eval_count.unwrap_or(0),
                    )
                    .await;
                if let Some(ttft) = outcome.ttft_ms {
                    self.metrics.record_first_token(key, ttft).await;
                }
                self.metrics
                    .record_stream_duration(key, outcome.duration_ms)
                    .await;
                self.breakers
                    .on_success(key, outcome.duration_ms, probe)
                    .await;
                self.timeouts
                    .record_success(key, outcome.duration_ms)
                    .await;
                self.inventory
                    .note_response_time(&key.backend_id, outcome.duration_ms)
                    .await;
            }
            Err(StreamFailure::Cancelled) => {
                if outcome.client_disconnected {
                    tracing::debug!(pair = %key, "Client disconnected mid-stream");
                } else if probe {
                    // A cancelled probe still frees its breaker slot.
                    self.breakers
                        .on_success(key, outcome.duration_ms, probe)
                        .await;
                }
            }
            Err(StreamFailure::ActivityTimeout) => {
                self.metrics.record_error(key, outcome.duration_ms).await;
                self.timeouts.record_timeout(key).await;
                let classification = self
                    .classifier
                    .classify("upstream response timed out", None);
                self.breakers
                    .on_failure(key, &classification, "upstream response timed out", probe)
                    .await;
            }
            Err(StreamFailure::Upstream(message)) => {
                self.metrics.record_error(key, outcome.duration_ms).await;
                let classification = self.classifier.classify(message, None);
                if classification.penalizes_breaker() {
                    self.breakers
                        .on_failure(key, &classification, message, probe)
                        .await;
                }
                if classification.permanent {
                    self.cooldowns.mark(key).await;
                }
            }
        }
    }

    // ── Passthrough helpers for listing endpoints ────────────────────────

    /// Fan a GET out to every healthy backend and collect the bodies that
    /// parse as JSON.
    pub async fn collect_from_fleet(&self, path: &str) -> Vec<(String, serde_json::Value)> {
        let backends = self.inventory.list().await;
        let mut results = Vec::new();
        for backend in backends.iter().filter(|b| b.healthy) {
            match self.passthrough(backend, Method::GET, path, None).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    if let Ok(value) = serde_json::from_slice(&response.body) {
                        results.push((backend.id.clone(), value));
                    }
                }
                Ok(response) => {
                    tracing::debug!(backend = %backend.id, path, status = response.status, "Fleet fan-out non-success");
                }
                Err(e) => {
                    tracing::debug!(backend = %backend.id, path, error = %e, "Fleet fan-out failed");
                }
            }
        }
        results
    }

    /// One buffered upstream call outside the routing loop (listing and
    /// introspection endpoints).
    pub async fn passthrough(
        &self,
        backend: &Backend,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<BufferedResponse, ProxyError> {
        let key = PairKey::new(&backend.id, "");
        let budgets = CallBudgets {
            connect: Duration::from_millis(self.settings.timeouts.connect_timeout_ms),
            activity: Duration::from_millis(self.settings.timeouts.default_timeout_ms),
        };
        self.upstream
            .execute_buffered(
                backend,
                ProxyCall {
                    key,
                    path: path.to_string(),
                    method,
                    body,
                    budgets,
                    cancel: self.shutdown.child_token(),
                },
            )
            .await
    }

    // ── Background tasks & lifecycle ─────────────────────────────────────

    /// Spawn the long-lived scheduled tasks. Each honors the shared
    /// shutdown token and stops deterministically.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let shutdown = self.shutdown.clone();

        // Health scheduler.
        let scheduler = HealthScheduler::new(
            Arc::clone(&self.inventory),
            self.settings.health_check.clone(),
        );
        tokio::spawn(scheduler.run(shutdown.clone()));

        // Queue deadline sweep + cooldown pruning.
        {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    let expired = this.queue.sweep_expired();
                    if expired > 0 {
                        tracing::debug!(expired, "Swept expired queue entries");
                    }
                    this.cooldowns.prune().await;
                }
            });
        }

        // Breaker escalation sweep.
        if self.settings.circuit_breaker.model_escalation.enabled {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            let interval = Duration::from_millis(
                self.settings
                    .circuit_breaker
                    .model_escalation
                    .check_interval_ms
                    .max(250),
            );
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    this.breakers.run_escalation_sweep().await;
                }
            });
        }

        // Background-tracked observations feed the timeout manager and the
        // breaker once the true response time is known.
        {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let Some(mut rx) = this.background_rx.lock().await.take() else {
                    return;
                };
                loop {
                    tokio::select! {
                        observation = rx.recv() => {
                            let Some(observation) = observation else { return };
                            this.apply_background_observation(observation).await;
                        }
                        _ = shutdown.cancelled() => return,
                    }
                }
            });
        }

        // Periodic state flush.
        if self.settings.enable_persistence {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            let interval =
                Duration::from_millis(self.settings.metrics.flush_interval_ms.max(1_000));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    this.flush_persistent_state().await;
                }
            });
        }

        // Config live reload (additive pattern updates + runtime flags).
        if self.settings.config_reload_interval_ms > 0 {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            let interval = Duration::from_millis(self.settings.config_reload_interval_ms);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    match Config::load() {
                        Ok(fresh) => {
                            for (kind, list) in [
                                (
                                    crate::classifier::PatternKind::NonRetryable,
                                    fresh.circuit_breaker.error_patterns.non_retryable.clone(),
                                ),
                                (
                                    crate::classifier::PatternKind::Transient,
                                    fresh.circuit_breaker.error_patterns.transient.clone(),
                                ),
                            ] {
                                this.classifier.add_patterns(kind, list);
                            }
                            this.shared_config.swap(fresh).await;
                            tracing::debug!("Configuration reloaded");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Config reload failed, keeping current");
                        }
                    }
                }
            });
        }
    }

    async fn apply_background_observation(&self, observation: BackgroundObservation) {
        tracing::info!(
            pair = %observation.key,
            duration_ms = observation.duration_ms,
            completed = observation.completed,
            "Background-tracked upstream finished"
        );
        if observation.completed {
            self.timeouts
                .record_success(&observation.key, observation.duration_ms)
                .await;
            self.breakers
                .on_success(&observation.key, observation.duration_ms, false)
                .await;
        }
    }

    /// Restore persisted state. Called once at startup.
    pub async fn load_persistent_state(&self) {
        if !self.settings.enable_persistence {
            return;
        }
        let dir = &self.settings.persistence_path;

        match persist::load_json::<Vec<String>>(&dir.join(BANS_FILE)) {
            Ok(Some(bans)) => self.bans.restore(bans).await,
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Failed to load bans"),
        }
        match persist::load_json::<PersistedTimeouts>(&dir.join(TIMEOUTS_FILE)) {
            Ok(Some(timeouts)) => self.timeouts.restore(timeouts).await,
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Failed to load timeouts"),
        }
        match persist::load_json::<PersistedBreakers>(&dir.join(BREAKERS_FILE)) {
            Ok(Some(persisted)) => self.breakers.restore(persisted.breakers).await,
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Failed to load circuit breakers"),
        }
    }

    /// Write every persisted file.
    pub async fn flush_persistent_state(&self) {
        if !self.settings.enable_persistence {
            return;
        }
        let dir = &self.settings.persistence_path;
        let max_backups = self.settings.max_backups;

        let bans = self.bans.persistable().await;
        if let Err(e) = persist::save_json_atomic(&dir.join(BANS_FILE), &bans, max_backups) {
            tracing::error!(error = %e, "Failed to persist bans");
        }
        let timeouts = self.timeouts.persistable().await;
        if let Err(e) = persist::save_json_atomic(&dir.join(TIMEOUTS_FILE), &timeouts, max_backups)
        {
            tracing::error!(error = %e, "Failed to persist timeouts");
        }
        let breakers = PersistedBreakers {
            timestamp: Utc::now(),
            breakers: self.breakers.persistable().await,
        };
        if let Err(e) = persist::save_json_atomic(&dir.join(BREAKERS_FILE), &breakers, max_backups)
        {
            tracing::error!(error = %e, "Failed to persist circuit breakers");
        }
        let metrics = PersistedMetrics {
            timestamp: Utc::now(),
            servers: self.metrics.persistable().await,
        };
        if let Err(e) = persist::save_json_atomic(&dir.join(METRICS_FILE), &metrics, max_backups) {
            tracing::error!(error = %e, "Failed to persist metrics");
        }
    }

    /// Graceful shutdown: stop admissions, cancel in-flight, wait up to the
    /// grace period, flush state.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down orchestrator");
        self.queue.pause();
        self.shutdown.cancel();

        let grace = Duration::from_millis(self.settings.shutdown_grace_ms);
        let deadline = Instant::now() + grace;
        while self.inflight.total_in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leftover = self.inflight.total_in_flight();
        if leftover > 0 {
            tracing::warn!(leftover, "Shutdown grace elapsed with requests in flight");
        }
        self.flush_persistent_state().await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use axum::body::Body;
    use axum::extract::State as AxumState;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures::StreamExt;

    #[derive(Clone)]
    struct MockState {
        fail: Arc<AtomicBool>,
        hits: Arc<AtomicUsize>,
        delay: Duration,
    }

    struct MockBackend {
        url: String,
        fail: Arc<AtomicBool>,
        hits: Arc<AtomicUsize>,
    }

    /// A native backend answering `/api/generate` and `/api/chat` with a
    /// buffered response, switchable between success and HTTP 500.
    async fn mock_backend(delay: Duration) -> MockBackend {
        let state = MockState {
            fail: Arc::new(AtomicBool::new(false)),
            hits: Arc::new(AtomicUsize::new(0)),
            delay,
        };
        async fn handler(AxumState(state): AxumState<MockState>) -> axum::response::Response {
            state.hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(state.delay).await;
            if state.fail.load(Ordering::SeqCst) {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": "boom"})),
                )
                    .into_response()
            } else {
                Json(serde_json::json!({
                    "model": "m",
                    "response": "hello",
                    "done": true,
                    "eval_count": 5,
                    "prompt_eval_count": 2,
                }))
                .into_response()
            }
        }
        let app = Router::new()
            .route("/api/generate", post(handler))
            .route("/api/chat", post(handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockBackend {
            url: format!("http://{addr}"),
            fail: state.fail,
            hits: state.hits,
        }
    }

    /// A streaming backend: an HTTP-framing chunk, a content chunk, then
    /// the terminal chunk, on a fixed schedule. Optionally stalls after the
    /// first chunk instead.
    async fn mock_streaming_backend(stall_after_first: bool) -> String {
        async fn stream_handler(stall: bool) -> axum::response::Response {
            let body = async_stream::stream! {
                tokio::time::sleep(Duration::from_millis(20)).await;
                yield Ok::<_, std::io::Error>(Bytes::from(
                    "{\"model\":\"m\",\"response\":\"\",\"done\":false}\n",
                ));
                if stall {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                yield Ok(Bytes::from("{\"response\":\"hel\",\"done\":false}\n"));
                tokio::time::sleep(Duration::from_millis(160)).await;
                yield Ok(Bytes::from(
                    "{\"response\":\"lo\",\"done\":true,\"eval_count\":9,\"prompt_eval_count\":3}\n",
                ));
            };
            axum::response::Response::builder()
                .header("content-type", "application/x-ndjson")
                .body(Body::from_stream(body))
                .unwrap()
        }
        let app = Router::new().route(
            "/api/generate",
            post(move || stream_handler(stall_after_first)),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.enable_persistence = false;
        config.health_check.enabled = false;
        config.streaming.background_tracking = false;
        config.circuit_breaker.base_failure_threshold = 3;
        config.circuit_breaker.min_failure_threshold = 1;
        config.circuit_breaker.adaptive_thresholds = false;
        config.circuit_breaker.recovery_success_threshold = 3;
        config.circuit_breaker.error_rate_threshold = 1.1;
        config.retry.max_retries_per_server = 2;
        config.queue.max_size = 2;
        config.queue.timeout_ms = 2_000;
        config.timeouts.min_timeout_ms = 100;
        config.timeouts.default_timeout_ms = 5_000;
        config.validate().unwrap();
        config
    }

    async fn add_backend(orch: &Arc<Orchestrator>, id: &str, url: &str, max_concurrency: u32) {
        let mut backend = Backend::new(id, url, max_concurrency);
        backend.models.insert("m".to_string());
        orch.inventory.add(backend).await.unwrap();
    }

    fn generate_request(streaming: bool) -> InferenceRequest {
        InferenceRequest {
            path: "/api/generate".to_string(),
            body: Bytes::from_static(b"{\"model\":\"m\",\"prompt\":\"hi\"}"),
            model: "m".to_string(),
            streaming,
            openai_compat: false,
            pinned_backend: None,
            client_id: None,
            priority: 0,
        }
    }

    fn key(backend: &str) -> PairKey {
        PairKey::new(backend, "m")
    }

    #[tokio::test]
    async fn single_backend_non_streaming_round_trip() {
        let upstream = mock_backend(Duration::ZERO).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &upstream.url, 4).await;

        let dispatched = orch.dispatch(generate_request(false)).await.unwrap();
        let Dispatched::Buffered(response, info) = dispatched else {
            panic!("expected buffered response");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.eval_count, Some(5));
        assert_eq!(info.backend_id, "a");
        assert_eq!(info.attempts, 1);
        assert!(!info.routed_to_open_circuit);

        let metrics = orch.metrics.snapshot(&key("a")).await;
        assert_eq!(metrics.windows["1m"].count, 1);
        assert_eq!(metrics.windows["1m"].errors, 0);
        assert_eq!(orch.inflight.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn failing_backend_fails_over_to_healthy_one() {
        let bad = mock_backend(Duration::ZERO).await;
        bad.fail.store(true, Ordering::SeqCst);
        let good = mock_backend(Duration::ZERO).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &bad.url, 4).await;
        add_backend(&orch, "b", &good.url, 4).await;
        // Steer the first pick toward the failing backend.
        orch.inventory.note_response_time("b", 5_000).await;
        orch.inventory.note_response_time("a", 1).await;

        let dispatched = orch.dispatch(generate_request(false)).await.unwrap();
        let Dispatched::Buffered(response, info) = dispatched else {
            panic!("expected buffered response");
        };
        assert_eq!(response.status, 200);
        assert_eq!(info.backend_id, "b");
        assert_eq!(info.attempts, 2);

        let a = orch.breakers.snapshot(&key("a")).await.unwrap();
        assert_eq!(a.failure_count, 1);
        let b = orch.breakers.snapshot(&key("b")).await.unwrap();
        assert_eq!(b.success_count, 1);
        assert_eq!(bad.hits.load(Ordering::SeqCst), 1);
        assert_eq!(good.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_then_recovers_via_probes() {
        let flaky = mock_backend(Duration::ZERO).await;
        flaky.fail.store(true, Ordering::SeqCst);
        let steady = mock_backend(Duration::ZERO).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &flaky.url, 4).await;
        add_backend(&orch, "b", &steady.url, 4).await;

        // Three consecutive 500s from `a` trip its breaker.
        let mut pinned = generate_request(false);
        pinned.pinned_backend = Some("a".to_string());
        for _ in 0..3 {
            let err = orch.dispatch(pinned.clone()).await.unwrap_err();
            assert!(matches!(err, GatewayError::Upstream { .. }));
        }
        assert_eq!(orch.breakers.state(&key("a")).await, CircuitState::Open);

        // Pinned traffic now sees the open circuit.
        let err = orch.dispatch(pinned.clone()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));

        // The next request routes straight to `b` without touching `a`.
        let hits_before = flaky.hits.load(Ordering::SeqCst);
        let dispatched = orch.dispatch(generate_request(false)).await.unwrap();
        let Dispatched::Buffered(_, info) = dispatched else {
            panic!("expected buffered response");
        };
        assert_eq!(info.backend_id, "b");
        assert_eq!(info.attempts, 1);
        assert_eq!(flaky.hits.load(Ordering::SeqCst), hits_before);

        // Recovery: the backend heals, the retry window elapses, probes run.
        flaky.fail.store(false, Ordering::SeqCst);
        orch.breakers.force_half_open(&key("a")).await;

        let mut pinned = generate_request(false);
        pinned.pinned_backend = Some("a".to_string());

        let dispatched = orch.dispatch(pinned.clone()).await.unwrap();
        let Dispatched::Buffered(_, info) = dispatched else {
            panic!("expected buffered response");
        };
        assert!(info.routed_to_open_circuit);
        // One successful probe is below the recovery threshold of three.
        assert_eq!(orch.breakers.state(&key("a")).await, CircuitState::HalfOpen);

        orch.dispatch(pinned.clone()).await.unwrap();
        orch.dispatch(pinned).await.unwrap();
        assert_eq!(orch.breakers.state(&key("a")).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn queue_backpressure_rejects_overflow_with_queue_full() {
        let upstream = mock_backend(Duration::from_millis(300)).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &upstream.url, 1).await;

        // Three concurrent requests: one admits, two wait in the queue.
        let mut handles = Vec::new();
        for _ in 0..3 {
            let orch = Arc::clone(&orch);
            handles.push(tokio::spawn(async move {
                orch.dispatch(generate_request(false)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orch.queue.len(), 2);

        // A fourth finds the queue full.
        let err = orch.dispatch(generate_request(false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::QueueFull));

        for handle in handles {
            let dispatched = handle.await.unwrap().unwrap();
            let Dispatched::Buffered(response, _) = dispatched else {
                panic!("expected buffered response");
            };
            assert_eq!(response.status, 200);
        }
        assert_eq!(orch.inflight.total_in_flight(), 0);
        assert!(orch.queue.is_empty());
    }

    #[tokio::test]
    async fn saturated_fleet_without_queue_rejects_immediately() {
        let upstream = mock_backend(Duration::from_millis(300)).await;
        let mut config = test_config();
        config.enable_queue = false;
        let orch = Orchestrator::new(config);
        add_backend(&orch, "a", &upstream.url, 1).await;

        let background = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.dispatch(generate_request(false)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = orch.dispatch(generate_request(false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoServerAvailable { .. }));
        background.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn streaming_records_ttft_and_duration() {
        let url = mock_streaming_backend(false).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &url, 4).await;

        let dispatched = orch.dispatch(generate_request(true)).await.unwrap();
        let Dispatched::Streaming(response, info) = dispatched else {
            panic!("expected streaming response");
        };
        assert_eq!(info.backend_id, "a");

        let mut collected = Vec::new();
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        let text = String::from_utf8(collected).unwrap();
        assert!(text.contains("\"done\":true"));

        // The watcher task records after the stream closes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let metrics = orch.metrics.snapshot(&key("a")).await;
        assert_eq!(metrics.windows["1m"].count, 1);
        assert_eq!(metrics.windows["1m"].errors, 0);
        // TTFT is the content chunk (~40ms), not the framing chunk (~20ms),
        // and well before the terminal chunk (~200ms).
        assert!(metrics.ttft_p95_ms >= 30, "ttft {}", metrics.ttft_p95_ms);
        assert!(metrics.ttft_p95_ms < 150, "ttft {}", metrics.ttft_p95_ms);
        assert!(metrics.stream_duration_p95_ms >= 150);
        assert_eq!(metrics.windows["1m"].tokens_generated, 9);
        assert_eq!(orch.inflight.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn mid_stream_stall_records_transient_failure() {
        let url = mock_streaming_backend(true).await;
        let mut config = test_config();
        config.timeouts.default_timeout_ms = 400;
        config.timeouts.streaming_multiplier = 1.0;
        let orch = Orchestrator::new(config);
        add_backend(&orch, "a", &url, 4).await;

        let dispatched = orch.dispatch(generate_request(true)).await.unwrap();
        let Dispatched::Streaming(response, _) = dispatched else {
            panic!("expected streaming response");
        };
        let mut body = response.body;
        let mut chunks = 0;
        while let Some(chunk) = body.next().await {
            chunk.unwrap();
            chunks += 1;
        }
        // Only the framing chunk made it through before the stall.
        assert_eq!(chunks, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let metrics = orch.metrics.snapshot(&key("a")).await;
        assert_eq!(metrics.windows["1m"].errors, 1);
        let breaker = orch.breakers.snapshot(&key("a")).await.unwrap();
        assert_eq!(breaker.failure_count, 1);
        assert_eq!(
            breaker.last_error_kind,
            Some(crate::classifier::ErrorType::Transient)
        );
        // The stall grew the learned budget.
        let state = orch.timeouts.state(&key("a")).await.unwrap();
        assert!(state.current_timeout_ms > 400);
        assert_eq!(orch.inflight.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_model_has_no_server() {
        let orch = Orchestrator::new(test_config());
        let err = orch.dispatch(generate_request(false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoServerAvailable { .. }));
    }

    #[tokio::test]
    async fn draining_pinned_backend_reports_drained() {
        let upstream = mock_backend(Duration::ZERO).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &upstream.url, 4).await;
        orch.inventory.set_draining("a", true).await.unwrap();

        let mut request = generate_request(false);
        request.pinned_backend = Some("a".to_string());
        let err = orch.dispatch(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::AdmissionDrained { .. }));
    }

    #[tokio::test]
    async fn banned_pair_is_never_selected() {
        let banned = mock_backend(Duration::ZERO).await;
        let allowed = mock_backend(Duration::ZERO).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &banned.url, 4).await;
        add_backend(&orch, "b", &allowed.url, 4).await;
        orch.bans.ban(key("a")).await;

        for _ in 0..3 {
            let dispatched = orch.dispatch(generate_request(false)).await.unwrap();
            let Dispatched::Buffered(_, info) = dispatched else {
                panic!("expected buffered response");
            };
            assert_eq!(info.backend_id, "b");
        }
        assert_eq!(banned.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cooldown_excludes_pair_after_permanent_failure() {
        let bad = mock_backend(Duration::ZERO).await;
        let good = mock_backend(Duration::ZERO).await;
        let orch = Orchestrator::new(test_config());
        add_backend(&orch, "a", &bad.url, 4).await;
        add_backend(&orch, "b", &good.url, 4).await;
        orch.cooldowns.mark(&key("a")).await;

        let dispatched = orch.dispatch(generate_request(false)).await.unwrap();
        let Dispatched::Buffered(_, info) = dispatched else {
            panic!("expected buffered response");
        };
        assert_eq!(info.backend_id, "b");
        assert_eq!(info.attempts, 1);
        assert_eq!(bad.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistent_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.enable_persistence = true;
        config.persistence_path = dir.path().to_path_buf();

        let orch = Orchestrator::new(config.clone());
        orch.bans.ban(key("a")).await;
        orch.timeouts.record_timeout(&key("a")).await;
        orch.breakers.force_open(&key("a")).await;
        orch.flush_persistent_state().await;

        let restored = Orchestrator::new(config);
        restored.load_persistent_state().await;
        assert!(restored.bans.is_banned(&key("a")).await);
        assert!(restored.timeouts.state(&key("a")).await.is_some());
        assert_eq!(restored.breakers.state(&key("a")).await, CircuitState::Open);
    }
}
