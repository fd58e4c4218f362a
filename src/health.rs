//! Backend health probing.
//!
//! A scheduled task polls each backend's model-listing endpoint, applying
//! consecutive-failure / consecutive-success thresholds before flipping the
//! inventory's `healthy` flag. Probes retry with exponential backoff inside
//! one round; a semaphore caps probe parallelism. Unhealthy backends are
//! re-probed on a slower recovery cadence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::HealthCheckSettings;
use crate::inventory::{FleetInventory, ProbeResult};

/// Wire shape of the upstream `/api/tags` response.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Default, Clone)]
struct ProbeCounters {
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_probe_at: Option<Instant>,
}

pub struct HealthScheduler {
    inventory: Arc<FleetInventory>,
    http: reqwest::Client,
    settings: HealthCheckSettings,
    counters: Mutex<HashMap<String, ProbeCounters>>,
}

impl HealthScheduler {
    pub fn new(inventory: Arc<FleetInventory>, settings: HealthCheckSettings) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.timeout_ms))
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            inventory,
            http,
            settings,
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Run the periodic probe loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.settings.enabled {
            tracing::info!("Health checks disabled");
            return;
        }
        let interval = Duration::from_millis(self.settings.interval_ms.max(250));
        tracing::info!(interval_ms = self.settings.interval_ms, "Health scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::debug!("Health scheduler stopped");
                    return;
                }
            }
            self.probe_round(&shutdown).await;
        }
    }

    /// One sweep: probe every due backend, bounded by the parallelism cap.
    pub async fn probe_round(self: &Arc<Self>, shutdown: &CancellationToken) {
        let backends = self.inventory.list().await;
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_checks.max(1)));
        let mut tasks = Vec::new();

        for backend in backends {
            if !self.due_for_probe(&backend).await {
                continue;
            }
            let scheduler = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if shutdown.is_cancelled() {
                    return;
                }
                scheduler.probe_backend(&backend).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Healthy backends probe on the regular cadence; unhealthy ones on the
    /// recovery cadence.
    async fn due_for_probe(&self, backend: &Backend) -> bool {
        let counters = self.counters.lock().await;
        let Some(state) = counters.get(&backend.id) else {
            return true;
        };
        let Some(last) = state.last_probe_at else {
            return true;
        };
        let cadence = if backend.healthy {
            Duration::from_millis(self.settings.interval_ms)
        } else {
            Duration::from_millis(self.settings.recovery_interval_ms)
        };
        // The outer loop already paces healthy probes; only hold back the
        // slower recovery cadence.
        backend.healthy || last.elapsed() >= cadence
    }

    /// Probe one backend and fold the verdict into the inventory.
    pub async fn probe_backend(&self, backend: &Backend) {
        let started = Instant::now();
        let observation = self.fetch_inventory(backend).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut counters = self.counters.lock().await;
        let state = counters.entry(backend.id.clone()).or_default();
        state.last_probe_at = Some(Instant::now());

        let healthy = match &observation {
            Ok(_) => {
                state.consecutive_successes = state.consecutive_successes.saturating_add(1);
                state.consecutive_failures = 0;
                backend.healthy || state.consecutive_successes >= self.settings.success_threshold
            }
            Err(e) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.consecutive_successes = 0;
                let flip = state.consecutive_failures >= self.settings.failure_threshold;
                if backend.healthy && !flip {
                    tracing::debug!(
                        backend = %backend.id,
                        failures = state.consecutive_failures,
                        error = %e,
                        "Health probe failed, below threshold"
                    );
                }
                backend.healthy && !flip
            }
        };
        drop(counters);

        let result = match observation {
            Ok((models, version)) => ProbeResult {
                healthy,
                models: Some(models),
                version,
                response_time_ms: Some(elapsed_ms),
            },
            Err(_) => ProbeResult {
                healthy,
                models: None,
                version: None,
                response_time_ms: None,
            },
        };
        if let Err(e) = self.inventory.apply_probe(&backend.id, result).await {
            // Backend may have been removed mid-probe.
            tracing::debug!(backend = %backend.id, error = %e, "Probe result dropped");
        }
    }

    /// Fetch `/api/tags` (with retries) and best-effort `/api/version`.
    async fn fetch_inventory(
        &self,
        backend: &Backend,
    ) -> Result<(HashSet<String>, Option<String>), String> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_tags(backend).await {
                Ok(models) => {
                    let version = self.fetch_version(backend).await;
                    return Ok((models, version));
                }
                Err(e) if attempt < self.settings.retry_attempts => {
                    let delay = self.settings.retry_delay_ms as f64
                        * self.settings.backoff_multiplier.powi(attempt as i32);
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                    attempt += 1;
                    tracing::trace!(backend = %backend.id, attempt, error = %e, "Retrying probe");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_tags(&self, backend: &Backend) -> Result<HashSet<String>, String> {
        let url = format!("{}/api/tags", backend.base_url);
        let mut request = self.http.get(&url);
        if let Some(api_key) = &backend.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        let tags: TagsResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn fetch_version(&self, backend: &Backend) -> Option<String> {
        let url = format!("{}/api/version", backend.base_url);
        let response = self.http.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response
            .json::<VersionResponse>()
            .await
            .ok()
            .map(|v| v.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn mock_backend(model_names: Vec<&'static str>, fail: bool) -> String {
        let app = Router::new()
            .route(
                "/api/tags",
                get(move || {
                    let model_names = model_names.clone();
                    async move {
                        if fail {
                            Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                        } else {
                            Ok(Json(serde_json::json!({
                                "models": model_names
                                    .iter()
                                    .map(|n| serde_json::json!({"name": n}))
                                    .collect::<Vec<_>>()
                            })))
                        }
                    }
                }),
            )
            .route(
                "/api/version",
                get(|| async { Json(serde_json::json!({"version": "0.5.0"})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn settings() -> HealthCheckSettings {
        HealthCheckSettings {
            interval_ms: 50,
            timeout_ms: 1_000,
            retry_attempts: 0,
            retry_delay_ms: 1,
            failure_threshold: 2,
            success_threshold: 2,
            ..HealthCheckSettings::default()
        }
    }

    #[tokio::test]
    async fn successful_probe_updates_models_and_version() {
        let url = mock_backend(vec!["llama3", "mistral"], false).await;
        let inventory = Arc::new(FleetInventory::ephemeral());
        inventory
            .add(Backend::new("a", &url, 4))
            .await
            .unwrap();
        let scheduler = HealthScheduler::new(Arc::clone(&inventory), settings());

        let backend = inventory.get("a").await.unwrap();
        scheduler.probe_backend(&backend).await;

        let after = inventory.get("a").await.unwrap();
        assert!(after.healthy);
        assert!(after.serves_model("llama3"));
        assert!(after.serves_model("mistral"));
        assert_eq!(after.version.as_deref(), Some("0.5.0"));
        assert!(after.last_response_time_ms.is_some());
    }

    #[tokio::test]
    async fn health_flips_only_after_failure_threshold() {
        let url = mock_backend(vec![], true).await;
        let inventory = Arc::new(FleetInventory::ephemeral());
        inventory.add(Backend::new("a", &url, 4)).await.unwrap();
        let scheduler = HealthScheduler::new(Arc::clone(&inventory), settings());

        let backend = inventory.get("a").await.unwrap();
        scheduler.probe_backend(&backend).await;
        assert!(inventory.get("a").await.unwrap().healthy);

        let backend = inventory.get("a").await.unwrap();
        scheduler.probe_backend(&backend).await;
        // Second consecutive failure crosses the threshold of 2.
        assert!(!inventory.get("a").await.unwrap().healthy);
    }

    #[tokio::test]
    async fn recovery_needs_success_threshold() {
        let good = mock_backend(vec!["m"], false).await;
        let inventory = Arc::new(FleetInventory::ephemeral());
        inventory.add(Backend::new("a", &good, 4)).await.unwrap();
        // Start unhealthy.
        inventory
            .apply_probe(
                "a",
                ProbeResult {
                    healthy: false,
                    models: None,
                    version: None,
                    response_time_ms: None,
                },
            )
            .await
            .unwrap();
        let scheduler = HealthScheduler::new(Arc::clone(&inventory), settings());

        let backend = inventory.get("a").await.unwrap();
        scheduler.probe_backend(&backend).await;
        // One success is below the threshold of 2.
        assert!(!inventory.get("a").await.unwrap().healthy);

        let backend = inventory.get("a").await.unwrap();
        scheduler.probe_backend(&backend).await;
        assert!(inventory.get("a").await.unwrap().healthy);
    }

    #[tokio::test]
    async fn probe_round_respects_shutdown() {
        let url = mock_backend(vec!["m"], false).await;
        let inventory = Arc::new(FleetInventory::ephemeral());
        inventory.add(Backend::new("a", &url, 4)).await.unwrap();
        let scheduler = HealthScheduler::new(Arc::clone(&inventory), settings());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        scheduler.probe_round(&shutdown).await;
        // Cancelled before probing: no model inventory was fetched.
        assert!(inventory.get("a").await.unwrap().models.is_empty());
    }
}
