//! Fleet inventory.
//!
//! The canonical backend registry. Mutations come from the control plane
//! and the health scheduler only; request workers read snapshots. The
//! backend list is persisted to `servers.json` on every change, excluding
//! transient fields (health verdicts and observed models are re-learned on
//! startup).

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::backend::{
    normalize_model_name, normalize_url, urls_equivalent, validate_base_url, Backend,
};
use crate::persist;

#[derive(Debug, Error, PartialEq)]
pub enum InventoryError {
    #[error("backend id '{0}' already exists")]
    DuplicateId(String),

    #[error("backend URL duplicates '{0}'")]
    DuplicateUrl(String),

    #[error("invalid backend id: {0}")]
    InvalidId(String),

    #[error("invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("backend '{0}' not found")]
    NotFound(String),
}

/// Partial update for one backend; `None` fields are untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendPatch {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_concurrency: Option<u32>,
    pub supports_native: Option<bool>,
    pub supports_openai_compat: Option<bool>,
    pub hardware: Option<String>,
}

/// Result of one health probe, applied by the scheduler.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub models: Option<HashSet<String>>,
    pub version: Option<String>,
    pub response_time_ms: Option<u64>,
}

/// The persisted shape: operator-supplied fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedBackend {
    id: String,
    base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    max_concurrency: u32,
    #[serde(default = "default_true")]
    supports_native: bool,
    #[serde(default = "default_true")]
    supports_openai_compat: bool,
    #[serde(default)]
    draining: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    maintenance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hardware: Option<String>,
}

fn default_true() -> bool {
    true
}

impl From<&Backend> for PersistedBackend {
    fn from(b: &Backend) -> Self {
        Self {
            id: b.id.clone(),
            base_url: b.base_url.clone(),
            api_key: b.api_key.clone(),
            max_concurrency: b.max_concurrency,
            supports_native: b.supports_native,
            supports_openai_compat: b.supports_openai_compat,
            draining: b.draining,
            maintenance: b.maintenance.clone(),
            hardware: b.hardware.clone(),
        }
    }
}

impl From<PersistedBackend> for Backend {
    fn from(p: PersistedBackend) -> Self {
        let mut backend = Backend::new(p.id, &p.base_url, p.max_concurrency);
        backend.api_key = p.api_key;
        backend.supports_native = p.supports_native;
        backend.supports_openai_compat = p.supports_openai_compat;
        backend.draining = p.draining;
        backend.maintenance = p.maintenance;
        backend.hardware = p.hardware;
        backend
    }
}

pub struct FleetInventory {
    backends: RwLock<Vec<Backend>>,
    storage_path: Option<PathBuf>,
    max_backups: usize,
}

impl FleetInventory {
    /// In-memory inventory with no persistence (tests, `enablePersistence`
    /// off).
    pub fn ephemeral() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            storage_path: None,
            max_backups: 0,
        }
    }

    /// Load the persisted backend list, starting empty when absent or
    /// unreadable.
    pub fn with_storage(storage_path: PathBuf, max_backups: usize) -> Self {
        let backends = match persist::load_json::<Vec<PersistedBackend>>(&storage_path) {
            Ok(Some(persisted)) => persisted.into_iter().map(Backend::from).collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!(
                    path = %storage_path.display(),
                    error = %e,
                    "Failed to load server inventory, starting empty"
                );
                Vec::new()
            }
        };
        Self {
            backends: RwLock::new(backends),
            storage_path: Some(storage_path),
            max_backups,
        }
    }

    /// Serialize under the caller's lock so concurrent mutations cannot
    /// interleave between state change and write-out.
    fn save_locked(&self, backends: &[Backend]) {
        let Some(path) = &self.storage_path else {
            return;
        };
        let persisted: Vec<PersistedBackend> = backends.iter().map(PersistedBackend::from).collect();
        if let Err(e) = persist::save_json_atomic(path, &persisted, self.max_backups) {
            tracing::error!(path = %path.display(), error = %e, "Failed to persist server inventory");
        }
    }

    pub async fn add(&self, mut backend: Backend) -> Result<(), InventoryError> {
        if backend.id.trim().is_empty() || backend.id.contains(':') || backend.id.contains('/') {
            return Err(InventoryError::InvalidId(backend.id));
        }
        validate_base_url(&backend.base_url).map_err(InventoryError::InvalidUrl)?;
        backend.base_url = normalize_url(&backend.base_url);
        backend.models = backend
            .models
            .iter()
            .map(|m| normalize_model_name(m))
            .collect();

        let mut backends = self.backends.write().await;
        if backends.iter().any(|b| b.id == backend.id) {
            return Err(InventoryError::DuplicateId(backend.id));
        }
        if let Some(existing) = backends
            .iter()
            .find(|b| urls_equivalent(&b.base_url, &backend.base_url))
        {
            return Err(InventoryError::DuplicateUrl(existing.id.clone()));
        }
        tracing::info!(backend = %backend.id, url = %backend.base_url, "Backend added");
        backends.push(backend);
        self.save_locked(&backends);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<Backend, InventoryError> {
        let mut backends = self.backends.write().await;
        let idx = backends
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        let removed = backends.remove(idx);
        tracing::info!(backend = %removed.id, "Backend removed");
        self.save_locked(&backends);
        Ok(removed)
    }

    pub async fn update(&self, id: &str, patch: BackendPatch) -> Result<Backend, InventoryError> {
        let mut backends = self.backends.write().await;

        if let Some(raw_url) = &patch.base_url {
            validate_base_url(raw_url).map_err(InventoryError::InvalidUrl)?;
            let normalized = normalize_url(raw_url);
            if let Some(existing) = backends
                .iter()
                .find(|b| b.id != id && urls_equivalent(&b.base_url, &normalized))
            {
                return Err(InventoryError::DuplicateUrl(existing.id.clone()));
            }
        }

        let backend = backends
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        if let Some(raw_url) = patch.base_url {
            backend.base_url = normalize_url(&raw_url);
        }
        if let Some(api_key) = patch.api_key {
            backend.api_key = if api_key.is_empty() {
                None
            } else {
                Some(api_key)
            };
        }
        if let Some(max_concurrency) = patch.max_concurrency {
            backend.max_concurrency = max_concurrency.max(1);
        }
        if let Some(v) = patch.supports_native {
            backend.supports_native = v;
        }
        if let Some(v) = patch.supports_openai_compat {
            backend.supports_openai_compat = v;
        }
        if let Some(hardware) = patch.hardware {
            backend.hardware = if hardware.is_empty() {
                None
            } else {
                Some(hardware)
            };
        }
        let updated = backend.clone();
        self.save_locked(&backends);
        Ok(updated)
    }

    pub async fn list(&self) -> Vec<Backend> {
        self.backends.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Backend> {
        self.backends
            .read()
            .await
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    /// Backends advertising `model` (already-normalized name).
    pub async fn servers_for_model(&self, model: &str) -> Vec<Backend> {
        self.backends
            .read()
            .await
            .iter()
            .filter(|b| b.serves_model(model))
            .cloned()
            .collect()
    }

    /// Union of model names across the fleet, sorted.
    pub async fn all_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .backends
            .read()
            .await
            .iter()
            .flat_map(|b| b.models.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        models.sort();
        models
    }

    pub async fn set_draining(&self, id: &str, draining: bool) -> Result<(), InventoryError> {
        let mut backends = self.backends.write().await;
        let backend = backends
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        if backend.draining != draining {
            backend.draining = draining;
            tracing::info!(backend = %id, draining, "Backend drain state changed");
        }
        self.save_locked(&backends);
        Ok(())
    }

    pub async fn set_maintenance(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<(), InventoryError> {
        let mut backends = self.backends.write().await;
        let backend = backends
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        // An empty or absent reason clears maintenance.
        backend.maintenance = reason.filter(|r| !r.trim().is_empty());
        tracing::info!(
            backend = %id,
            maintenance = backend.maintenance.is_some(),
            "Backend maintenance state changed"
        );
        self.save_locked(&backends);
        Ok(())
    }

    /// Apply one probe verdict. Models and version update only on success;
    /// a failed probe leaves the last observed inventory in place.
    pub async fn apply_probe(&self, id: &str, result: ProbeResult) -> Result<(), InventoryError> {
        let mut backends = self.backends.write().await;
        let backend = backends
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        let flipped = backend.healthy != result.healthy;
        backend.healthy = result.healthy;
        if let Some(models) = result.models {
            backend.models = models.iter().map(|m| normalize_model_name(m)).collect();
        }
        if let Some(version) = result.version {
            backend.version = Some(version);
        }
        if let Some(ms) = result.response_time_ms {
            backend.last_response_time_ms = Some(ms);
        }
        if flipped {
            if result.healthy {
                tracing::info!(backend = %id, "Backend healthy");
            } else {
                tracing::warn!(backend = %id, "Backend unhealthy");
            }
        }
        // Health flips are transient state: not persisted.
        Ok(())
    }

    /// Record an observed response time from live traffic.
    pub async fn note_response_time(&self, id: &str, ms: u64) {
        let mut backends = self.backends.write().await;
        if let Some(backend) = backends.iter_mut().find(|b| b.id == id) {
            backend.last_response_time_ms = Some(ms);
        }
    }
}
