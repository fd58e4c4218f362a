//! Control plane: fleet membership, operator states, queue control,
//! breaker overrides, bans and classifier patterns.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::routes::AppState;
use crate::backend::{Backend, PairKey};
use crate::classifier::PatternKind;
use crate::error::ErrorBody;
use crate::inventory::{BackendPatch, InventoryError};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/servers/add", post(add_server))
        .route("/servers", get(list_servers))
        .route("/servers/:id", delete(remove_server).patch(patch_server))
        .route("/servers/:id/drain", post(drain_server))
        .route("/servers/:id/undrain", post(undrain_server))
        .route("/servers/:id/maintenance", post(maintenance_server))
        .route("/model-map", get(model_map))
        .route("/queue", get(queue_status))
        .route("/queue/pause", post(queue_pause))
        .route("/queue/resume", post(queue_resume))
        .route("/circuit-breakers", get(list_breakers))
        .route("/circuit-breakers/:server_id/:model", get(get_breaker))
        .route(
            "/circuit-breakers/:server_id/:model/:action",
            post(breaker_action),
        )
        .route("/bans", get(list_bans).post(add_ban).delete(clear_bans))
        .route("/bans/:server_id/:model", delete(remove_ban))
        .route("/error-patterns", post(add_error_patterns))
}

fn inventory_error(e: InventoryError) -> Response {
    let status = match e {
        InventoryError::NotFound(_) => StatusCode::NOT_FOUND,
        InventoryError::DuplicateId(_) | InventoryError::DuplicateUrl(_) => StatusCode::CONFLICT,
        InventoryError::InvalidId(_) | InventoryError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
            details: None,
        }),
    )
        .into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
            details: None,
        }),
    )
        .into_response()
}

// ── Servers ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServerRequest {
    pub id: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub hardware: Option<String>,
}

async fn add_server(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddServerRequest>,
) -> Response {
    let id = request
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("srv-{}", &uuid::Uuid::new_v4().to_string()[..8]));
    let max_concurrency = request.max_concurrency.unwrap_or(
        state
            .orchestrator
            .settings
            .cooldown
            .default_max_concurrency,
    );
    let mut backend = Backend::new(id, &request.base_url, max_concurrency.max(1));
    backend.api_key = request.api_key.filter(|k| !k.is_empty());
    backend.hardware = request.hardware;

    match state.orchestrator.inventory.add(backend.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(backend)).into_response(),
        Err(e) => inventory_error(e),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerView {
    #[serde(flatten)]
    backend: Backend,
    in_flight: u32,
    circuit_blocked: bool,
}

async fn list_servers(State(state): State<Arc<AppState>>) -> Response {
    let backends = state.orchestrator.inventory.list().await;
    let mut views = Vec::with_capacity(backends.len());
    for backend in backends {
        let in_flight = state.orchestrator.inflight.backend_in_flight(&backend.id);
        let circuit_blocked = state.orchestrator.breakers.backend_blocked(&backend.id).await;
        views.push(ServerView {
            backend,
            in_flight,
            circuit_blocked,
        });
    }
    Json(views).into_response()
}

async fn remove_server(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.orchestrator.inventory.remove(&id).await {
        Ok(removed) => {
            // Drop the removed backend's per-pair state everywhere.
            for (key, _) in state.orchestrator.breakers.all().await {
                if key.backend_id == id {
                    state.orchestrator.breakers.forget(&key).await;
                    state.orchestrator.metrics.forget(&key).await;
                    state.orchestrator.timeouts.forget(&key).await;
                }
            }
            Json(removed).into_response()
        }
        Err(e) => inventory_error(e),
    }
}

async fn patch_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<BackendPatch>,
) -> Response {
    match state.orchestrator.inventory.update(&id, patch).await {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => inventory_error(e),
    }
}

async fn drain_server(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.orchestrator.inventory.set_draining(&id, true).await {
        Ok(()) => Json(serde_json::json!({"id": id, "draining": true})).into_response(),
        Err(e) => inventory_error(e),
    }
}

async fn undrain_server(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.orchestrator.inventory.set_draining(&id, false).await {
        Ok(()) => Json(serde_json::json!({"id": id, "draining": false})).into_response(),
        Err(e) => inventory_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MaintenanceRequest {
    #[serde(default)]
    pub reason: Option<String>,
    /// `false` takes the backend out of maintenance.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn maintenance_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Option<Json<MaintenanceRequest>>,
) -> Response {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let reason = if request.enabled {
        Some(
            request
                .reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "maintenance".to_string()),
        )
    } else {
        None
    };
    match state.orchestrator.inventory.set_maintenance(&id, reason).await {
        Ok(()) => Json(serde_json::json!({"id": id, "maintenance": request.enabled}))
            .into_response(),
        Err(e) => inventory_error(e),
    }
}

/// Model → serving backend ids.
async fn model_map(State(state): State<Arc<AppState>>) -> Response {
    let backends = state.orchestrator.inventory.list().await;
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for backend in backends {
        for model in &backend.models {
            map.entry(model.clone()).or_default().push(backend.id.clone());
        }
    }
    for ids in map.values_mut() {
        ids.sort();
    }
    Json(map).into_response()
}

// ── Queue ────────────────────────────────────────────────────────────────

async fn queue_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.queue.status()).into_response()
}

async fn queue_pause(State(state): State<Arc<AppState>>) -> Response {
    state.orchestrator.queue.pause();
    Json(serde_json::json!({"paused": true})).into_response()
}

async fn queue_resume(State(state): State<Arc<AppState>>) -> Response {
    state.orchestrator.queue.resume();
    Json(serde_json::json!({"paused": false})).into_response()
}

// ── Circuit breakers ─────────────────────────────────────────────────────

async fn list_breakers(State(state): State<Arc<AppState>>) -> Response {
    let all = state.orchestrator.breakers.all().await;
    let keyed: BTreeMap<String, _> = all
        .into_iter()
        .map(|(key, snapshot)| (key.storage_key(), snapshot))
        .collect();
    Json(keyed).into_response()
}

async fn get_breaker(
    State(state): State<Arc<AppState>>,
    Path((server_id, model)): Path<(String, String)>,
) -> Response {
    let key = PairKey::new(server_id, crate::backend::normalize_model_name(&model));
    match state.orchestrator.breakers.snapshot(&key).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("no breaker state for {key}"),
                details: None,
            }),
        )
            .into_response(),
    }
}

async fn breaker_action(
    State(state): State<Arc<AppState>>,
    Path((server_id, model, action)): Path<(String, String, String)>,
) -> Response {
    let key = PairKey::new(server_id, crate::backend::normalize_model_name(&model));
    let breakers = &state.orchestrator.breakers;
    match action.as_str() {
        "reset" => breakers.reset(&key).await,
        "open" => breakers.force_open(&key).await,
        "close" => breakers.force_close(&key).await,
        "half-open" => breakers.force_half_open(&key).await,
        other => {
            return bad_request(format!(
                "unknown circuit breaker action '{other}' (expected reset, open, close or half-open)"
            ));
        }
    }
    let snapshot = state.orchestrator.breakers.snapshot(&key).await;
    Json(serde_json::json!({"pair": key.storage_key(), "state": snapshot.map(|s| s.state)}))
        .into_response()
}

// ── Bans ─────────────────────────────────────────────────────────────────

async fn list_bans(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.bans.persistable().await).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRequest {
    pub server_id: String,
    pub model: String,
}

async fn add_ban(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BanRequest>,
) -> Response {
    if request.server_id.trim().is_empty() || request.model.trim().is_empty() {
        return bad_request("serverId and model are required");
    }
    let key = PairKey::new(
        request.server_id,
        crate::backend::normalize_model_name(&request.model),
    );
    let inserted = state.orchestrator.bans.ban(key.clone()).await;
    Json(serde_json::json!({"pair": key.storage_key(), "added": inserted})).into_response()
}

async fn remove_ban(
    State(state): State<Arc<AppState>>,
    Path((server_id, model)): Path<(String, String)>,
) -> Response {
    let key = PairKey::new(server_id, crate::backend::normalize_model_name(&model));
    let removed = state.orchestrator.bans.unban(&key).await;
    if removed {
        Json(serde_json::json!({"pair": key.storage_key(), "removed": true})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("{} is not banned", key.storage_key()),
                details: None,
            }),
        )
            .into_response()
    }
}

async fn clear_bans(State(state): State<Arc<AppState>>) -> Response {
    let cleared = state.orchestrator.bans.clear().await;
    Json(serde_json::json!({"cleared": cleared})).into_response()
}

// ── Classifier patterns ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PatternUpdate {
    pub kind: PatternKind,
    pub patterns: Vec<String>,
}

/// Additive runtime extension of the classifier's pattern lists.
async fn add_error_patterns(
    State(state): State<Arc<AppState>>,
    Json(update): Json<PatternUpdate>,
) -> Response {
    if update.patterns.is_empty() {
        return bad_request("patterns must be non-empty");
    }
    state
        .orchestrator
        .classifier
        .add_patterns(update.kind, update.patterns);
    Json(state.orchestrator.classifier.patterns()).into_response()
}
