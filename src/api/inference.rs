//! Native inference and listing endpoints.
//!
//! Inference bodies are inspected only for `model` and `stream`, then
//! forwarded verbatim to the selected backend. Listing endpoints fan out to
//! the fleet and merge. Endpoints that would mutate a single backend's
//! model store are refused uniformly.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use reqwest::Method;

use super::routes::AppState;
use super::types::{
    apply_debug_headers, apply_request_id, client_identity, split_pinned_model, wants_debug_info,
    InferencePayload,
};
use crate::error::GatewayError;
use crate::orchestrator::{Dispatched, InferenceRequest};

const NDJSON: &str = "application/x-ndjson";

pub async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(state, headers, body, "/api/generate", true, false).await
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(state, headers, body, "/api/chat", true, false).await
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(state, headers, body, "/api/embeddings", false, false).await
}

pub async fn embed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(state, headers, body, "/api/embed", false, false).await
}

/// Shared routing for every inference-shaped endpoint, native and
/// OpenAI-compatible.
pub(super) async fn dispatch_inference(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
    path: &str,
    default_stream: bool,
    openai_compat: bool,
) -> Response {
    let debug = wants_debug_info(&headers);

    let payload: InferencePayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return finish(
                GatewayError::Validation(format!("invalid request body: {e}")).into_response(),
                None,
                false,
            );
        }
    };
    let Some(raw_model) = payload.model.filter(|m| !m.trim().is_empty()) else {
        return finish(
            GatewayError::Validation("missing required field: model".into()).into_response(),
            None,
            false,
        );
    };
    let (model, pinned_backend) = split_pinned_model(&raw_model);
    let streaming = payload.stream.unwrap_or(default_stream);

    let request = InferenceRequest {
        path: path.to_string(),
        body,
        model,
        streaming,
        openai_compat,
        pinned_backend,
        client_id: client_identity(&headers),
        priority: 0,
    };

    match state.orchestrator.dispatch(request).await {
        Ok(Dispatched::Buffered(upstream, info)) => {
            let status =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut response = Response::builder().status(status);
            if let Some(ct) = &upstream.content_type {
                response = response.header(header::CONTENT_TYPE, ct);
            }
            let response = response
                .body(Body::from(upstream.body))
                .unwrap_or_else(|_| {
                    GatewayError::Internal("failed to build response".into()).into_response()
                });
            finish(response, debug.then_some(&info), true)
        }
        Ok(Dispatched::Streaming(upstream, info)) => {
            let status =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let content_type = upstream.content_type.as_deref().unwrap_or(NDJSON).to_string();
            let response = Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(upstream.body))
                .unwrap_or_else(|_| {
                    GatewayError::Internal("failed to build response".into()).into_response()
                });
            finish(response, debug.then_some(&info), true)
        }
        Err(e) => finish(e.into_response(), None, true),
    }
}

fn finish(
    mut response: Response,
    info: Option<&crate::orchestrator::RouteInfo>,
    request_id: bool,
) -> Response {
    if let Some(info) = info {
        apply_debug_headers(response.headers_mut(), info);
    }
    if request_id {
        apply_request_id(response.headers_mut());
    }
    response
}

// ── Listing & introspection ──────────────────────────────────────────────

/// `GET /api/tags`: union of fleet model listings, deduplicated by name.
pub async fn tags(State(state): State<Arc<AppState>>) -> Response {
    let collected = state.orchestrator.collect_from_fleet("/api/tags").await;
    let mut by_name: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for (_, value) in collected {
        let Some(models) = value.get("models").and_then(|m| m.as_array()) else {
            continue;
        };
        for model in models {
            if let Some(name) = model.get("name").and_then(|n| n.as_str()) {
                by_name.entry(name.to_string()).or_insert(model.clone());
            }
        }
    }
    let models: Vec<serde_json::Value> = by_name.into_values().collect();
    Json(serde_json::json!({ "models": models })).into_response()
}

/// `GET /api/ps`: running models across the fleet, tagged with the serving
/// backend.
pub async fn ps(State(state): State<Arc<AppState>>) -> Response {
    let collected = state.orchestrator.collect_from_fleet("/api/ps").await;
    let mut models = Vec::new();
    for (backend_id, value) in collected {
        let Some(running) = value.get("models").and_then(|m| m.as_array()) else {
            continue;
        };
        for entry in running {
            let mut entry = entry.clone();
            if let Some(map) = entry.as_object_mut() {
                map.insert(
                    "server".to_string(),
                    serde_json::Value::String(backend_id.clone()),
                );
            }
            models.push(entry);
        }
    }
    Json(serde_json::json!({ "models": models })).into_response()
}

pub async fn version() -> Response {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") })).into_response()
}

#[derive(Debug, serde::Deserialize)]
pub struct ShowPayload {
    model: Option<String>,
    /// Older clients send `name`.
    name: Option<String>,
}

/// `POST /api/show`: forwarded to one healthy backend advertising the
/// model.
pub async fn show(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload: ShowPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return GatewayError::Validation(format!("invalid request body: {e}")).into_response();
        }
    };
    let Some(raw_model) = payload.model.or(payload.name).filter(|m| !m.trim().is_empty()) else {
        return GatewayError::Validation("missing required field: model".into()).into_response();
    };
    let (model, pinned) = split_pinned_model(&raw_model);

    let mut backends = state.orchestrator.inventory.servers_for_model(&model).await;
    if let Some(pin) = &pinned {
        backends.retain(|b| &b.id == pin);
    }
    let Some(backend) = backends.into_iter().find(|b| b.healthy) else {
        return GatewayError::NoServerAvailable { model }.into_response();
    };

    match state
        .orchestrator
        .passthrough(&backend, Method::POST, "/api/show", Some(body))
        .await
    {
        Ok(upstream) => {
            let status =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut response = Response::builder().status(status);
            if let Some(ct) = &upstream.content_type {
                response = response.header(header::CONTENT_TYPE, ct);
            }
            response.body(Body::from(upstream.body)).unwrap_or_else(|_| {
                GatewayError::Internal("failed to build response".into()).into_response()
            })
        }
        Err(e) => {
            let (message, status) = e.classifier_view();
            GatewayError::Upstream { status, message }.into_response()
        }
    }
}

/// Single-backend model-store mutations make no sense behind the
/// orchestrator.
pub async fn unsupported(uri: axum::http::Uri) -> Response {
    GatewayError::UnsupportedEndpoint {
        endpoint: uri.path().to_string(),
    }
    .into_response()
}

/// `GET /api/health`: liveness plus a fleet summary.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let backends = state.orchestrator.inventory.list().await;
    let healthy = backends.iter().filter(|b| b.healthy).count();
    let models = state.orchestrator.inventory.all_models().await;
    Json(serde_json::json!({
        "status": "ok",
        "servers": backends.len(),
        "healthyServers": healthy,
        "models": models.len(),
        "queueDepth": state.orchestrator.queue.len(),
        "inFlight": state.orchestrator.inflight.total_in_flight(),
    }))
    .into_response()
}
