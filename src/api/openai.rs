//! OpenAI-compatible surface.
//!
//! The same routing core serves `/v1/*`; bodies are forwarded verbatim and
//! only backends flagged `supportsOpenaiCompat` are eligible. Model listing
//! presents the fleet's models as OpenAI model objects.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::inference::dispatch_inference;
use super::routes::AppState;
use super::types::split_pinned_model;
use crate::error::GatewayError;

#[derive(Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelObject>,
}

#[derive(Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(state, headers, body, "/v1/chat/completions", false, true).await
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(state, headers, body, "/v1/completions", false, true).await
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inference(state, headers, body, "/v1/embeddings", false, true).await
}

fn model_object(id: String, created: i64) -> ModelObject {
    ModelObject {
        id,
        object: "model",
        created,
        owned_by: "fleetgate",
    }
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .orchestrator
        .inventory
        .all_models()
        .await
        .into_iter()
        .map(|name| model_object(name, created))
        .collect();
    Json(ModelsResponse {
        object: "list",
        data,
    })
    .into_response()
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Response {
    let (normalized, _) = split_pinned_model(&model);
    let serving = state
        .orchestrator
        .inventory
        .servers_for_model(&normalized)
        .await;
    if serving.is_empty() {
        return GatewayError::NoServerAvailable { model: normalized }.into_response();
    }
    Json(model_object(normalized, chrono::Utc::now().timestamp())).into_response()
}
