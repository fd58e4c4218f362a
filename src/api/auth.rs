//! Control-plane bearer-token auth.
//!
//! A single shared token gates the `/api/orchestrator/*` routes when
//! `enableAuth` is set. Comparison is constant-time.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::routes::AppState;
use crate::error::ErrorBody;

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

/// Reject control-plane calls without the configured bearer token.
pub async fn require_control_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let settings = &state.orchestrator.settings;
    if !settings.enable_auth {
        return next.run(request).await;
    }
    let Some(expected) = settings.control_plane_token.as_deref() else {
        // Validation guarantees a token when auth is enabled; refuse rather
        // than fail open if that ever regresses.
        return unauthorized("control plane auth misconfigured");
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if constant_time_eq(token, expected) => next.run(request).await,
        _ => unauthorized("invalid or missing control plane token"),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: message.to_string(),
            details: None,
        }),
    )
        .into_response()
}
