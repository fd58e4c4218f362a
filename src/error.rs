//! Request-boundary error taxonomy.
//!
//! Every failure a client can observe maps to one of these variants, each
//! with a fixed HTTP status. Upstream statuses are mirrored only where safe;
//! circuit rejections carry a header hint and are never counted against the
//! breaker that produced them.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub static CIRCUIT_STATE_HINT: HeaderName = HeaderName::from_static("x-circuit-state");

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no server available for model '{model}'")]
    NoServerAvailable { model: String },

    #[error("request queue is full")]
    QueueFull,

    #[error("timed out waiting for an available server")]
    QueueTimeout,

    #[error("backend '{backend}' is not accepting new requests")]
    AdmissionDrained { backend: String },

    #[error("{0}")]
    Validation(String),

    #[error("upstream request timed out")]
    UpstreamTimeout {
        backend: Option<String>,
        details: Option<String>,
    },

    #[error("upstream error")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("circuit open for {backend}/{model}")]
    CircuitOpen { backend: String, model: String },

    #[error("circuit half-open for {backend}/{model}, probe capacity exhausted")]
    HalfOpenExhausted { backend: String, model: String },

    #[error("{endpoint} is not supported in multi-node mode")]
    UnsupportedEndpoint { endpoint: String },

    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoServerAvailable { .. }
            | Self::QueueFull
            | Self::QueueTimeout
            | Self::AdmissionDrained { .. }
            | Self::CircuitOpen { .. }
            | Self::HalfOpenExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation(_) | Self::UnsupportedEndpoint { .. } => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { status, .. } => mirror_upstream_status(*status),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Root-cause detail for the response body, where one exists.
    fn details(&self) -> Option<String> {
        match self {
            Self::Upstream { message, .. } => Some(message.clone()),
            Self::UpstreamTimeout { details, .. } => details.clone(),
            Self::Internal(details) => Some(details.clone()),
            _ => None,
        }
    }
}

/// Mirror an upstream status only where doing so cannot mislead the client:
/// 5xx map to 502/503/504, recognizable 4xx map to 400/404.
fn mirror_upstream_status(status: Option<u16>) -> StatusCode {
    match status {
        Some(503) => StatusCode::SERVICE_UNAVAILABLE,
        Some(504) => StatusCode::GATEWAY_TIMEOUT,
        Some(s) if (500..600).contains(&s) => StatusCode::BAD_GATEWAY,
        Some(404) => StatusCode::NOT_FOUND,
        Some(s) if (400..500).contains(&s) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Failure body shape shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        let mut response = (status, Json(body)).into_response();
        match &self {
            GatewayError::CircuitOpen { .. } => {
                response
                    .headers_mut()
                    .insert(&CIRCUIT_STATE_HINT, HeaderValue::from_static("open"));
            }
            GatewayError::HalfOpenExhausted { .. } => {
                response
                    .headers_mut()
                    .insert(&CIRCUIT_STATE_HINT, HeaderValue::from_static("half-open"));
            }
            _ => {}
        }
        response
    }
}
