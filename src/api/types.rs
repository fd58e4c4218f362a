//! Shared request/response plumbing for the HTTP surface.

use axum::http::{header, HeaderMap, HeaderValue};

use crate::backend::normalize_model_name;
use crate::orchestrator::RouteInfo;

/// Clients opt into routing diagnostics with this header.
pub const INCLUDE_DEBUG_INFO: &str = "x-include-debug-info";

/// Minimal view of an inference body: only the fields the router inspects.
/// The full JSON body is forwarded to the backend verbatim.
#[derive(Debug, serde::Deserialize)]
pub struct InferencePayload {
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Split a `model--<backendID>` pin out of the requested model name and
/// normalize what remains.
pub fn split_pinned_model(raw: &str) -> (String, Option<String>) {
    match raw.rsplit_once("--") {
        Some((model, backend)) if !backend.is_empty() && !model.is_empty() => {
            (normalize_model_name(model), Some(backend.to_string()))
        }
        _ => (normalize_model_name(raw), None),
    }
}

pub fn wants_debug_info(headers: &HeaderMap) -> bool {
    headers
        .get(INCLUDE_DEBUG_INFO)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Opaque client identity for sticky sessions: the bearer token's tail or
/// the remote address header, whichever exists.
pub fn client_identity(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        return Some(auth.chars().rev().take(16).collect());
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Attach the routing diagnostics headers.
pub fn apply_debug_headers(headers: &mut HeaderMap, info: &RouteInfo) {
    let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    };
    set(headers, "x-selected-server", info.backend_id.clone());
    set(
        headers,
        "x-server-circuit-state",
        info.server_circuit_state.to_string(),
    );
    set(
        headers,
        "x-model-circuit-state",
        info.model_circuit_state.to_string(),
    );
    set(
        headers,
        "x-available-servers",
        info.available_servers.to_string(),
    );
    set(
        headers,
        "x-routed-to-open-circuit",
        info.routed_to_open_circuit.to_string(),
    );
    set(
        headers,
        "x-retry-count",
        info.attempts.saturating_sub(1).to_string(),
    );
}

/// Every response carries a request id.
pub fn apply_request_id(headers: &mut HeaderMap) {
    if let Ok(v) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
        headers.insert("x-request-id", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_suffix_splits_and_normalizes() {
        assert_eq!(
            split_pinned_model("Llama3--node-1"),
            ("llama3".to_string(), Some("node-1".to_string()))
        );
        assert_eq!(split_pinned_model("llama3"), ("llama3".to_string(), None));
        // A trailing separator with no backend is part of nothing.
        assert_eq!(split_pinned_model("llama3--"), ("llama3--".to_string(), None));
    }

    #[test]
    fn debug_header_opt_in() {
        let mut headers = HeaderMap::new();
        assert!(!wants_debug_info(&headers));
        headers.insert(INCLUDE_DEBUG_INFO, HeaderValue::from_static("true"));
        assert!(wants_debug_info(&headers));
        headers.insert(INCLUDE_DEBUG_INFO, HeaderValue::from_static("false"));
        assert!(!wants_debug_info(&headers));
    }
}
