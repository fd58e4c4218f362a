//! Backend records and routing keys.
//!
//! A backend is one upstream inference server, identified by a stable opaque
//! id and reachable at a normalized base URL. All routing state elsewhere in
//! the crate is keyed by the `(backend, model)` pair.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// One upstream inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    /// Stable opaque id, unique in the fleet.
    pub id: String,
    /// Normalized base URL (no trailing slash, percent-decoded).
    pub base_url: String,
    /// Optional bearer token sent upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Concurrency cap for regular (non-probe) traffic.
    pub max_concurrency: u32,
    /// Last health probe verdict.
    #[serde(default = "default_true")]
    pub healthy: bool,
    /// Duration of the last successful upstream response, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_time_ms: Option<u64>,
    /// Model names observed on the last successful inventory poll.
    #[serde(default)]
    pub models: HashSet<String>,
    /// Upstream server version, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub supports_native: bool,
    #[serde(default = "default_true")]
    pub supports_openai_compat: bool,
    /// Operator state: refuse new requests, let in-flight finish.
    #[serde(default)]
    pub draining: bool,
    /// Operator state with optional reason; set means in maintenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<String>,
    /// Free-form hardware description (e.g. "2x A6000").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Backend {
    pub fn new(id: impl Into<String>, base_url: &str, max_concurrency: u32) -> Self {
        Self {
            id: id.into(),
            base_url: normalize_url(base_url),
            api_key: None,
            max_concurrency,
            healthy: true,
            last_response_time_ms: None,
            models: HashSet::new(),
            version: None,
            supports_native: true,
            supports_openai_compat: true,
            draining: false,
            maintenance: None,
            hardware: None,
        }
    }

    /// Whether the backend may receive new admissions at all.
    pub fn accepts_new_requests(&self) -> bool {
        self.healthy && !self.draining && self.maintenance.is_none()
    }

    /// Whether the backend advertised `model` on its last inventory poll.
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }
}

/// Routing key: one `(backend, model)` pair.
///
/// Used as the map key for breakers, metrics, in-flight counters, cooldowns,
/// bans and timeouts. The `backend:model` string form exists only at
/// persistence boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub backend_id: String,
    pub model: String,
}

impl PairKey {
    pub fn new(backend_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            model: model.into(),
        }
    }

    /// String form for persisted files (`serverId:model`).
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.backend_id, self.model)
    }

    /// Parse the persisted string form. The backend id cannot contain `:`;
    /// the model may (everything after the first separator belongs to it).
    pub fn from_storage_key(s: &str) -> Option<Self> {
        let (backend_id, model) = s.split_once(':')?;
        if backend_id.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(backend_id, model))
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.backend_id, self.model)
    }
}

/// Normalize a backend base URL.
///
/// Percent-decodes repeatedly until a fixpoint (guards against
/// double-encoded input), then strips trailing slashes. Two backends whose
/// normalized URLs are equal are considered the same server.
pub fn normalize_url(raw: &str) -> String {
    let mut current = raw.trim().to_string();
    // Decoding is contractive, but cap iterations against pathological input.
    for _ in 0..8 {
        let decoded = match urlencoding::decode(&current) {
            Ok(d) => d.into_owned(),
            Err(_) => break,
        };
        if decoded == current {
            break;
        }
        current = decoded;
    }
    while current.ends_with('/') {
        current.pop();
    }
    current
}

/// Whether two raw URLs address the same server after normalization.
pub fn urls_equivalent(a: &str, b: &str) -> bool {
    normalize_url(a) == normalize_url(b)
}

/// Validate that a base URL parses as an absolute http(s) URL.
pub fn validate_base_url(raw: &str) -> Result<(), String> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| format!("invalid URL: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported URL scheme '{other}'")),
    }
}

/// Normalize a model name: trim, lowercase, collapse whitespace around `/`.
///
/// `" Llama3 / 8B "` and `"llama3/8b"` route to the same pair.
pub fn normalize_model_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_ws = false;
    for ch in lowered.chars() {
        if ch.is_whitespace() {
            pending_ws = true;
            continue;
        }
        if ch == '/' {
            // Drop whitespace adjacent to the separator.
            pending_ws = false;
            out.push('/');
            continue;
        }
        if pending_ws && !out.is_empty() && !out.ends_with('/') {
            out.push(' ');
        }
        pending_ws = false;
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_strips_trailing_slashes() {
        assert_eq!(normalize_url("http://h:11434/"), "http://h:11434");
        assert_eq!(normalize_url("http://h:11434///"), "http://h:11434");
        assert_eq!(normalize_url("  http://h:11434  "), "http://h:11434");
    }

    #[test]
    fn normalize_url_decodes_to_fixpoint() {
        // Double-encoded space: %2520 → %20 → ' '
        assert_eq!(normalize_url("http://h/a%2520b"), "http://h/a b");
        // Idempotent on already-normalized input
        let once = normalize_url("http://h/a%2520b");
        assert_eq!(normalize_url(&once), once);
    }

    #[test]
    fn url_equivalence_matches_normal_forms() {
        assert!(urls_equivalent("http://h:11434/", "http://h:11434"));
        assert!(!urls_equivalent("http://h:11434", "http://h2:11434"));
    }

    #[test]
    fn model_names_normalize() {
        assert_eq!(normalize_model_name(" Llama3 / 8B "), "llama3/8b");
        assert_eq!(normalize_model_name("MIXTRAL"), "mixtral");
        assert_eq!(normalize_model_name("a b/c"), "a b/c");
    }

    #[test]
    fn pair_key_storage_round_trip() {
        let key = PairKey::new("srv-1", "library/llama3:8b");
        let parsed = PairKey::from_storage_key(&key.storage_key()).unwrap();
        // Model names containing ':' survive because only the first
        // separator splits.
        assert_eq!(parsed.backend_id, "srv-1");
        assert_eq!(parsed.model, "library/llama3:8b");
    }

    #[test]
    fn pair_key_rejects_malformed_storage_keys() {
        assert!(PairKey::from_storage_key("no-separator").is_none());
        assert!(PairKey::from_storage_key(":model").is_none());
        assert!(PairKey::from_storage_key("srv:").is_none());
    }

    #[test]
    fn backend_admission_flags() {
        let mut b = Backend::new("a", "http://h:11434", 4);
        assert!(b.accepts_new_requests());
        b.draining = true;
        assert!(!b.accepts_new_requests());
        b.draining = false;
        b.maintenance = Some("disk swap".into());
        assert!(!b.accepts_new_requests());
    }
}
