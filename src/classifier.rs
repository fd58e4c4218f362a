//! Upstream error classification.
//!
//! Maps an upstream failure (message text plus optional HTTP status) to a
//! classification that drives retry, cooldown and circuit-breaker decisions.
//! Given identical pattern configuration, classification is a pure function
//! of the input.

use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Coarse error type at the routing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    Transient,
    Permanent,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Resource,
    Compatibility,
    Network,
    Authentication,
    Configuration,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resource => "resource",
            Self::Compatibility => "compatibility",
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// How a retry of this error should be paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Do not retry this backend.
    None,
    /// Retry another candidate immediately.
    NextCandidate,
    /// Exponential backoff: `base · 3ⁿ`, capped.
    Exponential { base: Duration, cap: Duration },
}

/// Result of classifying one upstream failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub error_type: ErrorType,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    pub transient: bool,
    pub permanent: bool,
    pub should_circuit_break: bool,
    pub retry_strategy: RetryStrategy,
    /// The configured pattern that matched, if any.
    pub matched_pattern: Option<String>,
}

impl Classification {
    /// Whether this failure should count against the pair's breaker.
    /// Ignore-pattern hits (wrong backend for the call, not a bad backend)
    /// are the one class that never penalizes.
    pub fn penalizes_breaker(&self) -> bool {
        !(self.category == ErrorCategory::Compatibility && self.severity == Severity::Low)
    }

    fn build(
        error_type: ErrorType,
        category: ErrorCategory,
        severity: Severity,
        should_circuit_break: bool,
        retry_strategy: RetryStrategy,
        matched_pattern: Option<String>,
    ) -> Self {
        let retryable = matches!(
            error_type,
            ErrorType::Retryable | ErrorType::Transient | ErrorType::RateLimited
        );
        let transient = matches!(error_type, ErrorType::Transient | ErrorType::RateLimited);
        let permanent = matches!(error_type, ErrorType::Permanent | ErrorType::NonRetryable);
        Self {
            error_type,
            category,
            severity,
            retryable,
            transient,
            permanent,
            should_circuit_break,
            retry_strategy,
            matched_pattern,
        }
    }
}

/// Pattern lists, all matched case-insensitively as substrings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPatterns {
    /// Failures that mean "wrong backend for this call", not "bad backend":
    /// route elsewhere without penalizing this pair.
    pub ignore: Vec<String>,
    /// Fatal per-pair failures: model missing, runner crash, out of memory.
    pub non_retryable: Vec<String>,
    pub rate_limited: Vec<String>,
    pub transient: Vec<String>,
    /// Temporary capacity exhaustion: overloaded, no free slots, VRAM.
    pub resource: Vec<String>,
}

impl Default for ErrorPatterns {
    fn default() -> Self {
        Self {
            ignore: vec![
                "does not support generate".into(),
                "does not support chat".into(),
                "embedding model does not support".into(),
                "only supports embeddings".into(),
            ],
            non_retryable: vec![
                "model not found".into(),
                "no such model".into(),
                "file does not exist".into(),
                "out of memory".into(),
                "cuda error".into(),
                "invalid api key".into(),
                "unauthorized".into(),
                "llama runner process has terminated".into(),
                "error loading model".into(),
            ],
            rate_limited: vec![
                "rate limit".into(),
                "too many requests".into(),
                "quota exceeded".into(),
            ],
            transient: vec![
                "connection refused".into(),
                "connection reset".into(),
                "broken pipe".into(),
                "timeout".into(),
                "timed out".into(),
                "temporarily unavailable".into(),
                "eof".into(),
            ],
            resource: vec![
                "server overloaded".into(),
                "no slots available".into(),
                "not enough vram".into(),
                "resource exhausted".into(),
                "model is loading".into(),
            ],
        }
    }
}

/// Which pattern list an additive runtime update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Ignore,
    NonRetryable,
    RateLimited,
    Transient,
    Resource,
}

const RATE_LIMIT_BASE: Duration = Duration::from_secs(5 * 60);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(60 * 60);

/// Classifier with runtime-extensible pattern sets.
///
/// Pattern updates are additive only, so a classification observed once can
/// only be refined toward an earlier rule, never flip arbitrarily.
#[derive(Debug)]
pub struct ErrorClassifier {
    patterns: RwLock<ErrorPatterns>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(ErrorPatterns::default())
    }
}

impl ErrorClassifier {
    pub fn new(patterns: ErrorPatterns) -> Self {
        Self {
            patterns: RwLock::new(patterns),
        }
    }

    /// Append patterns to one of the lists. Duplicates are dropped.
    pub fn add_patterns(&self, kind: PatternKind, additions: Vec<String>) {
        let mut patterns = self.patterns.write().unwrap_or_else(|e| e.into_inner());
        let list = match kind {
            PatternKind::Ignore => &mut patterns.ignore,
            PatternKind::NonRetryable => &mut patterns.non_retryable,
            PatternKind::RateLimited => &mut patterns.rate_limited,
            PatternKind::Transient => &mut patterns.transient,
            PatternKind::Resource => &mut patterns.resource,
        };
        for addition in additions {
            let lowered = addition.trim().to_lowercase();
            if lowered.is_empty() {
                continue;
            }
            if !list.iter().any(|p| p.eq_ignore_ascii_case(&lowered)) {
                list.push(lowered);
            }
        }
    }

    pub fn patterns(&self) -> ErrorPatterns {
        self.patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Classify one failure. First matching rule wins; rules are checked in
    /// the order: ignore, non-retryable, rate-limited, transient, resource,
    /// HTTP status, default.
    pub fn classify(&self, message: &str, status: Option<u16>) -> Classification {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        let haystack = message.to_lowercase();

        if let Some(p) = first_match(&patterns.ignore, &haystack) {
            return Classification::build(
                ErrorType::NonRetryable,
                ErrorCategory::Compatibility,
                Severity::Low,
                false,
                RetryStrategy::NextCandidate,
                Some(p),
            );
        }

        if let Some(p) = first_match(&patterns.non_retryable, &haystack) {
            return Classification::build(
                ErrorType::NonRetryable,
                category_from_content(&haystack),
                Severity::Critical,
                true,
                RetryStrategy::None,
                Some(p),
            );
        }

        if status == Some(429) || first_match(&patterns.rate_limited, &haystack).is_some() {
            let matched = first_match(&patterns.rate_limited, &haystack);
            return Classification::build(
                ErrorType::RateLimited,
                ErrorCategory::Network,
                Severity::Medium,
                true,
                RetryStrategy::Exponential {
                    base: RATE_LIMIT_BASE,
                    cap: RATE_LIMIT_CAP,
                },
                matched,
            );
        }

        if let Some(p) = first_match(&patterns.transient, &haystack) {
            return Classification::build(
                ErrorType::Transient,
                ErrorCategory::Network,
                Severity::Medium,
                false,
                RetryStrategy::NextCandidate,
                Some(p),
            );
        }

        if let Some(p) = first_match(&patterns.resource, &haystack) {
            return Classification::build(
                ErrorType::Retryable,
                ErrorCategory::Resource,
                Severity::High,
                false,
                RetryStrategy::NextCandidate,
                Some(p),
            );
        }

        if let Some(code) = status.or_else(|| embedded_status(&haystack)) {
            return classify_status(code);
        }

        Classification::build(
            ErrorType::Retryable,
            ErrorCategory::Unknown,
            Severity::High,
            true,
            RetryStrategy::NextCandidate,
            None,
        )
    }
}

/// Pull an HTTP status out of free-text error bodies ("upstream returned
/// http 503", "status code: 502") when the transport gave us none.
fn embedded_status(haystack: &str) -> Option<u16> {
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    let re = STATUS_RE.get_or_init(|| {
        Regex::new(r"(?:http|status(?:\s+code)?)\s*:?\s*([1-5]\d{2})\b").expect("valid regex")
    });
    re.captures(haystack)?.get(1)?.as_str().parse().ok()
}

fn first_match(patterns: &[String], haystack: &str) -> Option<String> {
    patterns
        .iter()
        .find(|p| haystack.contains(&p.to_lowercase()))
        .cloned()
}

fn category_from_content(haystack: &str) -> ErrorCategory {
    if haystack.contains("unauthorized")
        || haystack.contains("api key")
        || haystack.contains("forbidden")
    {
        ErrorCategory::Authentication
    } else if haystack.contains("memory") || haystack.contains("vram") || haystack.contains("cuda")
    {
        ErrorCategory::Resource
    } else if haystack.contains("model") || haystack.contains("file") {
        ErrorCategory::Configuration
    } else {
        ErrorCategory::Unknown
    }
}

fn classify_status(code: u16) -> Classification {
    match code {
        502 | 503 | 504 => Classification::build(
            ErrorType::Transient,
            ErrorCategory::Network,
            Severity::Medium,
            false,
            RetryStrategy::NextCandidate,
            None,
        ),
        400 | 401 | 403 | 404 | 405 | 406 | 410 | 422 => Classification::build(
            ErrorType::NonRetryable,
            if code == 401 || code == 403 {
                ErrorCategory::Authentication
            } else {
                ErrorCategory::Configuration
            },
            Severity::Critical,
            true,
            RetryStrategy::None,
            None,
        ),
        500..=599 => Classification::build(
            ErrorType::Retryable,
            ErrorCategory::Unknown,
            Severity::High,
            true,
            RetryStrategy::NextCandidate,
            None,
        ),
        _ => Classification::build(
            ErrorType::Retryable,
            ErrorCategory::Unknown,
            Severity::High,
            true,
            RetryStrategy::NextCandidate,
            None,
        ),
    }
}
