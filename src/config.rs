//! Configuration.
//!
//! One validated configuration object covers the whole process. It loads
//! from a JSON file (path via `FLEETGATE_CONFIG`), with the listen socket
//! overridable through `HOST` / `PORT`. A reload task may re-read the file
//! on a configurable cadence and swap the shared value atomically.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::balancer::BalancerConfig;
use crate::breaker::BreakerConfig;
use crate::queue::QueueConfig;
use crate::timeout::TimeoutConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    /// Fail-over budget per request, additionally capped by candidate count.
    pub max_retries_per_server: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries_per_server: 2,
            retry_delay_ms: 200,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 5_000,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CooldownSettings {
    pub failure_cooldown_ms: u64,
    /// Concurrency assumed for backends added without an explicit cap.
    pub default_max_concurrency: u32,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            failure_cooldown_ms: 30_000,
            default_max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_concurrent_checks: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Probe cadence for backends already marked unhealthy.
    pub recovery_interval_ms: u64,
    /// Consecutive probe failures before `healthy` flips to false.
    pub failure_threshold: u32,
    /// Consecutive probe successes before `healthy` flips back.
    pub success_threshold: u32,
    pub backoff_multiplier: f64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 15_000,
            timeout_ms: 5_000,
            max_concurrent_checks: 8,
            retry_attempts: 2,
            retry_delay_ms: 500,
            recovery_interval_ms: 30_000,
            failure_threshold: 3,
            success_threshold: 2,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsSettings {
    pub enabled: bool,
    pub prometheus_enabled: bool,
    pub prometheus_port: u16,
    /// Retention for persisted history: pairs idle longer than this are
    /// dropped when `metrics.json` is written.
    pub history_window_minutes: u64,
    /// Recent-latency ring capacity per pair.
    pub ring_capacity: usize,
    /// Cadence of the periodic flush of `metrics.json`.
    pub flush_interval_ms: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_enabled: false,
            prometheus_port: 9090,
            history_window_minutes: 24 * 60,
            ring_capacity: crate::metrics::DEFAULT_RING_CAP,
            flush_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingSettings {
    pub enabled: bool,
    pub max_concurrent_streams: u32,
    pub buffer_size: usize,
    /// Keep listening to a client-abandoned upstream to learn its true
    /// response time.
    pub background_tracking: bool,
    pub background_listen_ms: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_streams: 256,
            buffer_size: 16 * 1024,
            background_tracking: true,
            background_listen_ms: 30 * 60 * 1000,
        }
    }
}

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub enable_queue: bool,
    pub enable_circuit_breaker: bool,
    pub enable_metrics: bool,
    pub enable_streaming: bool,
    pub enable_persistence: bool,
    pub enable_auth: bool,

    pub queue: QueueConfig,
    pub load_balancer: BalancerConfig,
    pub circuit_breaker: BreakerConfig,
    pub retry: RetrySettings,
    pub cooldown: CooldownSettings,
    pub health_check: HealthCheckSettings,
    pub metrics: MetricsSettings,
    pub streaming: StreamingSettings,
    pub timeouts: TimeoutConfig,

    /// Directory for persisted state files.
    pub persistence_path: PathBuf,
    pub max_backups: usize,
    /// Live reload cadence; 0 disables.
    pub config_reload_interval_ms: u64,
    /// Grace period for draining in-flight work on shutdown.
    pub shutdown_grace_ms: u64,

    /// Bearer token for control-plane routes when `enable_auth` is set.
    /// Overridable via `FLEETGATE_CONTROL_TOKEN`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11440,
            enable_queue: true,
            enable_circuit_breaker: true,
            enable_metrics: true,
            enable_streaming: true,
            enable_persistence: true,
            enable_auth: false,
            queue: QueueConfig::default(),
            load_balancer: BalancerConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            retry: RetrySettings::default(),
            cooldown: CooldownSettings::default(),
            health_check: HealthCheckSettings::default(),
            metrics: MetricsSettings::default(),
            streaming: StreamingSettings::default(),
            timeouts: TimeoutConfig::default(),
            persistence_path: PathBuf::from("./data"),
            max_backups: 3,
            config_reload_interval_ms: 0,
            shutdown_grace_ms: 15_000,
            control_plane_token: None,
        }
    }
}

/// Tolerance for the load-balancer weight sum.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

impl Config {
    /// Load the configuration: JSON file if `FLEETGATE_CONFIG` names one,
    /// defaults otherwise, then environment overrides for the socket.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FLEETGATE_CONFIG") {
            Ok(path) => Self::from_file(PathBuf::from(path))?,
            Err(_) => Self::default(),
        };

        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::InvalidValue("PORT".into(), format!("{e}")))?;
        }
        if let Ok(token) = std::env::var("FLEETGATE_CONTROL_TOKEN") {
            if !token.trim().is_empty() {
                config.control_plane_token = Some(token);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, msg: String| ConfigError::InvalidValue(field.into(), msg);

        if self.port == 0 {
            return Err(invalid("port", "must be non-zero".into()));
        }

        let weight_sum = self.load_balancer.weights.sum();
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(invalid(
                "loadBalancer.weights",
                format!("must sum to 1.0 ± {WEIGHT_SUM_TOLERANCE}, got {weight_sum}"),
            ));
        }

        let cb = &self.circuit_breaker;
        if cb.error_rate_smoothing <= 0.0 || cb.error_rate_smoothing >= 1.0 {
            return Err(invalid(
                "circuitBreaker.errorRateSmoothing",
                format!("must be in (0, 1), got {}", cb.error_rate_smoothing),
            ));
        }
        if cb.min_failure_threshold > cb.base_failure_threshold
            || cb.base_failure_threshold > cb.max_failure_threshold
        {
            return Err(invalid(
                "circuitBreaker.failureThreshold",
                format!(
                    "expected min ≤ base ≤ max, got {} / {} / {}",
                    cb.min_failure_threshold, cb.base_failure_threshold, cb.max_failure_threshold
                ),
            ));
        }
        if cb.half_open_max_requests == 0 {
            return Err(invalid(
                "circuitBreaker.halfOpenMaxRequests",
                "must be at least 1".into(),
            ));
        }
        if cb.recovery_success_threshold == 0 {
            return Err(invalid(
                "circuitBreaker.recoverySuccessThreshold",
                "must be at least 1".into(),
            ));
        }

        if self.queue.max_size == 0 {
            return Err(invalid("queue.maxSize", "must be at least 1".into()));
        }

        let t = &self.timeouts;
        if t.min_timeout_ms >= t.max_timeout_ms {
            return Err(invalid(
                "timeouts",
                format!(
                    "minTimeout ({}) must be below maxTimeout ({})",
                    t.min_timeout_ms, t.max_timeout_ms
                ),
            ));
        }
        if t.streaming_multiplier < 1.0 {
            return Err(invalid(
                "timeouts.streamingMultiplier",
                "must be at least 1.0".into(),
            ));
        }

        if self.enable_auth
            && self
                .control_plane_token
                .as_deref()
                .map(str::trim)
                .map_or(true, str::is_empty)
        {
            return Err(invalid(
                "controlPlaneToken",
                "required when enableAuth is set".into(),
            ));
        }

        Ok(())
    }
}

/// Read-mostly shared configuration, swapped atomically on reload.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub async fn get(&self) -> Arc<Config> {
        self.inner.read().await.clone()
    }

    pub async fn swap(&self, config: Config) {
        *self.inner.write().await = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn weight_sum_is_enforced() {
        let mut config = Config::default();
        config.load_balancer.weights.latency = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loadBalancer.weights"));
    }

    #[test]
    fn weight_sum_tolerance_is_loose_enough() {
        let mut config = Config::default();
        config.load_balancer.weights.latency += 0.0005;
        config.validate().unwrap();
    }

    #[test]
    fn threshold_ordering_is_enforced() {
        let mut config = Config::default();
        config.circuit_breaker.min_failure_threshold = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn smoothing_factor_bounds() {
        let mut config = Config::default();
        config.circuit_breaker.error_rate_smoothing = 1.0;
        assert!(config.validate().is_err());
        config.circuit_breaker.error_rate_smoothing = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn auth_requires_token() {
        let mut config = Config::default();
        config.enable_auth = true;
        assert!(config.validate().is_err());
        config.control_plane_token = Some("secret".into());
        config.validate().unwrap();
    }

    #[test]
    fn timeout_bounds_ordering() {
        let mut config = Config::default();
        config.timeouts.min_timeout_ms = config.timeouts.max_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::default();
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.port, config.port);
        assert_eq!(loaded.queue.max_size, config.queue.max_size);
    }

    #[test]
    fn unknown_file_is_an_io_error() {
        let err = Config::from_file(PathBuf::from("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
