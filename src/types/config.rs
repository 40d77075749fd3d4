//! Configuration structures.
//!
//! Configuration is loaded from a JSON document and/or `OFFICE_*` environment
//! variables. It only tunes the kernel; the office graph itself is built with
//! [`OfficeBuilder`](crate::kernel::metadata::OfficeBuilder).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::{Error, Result};

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Asset monitor configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Team defaults.
    #[serde(default)]
    pub teams: TeamConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON configuration document. Missing sections use defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `OFFICE_SWEEP_INTERVAL_MS`,
    /// `OFFICE_SOURCING_TIMEOUT_MS`, `OFFICE_WORKER_CAPACITY` and
    /// `OFFICE_LOG_LEVEL`.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Some(ms) = env_u64("OFFICE_SWEEP_INTERVAL_MS")? {
            config.monitor.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("OFFICE_SOURCING_TIMEOUT_MS")? {
            config.monitor.default_sourcing_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = env_u64("OFFICE_WORKER_CAPACITY")? {
            config.teams.worker_capacity = capacity as usize;
        }
        if let Ok(level) = std::env::var("OFFICE_LOG_LEVEL") {
            config.observability.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.monitor.sweep_interval.is_zero() {
            return Err(Error::validation("monitor.sweep_interval must be non-zero"));
        }
        if self.teams.worker_capacity == 0 {
            return Err(Error::validation("teams.worker_capacity must be non-zero"));
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::validation(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

/// Asset monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often the background sweep checks waiters for expiry.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Sourcing timeout for managed objects that declare none.
    #[serde(with = "humantime_serde")]
    pub default_sourcing_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(100),
            default_sourcing_timeout: Duration::from_secs(30),
        }
    }
}

/// Team defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Maximum jobs a `WorkerTeam` runs concurrently before reporting overload.
    pub worker_capacity: usize,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            worker_capacity: 64,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
