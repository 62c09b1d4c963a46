//! Configuration loading for chunkflow
//!
//! Bootstrap configuration comes from a TOML file. Every field has a built-in
//! default, so a missing file (or missing section) never prevents startup.
//!
//! Config file resolution order:
//! 1. Explicit path passed by the embedding application
//! 2. `CHUNKFLOW_CONFIG` environment variable
//! 3. Platform config directory (`~/.config/chunkflow/config.toml` on Linux)
//! 4. Built-in defaults

use crate::types::PriorityClass;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "CHUNKFLOW_CONFIG";

const MIB: usize = 1024 * 1024;

/// Complete stream configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StreamConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tier capacities and optional persistent cold store
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_hot_entries")]
    pub hot_entries: usize,
    #[serde(default = "default_warm_entries")]
    pub warm_entries: usize,
    #[serde(default = "default_cold_entries")]
    pub cold_entries: usize,
    #[serde(default = "default_hot_max_bytes")]
    pub hot_max_bytes: usize,
    #[serde(default = "default_warm_max_bytes")]
    pub warm_max_bytes: usize,
    #[serde(default = "default_cold_max_bytes")]
    pub cold_max_bytes: usize,

    /// Directory for the persistent cold tier (memory-only if unset)
    #[serde(default)]
    pub cold_store_dir: Option<PathBuf>,
}

fn default_hot_entries() -> usize {
    16
}
fn default_warm_entries() -> usize {
    128
}
fn default_cold_entries() -> usize {
    1024
}
fn default_hot_max_bytes() -> usize {
    16 * MIB
}
fn default_warm_max_bytes() -> usize {
    128 * MIB
}
fn default_cold_max_bytes() -> usize {
    512 * MIB
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_entries: default_hot_entries(),
            warm_entries: default_warm_entries(),
            cold_entries: default_cold_entries(),
            hot_max_bytes: default_hot_max_bytes(),
            warm_max_bytes: default_warm_max_bytes(),
            cold_max_bytes: default_cold_max_bytes(),
            cold_store_dir: None,
        }
    }
}

/// Worker pool sizing and tiered deadlines
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent fetch+enhance tasks
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_critical_timeout_ms")]
    pub critical_timeout_ms: u64,
    #[serde(default = "default_high_timeout_ms")]
    pub high_timeout_ms: u64,
    #[serde(default = "default_normal_timeout_ms")]
    pub normal_timeout_ms: u64,
    #[serde(default = "default_background_timeout_ms")]
    pub background_timeout_ms: u64,

    /// Extra attempts after a DecodeFailure
    #[serde(default = "default_decode_retries")]
    pub decode_retries: u32,
}

fn default_pool_size() -> usize {
    4
}
fn default_critical_timeout_ms() -> u64 {
    1500
}
fn default_high_timeout_ms() -> u64 {
    3000
}
fn default_normal_timeout_ms() -> u64 {
    8000
}
fn default_background_timeout_ms() -> u64 {
    20000
}
fn default_decode_retries() -> u32 {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            critical_timeout_ms: default_critical_timeout_ms(),
            high_timeout_ms: default_high_timeout_ms(),
            normal_timeout_ms: default_normal_timeout_ms(),
            background_timeout_ms: default_background_timeout_ms(),
            decode_retries: default_decode_retries(),
        }
    }
}

impl WorkerConfig {
    /// Deadline for a task of the given priority class
    pub fn timeout_for(&self, class: PriorityClass) -> Duration {
        let ms = match class {
            PriorityClass::Critical => self.critical_timeout_ms,
            PriorityClass::High => self.high_timeout_ms,
            PriorityClass::Normal => self.normal_timeout_ms,
            PriorityClass::Background => self.background_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Interaction shaping windows
#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_throttle_interval_ms")]
    pub throttle_interval_ms: u64,
    #[serde(default = "default_debounce_quiet_ms")]
    pub debounce_quiet_ms: u64,
    /// Events per second at or above which input counts as a burst
    #[serde(default = "default_rapid_threshold_per_sec")]
    pub rapid_threshold_per_sec: u32,
    #[serde(default = "default_rapid_window_ms")]
    pub rapid_window_ms: u64,
}

fn default_throttle_interval_ms() -> u64 {
    100
}
fn default_debounce_quiet_ms() -> u64 {
    500
}
fn default_rapid_threshold_per_sec() -> u32 {
    10
}
fn default_rapid_window_ms() -> u64 {
    1000
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: default_throttle_interval_ms(),
            debounce_quiet_ms: default_debounce_quiet_ms(),
            rapid_threshold_per_sec: default_rapid_threshold_per_sec(),
            rapid_window_ms: default_rapid_window_ms(),
        }
    }
}

/// Coordinator behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Chunks on each side of a seek target / preset working set
    #[serde(default = "default_neighbor_radius")]
    pub neighbor_radius: u32,
    /// Chunks after the audible one queued on playback advance
    #[serde(default = "default_lookahead_chunks")]
    pub lookahead_chunks: u32,
    #[serde(default = "default_seek_wait_timeout_ms")]
    pub seek_wait_timeout_ms: u64,
    /// Fallback readiness check interval while a seek waits
    #[serde(default = "default_ready_check_interval_ms")]
    pub ready_check_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_neighbor_radius() -> u32 {
    1
}
fn default_lookahead_chunks() -> u32 {
    1
}
fn default_seek_wait_timeout_ms() -> u64 {
    5000
}
fn default_ready_check_interval_ms() -> u64 {
    20
}
fn default_event_capacity() -> usize {
    256
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            neighbor_radius: default_neighbor_radius(),
            lookahead_chunks: default_lookahead_chunks(),
            seek_wait_timeout_ms: default_seek_wait_timeout_ms(),
            ready_check_interval_ms: default_ready_check_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl StreamConfig {
    /// Load configuration following the resolution order in the module docs
    ///
    /// A file that cannot be found falls back to defaults with a warning.
    /// A file that exists but does not parse is an error.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match resolve_config_path(explicit_path) {
            Some(path) => path,
            None => {
                info!("No chunkflow config file found, using built-in defaults");
                return Ok(Self::default());
            }
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                info!("Loaded chunkflow config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Config file {} not found, using built-in defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StreamConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.hot_entries == 0 || cache.warm_entries == 0 || cache.cold_entries == 0 {
            return Err(Error::Config("tier entry capacities must be > 0".to_string()));
        }
        if cache.hot_max_bytes == 0 || cache.warm_max_bytes == 0 || cache.cold_max_bytes == 0 {
            return Err(Error::Config("tier byte budgets must be > 0".to_string()));
        }

        let worker = &self.worker;
        if worker.pool_size == 0 {
            return Err(Error::Config("worker.pool_size must be > 0".to_string()));
        }
        let deadlines = [
            worker.critical_timeout_ms,
            worker.high_timeout_ms,
            worker.normal_timeout_ms,
            worker.background_timeout_ms,
        ];
        if deadlines.iter().any(|ms| *ms == 0) {
            return Err(Error::Config("worker timeouts must be > 0".to_string()));
        }
        if deadlines.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Config(format!(
                "worker timeouts must not decrease from critical to background: {:?}",
                deadlines
            )));
        }

        if self.gate.rapid_threshold_per_sec == 0 || self.gate.rapid_window_ms == 0 {
            return Err(Error::Config(
                "gate rapid-interaction threshold and window must be > 0".to_string(),
            ));
        }
        if self.coordinator.event_capacity == 0 {
            return Err(Error::Config("coordinator.event_capacity must be > 0".to_string()));
        }
        if self.coordinator.ready_check_interval_ms == 0 {
            return Err(Error::Config(
                "coordinator.ready_check_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pick the config file to read, if any
fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path().filter(|p| p.exists())
}

/// Platform default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chunkflow").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.pool_size, 4);
        assert_eq!(config.gate.debounce_quiet_ms, 500);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = StreamConfig::from_toml_str(
            r#"
            [worker]
            pool_size = 2

            [cache]
            hot_entries = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.worker.critical_timeout_ms, 1500);
        assert_eq!(config.cache.hot_entries, 4);
        assert_eq!(config.cache.warm_entries, 128);
    }

    #[test]
    fn decreasing_timeouts_rejected() {
        let result = StreamConfig::from_toml_str(
            r#"
            [worker]
            critical_timeout_ms = 5000
            high_timeout_ms = 1000
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn zero_pool_rejected() {
        let mut config = StreamConfig::default();
        config.worker.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_tiers_follow_class() {
        let worker = WorkerConfig::default();
        assert!(
            worker.timeout_for(PriorityClass::Critical)
                < worker.timeout_for(PriorityClass::Background)
        );
        assert_eq!(
            worker.timeout_for(PriorityClass::High),
            Duration::from_millis(3000)
        );
    }
}
