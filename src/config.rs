//! Configuration management for crabrig
//!
//! One explicit configuration struct, loaded from TOML and validated before
//! any component is built from it. Every section falls back to defaults, so a
//! partial file only needs the keys it changes.

use crate::errors::RigError;
use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub discovery: DiscoveryConfig,
    pub buffer: BufferConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

/// Enumeration, probing and hotplug settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Interval between enumeration rounds; 0 disables the background loop
    pub poll_interval_ms: u64,
    /// Age after which cached capabilities are re-probed
    pub refresh_interval_secs: u64,
    /// Trust an existing cache entry and skip probing entirely
    pub prefer_cache: bool,
    /// First retry delay after a failed probe
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay
    pub backoff_cap_ms: u64,
    /// Consecutive probe failures before probing is disabled
    pub disable_after_failures: u32,
    /// Hold `device_lost` for idle devices this long to absorb flapping
    pub ignore_flapping_threshold_ms: u64,
    pub probe_timeout_ms: u64,
    pub enumerate_timeout_ms: u64,
}

/// Frame buffer sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Preview buffer capacity (overwrite policy)
    pub capacity: usize,
    /// Recording buffer capacity (reject policy)
    pub record_capacity: usize,
}

/// Runtime and protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bounded wait for tasks to stop before they are aborted
    pub grace_period_ms: u64,
    /// Registry calls taking longer than this answer `busy`
    pub command_timeout_ms: u64,
    /// Backends to enumerate
    pub backends: Vec<BackendKind>,
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_directory: PathBuf,
    pub recording_directory: PathBuf,
    pub snapshot_directory: PathBuf,
}

/// Periodic telemetry on the status stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            refresh_interval_secs: 24 * 60 * 60,
            prefer_cache: false,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60_000,
            disable_after_failures: 3,
            ignore_flapping_threshold_ms: 1500,
            probe_timeout_ms: 5000,
            enumerate_timeout_ms: 3000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            record_capacity: 32,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 3000,
            command_timeout_ms: 2000,
            backends: vec![BackendKind::Usb],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_directory: PathBuf::from("./cache"),
            recording_directory: PathBuf::from("./recordings"),
            snapshot_directory: PathBuf::from("./snapshots"),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
        }
    }
}

impl DiscoveryConfig {
    /// `None` when the background enumeration loop is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn flapping_threshold(&self) -> Duration {
        Duration::from_millis(self.ignore_flapping_threshold_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn enumerate_timeout(&self) -> Duration {
        Duration::from_millis(self.enumerate_timeout_ms)
    }
}

impl RuntimeConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl TelemetryConfig {
    /// `None` when telemetry is switched off.
    pub fn interval(&self) -> Option<Duration> {
        (self.enabled && self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

impl RigConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| RigError::Config(format!("Failed to read config file: {}", e)))?;

        let config: RigConfig = toml::from_str(&contents)
            .map_err(|e| RigError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RigError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| RigError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| RigError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabrig.toml")
    }

    /// Load and validate in one step
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, RigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), RigError> {
        let invalid = |msg: &str| Err(RigError::Config(msg.to_string()));

        let discovery = &self.discovery;
        if discovery.backoff_base_ms == 0 {
            return invalid("discovery.backoff_base_ms must be positive");
        }
        if discovery.backoff_cap_ms < discovery.backoff_base_ms {
            return invalid("discovery.backoff_cap_ms must not be below backoff_base_ms");
        }
        if discovery.disable_after_failures == 0 {
            return invalid("discovery.disable_after_failures must be at least 1");
        }
        if discovery.probe_timeout_ms == 0 || discovery.enumerate_timeout_ms == 0 {
            return invalid("discovery timeouts must be positive");
        }

        if self.buffer.capacity == 0 || self.buffer.capacity > 1024 {
            return invalid("buffer.capacity must be between 1 and 1024");
        }
        if self.buffer.record_capacity == 0 || self.buffer.record_capacity > 4096 {
            return invalid("buffer.record_capacity must be between 1 and 4096");
        }

        if self.runtime.grace_period_ms == 0 {
            return invalid("runtime.grace_period_ms must be positive");
        }
        if self.runtime.command_timeout_ms == 0 {
            return invalid("runtime.command_timeout_ms must be positive");
        }
        if self.runtime.backends.is_empty() {
            return invalid("runtime.backends must name at least one backend");
        }

        if self.telemetry.enabled && self.telemetry.interval_ms < 100 {
            return invalid("telemetry.interval_ms must be at least 100");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RigConfig::default();
        assert_eq!(config.buffer.capacity, 8);
        assert_eq!(config.discovery.disable_after_failures, 3);
        assert_eq!(config.runtime.backends, vec![BackendKind::Usb]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut bad_buffer = RigConfig::default();
        bad_buffer.buffer.capacity = 0;
        assert!(bad_buffer.validate().is_err());

        let mut bad_backoff = RigConfig::default();
        bad_backoff.discovery.backoff_cap_ms = 10;
        assert!(bad_backoff.validate().is_err());

        let mut no_backends = RigConfig::default();
        no_backends.runtime.backends.clear();
        assert!(no_backends.validate().is_err());

        let mut quiet = RigConfig::default();
        quiet.telemetry.enabled = false;
        quiet.telemetry.interval_ms = 0;
        assert!(quiet.validate().is_ok());
        assert_eq!(quiet.telemetry.interval(), None);
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nested").join("crabrig.toml");

        let mut config = RigConfig::default();
        config.discovery.prefer_cache = true;
        config.runtime.backends = vec![BackendKind::Mock, BackendKind::Csi];
        config.save_to_file(&config_path).unwrap();

        let loaded = RigConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: RigConfig = toml::from_str(
            r#"
            [buffer]
            capacity = 4

            [runtime]
            backends = ["mock"]
            "#,
        )
        .unwrap();
        assert_eq!(config.buffer.capacity, 4);
        assert_eq!(config.buffer.record_capacity, 32);
        assert_eq!(config.runtime.backends, vec![BackendKind::Mock]);
        assert_eq!(config.runtime.grace_period_ms, 3000);
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = toml::to_string_pretty(&RigConfig::default()).unwrap();
        assert!(toml_string.contains("[discovery]"));
        assert!(toml_string.contains("[buffer]"));
        assert!(toml_string.contains("[runtime]"));
        assert!(toml_string.contains("[storage]"));
        assert!(toml_string.contains("ignore_flapping_threshold_ms"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = RigConfig::load_from_file("nonexistent_file.toml");
        assert_eq!(result.unwrap().buffer.capacity, 8);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[buffer\ncapacity = ").unwrap();
        assert!(matches!(RigConfig::load_from_file(&path), Err(RigError::Config(_))));
    }

    #[test]
    fn test_durations() {
        let mut config = RigConfig::default();
        assert_eq!(config.discovery.poll_interval(), Some(Duration::from_secs(2)));
        config.discovery.poll_interval_ms = 0;
        assert_eq!(config.discovery.poll_interval(), None);
        assert_eq!(config.runtime.grace_period(), Duration::from_secs(3));
    }
}
