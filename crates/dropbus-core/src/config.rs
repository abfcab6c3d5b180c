/*!
 * Configuration management for dropbus.
 *
 * Configuration is layered: built-in defaults, then an optional file, then
 * environment variables with a prefix.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Bytes taken by the announcement header (the sender's serial number)
pub const ANNOUNCEMENT_HEADER_SIZE: usize = 4;

/// Bytes taken by a driver info segment header
pub const SEGMENT_HEADER_SIZE: usize = 10;

/// Top-level dropbus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bus protocol configuration
    #[serde(default)]
    pub bus: BusConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to print the event target
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

/// Bus protocol configuration
///
/// Protocol timing is expressed in ticks; `tick_interval_ms` only decides
/// how long a tick lasts in wall-clock terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Interval between announcement ticks, in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Ticks an allocation stays uncertain, and ticks a remote may go unseen
    #[serde(default = "default_grace_ticks")]
    pub grace_ticks: u8,

    /// Maximum number of driver instances in the registry
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,

    /// Maximum number of filtered addresses
    #[serde(default = "default_filter_capacity")]
    pub filter_capacity: usize,

    /// Maximum announcement size in bytes, header included
    #[serde(default = "default_max_packet_payload")]
    pub max_packet_payload: usize,

    /// Maximum payload carried by one driver info segment
    #[serde(default = "default_max_segment_payload")]
    pub max_segment_payload: usize,

    /// Protocol version stamped on outgoing packets and required on inbound ones
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_with_target(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            grace_ticks: default_grace_ticks(),
            registry_capacity: default_registry_capacity(),
            filter_capacity: default_filter_capacity(),
            max_packet_payload: default_max_packet_payload(),
            max_segment_payload: default_max_segment_payload(),
            protocol_version: default_protocol_version(),
        }
    }
}

impl BusConfig {
    /// Wall-clock length of one tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check the configuration for values the protocol cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::config("bus.tick_interval_ms must be greater than zero"));
        }
        if self.grace_ticks == 0 || self.grace_ticks > 127 {
            return Err(Error::config("bus.grace_ticks must be between 1 and 127"));
        }
        if self.registry_capacity == 0 {
            return Err(Error::config("bus.registry_capacity must be greater than zero"));
        }
        if self.filter_capacity == 0 {
            return Err(Error::config("bus.filter_capacity must be greater than zero"));
        }
        if self.max_packet_payload < ANNOUNCEMENT_HEADER_SIZE + SEGMENT_HEADER_SIZE {
            return Err(Error::config(format!(
                "bus.max_packet_payload must hold at least one segment header ({} bytes)",
                ANNOUNCEMENT_HEADER_SIZE + SEGMENT_HEADER_SIZE
            )));
        }
        if self.max_segment_payload > u8::MAX as usize {
            return Err(Error::config("bus.max_segment_payload must fit in one byte"));
        }
        Ok(())
    }
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()
    }
}

fn default_app_name() -> String {
    "dropbus".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_grace_ticks() -> u8 {
    2
}

fn default_registry_capacity() -> usize {
    20
}

fn default_filter_capacity() -> usize {
    20
}

fn default_max_packet_payload() -> usize {
    255
}

fn default_max_segment_payload() -> usize {
    32
}

fn default_protocol_version() -> u8 {
    1
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut builder = ConfigLib::builder().add_source(defaults);

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "dropbus");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.bus.tick_interval_ms, 500);
        assert_eq!(config.bus.grace_ticks, 2);
        assert_eq!(config.bus.tick_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.bus, BusConfig::default());
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("dropbus.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                app_name = "bench-rig"

                [bus]
                tick_interval_ms = 250
                registry_capacity = 8
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.general.app_name, "bench-rig");
        assert_eq!(config.bus.tick_interval_ms, 250);
        assert_eq!(config.bus.registry_capacity, 8);
        assert_eq!(config.bus.filter_capacity, 20);

        Ok(())
    }

    #[test]
    fn test_config_builder_rejects_invalid_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("broken.toml");
        std::fs::write(&file_path, "[bus]\ntick_interval_ms = 0\n")?;

        let result = ConfigBuilder::new().with_config_file(file_path).build();
        assert!(matches!(result, Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn test_config_builder_missing_file_uses_defaults() -> Result<()> {
        let config = ConfigBuilder::new()
            .with_config_file("/nonexistent/dropbus.toml")
            .build()?;
        assert_eq!(config.bus.registry_capacity, 20);
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("DROPBUSTEST__BUS__TICK_INTERVAL_MS", "100");
        env::set_var("DROPBUSTEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("dropbustest")
            .build()?;

        assert_eq!(config.bus.tick_interval_ms, 100);
        assert_eq!(config.logging.level, "trace");

        env::remove_var("DROPBUSTEST__BUS__TICK_INTERVAL_MS");
        env::remove_var("DROPBUSTEST__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_validate_rejects_tiny_packets() {
        let bus = BusConfig {
            max_packet_payload: 8,
            ..BusConfig::default()
        };
        assert!(bus.validate().is_err());
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "dropbus");
    }
}
