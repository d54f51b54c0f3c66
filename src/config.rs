//! Configuration management for the logging socket service.
//!
//! Settings are layered with figment, lowest precedence first:
//!
//! 1. compiled defaults
//! 2. a TOML configuration file (if it exists)
//! 3. environment variables prefixed with `AESD_`, nested keys split on `__`
//!    (for example `AESD_LISTEN__PORT=9100`)

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "AESD_";

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level logging (most verbose)
    Trace,
    /// Debug level logging
    Debug,
    /// Info level logging (default)
    #[default]
    Info,
    /// Warning level logging
    Warn,
    /// Error level logging
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Logging level
    pub level: LogLevel,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Enable colored output (ignored for JSON logs)
    pub color: bool,
    /// Append records to this file instead of stdout
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Check if JSON logging is enabled.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        self.json
    }

    /// Check if colored logging is enabled. Escape sequences are never
    /// written to JSON output or to a file.
    #[must_use]
    pub const fn is_colored(&self) -> bool {
        self.color && !self.json && self.file.is_none()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            color: true,
            file: None,
        }
    }
}

/// Listening endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address to bind
    pub address: IpAddr,
    /// TCP port to bind; 0 picks an ephemeral port
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::DEFAULT_PORT,
        }
    }
}

/// Log store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backing file for the shared log
    pub data_file: PathBuf,
    /// Sync file data to disk after every append
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from(crate::DEFAULT_DATA_FILE),
            sync_writes: true,
        }
    }
}

/// Per-connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Initial capacity of the receive buffer in bytes
    pub initial_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: crate::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Timestamp task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// Run the timestamp task
    pub enabled: bool,
    /// Period between timestamp records in milliseconds
    pub interval_ms: u64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Abort connection handlers still running this long after shutdown
    /// starts. `None` waits for every handler to finish on its own.
    pub drain_timeout_ms: Option<u64>,
}

/// Main service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name, used in log records
    pub name: String,
    /// Listening endpoint
    pub listen: ListenConfig,
    /// Log store
    pub storage: StorageConfig,
    /// Connection handling
    pub connection: ConnectionConfig,
    /// Timestamp task
    pub timestamp: TimestampConfig,
    /// Shutdown behaviour
    pub shutdown: ShutdownConfig,
    /// Logging configuration
    pub logging: LogConfig,
    /// PID file location
    pub pid_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::from("aesdsocket"),
            listen: ListenConfig::default(),
            storage: StorageConfig::default(),
            connection: ConnectionConfig::default(),
            timestamp: TimestampConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LogConfig::default(),
            pid_file: None,
        }
    }
}

impl Config {
    /// Create a new config with defaults.
    ///
    /// # Errors
    ///
    /// Will return an error if the default configuration validation fails.
    pub fn new() -> Result<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default file, the environment and defaults.
    ///
    /// # Errors
    ///
    /// Will return an error if a source contains invalid configuration data.
    pub fn load() -> Result<Self> {
        Self::load_from_file(crate::DEFAULT_CONFIG_FILE)
    }

    /// Load config from a file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Will return an error if the file cannot be parsed or the merged
    /// configuration is invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address the service listens on.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen.address, self.listen.port)
    }

    /// Get the timestamp period as a Duration.
    #[must_use]
    pub const fn timestamp_interval(&self) -> Duration {
        Duration::from_millis(self.timestamp.interval_ms)
    }

    /// Get the handler drain timeout as a Duration.
    #[must_use]
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.shutdown.drain_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Service name cannot be empty"));
        }

        if self.connection.initial_buffer_size == 0 {
            return Err(Error::config(
                "Initial receive buffer size must be greater than 0",
            ));
        }

        if self.timestamp.enabled && self.timestamp.interval_ms == 0 {
            return Err(Error::config(
                "Timestamp interval must be greater than 0 when timestamps are enabled",
            ));
        }

        if self.shutdown.drain_timeout_ms == Some(0) {
            return Err(Error::config("Drain timeout must be greater than 0"));
        }

        check_parent_exists("Data file", &self.storage.data_file)?;
        if let Some(ref pid_file) = self.pid_file {
            check_parent_exists("PID file", pid_file)?;
        }
        if let Some(ref log_file) = self.logging.file {
            check_parent_exists("Log file", log_file)?;
        }

        Ok(())
    }

    /// Create a builder for this configuration.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

fn check_parent_exists(what: &str, path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => Err(Error::config(
            format!("{what} directory does not exist: {}", parent.display()),
        )),
        _ => Ok(()),
    }
}

/// Builder for creating configurations programmatically.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service name.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the address to bind.
    #[must_use]
    pub const fn address(mut self, address: IpAddr) -> Self {
        self.config.listen.address = address;
        self
    }

    /// Set the TCP port to bind.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.listen.port = port;
        self
    }

    /// Set the log store backing file.
    #[must_use]
    pub fn data_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.storage.data_file = path.into();
        self
    }

    /// Enable or disable syncing file data after every append.
    #[must_use]
    pub const fn sync_writes(mut self, enabled: bool) -> Self {
        self.config.storage.sync_writes = enabled;
        self
    }

    /// Set the initial receive buffer capacity.
    #[must_use]
    pub const fn initial_buffer_size(mut self, size: usize) -> Self {
        self.config.connection.initial_buffer_size = size;
        self
    }

    /// Set the timestamp period.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn timestamp_interval(mut self, interval: Duration) -> Result<Self> {
        self.config.timestamp.interval_ms = u64::try_from(interval.as_millis())
            .map_err(|_| Error::config("Timestamp interval too large"))?;
        Ok(self)
    }

    /// Enable or disable the timestamp task.
    #[must_use]
    pub const fn timestamps(mut self, enabled: bool) -> Self {
        self.config.timestamp.enabled = enabled;
        self
    }

    /// Set the handler drain timeout applied during shutdown.
    ///
    /// # Errors
    ///
    /// Will return an error if the duration exceeds `u64::MAX` milliseconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.config.shutdown.drain_timeout_ms = Some(
            u64::try_from(timeout.as_millis())
                .map_err(|_| Error::config("Drain timeout too large"))?,
        );
        Ok(self)
    }

    /// Set the log level.
    #[must_use]
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.config.logging.level = level;
        self
    }

    /// Enable JSON logging.
    #[must_use]
    pub const fn json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    /// Write log records to a file.
    #[must_use]
    pub fn log_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.logging.file = Some(path.into());
        self
    }

    /// Set the PID file location.
    #[must_use]
    pub fn pid_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.pid_file = Some(path.into());
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Will return an error if the resulting configuration is invalid.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.name, "aesdsocket");
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.storage.data_file, PathBuf::from("/var/tmp/aesdsocketdata"));
        assert_eq!(config.connection.initial_buffer_size, 1024);
        assert_eq!(config.timestamp_interval(), Duration::from_secs(10));
        assert!(config.drain_timeout().is_none());
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .name("test-service")
            .port(0)
            .data_file("log.dat")
            .initial_buffer_size(16)
            .timestamp_interval(Duration::from_millis(250))
            .unwrap()
            .drain_timeout(Duration::from_secs(2))
            .unwrap()
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.name, "test-service");
        assert_eq!(config.listen.port, 0);
        assert_eq!(config.connection.initial_buffer_size, 16);
        assert_eq!(config.timestamp.interval_ms, 250);
        assert_eq!(config.drain_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.storage.data_file = PathBuf::from("data");
        config.connection.initial_buffer_size = 0;
        assert!(config.validate().is_err());

        config.connection.initial_buffer_size = 1024;
        config.timestamp.interval_ms = 0;
        assert!(config.validate().is_err());

        config.timestamp.enabled = false;
        assert!(config.validate().is_ok());

        config.shutdown.drain_timeout_ms = Some(0);
        assert!(config.validate().is_err());

        config.shutdown.drain_timeout_ms = None;
        config.storage.data_file = PathBuf::from("/definitely/not/a/dir/data");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "aesdsocket.toml",
                r#"
                    name = "from-file"

                    [listen]
                    port = 9100

                    [storage]
                    data_file = "data"

                    [timestamp]
                    interval_ms = 500
                "#,
            )?;
            jail.set_env("AESD_LISTEN__PORT", "9200");

            let config = Config::load_from_file("aesdsocket.toml").expect("config loads");
            assert_eq!(config.name, "from-file");
            assert_eq!(config.listen.port, 9200);
            assert_eq!(config.timestamp.interval_ms, 500);
            Ok(())
        });
    }

    #[test]
    fn test_log_output_selection() {
        let dir = tempfile::tempdir().expect("Failed to create temporary directory");

        let config = Config::builder().data_file("data").build().unwrap();
        assert!(!config.logging.is_json());
        assert!(config.logging.is_colored());

        let config = Config::builder()
            .data_file("data")
            .log_file(dir.path().join("service.log"))
            .build()
            .unwrap();
        assert!(!config.logging.is_colored());

        let config = Config::builder()
            .data_file("data")
            .json_logging(true)
            .build()
            .unwrap();
        assert!(config.logging.is_json());
        assert!(!config.logging.is_colored());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Info), tracing::Level::INFO);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    }
}
