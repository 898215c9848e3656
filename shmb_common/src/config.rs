//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for the broker and for client processes that need to locate it.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shmb_common::config::{BrokerConfig, ConfigError, ConfigLoader};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = BrokerConfig::load(Path::new("shmb.toml"))?.with_env_overrides()?;
//!     config.validate()?;
//!     println!("Broker address: {}", config.address);
//!     Ok(())
//! }
//! ```

use crate::consts::{BROKER_ADDR_ENV, DEFAULT_BROKER_PORT, DEFAULT_READY_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared by every SHMB process.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "shmb-broker-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "shmb".to_string()
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Broker and broker-client configuration.
///
/// # TOML Example
///
/// ```toml
/// address = "127.0.0.1:25979"
/// ready_timeout_ms = 5000
///
/// [shared]
/// log_level = "debug"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Common fields.
    #[serde(default)]
    pub shared: SharedConfig,

    /// Well-known control address of the broker.
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// How long `ensure_running` waits for a spawned broker's readiness line.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

/// Well-known broker address on the loopback interface.
pub fn default_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BROKER_PORT))
}

fn default_ready_timeout_ms() -> u64 {
    DEFAULT_READY_TIMEOUT_MS
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig::default(),
            address: default_address(),
            ready_timeout_ms: default_ready_timeout_ms(),
        }
    }
}

impl BrokerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - the shared section is invalid
    /// - `ready_timeout_ms` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ready_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Readiness timeout as a `Duration`.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Apply the `SHMB_ADDRESS` environment override, if set.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        match std::env::var(BROKER_ADDR_ENV) {
            Ok(value) => self.with_address_override(&value),
            Err(_) => Ok(self),
        }
    }

    fn with_address_override(mut self, value: &str) -> Result<Self, ConfigError> {
        self.address = value.parse().map_err(|e| {
            ConfigError::ValidationError(format!("{BROKER_ADDR_ENV}={value:?}: {e}"))
        })?;
        Ok(self)
    }

    /// Load from `path` when given, otherwise start from defaults; the
    /// environment override is applied in both cases.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any serde-deserializable struct can be loaded from TOML.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
