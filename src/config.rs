//! Transport configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{MAX_BUFFERS, MAX_MAILBOXES};
use crate::port::PortRole;

/// Default configuration constants
///
/// Every default used by [`TransportConfig`] is collected here.
pub mod defaults {
    use crate::port::PortRole;

    // Ports
    /// Buffers per port when a port set does not say otherwise
    pub const BUFFER_COUNT: usize = 2;

    /// Data capacity of one buffer: 64KB
    pub const BUFFER_SIZE: usize = 64 * 1024;

    /// Output ports move data unless negotiated otherwise
    pub const PRODUCER_ROLE: PortRole = PortRole::ActiveMessage;

    /// Input ports send flow-control feedback unless negotiated otherwise
    pub const CONSUMER_ROLE: PortRole = PortRole::ActiveFlowControl;

    // Endpoints
    /// Protocol used for endpoints allocated without an explicit protocol
    pub const fn default_protocol() -> &'static str {
        "local"
    }

    /// Endpoint region size: 16MB
    pub const REGION_SIZE: usize = 16 * 1024 * 1024;

    /// Mailboxes per endpoint namespace
    pub const MAX_MAILBOXES: u32 = 64;

    // Dispatch
    /// Sleep granularity of `wait` in polling mode
    pub const POLL_INTERVAL_US: u64 = 100;

    // Log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// How a participant learns that dispatch has work to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// The caller re-polls; `wait` sleeps for the poll interval
    Polling,
    /// State changes signal a condition variable that `wait` blocks on
    Event,
}

/// Top-level transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub ports: PortConfig,

    #[serde(default)]
    pub endpoints: EndpointConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Polling or event-driven progress
    #[serde(default = "default_dispatch_mode")]
    pub mode: DispatchMode,

    /// Poll interval in microseconds (polling mode only)
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
}

fn default_dispatch_mode() -> DispatchMode {
    DispatchMode::Polling
}

fn default_poll_interval_us() -> u64 {
    defaults::POLL_INTERVAL_US
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: default_dispatch_mode(),
            poll_interval_us: default_poll_interval_us(),
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

/// Defaults applied to port sets that leave geometry or roles unspecified
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Data capacity of each buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_producer_role")]
    pub producer_role: PortRole,

    #[serde(default = "default_consumer_role")]
    pub consumer_role: PortRole,
}

fn default_buffer_count() -> usize {
    defaults::BUFFER_COUNT
}

fn default_buffer_size() -> usize {
    defaults::BUFFER_SIZE
}

fn default_producer_role() -> PortRole {
    defaults::PRODUCER_ROLE
}

fn default_consumer_role() -> PortRole {
    defaults::CONSUMER_ROLE
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            buffer_size: default_buffer_size(),
            producer_role: default_producer_role(),
            consumer_role: default_consumer_role(),
        }
    }
}

/// Endpoint allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Protocol used by `Transport::allocate_endpoint` and
    /// `Transport::local_endpoint` when the caller names none
    #[serde(default = "default_protocol")]
    pub default_protocol: String,

    /// Size of each locally allocated endpoint region in bytes
    #[serde(default = "default_region_size")]
    pub region_size: usize,

    #[serde(default = "default_max_mailboxes")]
    pub max_mailboxes: u32,
}

fn default_protocol() -> String {
    defaults::default_protocol().to_string()
}

fn default_region_size() -> usize {
    defaults::REGION_SIZE
}

fn default_max_mailboxes() -> u32 {
    defaults::MAX_MAILBOXES
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            default_protocol: default_protocol(),
            region_size: default_region_size(),
            max_mailboxes: default_max_mailboxes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Prefix each line with the emitting thread's name
    #[serde(default = "default_thread_names")]
    pub thread_names: bool,
}

fn default_thread_names() -> bool {
    true
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            thread_names: default_thread_names(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            ports: PortConfig::default(),
            endpoints: EndpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        let config: TransportConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.buffer_count == 0 || self.ports.buffer_count > MAX_BUFFERS {
            return Err(ConfigError::ValidationError(format!(
                "Buffer count must be between 1 and {}",
                MAX_BUFFERS
            )));
        }

        if self.ports.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "Buffer size must be non-zero".to_string(),
            ));
        }

        if self.endpoints.default_protocol.is_empty() {
            return Err(ConfigError::ValidationError(
                "Default protocol cannot be empty".to_string(),
            ));
        }

        if self.endpoints.region_size == 0 {
            return Err(ConfigError::ValidationError(
                "Region size must be non-zero".to_string(),
            ));
        }

        if self.endpoints.max_mailboxes == 0 || self.endpoints.max_mailboxes > MAX_MAILBOXES {
            return Err(ConfigError::ValidationError(format!(
                "max_mailboxes must be between 1 and {}",
                MAX_MAILBOXES
            )));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
