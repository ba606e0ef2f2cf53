//! # Configuration Management
//!
//! Centralized configuration for the interception layer.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`CHANNEL_INTERCEPT_*`)
//!
//! ## Defaults
//! - The interception stage is named `packet_interceptor`
//! - Companion stages are compressor and decompressor stages
//! - `close()` waits at most 5 seconds for stage removal

use crate::error::{constants, InterceptError, Result};
use crate::transport::StageKind;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default name of the interception stage in every pipeline
pub const DEFAULT_STAGE_NAME: &str = "packet_interceptor";

/// Default name of the transport's own decoder stage
pub const DEFAULT_TRANSPORT_DECODER: &str = "decoder";

/// Default upper bound for `close()` to wait on stage removal
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct InterceptConfig {
    /// Interceptor settings
    #[serde(default)]
    pub interceptor: InterceptorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl InterceptConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| InterceptError::ConfigError(format!("{}: {e}", constants::ERR_CONFIG_OPEN)))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| InterceptError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| InterceptError::ConfigError(format!("{}: {e}", constants::ERR_CONFIG_PARSE)))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("CHANNEL_INTERCEPT_STAGE_NAME") {
            config.interceptor.stage_name = name;
        }

        if let Ok(decoder) = std::env::var("CHANNEL_INTERCEPT_TRANSPORT_DECODER") {
            config.interceptor.transport_decoder = decoder;
        }

        if let Ok(strict) = std::env::var("CHANNEL_INTERCEPT_STRICT_MONITOR") {
            if let Ok(val) = strict.parse::<bool>() {
                config.interceptor.strict_monitor = val;
            }
        }

        if let Ok(timeout) = std::env::var("CHANNEL_INTERCEPT_CLOSE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.interceptor.close_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(kinds) = std::env::var("CHANNEL_INTERCEPT_COMPANION_KINDS") {
            config.interceptor.companion_kinds = parse_kinds(&kinds)?;
        }

        if let Ok(level) = std::env::var("CHANNEL_INTERCEPT_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| InterceptError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| InterceptError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| InterceptError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.interceptor.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(InterceptError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Comma separated stage kinds, e.g. `compressor,decompressor`.
fn parse_kinds(value: &str) -> Result<Vec<StageKind>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<StageKind>().map_err(InterceptError::ConfigError))
        .collect()
}

/// Interceptor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Name the interception stage is installed under
    pub stage_name: String,

    /// Name of the transport's decoder stage, the anchor companion stages are
    /// inserted against
    pub transport_decoder: String,

    /// Stage kinds that must sit on the wire side of the interception stage
    pub companion_kinds: Vec<StageKind>,

    /// Fail the dispatch pass when a `Monitor` listener cancels a message
    pub strict_monitor: bool,

    /// Upper bound for `close()` to wait on stage removal
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,

    /// Drop closed connections from the hook whenever a new one is tracked
    pub prune_closed_on_push: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            stage_name: String::from(DEFAULT_STAGE_NAME),
            transport_decoder: String::from(DEFAULT_TRANSPORT_DECODER),
            companion_kinds: vec![StageKind::Compressor, StageKind::Decompressor],
            strict_monitor: false,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            prune_closed_on_push: true,
        }
    }
}

impl InterceptorConfig {
    /// Validate interceptor configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.stage_name.trim().is_empty() {
            errors.push("Stage name cannot be empty".to_string());
        }

        if self.transport_decoder.trim().is_empty() {
            errors.push("Transport decoder name cannot be empty".to_string());
        } else if self.transport_decoder == self.stage_name {
            errors.push(format!(
                "Transport decoder and interception stage share the name '{}'",
                self.stage_name
            ));
        }

        for (i, kind) in self.companion_kinds.iter().enumerate() {
            if matches!(kind, StageKind::Interceptor | StageKind::Decoder) {
                errors.push(format!("Stage kind '{kind}' cannot be a companion"));
            }
            if self.companion_kinds[..i].contains(kind) {
                errors.push(format!("Duplicate companion kind: '{kind}'"));
            }
        }

        if self.close_timeout.as_millis() < 10 {
            errors.push("Close timeout too short (minimum: 10ms)".to_string());
        } else if self.close_timeout.as_secs() > 300 {
            errors.push("Close timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("channel-intercept"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
