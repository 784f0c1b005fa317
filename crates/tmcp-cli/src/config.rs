//! Configuration management for the tmcp CLI
//!
//! Configuration is stored in TOML format. The `[resolver]`, `[session]` and
//! `[registry]` tables are the bridge configuration; the rest belongs to the
//! CLI itself.
//!
//! # Configuration File Locations
//!
//! - Linux: `~/.config/tmcp/config.toml`
//! - macOS: `~/Library/Application Support/world.teaspoon.tmcp/config.toml`
//! - Windows: `%APPDATA%\teaspoon\tmcp\config\config.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tmcp_core::config::{BridgeConfig, RegistrySettings, ResolverConfig, SessionConfig};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// CLI configuration
///
/// # Example TOML
///
/// ```toml
/// [identity]
/// backend = "file"  # "file" | "sqlite"
/// path = ""         # Empty = default location
///
/// [resolver]
/// freshness_secs = 300
///
/// [session]
/// reorder_window = 64
/// handshake_timeout_ms = 10000
///
/// [registry]
/// did_publish_url = "https://did.teaspoon.world/add-vid"
///
/// [output]
/// format = "table"  # "table" | "json" | "quiet"
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identity store configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Resolver cache configuration
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Session timeouts and limits
    #[serde(default)]
    pub session: SessionConfig,

    /// DID registry endpoints
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Storage backend: "file" (JSON) or "sqlite"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Path to the identity store (empty = default location)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_backend() -> String {
    "file".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "table", "json", "quiet"
    #[serde(default = "default_format")]
    pub format: String,

    /// Verbose output
    #[serde(default)]
    pub verbose: bool,
}

fn default_format() -> String {
    "table".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            verbose: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("world", "teaspoon", "tmcp")
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        match custom_path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    /// Get default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path (for the identity store)
    pub fn data_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The bridge part of this configuration.
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            resolver: self.resolver.clone(),
            session: self.session.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Where the identity store lives: the configured path, or a file in
    /// the data directory named after the backend.
    pub fn identity_store_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.identity.path {
            if !path.as_os_str().is_empty() {
                return Some(path.clone());
            }
        }
        let file = match self.identity.backend.as_str() {
            "sqlite" => "identities.db",
            _ => "identities.json",
        };
        Self::data_dir().map(|dir| dir.join(file))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_formats = ["table", "json", "quiet"];
        if !valid_formats.contains(&self.output.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format '{}'. Valid values: {:?}",
                self.output.format, valid_formats
            )));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        let valid_backends = ["file", "sqlite"];
        if !valid_backends.contains(&self.identity.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid identity backend '{}'. Valid values: {:?}",
                self.identity.backend, valid_backends
            )));
        }

        if !self.registry.did_publish_url.starts_with("http://")
            && !self.registry.did_publish_url.starts_with("https://")
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid registry URL '{}': must start with http:// or https://",
                self.registry.did_publish_url
            )));
        }

        self.bridge()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.0))
    }

    /// Generate a sample configuration file content
    pub fn sample_toml() -> &'static str {
        r#"# tmcp configuration

[identity]
# Storage backend: "file" (JSON) or "sqlite"
backend = "file"
# Path to the identity store (empty = default location)
# path = ""

[resolver]
# Seconds a resolved peer document is served from cache
freshness_secs = 300

[session]
# Out-of-order envelopes held while waiting for a gap to fill
reorder_window = 64
handshake_timeout_ms = 10000
connect_timeout_ms = 10000
outbound_queue_depth = 256
max_payload_bytes = 1048576
shutdown_grace_ms = 5000

[registry]
did_publish_url = "https://did.teaspoon.world/add-vid"
did_publish_history_url = "https://did.teaspoon.world/add-history/{did}"
did_web_format = "did:web:did.teaspoon.world:endpoint:{name}"
client_placeholder_address = "tmcpclient://"

[output]
# Output format: "table", "json", "quiet"
format = "table"
verbose = false

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "warn"
"#
    }
}

/// CLI configuration overrides
///
/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Output format override
    pub output_format: Option<String>,
    /// Verbose flag override
    pub verbose: Option<bool>,
    /// Debug flag override
    pub debug: Option<bool>,
    /// Identity store path override
    pub identity_path: Option<PathBuf>,
    /// Registry publish URL override
    pub registry_url: Option<String>,
}

impl Config {
    /// Apply CLI overrides to configuration
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(ref format) = overrides.output_format {
            self.output.format = format.clone();
        }
        if let Some(verbose) = overrides.verbose {
            self.output.verbose = verbose;
        }
        if overrides.debug == Some(true) {
            self.logging.level = "debug".to_string();
        }
        if let Some(ref path) = overrides.identity_path {
            self.identity.path = Some(path.clone());
        }
        if let Some(ref url) = overrides.registry_url {
            self.registry.did_publish_url = url.clone();
        }
        self
    }
}
