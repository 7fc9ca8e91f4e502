//! TOML Configuration File Support
//!
//! Loads defaults for conversations from
//! `$XDG_CONFIG_HOME/agent-conversation/conversation.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI overrides ([`ConfigOverrides`])
//! 2. Environment variables (`CONVERSATION_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [conversation]
//! max_iteration_per_run = 500
//! stuck_detection = true
//! visualize = true
//! confirmation_mode = false
//!
//! [persistence]
//! enabled = true
//! root = "/home/me/.local/share/agent-conversation/conversations"
//!
//! [logging]
//! filter = "conversation_core=debug"
//! with_target = false
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CONVERSATION_MAX_ITERATIONS` | `max_iteration_per_run` |
//! | `CONVERSATION_STUCK_DETECTION` | `stuck_detection` |
//! | `CONVERSATION_VISUALIZE` | `visualize` |
//! | `CONVERSATION_CONFIRMATION_MODE` | `confirmation_mode` |
//! | `CONVERSATION_PERSISTENCE_DIR` | `persistence.root` (also enables persistence) |
//! | `CONVERSATION_LOG` | `logging.filter` |

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LoggingConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[conversation]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationToml {
    /// Agent steps allowed per `run()`
    pub max_iteration_per_run: Option<usize>,

    /// Whether to stop runs that loop
    pub stuck_detection: Option<bool>,

    /// Whether to log every event
    pub visualize: Option<bool>,

    /// Whether actions wait for approval
    pub confirmation_mode: Option<bool>,
}

/// `[persistence]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceToml {
    /// Whether conversations are written to disk
    pub enabled: Option<bool>,

    /// Directory holding one subdirectory per conversation
    pub root: Option<PathBuf>,
}

/// `[logging]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingToml {
    /// `EnvFilter` directives
    pub filter: Option<String>,

    /// Include targets in log lines
    pub with_target: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigToml {
    /// Conversation section
    pub conversation: ConversationToml,

    /// Persistence section
    pub persistence: PersistenceToml,

    /// Logging section
    pub logging: LoggingToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Where conversations are stored
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Persist to disk; in-memory only when `false`
    pub enabled: bool,

    /// Root directory; the platform data directory when `None`
    pub root: Option<PathBuf>,
}

impl PersistenceConfig {
    /// Root directory conversations are written under, if persistence is on
    #[must_use]
    pub fn resolved_root(&self) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        self.root.clone().or_else(default_persistence_root)
    }
}

/// Resolved configuration for conversations
#[derive(Clone, Debug)]
pub struct ConversationConfig {
    /// Agent steps allowed per `run()`
    pub max_iteration_per_run: usize,

    /// Whether stuck detection is enabled
    pub stuck_detection: bool,

    /// Whether the tracing visualizer heads the event pipeline
    pub visualize: bool,

    /// Whether new conversations start in confirmation mode
    pub confirmation_mode: bool,

    /// Storage settings
    pub persistence: PersistenceConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_iteration_per_run: 500,
            stuck_detection: true,
            visualize: true,
            confirmation_mode: false,
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ConversationConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero step budget or an
    /// empty log filter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iteration_per_run == 0 {
            return Err(ConfigError::ValidationError(
                "max_iteration_per_run must be at least 1".to_string(),
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "logging.filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/agent-conversation/conversation.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agent-conversation").join("conversation.toml"))
}

/// Default root for persisted conversations
#[must_use]
pub fn default_persistence_root() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("agent-conversation").join("conversations"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<ConversationConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConversationConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment variables through `env`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ConversationConfig, ConfigError> {
    let mut config = ConversationConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConfigToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut ConversationConfig, toml: &ConfigToml) {
    if let Some(max) = toml.conversation.max_iteration_per_run {
        config.max_iteration_per_run = max;
    }
    if let Some(enabled) = toml.conversation.stuck_detection {
        config.stuck_detection = enabled;
    }
    if let Some(enabled) = toml.conversation.visualize {
        config.visualize = enabled;
    }
    if let Some(enabled) = toml.conversation.confirmation_mode {
        config.confirmation_mode = enabled;
    }

    if let Some(enabled) = toml.persistence.enabled {
        config.persistence.enabled = enabled;
    }
    if toml.persistence.root.is_some() {
        config.persistence.root = toml.persistence.root.clone();
    }

    if let Some(ref filter) = toml.logging.filter {
        config.logging.filter = filter.clone();
    }
    if let Some(with_target) = toml.logging.with_target {
        config.logging.with_target = with_target;
    }
}

fn parse_bool(value: &str) -> bool {
    value != "0" && value.to_lowercase() != "false"
}

fn apply_env_config(config: &mut ConversationConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(max) = env("CONVERSATION_MAX_ITERATIONS") {
        match max.parse::<usize>() {
            Ok(n) => {
                config.max_iteration_per_run = n;
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(value = %max, "Ignoring invalid CONVERSATION_MAX_ITERATIONS"),
        }
    }
    if let Some(enabled) = env("CONVERSATION_STUCK_DETECTION") {
        config.stuck_detection = parse_bool(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = env("CONVERSATION_VISUALIZE") {
        config.visualize = parse_bool(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = env("CONVERSATION_CONFIRMATION_MODE") {
        config.confirmation_mode = parse_bool(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = env("CONVERSATION_PERSISTENCE_DIR") {
        config.persistence.enabled = true;
        config.persistence.root = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
    if let Some(filter) = env("CONVERSATION_LOG") {
        config.logging.filter = filter;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Step budget override
    pub max_iteration_per_run: Option<usize>,

    /// Stuck detection override
    pub stuck_detection: Option<bool>,

    /// Visualizer override
    pub visualize: Option<bool>,

    /// Confirmation mode override
    pub confirmation_mode: Option<bool>,

    /// Persistence root override (enables persistence)
    pub persistence_root: Option<PathBuf>,

    /// Log filter override
    pub log_filter: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set step budget override
    #[must_use]
    pub fn with_max_iteration_per_run(mut self, max: usize) -> Self {
        self.max_iteration_per_run = Some(max);
        self
    }

    /// Set stuck detection override
    #[must_use]
    pub fn with_stuck_detection(mut self, enabled: bool) -> Self {
        self.stuck_detection = Some(enabled);
        self
    }

    /// Set visualizer override
    #[must_use]
    pub fn with_visualize(mut self, enabled: bool) -> Self {
        self.visualize = Some(enabled);
        self
    }

    /// Set confirmation mode override
    #[must_use]
    pub fn with_confirmation_mode(mut self, enabled: bool) -> Self {
        self.confirmation_mode = Some(enabled);
        self
    }

    /// Set persistence root override
    #[must_use]
    pub fn with_persistence_root(mut self, root: PathBuf) -> Self {
        self.persistence_root = Some(root);
        self
    }

    /// Set log filter override
    #[must_use]
    pub fn with_log_filter(mut self, filter: String) -> Self {
        self.log_filter = Some(filter);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the result is invalid.
    pub fn apply(&self, config: &mut ConversationConfig) -> Result<(), ConfigError> {
        if self.max_iteration_per_run.is_some()
            || self.stuck_detection.is_some()
            || self.visualize.is_some()
            || self.confirmation_mode.is_some()
            || self.persistence_root.is_some()
            || self.log_filter.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(max) = self.max_iteration_per_run {
            config.max_iteration_per_run = max;
        }
        if let Some(enabled) = self.stuck_detection {
            config.stuck_detection = enabled;
        }
        if let Some(enabled) = self.visualize {
            config.visualize = enabled;
        }
        if let Some(enabled) = self.confirmation_mode {
            config.confirmation_mode = enabled;
        }
        if let Some(ref root) = self.persistence_root {
            config.persistence.enabled = true;
            config.persistence.root = Some(root.clone());
        }
        if let Some(ref filter) = self.log_filter {
            config.logging.filter = filter.clone();
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
