//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into validated, type-safe structures. It also defines the
//! [`ServerConfigSource`] seam through which the gateway obtains launch
//! snapshots; the file-backed [`ServerTable`] is the bundled implementation,
//! and a persistence or secrets backend can stand in for it.
//!
//! # Configuration File Locations
//!
//! The configuration file is searched in the following order:
//!
//! 1. Path given as the first CLI argument
//! 2. Default location:
//!    - **Linux/macOS:** `~/.mcp-gateway/config.json`
//!    - **Windows:** `%USERPROFILE%\.mcp-gateway\config.json`

mod settings;

pub use settings::{Config, LoggingConfig, ServerConfig, SessionConfig, SupervisorConfig};

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::ConfigError;

/// Supplies immutable launch snapshots keyed by logical server name.
///
/// The gateway reads a snapshot only when it needs to launch or address a
/// server and never writes configuration back.
pub trait ServerConfigSource: Send + Sync {
    /// Returns the current snapshot for `server`, if it is configured.
    fn snapshot(&self, server: &str) -> Option<ServerConfig>;

    /// Names of every configured server.
    fn server_names(&self) -> Vec<String>;
}

/// Server snapshots loaded from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ServerTable {
    servers: IndexMap<String, ServerConfig>,
}

impl ServerTable {
    /// Wraps an ordered map of server configurations.
    #[must_use]
    pub const fn new(servers: IndexMap<String, ServerConfig>) -> Self {
        Self { servers }
    }

    /// Adds or replaces one server. Running processes keep the snapshot they
    /// were launched with.
    pub fn insert(&mut self, name: impl Into<String>, config: ServerConfig) {
        self.servers.insert(name.into(), config);
    }
}

impl ServerConfigSource for ServerTable {
    fn snapshot(&self, server: &str) -> Option<ServerConfig> {
        self.servers.get(server).cloned()
    }

    fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }
}

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.mcp-gateway/`
/// - **Windows:** `%USERPROFILE%\.mcp-gateway\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".mcp-gateway"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and parses the configuration file.
///
/// If `path` is `None`, uses the platform-specific default location.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - Required fields are missing or invalid
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| ConfigError::NotFound {
            path: PathBuf::from("<default config path>"),
        })?,
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path.clone(),
        source: e,
    })?;

    config.validate()?;

    Ok(config)
}
