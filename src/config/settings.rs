//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::mcp::types::{is_valid_tool_name, Tool};

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Address the HTTP surface binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Logical tool servers, keyed by name, in configured order.
    #[serde(default)]
    pub servers: IndexMap<String, ServerConfig>,

    /// Process supervision settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Streaming session settings.
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, server) in &self.servers {
            server.validate(name)?;
        }
        self.supervisor.validate()?;
        self.sessions.validate()?;

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "Invalid log format '{}'. Must be one of: text, json",
                    self.logging.format
                ),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            _schema: None,
            _comment: None,
            listen: default_listen(),
            servers: IndexMap::new(),
            supervisor: SupervisorConfig::default(),
            sessions: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8931".to_string()
}

/// Launch snapshot for one logical tool server.
///
/// Argument and environment values arrive already decrypted; the gateway
/// never sees ciphertext.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Program to execute.
    pub command: String,

    /// Ordered command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides merged over the gateway's own environment.
    #[serde(default, alias = "environment")]
    pub env: HashMap<String, String>,

    /// Per-call timeout for bridge exchanges, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Disabled servers are never launched.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Working directory for the process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Static tool catalog. When present, discovery never spawns the process.
    #[serde(default)]
    pub tools: Option<Vec<Tool>>,
}

impl ServerConfig {
    /// Creates an enabled snapshot with default timeout and no static tools.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            timeout_ms: default_timeout_ms(),
            enabled: true,
            working_dir: None,
            tools: None,
        }
    }

    /// The per-call timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: format!("Server '{name}' has an empty command"),
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: format!("Server '{name}' timeout_ms must be greater than zero"),
            });
        }
        if let Some(tools) = &self.tools {
            if let Some(bad) = tools.iter().find(|t| !is_valid_tool_name(&t.name)) {
                return Err(ConfigError::ValidationError {
                    message: format!("Server '{name}' declares invalid tool name '{}'", bad.name),
                });
            }
        }
        Ok(())
    }
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_true() -> bool {
    true
}

/// Process supervision settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Interval between health checks, in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Consecutive failed checks that trigger a restart.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Restarts allowed before a server is marked Failed.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Whether failed servers are restarted automatically.
    #[serde(default = "default_true")]
    pub auto_restart: bool,

    /// First restart backoff step, in milliseconds. Doubles per restart.
    #[serde(default = "default_backoff_base_ms")]
    pub restart_backoff_base_ms: u64,

    /// Backoff ceiling, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub restart_backoff_max_ms: u64,

    /// Graceful shutdown window before a forced kill, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Send a protocol `ping` as part of each health check.
    #[serde(default = "default_true")]
    pub ping_on_health_check: bool,

    /// Timeout for the health-check ping, in milliseconds.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

impl SupervisorConfig {
    /// Health-check interval.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Graceful shutdown window.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Health-check ping timeout.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Capped-exponential backoff before the restart following
    /// `restart_count` earlier restarts.
    #[must_use]
    pub fn restart_backoff(&self, restart_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(restart_count);
        let delay = self.restart_backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.restart_backoff_max_ms))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "supervisor.health_check_interval_ms must be greater than zero"
                    .to_string(),
            });
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ValidationError {
                message: "supervisor.failure_threshold must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_interval_ms(),
            failure_threshold: default_failure_threshold(),
            max_restarts: default_max_restarts(),
            auto_restart: true,
            restart_backoff_base_ms: default_backoff_base_ms(),
            restart_backoff_max_ms: default_backoff_max_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            ping_on_health_check: true,
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

const fn default_health_interval_ms() -> u64 {
    30_000
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_max_restarts() -> u32 {
    5
}

const fn default_backoff_base_ms() -> u64 {
    1_000
}

const fn default_backoff_max_ms() -> u64 {
    30_000
}

const fn default_shutdown_grace_ms() -> u64 {
    5_000
}

const fn default_ping_timeout_ms() -> u64 {
    5_000
}

/// Streaming session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Quiet period after which a keepalive frame is emitted, in milliseconds.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,

    /// Time an inactive session is kept for reconnection, in milliseconds.
    #[serde(default = "default_reap_grace_ms")]
    pub reap_grace_ms: u64,

    /// Active sessions with no client message for this long are closed.
    /// Defaults to the reap grace.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Reconnects allowed per session.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnect_attempts: u32,

    /// Messages that may queue behind the in-flight call of one session.
    #[serde(default = "default_queue_depth")]
    pub inbound_queue_depth: usize,
}

impl SessionConfig {
    /// Keepalive interval.
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Reap grace period.
    #[must_use]
    pub const fn reap_grace(&self) -> Duration {
        Duration::from_millis(self.reap_grace_ms)
    }

    /// Idle timeout for active sessions.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "sessions.keepalive_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "sessions.idle_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.inbound_queue_depth == 0 {
            return Err(ConfigError::ValidationError {
                message: "sessions.inbound_queue_depth must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_ms(),
            reap_grace_ms: default_reap_grace_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_reconnect_attempts: default_max_reconnects(),
            inbound_queue_depth: default_queue_depth(),
        }
    }
}

const fn default_keepalive_ms() -> u64 {
    30_000
}

const fn default_reap_grace_ms() -> u64 {
    60_000
}

const fn default_idle_timeout_ms() -> u64 {
    default_reap_grace_ms()
}

const fn default_max_reconnects() -> u32 {
    3
}

const fn default_queue_depth() -> usize {
    64
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen, "127.0.0.1:8931");
        assert!(config.servers.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "listen": "0.0.0.0:9000",
            "servers": {
                "files": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
                    "environment": {"API_TOKEN": "decrypted"},
                    "timeout_ms": 10000
                },
                "weather": {
                    "command": "weather-mcp",
                    "enabled": false,
                    "tools": [
                        {
                            "name": "forecast",
                            "description": "Forecast for a city",
                            "inputSchema": {
                                "type": "object",
                                "properties": {"city": {"type": "string"}},
                                "required": ["city"]
                            }
                        }
                    ]
                }
            },
            "supervisor": {
                "health_check_interval_ms": 1000,
                "failure_threshold": 2,
                "max_restarts": 4
            },
            "sessions": {
                "keepalive_interval_ms": 15000,
                "max_reconnect_attempts": 5
            },
            "logging": {
                "level": "debug",
                "format": "json"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen, "0.0.0.0:9000");
        let names: Vec<_> = config.servers.keys().cloned().collect();
        assert_eq!(names, ["files", "weather"]);

        let files = &config.servers["files"];
        assert_eq!(files.args.len(), 3);
        assert_eq!(files.env["API_TOKEN"], "decrypted");
        assert_eq!(files.timeout(), Duration::from_secs(10));
        assert!(files.enabled);

        let weather = &config.servers["weather"];
        assert!(!weather.enabled);
        assert_eq!(weather.tools.as_ref().unwrap()[0].name, "forecast");

        assert_eq!(config.supervisor.failure_threshold, 2);
        assert_eq!(config.sessions.max_reconnect_attempts, 5);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn supervisor_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.failure_threshold, 3);
        assert!(config.auto_restart);
    }

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.reap_grace(), Duration::from_secs(60));
        assert_eq!(config.idle_timeout(), config.reap_grace());
        assert_eq!(config.max_reconnect_attempts, 3);
    }

    #[test]
    fn reject_zero_idle_timeout() {
        let json = r#"{"sessions": {"idle_timeout_ms": 0}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("idle_timeout_ms"));
    }

    #[test]
    fn restart_backoff_doubles_and_caps() {
        let config = SupervisorConfig {
            restart_backoff_base_ms: 100,
            restart_backoff_max_ms: 500,
            ..SupervisorConfig::default()
        };
        assert_eq!(config.restart_backoff(0), Duration::from_millis(100));
        assert_eq!(config.restart_backoff(1), Duration::from_millis(200));
        assert_eq!(config.restart_backoff(2), Duration::from_millis(400));
        assert_eq!(config.restart_backoff(3), Duration::from_millis(500));
        assert_eq!(config.restart_backoff(64), Duration::from_millis(500));
    }

    #[test]
    fn reject_empty_command() {
        let json = r#"{"servers": {"broken": {"command": "  "}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_invalid_static_tool_name() {
        let json = r#"{"servers": {"s": {"command": "x", "tools": [
            {"name": "has space", "inputSchema": {"type": "object"}}
        ]}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_invalid_log_format() {
        let json = r#"{"logging": {"format": "xml"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
