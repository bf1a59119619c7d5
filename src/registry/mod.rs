//! Tool catalogs and argument validation.
//!
//! A server's tools come from a [`ToolSource`]. Servers with a static
//! catalog in their configuration are answered without touching a process;
//! all others are discovered from the running process and cached for its
//! lifetime.

mod validate;

pub use validate::validate_arguments;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::config::ServerConfigSource;
use crate::error::{GatewayError, ValidationError};
use crate::mcp::types::Tool;
use crate::supervisor::Supervisor;

/// Supplies the tool catalog of one server.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// Returns every tool the server offers.
    async fn tools(&self) -> Result<Vec<Tool>, GatewayError>;
}

/// A fixed catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tools: Vec<Tool>,
}

impl StaticCatalog {
    /// Wraps a list of tools.
    #[must_use]
    pub const fn new(tools: Vec<Tool>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl ToolSource for StaticCatalog {
    async fn tools(&self) -> Result<Vec<Tool>, GatewayError> {
        Ok(self.tools.clone())
    }
}

/// Tools reported by the server's running process via `tools/list`.
pub struct LiveProcessCatalog {
    supervisor: Arc<Supervisor>,
    configs: Arc<dyn ServerConfigSource>,
    server: String,
}

impl LiveProcessCatalog {
    /// Creates a catalog backed by the supervised process for `server`.
    #[must_use]
    pub fn new(
        supervisor: Arc<Supervisor>,
        configs: Arc<dyn ServerConfigSource>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            configs,
            server: server.into(),
        }
    }
}

#[async_trait]
impl ToolSource for LiveProcessCatalog {
    async fn tools(&self) -> Result<Vec<Tool>, GatewayError> {
        let config = self
            .configs
            .snapshot(&self.server)
            .ok_or_else(|| GatewayError::UnknownServer {
                server: self.server.clone(),
            })?;
        let handle = self.supervisor.ensure_running(&self.server, &config).await?;
        handle.bridge().list_tools(config.timeout()).await
    }
}

/// Resolves and validates tools per server.
pub struct ToolRegistry {
    supervisor: Arc<Supervisor>,
    configs: Arc<dyn ServerConfigSource>,
    overrides: RwLock<HashMap<String, Arc<dyn ToolSource>>>,
}

impl ToolRegistry {
    /// Creates a registry that picks a catalog from each server's config.
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, configs: Arc<dyn ServerConfigSource>) -> Self {
        Self {
            supervisor,
            configs,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Uses `source` for `server` instead of the configured catalog.
    pub fn register(&self, server: impl Into<String>, source: Arc<dyn ToolSource>) {
        self.overrides.write().insert(server.into(), source);
    }

    /// The catalog for `server`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer` if the server is neither registered nor
    /// configured.
    pub fn source(&self, server: &str) -> Result<Arc<dyn ToolSource>, GatewayError> {
        if let Some(source) = self.overrides.read().get(server) {
            return Ok(Arc::clone(source));
        }
        let config = self
            .configs
            .snapshot(server)
            .ok_or_else(|| GatewayError::UnknownServer {
                server: server.to_string(),
            })?;
        Ok(match config.tools {
            Some(tools) => Arc::new(StaticCatalog::new(tools)),
            None => Arc::new(LiveProcessCatalog::new(
                Arc::clone(&self.supervisor),
                Arc::clone(&self.configs),
                server,
            )),
        })
    }

    /// Every tool `server` offers.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unknown or discovery fails.
    pub async fn available_tools(&self, server: &str) -> Result<Vec<Tool>, GatewayError> {
        self.source(server)?.tools().await
    }

    /// Checks that `tool` exists on `server` and `arguments` satisfy its
    /// schema. Returns the tool definition on success.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an unknown tool or bad arguments, or the
    /// discovery error if the catalog cannot be read.
    pub async fn validate(
        &self,
        server: &str,
        tool: &str,
        arguments: &Value,
    ) -> Result<Tool, GatewayError> {
        let tools = self.available_tools(server).await?;
        let definition = tools
            .into_iter()
            .find(|t| t.name == tool)
            .ok_or_else(|| ValidationError::UnknownTool {
                tool: tool.to_string(),
            })?;
        validate_arguments(&definition, arguments)?;
        Ok(definition)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("overrides", &self.overrides.read().len())
            .finish_non_exhaustive()
    }
}
