//! The gateway façade.
//!
//! [`Gateway`] wires the collaborators together and routes each inbound
//! message to a live session, to a server's stateless handler, or to an
//! error.

mod dispatch;

pub use dispatch::Dispatcher;

use std::sync::Arc;

use crate::config::{Config, ServerConfigSource, ServerTable};
use crate::error::{GatewayError, SessionError};
use crate::mcp::protocol::Reply;
use crate::mcp::types::Implementation;
use crate::registry::ToolRegistry;
use crate::session::{ClientIdentity, SessionInfo, SessionManager, SessionStream};
use crate::supervisor::{ServerStatus, Supervisor};

/// Where a routed message ended up.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Queued on a live session; the reply arrives on its stream.
    Queued {
        /// The session that accepted the message.
        session_id: String,
    },
    /// Handled inline. `None` for notifications.
    Replied(Option<Reply>),
}

/// Aggregate health for the HTTP surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayHealth {
    /// Supervised servers.
    pub servers: Vec<ServerStatus>,
    /// Sessions in any state.
    pub sessions: usize,
    /// Sessions currently forwarding.
    pub active_sessions: usize,
}

/// Owns the supervisor, registry, dispatcher and session manager.
pub struct Gateway {
    configs: Arc<dyn ServerConfigSource>,
    supervisor: Arc<Supervisor>,
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
}

impl Gateway {
    /// Builds a gateway from a loaded configuration file.
    #[must_use]
    pub fn new(config: &Config) -> Arc<Self> {
        let table = ServerTable::new(config.servers.clone());
        Self::with_source(config, Arc::new(table))
    }

    /// Builds a gateway that reads server snapshots from `configs`.
    #[must_use]
    pub fn with_source(config: &Config, configs: Arc<dyn ServerConfigSource>) -> Arc<Self> {
        let supervisor = Supervisor::new(config.supervisor.clone());
        let registry = Arc::new(ToolRegistry::new(
            Arc::clone(&supervisor),
            Arc::clone(&configs),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&supervisor),
            Arc::clone(&registry),
            Arc::clone(&configs),
        ));
        let sessions = SessionManager::new(config.sessions.clone(), Arc::clone(&dispatcher));
        tracing::info!(servers = configs.server_names().len(), "Gateway ready");
        Arc::new(Self {
            configs,
            supervisor,
            registry,
            dispatcher,
            sessions,
        })
    }

    /// The supervisor.
    #[must_use]
    pub const fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// The tool registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The session manager.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Names of every configured server.
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        self.configs.server_names()
    }

    /// Routes one raw message.
    ///
    /// A live session that belongs to `server` (when given) takes the
    /// message. Otherwise a known `server` answers it inline through the
    /// stateless handler.
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer`, `ServerDisabled`, a session error when only
    /// a dead session was named, or `NoRoute` when neither was given.
    pub async fn route(
        &self,
        session_id: Option<&str>,
        server: Option<&str>,
        raw: &str,
    ) -> Result<RouteOutcome, GatewayError> {
        let mut session_error = None;

        if let Some(session_id) = session_id {
            match self.sessions.get(session_id) {
                Some(info) if server.is_some_and(|s| s != info.server) => {
                    tracing::debug!(session_id, "Session belongs to another server");
                }
                Some(_) => match self.sessions.submit(session_id, raw.to_string()) {
                    Ok(()) => {
                        return Ok(RouteOutcome::Queued {
                            session_id: session_id.to_string(),
                        });
                    }
                    Err(e @ SessionError::Backpressure { .. }) => return Err(e.into()),
                    Err(e) => session_error = Some(e),
                },
                None => {
                    session_error = Some(SessionError::NotFound {
                        session_id: session_id.to_string(),
                    });
                }
            }
        }

        match server {
            Some(server) => {
                self.dispatcher.snapshot(server)?;
                Ok(RouteOutcome::Replied(
                    self.dispatcher.handle_line(server, raw).await,
                ))
            }
            None => Err(session_error.map_or(GatewayError::NoRoute, GatewayError::from)),
        }
    }

    /// Opens a session stream against `server`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer` or `ServerDisabled`.
    pub fn open_session(
        &self,
        server: &str,
        identity: ClientIdentity,
        client_info: Option<Implementation>,
    ) -> Result<SessionStream, GatewayError> {
        self.sessions.create_session(server, identity, client_info)
    }

    /// Reattaches a stream to an existing session.
    ///
    /// # Errors
    ///
    /// Returns a session error if the session is gone or out of reconnects.
    pub fn reconnect(&self, session_id: &str) -> Result<SessionStream, GatewayError> {
        Ok(self.sessions.reconnect(session_id)?)
    }

    /// Closes a session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist.
    pub fn close_session(&self, session_id: &str) -> Result<(), GatewayError> {
        Ok(self.sessions.close_session(session_id)?)
    }

    /// Metadata of one session.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id)
    }

    /// Clears a failed server so it can be launched again.
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer` if the server has never been launched.
    pub async fn reset_server(&self, server: &str) -> Result<(), GatewayError> {
        self.supervisor.reset(server).await
    }

    /// Supervisor and session summary.
    #[must_use]
    pub fn health(&self) -> GatewayHealth {
        GatewayHealth {
            servers: self.supervisor.status(),
            sessions: self.sessions.session_count(),
            active_sessions: self.sessions.active_sessions().len(),
        }
    }

    /// Closes every session and stops every process.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down gateway");
        self.sessions.shutdown();
        self.supervisor.shutdown().await;
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("supervisor", &self.supervisor)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::mcp::types::Tool;
    use serde_json::json;

    fn gateway() -> Arc<Gateway> {
        let mut config = Config::default();
        let mut server = ServerConfig::new("/nonexistent/never-spawned", vec![]);
        server.tools = Some(vec![Tool::new("echo", "Echo", json!({"type": "object"}))]);
        config.servers.insert("static".to_string(), server);
        Gateway::new(&config)
    }

    #[tokio::test]
    async fn routes_to_generic_handler_without_session() {
        let gateway = gateway();
        let outcome = gateway
            .route(None, Some("static"), r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();
        let RouteOutcome::Replied(Some(Reply::Success(response))) = outcome else {
            panic!("expected inline success, got {outcome:?}");
        };
        assert_eq!(response.result["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn unknown_session_falls_back_to_server() {
        let gateway = gateway();
        let outcome = gateway
            .route(Some("gone"), Some("static"), r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Replied(Some(Reply::Success(_)))));
    }

    #[tokio::test]
    async fn unknown_session_without_server_is_session_error() {
        let gateway = gateway();
        let err = gateway.route(Some("gone"), None, "{}").await.unwrap_err();
        assert!(matches!(err, GatewayError::Session(SessionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn nothing_to_route_to() {
        let gateway = gateway();
        assert!(matches!(
            gateway.route(None, None, "{}").await.unwrap_err(),
            GatewayError::NoRoute
        ));
        assert!(matches!(
            gateway.route(None, Some("missing"), "{}").await.unwrap_err(),
            GatewayError::UnknownServer { .. }
        ));
    }

    #[tokio::test]
    async fn notification_routed_inline_has_no_reply() {
        let gateway = gateway();
        let outcome = gateway
            .route(None, Some("static"), r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .unwrap();
        assert!(matches!(outcome, RouteOutcome::Replied(None)));
    }
}
