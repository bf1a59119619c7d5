//! Per-message request handling against one logical server.
//!
//! The dispatcher is the stateless "generic handler". `ping` is answered
//! locally and `tools/list` is served from the registry. `tools/call` is
//! validated before anything reaches a process, and `initialize` goes
//! through the process's bridge. Other methods are refused.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::{ServerConfig, ServerConfigSource};
use crate::error::GatewayError;
use crate::mcp::protocol::{
    parse_message, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, OutgoingNotification, Reply, RequestId,
};
use crate::mcp::types::{Implementation, ToolCallParams};
use crate::registry::ToolRegistry;
use crate::supervisor::{ProcessHandle, Supervisor};

/// Routes JSON-RPC messages for any configured server.
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    registry: Arc<ToolRegistry>,
    configs: Arc<dyn ServerConfigSource>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given collaborators.
    #[must_use]
    pub fn new(
        supervisor: Arc<Supervisor>,
        registry: Arc<ToolRegistry>,
        configs: Arc<dyn ServerConfigSource>,
    ) -> Self {
        Self {
            supervisor,
            registry,
            configs,
        }
    }

    /// The configuration snapshot for `server`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer` or `ServerDisabled`.
    pub fn snapshot(&self, server: &str) -> Result<ServerConfig, GatewayError> {
        let config = self
            .configs
            .snapshot(server)
            .ok_or_else(|| GatewayError::UnknownServer {
                server: server.to_string(),
            })?;
        if !config.enabled {
            return Err(GatewayError::ServerDisabled {
                server: server.to_string(),
            });
        }
        Ok(config)
    }

    /// Runs the `initialize` handshake for `server` (cached per process) and
    /// returns its result.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started or the handshake
    /// fails.
    pub async fn initialize(
        &self,
        server: &str,
        client_info: &Implementation,
    ) -> Result<Value, GatewayError> {
        let (handle, config) = self.process(server).await?;
        handle
            .bridge()
            .initialize(client_info, config.timeout())
            .await
    }

    /// Parses one raw line and handles it. Returns the reply to send, or
    /// `None` for notifications.
    pub async fn handle_line(&self, server: &str, line: &str) -> Option<Reply> {
        match parse_message(line) {
            Ok(message) => self.dispatch(server, message).await,
            Err(error) => {
                tracing::debug!(server, code = error.error.code, "Rejected malformed message");
                Some(Reply::Failure(error))
            }
        }
    }

    /// Handles a parsed message.
    pub async fn dispatch(&self, server: &str, message: IncomingMessage) -> Option<Reply> {
        match message {
            IncomingMessage::Request(request) => Some(self.handle_request(server, request).await),
            IncomingMessage::Notification(notification) => {
                self.handle_notification(server, notification).await;
                None
            }
        }
    }

    async fn handle_request(&self, server: &str, request: JsonRpcRequest) -> Reply {
        tracing::debug!(server, method = %request.method, id = %request.id, "Dispatching request");
        let id = request.id.clone();

        if request.method == "initialize" {
            return match self.forward_initialize(server, request).await {
                Ok(reply) => reply,
                Err(error) => Self::failure(server, id, &error),
            };
        }

        let outcome = match request.method.as_str() {
            "ping" => Ok(json!({})),
            "tools/list" => self
                .registry
                .available_tools(server)
                .await
                .map(|tools| json!({ "tools": tools })),
            "tools/call" => match request.params.map(serde_json::from_value::<ToolCallParams>) {
                Some(Ok(params)) => self.handle_tool_call(server, params).await,
                Some(Err(e)) => {
                    return Reply::Failure(JsonRpcError::invalid_params(
                        id,
                        format!("Invalid tools/call params: {e}"),
                    ));
                }
                None => {
                    return Reply::Failure(JsonRpcError::invalid_params(
                        id,
                        "Missing tools/call params",
                    ));
                }
            },
            other => return Reply::Failure(JsonRpcError::method_not_found(id, other)),
        };

        match outcome {
            Ok(result) => Reply::Success(JsonRpcResponse::success(id, result)),
            Err(error) => Self::failure(server, id, &error),
        }
    }

    fn failure(server: &str, id: RequestId, error: &GatewayError) -> Reply {
        if error.is_process_failure() {
            tracing::warn!(server, error = %error, "Request failed");
        } else {
            tracing::debug!(server, error = %error, "Request rejected");
        }
        Reply::Failure(error.rpc_error(id))
    }

    /// Answers `initialize` through the bridge, which performs the handshake
    /// with the client's `clientInfo` on first use and serves the cached
    /// result afterwards.
    async fn forward_initialize(
        &self,
        server: &str,
        request: JsonRpcRequest,
    ) -> Result<Reply, GatewayError> {
        let (handle, config) = self.process(server).await?;
        let response = handle.bridge().call(request, config.timeout()).await?;
        Ok(response.into_reply())
    }

    async fn handle_tool_call(
        &self,
        server: &str,
        params: ToolCallParams,
    ) -> Result<Value, GatewayError> {
        self.registry
            .validate(server, &params.name, &params.arguments)
            .await?;

        let (handle, config) = self.process(server).await?;
        handle
            .bridge()
            .call_tool(&params.name, params.arguments, config.timeout())
            .await
    }

    async fn handle_notification(&self, server: &str, notification: JsonRpcNotification) {
        if notification.method == "notifications/initialized" {
            // The gateway already completed the handshake with the process.
            return;
        }

        let Some(handle) = self.supervisor.handle(server) else {
            tracing::debug!(server, method = %notification.method, "Dropping notification, no process");
            return;
        };
        let timeout = handle.config().timeout();
        let outgoing = OutgoingNotification::new(notification.method, notification.params);
        if let Err(e) = handle.bridge().notify(&outgoing, timeout).await {
            tracing::debug!(server, error = %e, "Failed to forward notification");
        }
    }

    async fn process(
        &self,
        server: &str,
    ) -> Result<(Arc<ProcessHandle>, ServerConfig), GatewayError> {
        let config = self.snapshot(server)?;
        let handle = self.supervisor.ensure_running(server, &config).await?;
        Ok((handle, config))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
