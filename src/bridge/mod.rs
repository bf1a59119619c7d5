//! stdio ↔ JSON-RPC bridge for one tool-server process.
//!
//! The bridge owns the process's stdin and stdout for the lifetime of the
//! process. Every exchange takes the pipe lock, writes one request line and
//! reads lines until the matching response arrives, so requests from many
//! sessions are queued rather than interleaved.
//!
//! Request ids are rewritten to bridge-unique numbers on the way in and
//! restored on the way out. Two sessions that both use id `1` therefore never
//! see each other's responses, and a late reply to a timed-out call is
//! recognised as stale and skipped.
//!
//! A write that is abandoned part way through a line (the caller timed out
//! or was cancelled) leaves the framing on stdin undefined, so the pipe is
//! retired and the process treated as gone.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, OnceCell};

use crate::error::GatewayError;
use crate::mcp::protocol::{
    JsonRpcError, JsonRpcRequest, McpResponse, OutgoingNotification, RequestId,
};
use crate::mcp::transport::LineTransport;
use crate::mcp::types::{
    check_tool_result, initialize_params, is_valid_tool_name, normalise_initialize_result,
    Implementation, Tool,
};

type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PipeTransport = LineTransport<PipeReader, PipeWriter>;

/// Upper bound on `tools/list` pages followed for one discovery.
const MAX_TOOL_PAGES: usize = 64;

/// How long teardown waits for an in-flight exchange to release the pipes.
const TEARDOWN_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Translates between structured MCP messages and a process's stdio.
pub struct ProtocolBridge {
    /// Logical server name, for errors and logs.
    server: String,
    /// The pipes. `None` once torn down or after the process went away.
    io: Mutex<Option<PipeTransport>>,
    /// Normalised `initialize` result, cached for the process lifetime.
    initialized: OnceCell<Value>,
    /// `tools/list` result, cached for the process lifetime.
    tools: OnceCell<Vec<Tool>>,
    /// Source of bridge-unique request ids.
    next_id: AtomicI64,
    /// Set when an exchange timed out or the process broke protocol.
    unhealthy: AtomicBool,
    /// Set when the pipes closed; no further writes are attempted.
    gone: AtomicBool,
}

impl ProtocolBridge {
    /// Creates a bridge over a process's stdout (`reader`) and stdin (`writer`).
    pub fn new<R, W>(server: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: PipeReader = Box::new(reader);
        let writer: PipeWriter = Box::new(writer);
        Self {
            server: server.into(),
            io: Mutex::new(Some(LineTransport::new(reader, writer))),
            initialized: OnceCell::new(),
            tools: OnceCell::new(),
            next_id: AtomicI64::new(1),
            unhealthy: AtomicBool::new(false),
            gone: AtomicBool::new(false),
        }
    }

    /// Logical server name.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// True once a timeout, protocol violation or closed pipe was observed.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Acquire) || self.is_gone()
    }

    /// True once the pipes are closed.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// True once the handshake has completed on this process.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Performs the `initialize` handshake, or returns the cached result.
    ///
    /// On first use this writes the `initialize` request, waits up to
    /// `timeout` for the reply and then sends `notifications/initialized`.
    /// `client_info` is forwarded only by the call that performs the
    /// handshake.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `ProcessGone`, `ProtocolError`, or `Upstream` if
    /// the process rejected the handshake.
    pub async fn initialize(
        &self,
        client_info: &Implementation,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        self.initialized
            .get_or_try_init(|| self.handshake(client_info, timeout))
            .await
            .cloned()
    }

    async fn handshake(
        &self,
        client_info: &Implementation,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        tracing::debug!(server = %self.server, client = %client_info.name, "Initialising process");
        let response = self
            .exchange("initialize", Some(initialize_params(client_info)), timeout)
            .await?;
        let result = extract_result(response)?;
        self.notify(&OutgoingNotification::initialized(), timeout)
            .await?;
        tracing::info!(server = %self.server, "Process initialised");
        Ok(normalise_initialize_result(result, &self.server))
    }

    async fn ensure_initialized(&self, timeout: Duration) -> Result<(), GatewayError> {
        self.initialize(&Implementation::gateway(), timeout)
            .await
            .map(drop)
    }

    /// Forwards a client request and returns the process's response with the
    /// client's original id restored.
    ///
    /// `initialize` is answered from the handshake cache; every other method
    /// first guarantees the handshake has completed.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `ProcessGone` or `ProtocolError`. JSON-RPC errors
    /// from the process are returned inside the `McpResponse`.
    pub async fn call(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<McpResponse, GatewayError> {
        if request.method == "initialize" {
            let result = match self.initialized.get() {
                Some(cached) => cached.clone(),
                None => {
                    let client_info = request
                        .params
                        .as_ref()
                        .and_then(|p| p.get("clientInfo"))
                        .and_then(|c| serde_json::from_value(c.clone()).ok())
                        .unwrap_or_else(Implementation::gateway);
                    self.initialize(&client_info, timeout).await?
                }
            };
            return Ok(McpResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: Some(result),
                error: None,
            });
        }

        self.ensure_initialized(timeout).await?;
        let response = self
            .exchange(&request.method, request.params, timeout)
            .await?;
        Ok(McpResponse {
            id: request.id,
            ..response
        })
    }

    /// Sends a notification to the process. No response is read.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the write stalls or `ProcessGone` if the pipe is
    /// closed.
    pub async fn notify(
        &self,
        notification: &OutgoingNotification,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let mut guard = self.io.lock().await;
        let transport = self.live_transport(&mut guard)?;

        let outcome = tokio::time::timeout(timeout, self.write_line(transport, notification)).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.pipe_failure(&mut guard, &e)),
            Err(_) => Err(self.timed_out(&notification.method, timeout)),
        }
    }

    /// Protocol-level liveness check.
    ///
    /// # Errors
    ///
    /// Returns an error if the process does not answer `ping` successfully.
    pub async fn ping(&self, timeout: Duration) -> Result<(), GatewayError> {
        let response = self.exchange("ping", None, timeout).await?;
        extract_result(response).map(drop)
    }

    /// Lists the process's tools, following pagination. Cached for the
    /// process lifetime; entries with invalid names are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the result is malformed.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<Tool>, GatewayError> {
        self.ensure_initialized(timeout).await?;
        self.tools
            .get_or_try_init(|| self.fetch_tools(timeout))
            .await
            .cloned()
    }

    async fn fetch_tools(&self, timeout: Duration) -> Result<Vec<Tool>, GatewayError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = extract_result(self.exchange("tools/list", params, timeout).await?)?;

            let page: Vec<Tool> = result
                .get("tools")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| self.protocol_error(format!("malformed tools/list result: {e}")))?
                .unwrap_or_default();

            for tool in page {
                if is_valid_tool_name(&tool.name) {
                    tools.push(tool);
                } else {
                    tracing::warn!(server = %self.server, tool = %tool.name, "Dropping tool with invalid name");
                }
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        tracing::debug!(server = %self.server, count = tools.len(), "Discovered tools");
        Ok(tools)
    }

    /// Invokes a tool and returns its result exactly as the process sent it.
    ///
    /// A tool-level failure (`isError: true`) is a successful exchange and is
    /// reported in the returned result.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails, the process answers with a
    /// JSON-RPC error, or the result is malformed.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        self.ensure_initialized(timeout).await?;
        let params = json!({ "name": name, "arguments": arguments });
        let result = extract_result(self.exchange("tools/call", Some(params), timeout).await?)?;
        check_tool_result(&result)
            .map_err(|reason| self.protocol_error(format!("malformed tools/call result: {reason}")))?;
        Ok(result)
    }

    /// Closes the process's stdin so a well-behaved server exits.
    ///
    /// Waits at most briefly for an in-flight exchange; the caller is
    /// expected to follow up with a bounded wait and a kill.
    pub async fn teardown(&self) {
        self.gone.store(true, Ordering::Release);
        let Ok(mut guard) = tokio::time::timeout(TEARDOWN_LOCK_WAIT, self.io.lock()).await else {
            tracing::debug!(server = %self.server, "Exchange in flight during teardown");
            return;
        };
        if let Some(mut transport) = guard.take() {
            if let Err(e) = transport.shutdown().await {
                tracing::debug!(server = %self.server, error = %e, "Closing stdin failed");
            }
        }
    }

    /// Writes one request under a fresh id and reads until its response.
    async fn exchange(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<McpResponse, GatewayError> {
        let mut guard = self.io.lock().await;
        let transport = self.live_transport(&mut guard)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        tracing::trace!(server = %self.server, method, id, "Forwarding request");

        let outcome = tokio::time::timeout(timeout, self.round_trip(transport, &request)).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(RoundTripError::Io(e))) => Err(self.pipe_failure(&mut guard, &e)),
            Ok(Err(RoundTripError::Gateway(e))) => {
                if e.is_process_failure() {
                    self.unhealthy.store(true, Ordering::Release);
                }
                Err(e)
            }
            Err(_) => Err(self.timed_out(method, timeout)),
        }
    }

    async fn round_trip(
        &self,
        transport: &mut PipeTransport,
        request: &JsonRpcRequest,
    ) -> Result<McpResponse, RoundTripError> {
        self.write_line(transport, request).await?;
        let expected = json!(request.id);

        loop {
            let Some(line) = transport.read_line().await? else {
                return Err(RoundTripError::Io(io::ErrorKind::UnexpectedEof.into()));
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| self.protocol_error(format!("malformed JSON: {e}")))?;

            let Some(id) = value.get("id") else {
                tracing::debug!(server = %self.server, "Skipping process notification");
                continue;
            };

            if let Some(method) = value.get("method").and_then(Value::as_str) {
                // Server-initiated requests (sampling, roots) are not brokered.
                let reply_id = serde_json::from_value(id.clone())
                    .map_err(|e| self.protocol_error(format!("invalid request id: {e}")))?;
                tracing::debug!(server = %self.server, method, "Rejecting server-initiated request");
                self.write_line(transport, &JsonRpcError::method_not_found(reply_id, method))
                    .await?;
                continue;
            }

            if *id != expected {
                tracing::debug!(server = %self.server, stale_id = %id, "Skipping stale response");
                continue;
            }

            let response: McpResponse = serde_json::from_value(value)
                .map_err(|e| self.protocol_error(format!("malformed response: {e}")))?;
            if let Some(reason) = response.validate() {
                return Err(self.protocol_error(reason.to_string()).into());
            }
            return Ok(response);
        }
    }

    /// Writes one line. If the future is dropped before the write completes
    /// the pipe is marked gone.
    async fn write_line<T: Serialize + Sync>(
        &self,
        transport: &mut PipeTransport,
        message: &T,
    ) -> io::Result<()> {
        let mut pending = PendingWrite {
            bridge: self,
            finished: false,
        };
        let result = transport.write_message(message).await;
        pending.finished = true;
        result
    }

    fn live_transport<'a>(
        &self,
        guard: &'a mut Option<PipeTransport>,
    ) -> Result<&'a mut PipeTransport, GatewayError> {
        if self.is_gone() {
            return Err(self.gone_error());
        }
        guard.as_mut().ok_or_else(|| self.gone_error())
    }

    /// Classifies an I/O failure. Closed pipes release the transport so no
    /// further writes are attempted.
    fn pipe_failure(&self, guard: &mut Option<PipeTransport>, error: &io::Error) -> GatewayError {
        if error.kind() == io::ErrorKind::InvalidData {
            self.unhealthy.store(true, Ordering::Release);
            return self.protocol_error(format!("invalid UTF-8 from process: {error}"));
        }
        tracing::warn!(server = %self.server, error = %error, "Process pipe closed");
        self.gone.store(true, Ordering::Release);
        guard.take();
        self.gone_error()
    }

    fn timed_out(&self, method: &str, timeout: Duration) -> GatewayError {
        tracing::warn!(server = %self.server, method, timeout_ms = timeout.as_millis(), "Process did not answer in time");
        self.unhealthy.store(true, Ordering::Release);
        GatewayError::Timeout {
            server: self.server.clone(),
            method: method.to_string(),
            timeout,
        }
    }

    fn gone_error(&self) -> GatewayError {
        GatewayError::ProcessGone {
            server: self.server.clone(),
        }
    }

    fn protocol_error(&self, reason: String) -> GatewayError {
        GatewayError::ProtocolError {
            server: self.server.clone(),
            reason,
        }
    }
}

impl std::fmt::Debug for ProtocolBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBridge")
            .field("server", &self.server)
            .field("initialized", &self.is_initialized())
            .field("unhealthy", &self.is_unhealthy())
            .finish_non_exhaustive()
    }
}

/// Retires the pipe when a write is abandoned mid-line.
struct PendingWrite<'a> {
    bridge: &'a ProtocolBridge,
    finished: bool,
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(server = %self.bridge.server, "Write abandoned mid-line, retiring pipe");
            self.bridge.unhealthy.store(true, Ordering::Release);
            self.bridge.gone.store(true, Ordering::Release);
        }
    }
}

enum RoundTripError {
    Io(io::Error),
    Gateway(GatewayError),
}

impl From<io::Error> for RoundTripError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<GatewayError> for RoundTripError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

/// Extracts the result from a process response, converting a JSON-RPC error
/// into [`GatewayError::Upstream`].
///
/// # Errors
///
/// Returns `Upstream` if the response carries an error.
pub fn extract_result(response: McpResponse) -> Result<Value, GatewayError> {
    if let Some(err) = response.error {
        return Err(GatewayError::Upstream {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}
