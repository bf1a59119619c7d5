//! Streaming sessions.
//!
//! A session is one client's logical stream against one logical server. It
//! moves through `Created → Connected → Active → Inactive` and is removed
//! ("reaped") after a grace period without reconnection, when it sits idle
//! too long, or immediately on explicit close.
//!
//! Each connection is served by its own task which owns the frame sender and
//! the inbound queue. The task forwards inbound messages one at a time, so a
//! session never has more than one bridge call in flight, and emits a
//! keepalive after every quiet `keepalive_interval`. Disconnect is noticed
//! through the closed frame channel and cancels any in-flight call.
//!
//! Reap deadlines live in a single deadline-ordered queue drained by one
//! reaper task.

mod frame;
mod reaper;

pub use frame::{ControlEvent, Frame};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{GatewayError, SessionError};
use crate::gateway::Dispatcher;
use crate::mcp::protocol::{JsonRpcResponse, OutgoingNotification, Reply, RequestId};
use crate::mcp::types::Implementation;
use reaper::ReapQueue;

/// Frames buffered per stream before the session task waits on the client.
const FRAME_BUFFER: usize = 32;

/// Who opened a session, as asserted by the fronting proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    /// Authenticated subject.
    pub subject: String,
    /// Project the subject is acting in.
    pub project: Option<String>,
}

/// Session lifecycle state. Reaped sessions no longer exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, stream not yet opened.
    Created,
    /// Stream open, handshake in progress.
    Connected,
    /// Forwarding messages.
    Active,
    /// Stream gone; waiting for reconnection or reaping.
    Inactive,
}

/// Snapshot of a session's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id.
    pub id: String,
    /// Logical server name.
    pub server: String,
    /// Owning client.
    pub identity: ClientIdentity,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last inbound client message.
    pub last_activity: DateTime<Utc>,
    /// Lifecycle state.
    pub state: SessionState,
    /// Reconnects used.
    pub reconnect_count: u32,
}

/// Which sessions a broadcast reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastScope {
    /// Sessions against one logical server.
    Server(String),
    /// Sessions opened within one project.
    Project(String),
}

impl BroadcastScope {
    fn matches(&self, session: &Session) -> bool {
        match self {
            Self::Server(server) => session.server == *server,
            Self::Project(project) => session.identity.project.as_deref() == Some(project),
        }
    }
}

/// The client half of a session connection: the frames to stream out.
#[derive(Debug)]
pub struct SessionStream {
    session_id: String,
    frames: mpsc::Receiver<Frame>,
}

impl SessionStream {
    /// Session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receives the next frame. `None` once the session task has ended.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Converts into a `Stream` of frames.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<Frame> {
        ReceiverStream::new(self.frames)
    }
}

struct Session {
    id: String,
    server: String,
    identity: ClientIdentity,
    client_info: Implementation,
    created_at: DateTime<Utc>,
    meta: Mutex<SessionMeta>,
}

struct SessionMeta {
    state: SessionState,
    last_activity: DateTime<Utc>,
    last_seen: Instant,
    inactive_since: Option<Instant>,
    reconnect_count: u32,
    /// Earliest deadline this session has in the reap queue.
    scheduled: Option<Instant>,
    /// Bumped on every (re)connection; stale tasks compare against it.
    generation: u64,
    link: Option<Link>,
}

/// Channels of the current connection.
struct Link {
    generation: u64,
    frames: mpsc::Sender<Frame>,
    inbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// The task half of a connection.
struct Connection {
    generation: u64,
    frames: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl Session {
    fn info(&self) -> SessionInfo {
        let meta = self.meta.lock();
        SessionInfo {
            id: self.id.clone(),
            server: self.server.clone(),
            identity: self.identity.clone(),
            created_at: self.created_at,
            last_activity: meta.last_activity,
            state: meta.state,
            reconnect_count: meta.reconnect_count,
        }
    }

    fn set_state(&self, generation: u64, state: SessionState) {
        let mut meta = self.meta.lock();
        if meta.generation == generation {
            meta.state = state;
        }
    }
}

/// Owns every session and the reaper.
pub struct SessionManager {
    settings: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    reap_queue: Arc<ReapQueue>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Creates the manager and starts its reaper task.
    #[must_use]
    pub fn new(settings: SessionConfig, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let manager = Arc::new(Self {
            settings,
            dispatcher,
            sessions: RwLock::new(HashMap::new()),
            reap_queue: Arc::new(ReapQueue::default()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(reaper::run(
            Arc::clone(&manager.reap_queue),
            Arc::downgrade(&manager),
            manager.shutdown.child_token(),
        ));
        manager
    }

    /// Session settings.
    #[must_use]
    pub const fn settings(&self) -> &SessionConfig {
        &self.settings
    }

    /// Opens a new session against `server`.
    ///
    /// The returned stream starts with a connection frame, followed by the
    /// `initialize` result (id `0`) and a `notifications/initialized` frame
    /// once the process handshake completes.
    ///
    /// # Errors
    ///
    /// Returns `UnknownServer` or `ServerDisabled` before any stream is
    /// opened.
    pub fn create_session(
        self: &Arc<Self>,
        server: &str,
        identity: ClientIdentity,
        client_info: Option<Implementation>,
    ) -> Result<SessionStream, GatewayError> {
        self.dispatcher.snapshot(server)?;

        let now = Instant::now();
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            server: server.to_string(),
            identity,
            client_info: client_info.unwrap_or_else(Implementation::gateway),
            created_at: Utc::now(),
            meta: Mutex::new(SessionMeta {
                state: SessionState::Created,
                last_activity: Utc::now(),
                last_seen: now,
                inactive_since: None,
                reconnect_count: 0,
                scheduled: None,
                generation: 0,
                link: None,
            }),
        });
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));

        let (stream, connection) = {
            let mut meta = session.meta.lock();
            self.schedule(&session.id, &mut meta, now + self.settings.idle_timeout());
            self.attach(&session, &mut meta)
        };

        tracing::info!(
            session_id = %session.id,
            server,
            subject = %session.identity.subject,
            "Session created"
        );
        self.spawn_connection(session, connection, true);
        Ok(stream)
    }

    /// Opens a new stream for an existing session.
    ///
    /// Any stream still attached is replaced. No new handshake is emitted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` once the session is reaped, or `ReconnectLimit`
    /// after `max_reconnect_attempts` reconnects.
    pub fn reconnect(self: &Arc<Self>, session_id: &str) -> Result<SessionStream, SessionError> {
        let session = self.lookup(session_id)?;
        let (stream, connection) = {
            let mut meta = session.meta.lock();
            let limit = self.settings.max_reconnect_attempts;
            if meta.reconnect_count >= limit {
                tracing::warn!(session_id, limit, "Reconnect refused");
                return Err(SessionError::ReconnectLimit {
                    session_id: session_id.to_string(),
                    limit,
                });
            }
            meta.reconnect_count += 1;
            if let Some(old) = meta.link.take() {
                old.cancel.cancel();
            }
            self.attach(&session, &mut meta)
        };

        tracing::info!(session_id, "Session reconnected");
        self.spawn_connection(session, connection, false);
        Ok(stream)
    }

    /// Queues a raw client message for the session's task.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Inactive` when no stream is attached, or
    /// `Backpressure` when the inbound queue is full.
    pub fn submit(&self, session_id: &str, line: String) -> Result<(), SessionError> {
        let session = self.lookup(session_id)?;
        let mut meta = session.meta.lock();
        let Some(link) = meta.link.as_ref() else {
            return Err(SessionError::Inactive {
                session_id: session_id.to_string(),
            });
        };
        match link.inbound.try_send(line) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(SessionError::Backpressure {
                    session_id: session_id.to_string(),
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(SessionError::Inactive {
                    session_id: session_id.to_string(),
                });
            }
        }
        meta.last_activity = Utc::now();
        meta.last_seen = Instant::now();
        Ok(())
    }

    /// Closes and removes a session immediately.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist.
    pub fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        if let Some(link) = session.meta.lock().link.take() {
            link.cancel.cancel();
        }
        tracing::info!(session_id, "Session closed");
        Ok(())
    }

    /// Sends `message` to every active session in `scope`. Sessions whose
    /// stream is closed or full are skipped. Returns the number reached.
    pub fn broadcast(&self, scope: &BroadcastScope, message: &Value) -> usize {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut delivered = 0;
        for session in sessions.iter().filter(|s| scope.matches(s)) {
            let meta = session.meta.lock();
            if meta.state != SessionState::Active {
                continue;
            }
            if let Some(link) = &meta.link {
                if link.frames.try_send(Frame::Message(message.clone())).is_ok() {
                    delivered += 1;
                }
            }
        }
        tracing::debug!(?scope, delivered, "Broadcast sent");
        delivered
    }

    /// Every session currently in the `Active` state.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|s| s.info())
            .filter(|info| info.state == SessionState::Active)
            .collect()
    }

    /// Metadata of one session.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(session_id).map(|s| s.info())
    }

    /// Number of sessions in any state.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Reaps every session whose deadline has passed at `now`: inactive
    /// sessions past the reap grace period and active sessions idle longer
    /// than the idle timeout. Returns the ids removed.
    pub fn reap_expired_at(&self, now: Instant) -> Vec<String> {
        let mut reaped = Vec::new();

        while let Some((deadline, session_id)) = self.reap_queue.pop_due(now) {
            let Some(session) = self.sessions.read().get(&session_id).cloned() else {
                continue;
            };

            let mut meta = session.meta.lock();
            if meta.scheduled != Some(deadline) {
                continue;
            }
            meta.scheduled = None;

            let (due, reason) = match (meta.state, meta.inactive_since) {
                (SessionState::Inactive, Some(since)) => {
                    (since + self.settings.reap_grace(), "disconnected")
                }
                _ => (meta.last_seen + self.settings.idle_timeout(), "idle"),
            };

            if due > now {
                self.schedule(&session_id, &mut meta, due);
                continue;
            }

            if let Some(link) = meta.link.take() {
                link.cancel.cancel();
            }
            drop(meta);
            self.sessions.write().remove(&session_id);
            tracing::info!(session_id = %session_id, reason, "Session reaped");
            reaped.push(session_id);
        }

        reaped
    }

    /// Closes every session and stops the reaper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.meta.lock().link.take();
        }
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Queues `deadline` unless an earlier one is already queued.
    fn schedule(&self, session_id: &str, meta: &mut SessionMeta, deadline: Instant) {
        if meta.scheduled.is_some_and(|current| current <= deadline) {
            return;
        }
        meta.scheduled = Some(deadline);
        self.reap_queue.push(deadline, session_id.to_string());
    }

    /// Creates fresh channels for a connection and records them as current.
    fn attach(&self, session: &Session, meta: &mut SessionMeta) -> (SessionStream, Connection) {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.settings.inbound_queue_depth);
        let cancel = self.shutdown.child_token();

        meta.generation += 1;
        meta.state = SessionState::Connected;
        meta.inactive_since = None;
        // A new stream counts as activity; the queued deadline is recomputed
        // from this when it fires.
        meta.last_seen = Instant::now();
        meta.last_activity = Utc::now();
        meta.link = Some(Link {
            generation: meta.generation,
            frames: frames_tx.clone(),
            inbound: inbound_tx,
            cancel: cancel.clone(),
        });

        (
            SessionStream {
                session_id: session.id.clone(),
                frames: frames_rx,
            },
            Connection {
                generation: meta.generation,
                frames: frames_tx,
                inbound: inbound_rx,
                cancel,
            },
        )
    }

    /// Marks the session inactive if `generation` is still its current
    /// connection.
    fn detach(&self, session: &Session, generation: u64) {
        let mut meta = session.meta.lock();
        if meta.generation != generation {
            return;
        }
        if meta.link.as_ref().is_some_and(|l| l.generation == generation) {
            meta.link = None;
        }
        let now = Instant::now();
        meta.state = SessionState::Inactive;
        meta.inactive_since = Some(now);
        self.schedule(&session.id, &mut meta, now + self.settings.reap_grace());
        tracing::info!(session_id = %session.id, "Session inactive");
    }

    fn spawn_connection(self: &Arc<Self>, session: Arc<Session>, connection: Connection, handshake: bool) {
        let span = tracing::info_span!("session", session_id = %session.id, server = %session.server);
        tokio::spawn(
            Arc::clone(self)
                .serve(session, connection, handshake)
                .instrument(span),
        );
    }

    async fn serve(self: Arc<Self>, session: Arc<Session>, mut connection: Connection, handshake: bool) {
        let generation = connection.generation;

        if self.open(&session, &connection, handshake).await {
            session.set_state(generation, SessionState::Active);
            self.forward(&session, &mut connection).await;
        }

        self.detach(&session, generation);
    }

    /// Emits the opening frames. Returns false if the stream should end.
    async fn open(&self, session: &Session, connection: &Connection, handshake: bool) -> bool {
        let frames = &connection.frames;
        if frames
            .send(Frame::connection(&session.id, &session.server))
            .await
            .is_err()
        {
            return false;
        }
        if !handshake {
            return true;
        }

        let outcome = tokio::select! {
            () = connection.cancel.cancelled() => return false,
            () = frames.closed() => return false,
            outcome = self.dispatcher.initialize(&session.server, &session.client_info) => outcome,
        };

        let id = RequestId::Number(0);
        match outcome {
            Ok(result) => {
                let reply = Reply::Success(JsonRpcResponse::success(id, result));
                frames.send(Frame::Reply(reply)).await.is_ok()
                    && frames
                        .send(Frame::Notification(OutgoingNotification::initialized()))
                        .await
                        .is_ok()
            }
            Err(error) => {
                tracing::warn!(error = %error, "Session handshake failed");
                let _ = frames.send(Frame::Reply(Reply::Failure(error.rpc_error(id)))).await;
                false
            }
        }
    }

    /// Forwards inbound messages in arrival order and keeps the stream alive.
    async fn forward(&self, session: &Session, connection: &mut Connection) {
        let period = self.settings.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let frames = &connection.frames;
        let cancel = &connection.cancel;
        let inbound = &mut connection.inbound;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = frames.closed() => break,
                line = inbound.recv() => {
                    let Some(line) = line else { break };
                    let reply = tokio::select! {
                        () = cancel.cancelled() => break,
                        () = frames.closed() => break,
                        reply = self.dispatcher.handle_line(&session.server, &line) => reply,
                    };
                    if let Some(reply) = reply {
                        if frames.send(Frame::Reply(reply)).await.is_err() {
                            break;
                        }
                    }
                    keepalive.reset();
                }
                _ = keepalive.tick() => {
                    if frames.send(Frame::keepalive()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_count())
            .field("pending_reaps", &self.reap_queue.len())
            .finish_non_exhaustive()
    }
}
