//! Frames written to a session's event stream.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::mcp::protocol::{OutgoingNotification, Reply};

/// Stream control events that are not JSON-RPC messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEvent {
    /// First frame of every stream.
    Connection {
        /// Session the stream belongs to.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Logical server behind the session.
        server: String,
    },
    /// Emitted after a quiet period.
    Keepalive {
        /// Emission time.
        timestamp: DateTime<Utc>,
    },
}

/// One `data:` frame on a session stream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Frame {
    /// Connection or keepalive event.
    Control(ControlEvent),
    /// Reply to a client request.
    Reply(Reply),
    /// A notification to the client.
    Notification(OutgoingNotification),
    /// A broadcast payload, passed through as-is.
    Message(Value),
}

impl Frame {
    /// The opening frame.
    #[must_use]
    pub fn connection(session_id: &str, server: &str) -> Self {
        Self::Control(ControlEvent::Connection {
            session_id: session_id.to_string(),
            server: server.to_string(),
        })
    }

    /// A keepalive stamped with the current time.
    #[must_use]
    pub fn keepalive() -> Self {
        Self::Control(ControlEvent::Keepalive {
            timestamp: Utc::now(),
        })
    }

    /// True for keepalive frames.
    #[must_use]
    pub const fn is_keepalive(&self) -> bool {
        matches!(self, Self::Control(ControlEvent::Keepalive { .. }))
    }
}
