//! Shared helpers for integration tests.
//!
//! Tool servers are stood in for by small `sed` and `sh` programs, so these
//! helpers are only usable on unix.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mcp_gateway::config::{Config, ServerConfig, SessionConfig, SupervisorConfig};
use mcp_gateway::gateway::Gateway;
use mcp_gateway::session::{Frame, SessionStream};

/// Answers `tools/list` with a single `echo` tool, `tools/call` of `echo`
/// with its `text` argument, and any other request with an empty result.
/// Notifications are swallowed.
const ECHO_SCRIPT: &str = r##"s/^{"jsonrpc":"2.0","id":\([0-9]*\),"method":"tools\/list".*/{"jsonrpc":"2.0","id":\1,"result":{"tools":[{"name":"echo","description":"Echo text","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}/p
t
s/^{"jsonrpc":"2.0","id":\([0-9]*\),"method":"tools\/call".*"arguments":{"text":"\([^"]*\)"}.*/{"jsonrpc":"2.0","id":\1,"result":{"content":[{"type":"text","text":"\2"}]}}/p
t
s/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/{"jsonrpc":"2.0","id":\1,"result":{}}/p"##;

/// A well-behaved tool server.
pub fn echo_server() -> ServerConfig {
    let mut config = ServerConfig::new(
        "sed",
        vec!["-u".into(), "-n".into(), "-e".into(), ECHO_SCRIPT.into()],
    );
    config.timeout_ms = 5_000;
    config
}

/// A server that reads everything and never answers.
pub fn silent_server(timeout_ms: u64) -> ServerConfig {
    let mut config = ServerConfig::new("sh", vec!["-c".into(), "cat > /dev/null".into()]);
    config.timeout_ms = timeout_ms;
    config
}

/// Supervisor settings that keep background activity out of the way.
pub fn quiet_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        health_check_interval_ms: 60_000,
        restart_backoff_base_ms: 1,
        restart_backoff_max_ms: 10,
        shutdown_grace_ms: 500,
        ..SupervisorConfig::default()
    }
}

/// Builds a gateway over the given servers.
pub fn gateway(servers: Vec<(&str, ServerConfig)>, sessions: SessionConfig) -> Arc<Gateway> {
    let mut config = Config::default();
    config.supervisor = quiet_supervisor();
    config.sessions = sessions;
    for (name, server) in servers {
        config.servers.insert(name.to_string(), server);
    }
    Gateway::new(&config)
}

/// Receives the next frame that is not a keepalive.
pub async fn next_frame(stream: &mut SessionStream) -> Frame {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), stream.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended");
        if !frame.is_keepalive() {
            return frame;
        }
    }
}

/// Serialises a frame for assertions.
pub fn json(frame: &Frame) -> serde_json::Value {
    serde_json::to_value(frame).expect("frames serialise")
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
