//! HTTP surface tests over a real socket.

#![cfg(unix)]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mcp_gateway::config::SessionConfig;
use mcp_gateway::gateway::Gateway;
use mcp_gateway::http::{router, SESSION_HEADER};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start(gateway: Arc<Gateway>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(gateway)).await.unwrap();
    });
    addr
}

fn raw_request(method: &str, path: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(body);
    request
}

/// Sends a request and reads the whole response. Returns the status code,
/// the raw head and the body.
async fn send(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (u16, String, String) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(raw_request(method, path, headers, body).as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), socket.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    split(&String::from_utf8(response).unwrap())
}

fn split(response: &str) -> (u16, String, String) {
    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((response, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    (status, head.to_string(), body.to_string())
}

/// Body of a non-chunked JSON response, or the first chunk of a chunked one.
fn json_body(head: &str, body: &str) -> Value {
    let text = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        body.split("\r\n").nth(1).unwrap_or_default()
    } else {
        body
    };
    serde_json::from_str(text).unwrap()
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn gateway() -> Arc<Gateway> {
    common::gateway(
        vec![("echo", common::echo_server())],
        SessionConfig {
            keepalive_interval_ms: 60_000,
            ..SessionConfig::default()
        },
    )
}

#[tokio::test]
async fn health_reports_service_and_sessions() {
    let addr = start(gateway()).await;
    let (status, head, body) = send(addr, "GET", "/health", &[], "").await;
    assert_eq!(status, 200);
    let health = json_body(&head, &body);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "mcp-gateway");
    assert_eq!(health["gateway"]["sessions"], 0);
}

#[tokio::test]
async fn inline_message_gets_json_reply() {
    let addr = start(gateway()).await;
    let request = json!({
        "jsonrpc": "2.0",
        "id": 11,
        "method": "tools/call",
        "params": {"name": "echo", "arguments": {"text": "over http"}}
    });
    let (status, head, body) = send(
        addr,
        "POST",
        "/servers/echo/messages",
        &[("content-type", "application/json")],
        &request.to_string(),
    )
    .await;
    assert_eq!(status, 200);
    let reply = json_body(&head, &body);
    assert_eq!(reply["id"], 11);
    assert_eq!(reply["result"]["content"][0]["text"], "over http");
}

#[tokio::test]
async fn inline_notification_is_accepted() {
    let addr = start(gateway()).await;
    let (status, _, _) = send(
        addr,
        "POST",
        "/servers/echo/messages",
        &[],
        r#"{"jsonrpc":"2.0","method":"notifications/cancelled"}"#,
    )
    .await;
    assert_eq!(status, 202);
}

#[tokio::test]
async fn unknown_server_and_session_are_not_found() {
    let addr = start(gateway()).await;
    let (status, _, _) = send(addr, "GET", "/servers/missing/sse", &[], "").await;
    assert_eq!(status, 404);
    let (status, _, _) = send(addr, "POST", "/sessions/nope/messages", &[], "{}").await;
    assert_eq!(status, 404);
    let (status, _, _) = send(addr, "DELETE", "/sessions/nope", &[], "").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn event_stream_carries_session_frames() {
    let gateway = gateway();
    let addr = start(Arc::clone(&gateway)).await;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(raw_request("GET", "/servers/echo/sse", &[("x-client-id", "alice")], "").as_bytes())
        .await
        .unwrap();

    let mut received = String::new();
    let mut buf = [0u8; 4096];
    while !received.contains("notifications/initialized") {
        let n = tokio::time::timeout(Duration::from_secs(10), socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream closed early: {received}");
        received.push_str(&String::from_utf8_lossy(&buf[..n]));
    }

    let (status, head, _) = split(&received);
    assert_eq!(status, 200);
    assert!(header(&head, "content-type").unwrap().starts_with("text/event-stream"));
    let session_id = header(&head, SESSION_HEADER).unwrap().to_string();
    assert!(received.contains(&format!(r#""sessionId":"{session_id}""#)));
    assert!(received.contains(r#""type":"connection""#));

    let info = gateway.session(&session_id).unwrap();
    assert_eq!(info.identity.subject, "alice");

    let (status, _, _) = send(
        addr,
        "POST",
        &format!("/sessions/{session_id}/messages"),
        &[],
        r#"{"jsonrpc":"2.0","id":"s1","method":"ping"}"#,
    )
    .await;
    assert_eq!(status, 202);

    while !received.contains(r#""id":"s1""#) {
        let n = tokio::time::timeout(Duration::from_secs(10), socket.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream closed early: {received}");
        received.push_str(&String::from_utf8_lossy(&buf[..n]));
    }

    let (status, _, _) = send(addr, "DELETE", &format!("/sessions/{session_id}"), &[], "").await;
    assert_eq!(status, 204);
    assert!(gateway.session(&session_id).is_none());

    gateway.shutdown().await;
}
