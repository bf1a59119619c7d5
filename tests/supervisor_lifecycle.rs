//! Supervisor lifecycle tests: crash recovery, restart ceilings and health.

#![cfg(unix)]

mod common;

use mcp_gateway::config::{ServerConfig, SessionConfig, SupervisorConfig};
use mcp_gateway::gateway::{Gateway, RouteOutcome};
use mcp_gateway::mcp::protocol::Reply;
use mcp_gateway::supervisor::{ProcessState, Supervisor};

const CALL: &str =
    r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"text":"hello"}}}"#;

async fn call(gateway: &Gateway, server: &str) -> Reply {
    match gateway.route(None, Some(server), CALL).await.unwrap() {
        RouteOutcome::Replied(Some(reply)) => reply,
        other => panic!("expected a reply, got {other:?}"),
    }
}

fn kill(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn crashed_process_is_replaced_on_next_request() {
    let gateway = common::gateway(vec![("echo", common::echo_server())], SessionConfig::default());

    let Reply::Success(first) = call(&gateway, "echo").await else {
        panic!("first call failed");
    };
    assert_eq!(first.result["content"][0]["text"], "hello");

    let original = gateway.supervisor().handle("echo").unwrap();
    let original_pid = original.pid().unwrap();
    kill(original_pid);
    assert!(common::eventually(|| !original.is_alive()).await);

    let Reply::Success(second) = call(&gateway, "echo").await else {
        panic!("call after crash failed");
    };
    assert_eq!(second.result["content"][0]["text"], "hello");

    let replacement = gateway.supervisor().handle("echo").unwrap();
    assert_ne!(replacement.pid(), Some(original_pid));
    assert_eq!(gateway.supervisor().health("echo").unwrap().restart_count, 1);
    assert_eq!(gateway.supervisor().state("echo"), Some(ProcessState::Running));

    gateway.shutdown().await;
}

#[tokio::test]
async fn process_that_keeps_dying_hits_the_ceiling() {
    let mut config = mcp_gateway::config::Config::default();
    config.supervisor = SupervisorConfig {
        max_restarts: 1,
        ..common::quiet_supervisor()
    };
    config.servers.insert(
        "flaky".to_string(),
        ServerConfig::new("sh", vec!["-c".into(), "exit 3".into()]),
    );
    let gateway = Gateway::new(&config);

    // Launch, then one restart; both processes exit before answering.
    for _ in 0..2 {
        assert_eq!(call(&gateway, "flaky").await.error_code(), Some(-32603));
        let handle = gateway.supervisor().handle("flaky").unwrap();
        assert!(common::eventually(|| !handle.is_alive()).await);
    }

    let reply = call(&gateway, "flaky").await;
    let Reply::Failure(error) = reply else {
        panic!("expected failure");
    };
    assert_eq!(error.error.code, -32603);
    assert!(error.error.message.contains("restart limit"), "{}", error.error.message);
    assert_eq!(gateway.supervisor().state("flaky"), Some(ProcessState::Failed));

    // Failed servers stay failed until reset.
    assert_eq!(call(&gateway, "flaky").await.error_code(), Some(-32603));
    gateway.reset_server("flaky").await.unwrap();
    assert_eq!(gateway.supervisor().state("flaky"), Some(ProcessState::Stopped));
    assert_eq!(gateway.supervisor().health("flaky").unwrap().restart_count, 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn health_check_pings_initialised_process() {
    let supervisor = Supervisor::new(SupervisorConfig {
        ping_on_health_check: true,
        ping_timeout_ms: 2_000,
        ..common::quiet_supervisor()
    });
    let config = common::echo_server();
    let handle = supervisor.ensure_running("echo", &config).await.unwrap();
    handle
        .bridge()
        .initialize(&mcp_gateway::mcp::types::Implementation::gateway(), config.timeout())
        .await
        .unwrap();

    assert!(supervisor.health_check("echo").await);
    let health = supervisor.health("echo").unwrap();
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.last_check.is_some());

    supervisor.shutdown().await;
    assert_eq!(supervisor.state("echo"), Some(ProcessState::Stopped));
}

#[tokio::test]
async fn monitor_restarts_unresponsive_process() {
    let supervisor = Supervisor::new(SupervisorConfig {
        health_check_interval_ms: 50,
        failure_threshold: 2,
        ..common::quiet_supervisor()
    });
    let config = common::silent_server(100);
    let handle = supervisor.ensure_running("silent", &config).await.unwrap();

    // The timeout marks the bridge unhealthy; the monitor takes it from there.
    assert!(handle
        .bridge()
        .initialize(&mcp_gateway::mcp::types::Implementation::gateway(), config.timeout())
        .await
        .is_err());

    let restarted = common::eventually(|| {
        supervisor
            .handle("silent")
            .is_some_and(|current| current.pid() != handle.pid())
    })
    .await;
    assert!(restarted);
    assert!(supervisor.health("silent").unwrap().restart_count >= 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn status_lists_every_supervised_server() {
    let gateway = common::gateway(
        vec![("b-echo", common::echo_server()), ("a-echo", common::echo_server())],
        SessionConfig::default(),
    );
    call(&gateway, "b-echo").await;
    call(&gateway, "a-echo").await;

    let health = gateway.health();
    let names: Vec<_> = health.servers.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["a-echo", "b-echo"]);
    assert!(health.servers.iter().all(|s| s.pid.is_some()));
    assert_eq!(health.sessions, 0);

    gateway.shutdown().await;
}
