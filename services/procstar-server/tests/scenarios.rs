//! End-to-end scenarios driven against the real TLS + WebSocket accept
//! loop, using `MockAgent` in place of a real procstar binary.

use std::path::PathBuf;
use std::time::Duration;

use procstar_protocol::{Message, ProcDelete, ProcResult, ProcidList};
use procstar_server::config::ServerConfig;
use procstar_server::Server;
use procstar_test_utils::{AgentIdentity, MockAgent};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn test_config(access_token: &str) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        access_token: access_token.to_owned(),
        tls_cert: fixture_path("localhost.crt").display().to_string(),
        tls_key: fixture_path("localhost.key").display().to_string(),
        login_timeout_s: 60,
        dispatch_retry_max: 3,
    }
}

async fn start_test_server(access_token: &str) -> (Server, std::net::SocketAddr) {
    let server = Server::new(test_config(access_token));
    let addr = server.serve().await.expect("server should bind");
    (server, addr)
}

#[tokio::test]
async fn echo_scenario_delivers_two_results() {
    let (server, addr) = start_test_server("").await;
    let cert = fixture_path("localhost.crt");

    let mut agent = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-echo", "default"),
        "",
    )
    .await
    .expect("agent should register");

    let process = server
        .dispatcher
        .start(
            "p-echo",
            serde_json::json!({"argv": ["/bin/echo", "Hello, world!"]}),
            "default",
        )
        .await
        .expect("start should succeed");

    // The agent receives the ProcStart request and replies with two
    // results, as a real procstar instance running /bin/echo would.
    match agent.recv().await.expect("should receive ProcStart") {
        Message::ProcStart(start) => assert!(start.specs.contains_key("p-echo")),
        other => panic!("expected ProcStart, got {other:?}"),
    }

    agent
        .send(&Message::ProcResult(ProcResult {
            proc_id: "p-echo".into(),
            res: serde_json::json!({"pid": 123, "status": null}),
        }))
        .await
        .unwrap();
    agent
        .send(&Message::ProcResult(ProcResult {
            proc_id: "p-echo".into(),
            res: serde_json::json!({
                "pid": 123,
                "status": {"exit_code": 0},
                "fds": {"stdout": {"text": "Hello, world!\n"}, "stderr": {"text": ""}},
            }),
        }))
        .await
        .unwrap();

    let mut results = process.results();
    let first = results.next().await;
    let second = results.next().await;

    match first {
        procstar_server::tracker::WaitEvent::Result(v) => {
            assert_eq!(v["status"], serde_json::Value::Null);
        }
        other => panic!("expected first Result event, got {other:?}"),
    }
    match second {
        procstar_server::tracker::WaitEvent::Result(v) => {
            assert_eq!(v["status"]["exit_code"], 0);
            assert_eq!(v["fds"]["stdout"]["text"], "Hello, world!\n");
        }
        other => panic!("expected second Result event, got {other:?}"),
    }
}

#[tokio::test]
async fn multi_group_dispatch_reaches_only_the_requested_group() {
    let (server, addr) = start_test_server("").await;
    let cert = fixture_path("localhost.crt");

    let mut agent_a = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-group-a", "group-a"),
        "",
    )
    .await
    .expect("group-a agent should register");

    let mut agent_b = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-group-b", "group-b"),
        "",
    )
    .await
    .expect("group-b agent should register");

    server
        .dispatcher
        .start(
            "p-group-a",
            serde_json::json!({"argv": ["/bin/true"]}),
            "group-a",
        )
        .await
        .expect("start in group-a should succeed");

    match agent_a.recv().await.expect("group-a agent should receive ProcStart") {
        Message::ProcStart(start) => assert!(start.specs.contains_key("p-group-a")),
        other => panic!("expected ProcStart, got {other:?}"),
    }

    let group_b_saw_nothing =
        tokio::time::timeout(Duration::from_millis(200), agent_b.recv()).await;
    assert!(
        group_b_saw_nothing.is_err(),
        "group-b agent should not receive a message dispatched to group-a"
    );

    server
        .dispatcher
        .start(
            "p-group-b",
            serde_json::json!({"argv": ["/bin/true"]}),
            "group-b",
        )
        .await
        .expect("start in group-b should succeed");

    match agent_b.recv().await.expect("group-b agent should receive ProcStart") {
        Message::ProcStart(start) => assert!(start.specs.contains_key("p-group-b")),
        other => panic!("expected ProcStart, got {other:?}"),
    }
}

#[tokio::test]
async fn no_token_mode_accepts_empty_access_token() {
    let (_server, addr) = start_test_server("").await;
    let cert = fixture_path("localhost.crt");

    let agent = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-notoken", "default"),
        "",
    )
    .await;
    assert!(agent.is_ok());
}

#[tokio::test]
async fn protocol_violation_closes_socket_without_registering() {
    let (server, addr) = start_test_server("").await;
    let cert = fixture_path("localhost.crt");

    let mut agent = MockAgent::connect("127.0.0.1", addr.port(), &cert)
        .await
        .expect("TLS handshake should succeed");
    agent.send_text("not a binary frame").await.unwrap();

    // Give the handler a moment to process and close.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(server
        .dispatcher
        .registry()
        .get("never-registered")
        .await
        .is_none());
}

#[tokio::test]
async fn double_register_swap_keeps_one_entry_with_latest_port() {
    let (server, addr) = start_test_server("").await;
    let cert = fixture_path("localhost.crt");

    let _first = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-swap", "default"),
        "",
    )
    .await
    .expect("first register should succeed");

    let _second = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-swap", "default"),
        "",
    )
    .await
    .expect("second register should succeed");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let conn = server
        .dispatcher
        .registry()
        .get("conn-swap")
        .await
        .expect("connection should still be present");
    assert!(conn.is_open().await);
}

#[tokio::test]
async fn reconnect_mid_flight_preserves_process_history_across_rebind() {
    let (server, addr) = start_test_server("").await;
    let cert = fixture_path("localhost.crt");

    let mut agent = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-reconnect", "default"),
        "",
    )
    .await
    .expect("register should succeed");

    let process = server
        .dispatcher
        .start(
            "p-reconnect",
            serde_json::json!({"argv": ["/bin/true"]}),
            "default",
        )
        .await
        .expect("start should succeed");
    agent.recv().await.expect("ProcStart should arrive");

    // Simulate the socket dropping and the same agent reconnecting.
    drop(agent);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut agent2 = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-reconnect", "default"),
        "",
    )
    .await
    .expect("reconnect should succeed");

    // After reconnect, the agent reports its process list; the tracker
    // entry from before the drop must still resolve to the same process.
    agent2
        .send(&Message::ProcidList(ProcidList {
            proc_ids: vec!["p-reconnect".into()],
        }))
        .await
        .unwrap();
    agent2
        .send(&Message::ProcResult(ProcResult {
            proc_id: "p-reconnect".into(),
            res: serde_json::json!({"pid": 1, "status": {"exit_code": 0}}),
        }))
        .await
        .unwrap();

    let event = process.wait().await;
    match event {
        procstar_server::tracker::WaitEvent::Result(v) => {
            assert_eq!(v["status"]["exit_code"], 0);
        }
        other => panic!("expected Result event, got {other:?}"),
    }

    let _ = server.dispatcher.registry().get("conn-reconnect").await;
}

#[tokio::test]
async fn delete_finality_resolves_all_waiters_with_deleted_sentinel() {
    let (server, addr) = start_test_server("").await;
    let cert = fixture_path("localhost.crt");

    let mut agent = MockAgent::connect_and_register(
        "127.0.0.1",
        addr.port(),
        &cert,
        &AgentIdentity::new("conn-delete", "default"),
        "",
    )
    .await
    .expect("register should succeed");

    let process = server
        .dispatcher
        .start("p-delete", serde_json::json!({"argv": ["/bin/true"]}), "default")
        .await
        .expect("start should succeed");
    agent.recv().await.expect("ProcStart should arrive");

    let waiter = tokio::spawn({
        let process = std::sync::Arc::clone(&process);
        async move { process.wait().await }
    });
    tokio::task::yield_now().await;

    agent
        .send(&Message::ProcDelete(ProcDelete {
            proc_id: "p-delete".into(),
        }))
        .await
        .unwrap();

    let event = waiter.await.unwrap();
    assert!(matches!(event, procstar_server::tracker::WaitEvent::Deleted));
    assert!(server.dispatcher.tracker().get("p-delete").await.is_none());
}
