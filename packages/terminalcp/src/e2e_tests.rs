//! End-to-end tests: a real daemon on a temp-dir socket, driven through
//! the client library and, for protocol edge cases, a raw socket.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientError};
use crate::config::{ServerConfig, TermcpConfig};
use crate::manager::TerminalManager;
use crate::protocol::{ErrorCode, EventKind, OutputMode};
use crate::server::{BindOutcome, IpcServer, bind_socket};

struct TestDaemon {
    config: TermcpConfig,
    shutdown: CancellationToken,
    serve: tokio::task::JoinHandle<anyhow::Result<()>>,
    _tmp: tempfile::TempDir,
}

impl TestDaemon {
    async fn start() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let config = TermcpConfig::new(Some(tmp.path().join("data"))).unwrap();

        let settings = ServerConfig {
            enter_delay: Duration::from_millis(20),
            stop_grace: Duration::from_secs(2),
            ..ServerConfig::default()
        };
        let manager = Arc::new(TerminalManager::new(settings));
        let server = Arc::new(IpcServer::new(manager, 256));

        let BindOutcome::Bound(listener) = bind_socket(&config.socket_path()).await.unwrap()
        else {
            panic!("fresh socket should bind");
        };

        let shutdown = CancellationToken::new();
        let serve = tokio::spawn(server.serve(
            listener,
            config.socket_path(),
            shutdown.clone(),
        ));

        Self {
            config,
            shutdown,
            serve,
            _tmp: tmp,
        }
    }

    async fn client(&self) -> Client {
        Client::connect(&self.config.socket_path())
            .await
            .expect("client should connect to test daemon")
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.serve).await;
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn list_starts_empty() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    assert!(client.list().await.unwrap().is_empty());

    daemon.stop().await;
}

#[tokio::test]
async fn echo_roundtrip_shows_on_screen() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let id = client.start("sh", None, None, None).await.unwrap();
    client.stdin(&id, "echo round-trip-ok\r", false).await.unwrap();

    let client_ref = &client;
    let id_ref = &id;
    wait_for("echo output on screen", move || async move {
        client_ref
            .stdout(id_ref, OutputMode::Screen, None, None)
            .await
            .unwrap()
            .contains("round-trip-ok")
    })
    .await;

    daemon.stop().await;
}

#[tokio::test]
async fn ctrl_c_key_kills_cat() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let id = client.start("cat", None, None, None).await.unwrap();
    client.stdin(&id, "C-c", true).await.unwrap();

    let client_ref = &client;
    let id_ref = &id;
    wait_for("cat should exit on C-c", move || async move {
        client_ref
            .list()
            .await
            .unwrap()
            .iter()
            .find(|e| &e.id == id_ref)
            .is_some_and(|e| !e.running)
    })
    .await;

    daemon.stop().await;
}

#[tokio::test]
async fn subscriber_streams_output_and_stream_read_catches_up() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_event(Box::new(move |event| {
        let _ = event_tx.send(event);
    }));

    let id = client.start("cat", None, None, None).await.unwrap();
    client.subscribe(&id).await.unwrap();
    client.stdin(&id, "ping-via-event\r", false).await.unwrap();

    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !collected.contains("ping-via-event") {
        let event = tokio::time::timeout_at(deadline, event_rx.recv())
            .await
            .expect("event should arrive before deadline")
            .expect("event channel should stay open");
        assert_eq!(event.terminal, id);
        if event.kind == EventKind::Output {
            collected.push_str(&event.data);
        }
    }

    // Read-your-writes: a stream read after an observed event reflects it.
    let stream = client
        .stdout(&id, OutputMode::Stream, None, None)
        .await
        .unwrap();
    assert!(stream.contains("ping-via-event"));

    daemon.stop().await;
}

#[tokio::test]
async fn exit_event_reaches_subscriber() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_event(Box::new(move |event| {
        let _ = event_tx.send(event);
    }));

    let id = client.start("sleep 30", None, None, None).await.unwrap();
    client.subscribe(&id).await.unwrap();

    // Kill out-of-band (force-stop removes the record; use stdin-free path).
    client.stop(&id, true).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, event_rx.recv())
            .await
            .expect("exit event should arrive")
            .expect("event channel should stay open");
        if event.kind == EventKind::Exit {
            break;
        }
    }

    daemon.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_at_the_protocol_level() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let id = client.start("sleep 30", None, None, None).await.unwrap();
    client.stop(&id, false).await.unwrap();

    assert!(client.list().await.unwrap().is_empty());

    let err = client.stop(&id, false).await.unwrap_err();
    match err {
        ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::UnknownTerminal),
        other => panic!("expected server error, got {:?}", other),
    }

    // Daemon state unchanged by the failed second stop.
    assert!(client.list().await.unwrap().is_empty());

    daemon.stop().await;
}

#[tokio::test]
async fn stdin_to_unknown_terminal_fails() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let err = client.stdin("term-404", "hello", false).await.unwrap_err();
    match err {
        ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::UnknownTerminal),
        other => panic!("expected server error, got {:?}", other),
    }

    daemon.stop().await;
}

#[tokio::test]
async fn invalid_key_token_is_reported() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let id = client.start("cat", None, None, None).await.unwrap();
    let err = client.stdin(&id, "C-bogus", true).await.unwrap_err();
    match err {
        ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::InvalidKey),
        other => panic!("expected server error, got {:?}", other),
    }

    daemon.stop().await;
}

#[tokio::test]
async fn unknown_action_keeps_connection_alive() {
    let daemon = TestDaemon::start().await;

    let stream = UnixStream::connect(daemon.config.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"{\"id\":\"1\",\"action\":\"frobnicate\"}\n")
        .await
        .unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["id"], "1");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "UnknownAction");

    // Connection still serves requests afterwards.
    write_half
        .write_all(b"{\"id\":\"2\",\"action\":\"list\"}\n")
        .await
        .unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["id"], "2");
    assert_eq!(value["ok"], true);

    daemon.stop().await;
}

#[tokio::test]
async fn bad_request_shape_is_reported() {
    let daemon = TestDaemon::start().await;

    let stream = UnixStream::connect(daemon.config.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Known action, missing required argument.
    write_half
        .write_all(b"{\"id\":\"7\",\"action\":\"stdin\",\"terminal\":\"t\"}\n")
        .await
        .unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "BadRequest");

    daemon.stop().await;
}

#[tokio::test]
async fn malformed_json_closes_the_connection() {
    let daemon = TestDaemon::start().await;

    let stream = UnixStream::connect(daemon.config.socket_path()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"this is not json\n").await.unwrap();

    let mut line = String::new();
    let n = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("server should close promptly")
        .unwrap();
    assert_eq!(n, 0, "expected EOF, got frame: {:?}", line);

    daemon.stop().await;
}

#[tokio::test]
async fn concurrent_writers_keep_lines_whole() {
    let daemon = TestDaemon::start().await;
    let client_a = Arc::new(daemon.client().await);
    let client_b = Arc::new(daemon.client().await);

    let id = client_a.start("cat", None, None, None).await.unwrap();

    let id_a = id.clone();
    let a = {
        let client = client_a.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                client
                    .stdin(&id_a, &format!("alpha-{}-tag\r", i), false)
                    .await
                    .unwrap();
            }
        })
    };
    let id_b = id.clone();
    let b = {
        let client = client_b.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                client
                    .stdin(&id_b, &format!("bravo-{}-tag\r", i), false)
                    .await
                    .unwrap();
            }
        })
    };
    a.await.unwrap();
    b.await.unwrap();

    let client_ref = &client_a;
    let id_ref = &id;
    wait_for("all tagged lines echoed", move || async move {
        let stream = client_ref
            .stdout(id_ref, OutputMode::Stream, None, None)
            .await
            .unwrap();
        (0..5).all(|i| {
            stream.contains(&format!("alpha-{}-tag", i))
                && stream.contains(&format!("bravo-{}-tag", i))
        })
    })
    .await;

    daemon.stop().await;
}

#[tokio::test]
async fn resize_reaches_the_child() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let id = client.start("sh", None, None, None).await.unwrap();
    client.resize(&id, 100, 30).await.unwrap();
    client.stdin(&id, "stty size\r", false).await.unwrap();

    let client_ref = &client;
    let id_ref = &id;
    wait_for("stty should report the new size", move || async move {
        client_ref
            .stdout(id_ref, OutputMode::Screen, None, None)
            .await
            .unwrap()
            .contains("30 100")
    })
    .await;

    let entry = client
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.id == id)
        .unwrap();
    assert_eq!((entry.cols, entry.rows), (100, 30));

    daemon.stop().await;
}

#[tokio::test]
async fn stream_views_limit_bytes_and_lines() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let id = client
        .start("printf 'first\\nsecond\\nthird\\n'", None, None, None)
        .await
        .unwrap();

    let client_ref = &client;
    let id_ref = &id;
    wait_for("printf output buffered", move || async move {
        client_ref
            .stdout(id_ref, OutputMode::Stream, None, None)
            .await
            .unwrap()
            .contains("third")
    })
    .await;

    let tail = client
        .stdout(&id, OutputMode::Stream, Some(1), None)
        .await
        .unwrap();
    assert!(tail.contains("third"));
    assert!(!tail.contains("first"));

    let last_bytes = client
        .stdout(&id, OutputMode::Stream, None, Some(4))
        .await
        .unwrap();
    assert!(last_bytes.len() <= 4);

    daemon.stop().await;
}

#[tokio::test]
async fn term_size_responds() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let size = client.term_size().await.unwrap();
    assert!(size.cols > 0);
    assert!(size.rows > 0);

    daemon.stop().await;
}

#[tokio::test]
async fn kill_server_stops_terminals_and_unlinks_socket() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    client.start("sleep 30", None, None, None).await.unwrap();
    client.start("cat", None, None, None).await.unwrap();

    client.kill_server().await.unwrap();

    let socket_path = daemon.config.socket_path();
    let serve = daemon.serve;
    tokio::time::timeout(Duration::from_secs(10), serve)
        .await
        .expect("daemon should shut down")
        .unwrap()
        .unwrap();

    assert!(!socket_path.exists(), "socket should be unlinked");
    assert!(Client::connect(&socket_path).await.is_err());
}

#[tokio::test]
async fn requests_interleave_with_subscription_events() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_event(Box::new(move |event| {
        let _ = event_tx.send(event);
    }));

    let id = client.start("cat", None, None, None).await.unwrap();
    client.subscribe(&id).await.unwrap();
    client.stdin(&id, "mixed-traffic\r", false).await.unwrap();

    // Responses keep flowing while events stream on the same connection.
    for _ in 0..5 {
        assert_eq!(client.list().await.unwrap().len(), 1);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut collected = String::new();
    while !collected.contains("mixed-traffic") {
        let event = tokio::time::timeout_at(deadline, event_rx.recv())
            .await
            .expect("events should arrive")
            .expect("event channel open");
        if event.kind == EventKind::Output {
            collected.push_str(&event.data);
        }
    }

    client.unsubscribe(&id).await.unwrap();
    daemon.stop().await;
}
