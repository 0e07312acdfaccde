//! End-to-end tests of the client runtime against scripted mock servers
//! speaking real LSP frames over real pipes.

#![cfg(unix)]

mod common;

use common::{null_result, wait_for_capture, MockServerBuilder, INIT_RESPONSE};
use polyglot_lsp::{ClientConfig, Error, Language, Session, SessionState, SyncSession};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ClientConfig {
    let mut config = ClientConfig::new(Language::Go);
    config.request_timeout = 5;
    config
}

#[tokio::test]
async fn handshake_reaches_ready_and_shutdown_is_ordered() {
    let server = MockServerBuilder::new()
        .sleep(0.2)
        .send(INIT_RESPONSE)
        .sleep(1.0)
        .send(&null_result(1)) // shutdown
        .build();

    let session =
        Session::create_with_profile(config(), server.workspace(), server.profile()).unwrap();
    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);

    let captured = server.captured();
    let initialize = captured.find(r#""method":"initialize""#).unwrap();
    let initialized = captured.find(r#""method":"initialized""#).unwrap();
    let shutdown = captured.find(r#""method":"shutdown""#).unwrap();
    let exit = captured.find(r#""method":"exit""#).unwrap();
    assert!(initialize < initialized);
    assert!(initialized < shutdown);
    assert!(shutdown < exit);
}

#[tokio::test]
async fn responses_correlate_out_of_order() {
    let server = MockServerBuilder::new()
        .sleep(0.2)
        .send(INIT_RESPONSE)
        .sleep(1.0)
        .send(&null_result(2)) // the later request is answered first
        .sleep(0.4)
        .send(&null_result(1))
        .sleep(0.5)
        .send(&null_result(3)) // shutdown
        .build();
    server.add_file("main.go", "package main\n");
    server.add_file("lib.go", "package main\n");

    let session = Arc::new(
        Session::create_with_profile(config(), server.workspace(), server.profile()).unwrap(),
    );
    session.start().await.unwrap();

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.request_definition("main.go", 0, 0).await }
    });
    // stagger so the request ids are assigned in a known order
    tokio::time::sleep(Duration::from_millis(150)).await;

    // id 2 resolves while id 1 is still pending
    let second = session.request_hover("lib.go", 0, 0).await;
    assert!(second.unwrap().is_none());

    let first = first.await.unwrap();
    assert!(first.unwrap().is_empty());

    session.stop().await;
}

#[tokio::test]
async fn unknown_server_requests_are_answered_method_not_found() {
    let server = MockServerBuilder::new()
        .sleep(0.2)
        .send(INIT_RESPONSE)
        .sleep(0.4)
        .send(r#"{"jsonrpc":"2.0","id":99,"method":"test/unknown","params":{}}"#)
        .sleep(0.2)
        .send(r#"{"jsonrpc":"2.0","id":98,"method":"workspace/configuration","params":{"items":[{"section":"gopls"}]}}"#)
        .sleep(1.4)
        .send(&null_result(1)) // shutdown
        .build();

    let session =
        Session::create_with_profile(config(), server.workspace(), server.profile()).unwrap();
    session.start().await.unwrap();

    assert!(wait_for_capture(&server, "-32601", Duration::from_secs(5)).await);
    assert!(wait_for_capture(&server, r#""id":98"#, Duration::from_secs(5)).await);
    let captured = server.captured();
    assert!(
        captured.contains(r#""result":[null]"#),
        "configuration request should be answered with one null per item: {captured}"
    );

    session.stop().await;
}

#[tokio::test]
async fn open_close_symmetry_and_edit_versions() {
    let server = MockServerBuilder::new()
        .sleep(0.2)
        .send(INIT_RESPONSE)
        .sleep(2.5)
        .send(&null_result(1)) // shutdown
        .build();
    server.add_file("src/app.go", "package app\n");

    let session =
        Session::create_with_profile(config(), server.workspace(), server.profile()).unwrap();
    session.start().await.unwrap();

    // two opens, one edit, two closes
    session.open_file("src/app.go").await.unwrap();
    session.open_file("src/app.go").await.unwrap();
    let end = session
        .insert_text_at_position("src/app.go", 0, 11, "lication")
        .await
        .unwrap();
    assert_eq!(end.character, 19);
    assert_eq!(
        session.get_open_file_text("src/app.go").unwrap(),
        "package application\n"
    );
    session.close_file("src/app.go").await.unwrap();
    session.close_file("src/app.go").await.unwrap();

    assert!(wait_for_capture(&server, "didClose", Duration::from_secs(5)).await);
    let captured = server.captured();
    assert_eq!(
        captured.matches(r#""method":"textDocument/didOpen""#).count(),
        1
    );
    assert_eq!(
        captured.matches(r#""method":"textDocument/didClose""#).count(),
        1
    );
    assert_eq!(
        captured.matches(r#""method":"textDocument/didChange""#).count(),
        1
    );
    assert!(captured.contains(r#""version":1"#));
    assert!(captured.contains("package application"));

    // the overlay never touched the disk
    let on_disk = std::fs::read_to_string(server.workspace().join("src/app.go")).unwrap();
    assert_eq!(on_disk, "package app\n");

    session.stop().await;
}

#[tokio::test]
async fn broken_stream_degrades_the_session_instead_of_hanging() {
    // the server dies shortly after the handshake
    let server = MockServerBuilder::new()
        .sleep(0.2)
        .send(INIT_RESPONSE)
        .sleep(0.5)
        .exit_when_done()
        .build();
    server.add_file("main.go", "package main\n");

    let session =
        Session::create_with_profile(config(), server.workspace(), server.profile()).unwrap();
    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    // give the EOF time to propagate through the read loop
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = session.request_definition("main.go", 0, 0).await;
    assert!(result.is_err(), "query against a dead server must fail");
    assert!(matches!(
        session.state(),
        SessionState::ShuttingDown | SessionState::Stopped
    ));

    session.stop().await;
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn timeout_leaves_the_session_usable() {
    let server = MockServerBuilder::new()
        .sleep(0.2)
        .send(INIT_RESPONSE)
        // id 1 is never answered; the follow-up query id 2 is
        .sleep(2.2)
        .send(&null_result(2))
        .sleep(1.0)
        .send(&null_result(3)) // shutdown
        .build();
    server.add_file("mode.go", "package mode\n");

    let mut config = ClientConfig::new(Language::Go);
    config.request_timeout = 1;

    let sync =
        SyncSession::create_with_profile(config, server.workspace(), server.profile()).unwrap();
    let guard = sync.start_server().unwrap();

    let err = sync.request_definition("mode.go", 0, 0).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "unexpected error: {err}");

    // the cancel went out best-effort and the session keeps working
    std::thread::sleep(Duration::from_millis(700));
    let second = sync.request_definition("mode.go", 0, 0).unwrap();
    assert!(second.is_empty());
    assert_eq!(sync.session().state(), SessionState::Ready);

    guard.stop().unwrap();
    let captured = server.captured();
    assert!(
        captured.contains(r#""method":"$/cancelRequest""#),
        "expected a cancel notification in: {captured}"
    );
}

#[test]
fn teardown_reaps_the_whole_process_tree() {
    let marker = "487.3211";
    let server = MockServerBuilder::new()
        .spawn_sleeper(marker)
        .sleep(0.2)
        .send(INIT_RESPONSE)
        .sleep(1.2)
        .send(&null_result(1)) // shutdown
        .build();

    let sync =
        SyncSession::create_with_profile(config(), server.workspace(), server.profile()).unwrap();
    {
        let _guard = sync.start_server().unwrap();
        assert_eq!(sync.session().state(), SessionState::Ready);
        // leave the scope without an explicit stop
    }

    assert_eq!(sync.session().state(), SessionState::Stopped);

    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let survivor = system.processes().values().any(|process| {
        process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(marker))
    });
    assert!(!survivor, "the forked sleeper must not outlive the session");
}
