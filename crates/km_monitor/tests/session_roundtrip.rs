//! End-to-end wiretap sessions against real child processes.

#![cfg(unix)]

use std::time::Duration;

use km_events::{Classification, CorrelationId, Direction};
use km_monitor::{ChildSpec, MonitorConfig, MonitorSession};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const PING: &[u8] = b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\n";

#[tokio::test]
async fn cat_round_trip_is_byte_transparent() {
    let session = MonitorSession::new(MonitorConfig::default(), CorrelationId::generate());
    let mut observer = session.fanout().subscribe("test");

    let (mut stdin_writer, session_stdin) = duplex(4096);
    let (session_stdout, mut stdout_reader) = duplex(4096);
    let (session_stderr, _stderr_reader) = duplex(4096);

    let spec = ChildSpec::new("cat", vec![]);
    let run = session.run_with_io(
        &spec,
        session_stdin,
        session_stdout,
        session_stderr,
        CancellationToken::new(),
    );

    let driver = async {
        stdin_writer.write_all(PING).await.unwrap();
        drop(stdin_writer);
        let mut out = Vec::new();
        stdout_reader.read_to_end(&mut out).await.unwrap();
        out
    };

    let (code, out) = tokio::join!(run, driver);
    assert_eq!(code.unwrap(), 0);
    assert_eq!(out, PING);

    // Both directions were observed and classified.
    let first = observer.recv().await.unwrap();
    let second = observer.recv().await.unwrap();
    let mut directions = [first.direction, second.direction];
    directions.sort_by_key(|d| *d == Direction::Outbound);
    assert_eq!(directions, [Direction::Inbound, Direction::Outbound]);
    for msg in [first, second] {
        assert_eq!(msg.classification, Classification::Request);
        assert_eq!(msg.method.as_deref(), Some("ping"));
        assert_eq!(msg.request_id.as_deref(), Some("1"));
    }
}

#[tokio::test]
async fn unread_observer_does_not_change_forwarding() {
    let config = MonitorConfig {
        observer_mailbox: 2,
        ..Default::default()
    };
    let session = MonitorSession::new(config, CorrelationId::generate());
    // Subscribed but never drained: its mailbox overflows immediately.
    let stuck = session.fanout().subscribe("stuck");

    let payload: Vec<u8> = (0..50)
        .flat_map(|n| format!("{{\"jsonrpc\":\"2.0\",\"method\":\"m\",\"id\":{n}}}\n").into_bytes())
        .collect();

    let (mut stdin_writer, session_stdin) = duplex(65536);
    let (session_stdout, mut stdout_reader) = duplex(65536);
    let (session_stderr, _stderr_reader) = duplex(4096);

    let spec = ChildSpec::new("cat", vec![]);
    let run = session.run_with_io(
        &spec,
        session_stdin,
        session_stdout,
        session_stderr,
        CancellationToken::new(),
    );

    let expected = payload.clone();
    let driver = async move {
        stdin_writer.write_all(&payload).await.unwrap();
        drop(stdin_writer);
        let mut out = Vec::new();
        stdout_reader.read_to_end(&mut out).await.unwrap();
        out
    };

    let (code, out) = tokio::join!(run, driver);
    assert_eq!(code.unwrap(), 0);
    assert_eq!(out, expected);
    drop(stuck);
}

#[tokio::test]
async fn child_exit_code_propagates() {
    let session = MonitorSession::new(MonitorConfig::default(), CorrelationId::generate());

    let (_stdin_writer, session_stdin) = duplex(64);
    let (session_stdout, mut stdout_reader) = duplex(64);
    let (session_stderr, _stderr_reader) = duplex(64);

    let spec = ChildSpec::new("sh", vec!["-c".into(), "exit 3".into()]);
    let code = session
        .run_with_io(
            &spec,
            session_stdin,
            session_stdout,
            session_stderr,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(code, 3);

    let mut out = Vec::new();
    stdout_reader.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn child_stderr_is_forwarded_verbatim() {
    let session = MonitorSession::new(MonitorConfig::default(), CorrelationId::generate());
    let mut observer = session.fanout().subscribe("test");

    let (_stdin_writer, session_stdin) = duplex(64);
    let (session_stdout, _stdout_reader) = duplex(4096);
    let (session_stderr, mut stderr_reader) = duplex(4096);

    let spec = ChildSpec::new(
        "sh",
        vec!["-c".into(), "echo diagnostics line >&2".into()],
    );
    let code = session
        .run_with_io(
            &spec,
            session_stdin,
            session_stdout,
            session_stderr,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(code, 0);

    let mut err = Vec::new();
    stderr_reader.read_to_end(&mut err).await.unwrap();
    assert_eq!(err, b"diagnostics line\n");

    // Stderr is never observed.
    drop(session);
    assert!(observer.recv().await.is_none());
}

#[tokio::test]
async fn shutdown_is_bounded_even_for_stubborn_children() {
    let config = MonitorConfig {
        drain_deadline: Duration::from_millis(300),
        exit_grace: Duration::from_millis(200),
        ..Default::default()
    };
    let session = MonitorSession::new(config, CorrelationId::generate());

    let (_stdin_writer, session_stdin) = duplex(64);
    let (session_stdout, _stdout_reader) = duplex(4096);
    let (session_stderr, _stderr_reader) = duplex(4096);

    // Ignores SIGTERM; only SIGKILL ends it.
    let spec = ChildSpec::new(
        "sh",
        vec!["-c".into(), "trap '' TERM; while :; do sleep 0.1; done".into()],
    );
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let code = tokio::time::timeout(
        Duration::from_secs(5),
        session.run_with_io(&spec, session_stdin, session_stdout, session_stderr, cancel),
    )
    .await
    .expect("shutdown must complete within the bound")
    .unwrap();
    assert_ne!(code, 0);
    canceller.await.unwrap();
}

#[tokio::test]
async fn outbound_traffic_without_requests_is_still_observed() {
    let session = MonitorSession::new(MonitorConfig::default(), CorrelationId::generate());
    let mut observer = session.fanout().subscribe("test");

    let (_stdin_writer, session_stdin) = duplex(64);
    let (session_stdout, mut stdout_reader) = duplex(4096);
    let (session_stderr, _stderr_reader) = duplex(4096);

    let notification = r#"{"jsonrpc":"2.0","method":"notifications/ready"}"#;
    let spec = ChildSpec::new("sh", vec!["-c".into(), format!("echo '{notification}'")]);
    let code = session
        .run_with_io(
            &spec,
            session_stdin,
            session_stdout,
            session_stderr,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(code, 0);

    let mut out = Vec::new();
    stdout_reader.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, format!("{notification}\n").into_bytes());

    let msg = observer.recv().await.unwrap();
    assert_eq!(msg.direction, Direction::Outbound);
    assert_eq!(msg.classification, Classification::Notification);
    assert_eq!(msg.method.as_deref(), Some("notifications/ready"));
}
