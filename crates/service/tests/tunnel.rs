use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::BytesMut;
use codec::{Packet, PacketType};
use parking_lot::Mutex;
use service::{Context, ContextOption, ErrorKind, Observer, RuleMode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    task::JoinHandle,
    time::{sleep, timeout},
};

#[derive(Default)]
struct Inner {
    errors: Mutex<Vec<(Option<String>, ErrorKind)>>,
    established: AtomicUsize,
    closed: AtomicUsize,
    unknown: AtomicUsize,
}

#[derive(Default, Clone)]
struct TestObserver(Arc<Inner>);

impl TestObserver {
    fn errors(&self) -> Vec<(Option<String>, ErrorKind)> {
        self.0.errors.lock().clone()
    }

    fn established(&self) -> usize {
        self.0.established.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.0.closed.load(Ordering::SeqCst)
    }

    fn unknown(&self) -> usize {
        self.0.unknown.load(Ordering::SeqCst)
    }
}

impl Observer for TestObserver {
    fn on_unknown_packet(&self, _bytes: &[u8]) {
        self.0.unknown.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, service: Option<&str>, kind: ErrorKind, _message: &str) {
        self.0
            .errors
            .lock()
            .push((service.map(str::to_string), kind));
    }

    fn on_established(&self, _service: &str, _session: u16) {
        self.0.established.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closed(&self, _service: &str, _session: u16) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Two localhost udp sockets connected to each other, the stand-in for a
/// hole-punched socket pair.
async fn socket_pair() -> Result<(Arc<UdpSocket>, Arc<UdpSocket>)> {
    let a = UdpSocket::bind("127.0.0.1:0").await?;
    let b = UdpSocket::bind("127.0.0.1:0").await?;
    a.connect(b.local_addr()?).await?;
    b.connect(a.local_addr()?).await?;
    Ok((Arc::new(a), Arc::new(b)))
}

/// A tcp backend that echoes everything back.
async fn echo_backend() -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(size) => {
                            if stream.write_all(&buf[..size]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    Ok((addr, task))
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        sleep(Duration::from_millis(25)).await;
    }

    false
}

/// Run one transfer through the tunnel and expect the same bytes back from
/// the echo backend.
async fn transfer_echo(listen: SocketAddr, len: usize, seed: u8, limit: Duration) -> Result<()> {
    let data = payload(len, seed);
    let stream = TcpStream::connect(listen).await?;
    let (mut reader, mut writer) = stream.into_split();

    let send = data.clone();
    let feeder = tokio::spawn(async move {
        let _ = writer.write_all(&send).await;
        // keep the write half open, closing it would tear the whole
        // session down before the echo comes back.
        writer
    });

    let mut echo = vec![0u8; len];
    timeout(limit, reader.read_exact(&mut echo)).await??;
    assert_eq!(echo, data, "echoed bytes differ");

    drop(feeder.await?);
    Ok(())
}

#[tokio::test]
async fn test_echo_transfer() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client_events = TestObserver::default();
    let client = Context::new(a, client_events.clone());
    let server = Context::new(b, TestObserver::default());

    let (backend, _task) = echo_backend().await?;
    let _server_rule = server.add_rule(RuleMode::Server, "echo", backend).await?;
    let rule = client
        .add_rule(RuleMode::Client, "echo", "127.0.0.1:0".parse()?)
        .await?;

    transfer_echo(
        rule.listen().unwrap(),
        1024 * 1024,
        7,
        Duration::from_secs(60),
    )
    .await?;

    assert_eq!(client_events.established(), 1);
    assert!(client_events.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lossy_link_transfer() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client = Context::new(a, TestObserver::default());
    let server = Context::new(b, TestObserver::default());

    for context in [&client, &server] {
        context.set_option(ContextOption::DebugPacketLoss, 3000)?;
        context.set_option(ContextOption::UdpTimeout, 100)?;
        context.set_option(ContextOption::UdpRetries, 20)?;
    }

    let (backend, _task) = echo_backend().await?;
    let _server_rule = server.add_rule(RuleMode::Server, "lossy", backend).await?;
    let rule = client
        .add_rule(RuleMode::Client, "lossy", "127.0.0.1:0".parse()?)
        .await?;

    transfer_echo(
        rule.listen().unwrap(),
        64 * 1024,
        3,
        Duration::from_secs(120),
    )
    .await
}

#[tokio::test]
async fn test_stop_and_wait_window() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client = Context::new(a, TestObserver::default());
    let server = Context::new(b, TestObserver::default());

    // window of one degrades to stop-and-wait and must still deliver,
    // even on a lossy path.
    for context in [&client, &server] {
        context.set_option(ContextOption::SlideWindow, 1)?;
        context.set_option(ContextOption::DebugPacketLoss, 2000)?;
        context.set_option(ContextOption::UdpTimeout, 50)?;
        context.set_option(ContextOption::UdpRetries, 20)?;
    }

    let (backend, _task) = echo_backend().await?;
    let _server_rule = server.add_rule(RuleMode::Server, "sw", backend).await?;
    let rule = client
        .add_rule(RuleMode::Client, "sw", "127.0.0.1:0".parse()?)
        .await?;

    transfer_echo(rule.listen().unwrap(), 16 * 1024, 9, Duration::from_secs(60)).await
}

#[tokio::test]
async fn test_multiplex_two_services() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client = Context::new(a, TestObserver::default());
    let server = Context::new(b, TestObserver::default());

    let (backend_a, _task_a) = echo_backend().await?;
    let (backend_b, _task_b) = echo_backend().await?;
    let _rule_a = server.add_rule(RuleMode::Server, "alpha", backend_a).await?;
    let _rule_b = server.add_rule(RuleMode::Server, "beta", backend_b).await?;

    let listen_a = client
        .add_rule(RuleMode::Client, "alpha", "127.0.0.1:0".parse()?)
        .await?
        .listen()
        .unwrap();
    let listen_b = client
        .add_rule(RuleMode::Client, "beta", "127.0.0.1:0".parse()?)
        .await?
        .listen()
        .unwrap();

    // concurrent transfers with distinct patterns must not bleed into each
    // other.
    let first = tokio::spawn(transfer_echo(
        listen_a,
        256 * 1024,
        11,
        Duration::from_secs(60),
    ));
    let second = tokio::spawn(transfer_echo(
        listen_b,
        256 * 1024,
        42,
        Duration::from_secs(60),
    ));

    first.await??;
    second.await??;
    Ok(())
}

#[tokio::test]
async fn test_unknown_service_fails_once() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client_events = TestObserver::default();
    let client = Context::new(a, client_events.clone());
    let _server = Context::new(b, TestObserver::default());

    let rule = client
        .add_rule(RuleMode::Client, "nope", "127.0.0.1:0".parse()?)
        .await?;

    let mut stream = TcpStream::connect(rule.listen().unwrap()).await?;

    // the peer rejects the service, the local tcp socket closes.
    let mut buf = [0u8; 16];
    let size = timeout(Duration::from_secs(10), stream.read(&mut buf)).await??;
    assert_eq!(size, 0);

    assert!(
        wait_until(|| !client_events.errors().is_empty(), Duration::from_secs(5)).await,
        "error hook never fired"
    );
    let errors = client_events.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0],
        (Some("nope".to_string()), ErrorKind::UnknownService)
    );
    Ok(())
}

#[tokio::test]
async fn test_zero_retries_fails_on_first_timeout() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client_events = TestObserver::default();
    let client = Context::new(a, client_events.clone());
    let _server = Context::new(b, TestObserver::default());

    client.set_option(ContextOption::UdpRetries, 0)?;
    client.set_option(ContextOption::DebugPacketLoss, 10_000)?;

    let rule = client
        .add_rule(RuleMode::Client, "void", "127.0.0.1:0".parse()?)
        .await?;
    let _stream = TcpStream::connect(rule.listen().unwrap()).await?;

    assert!(
        wait_until(
            || {
                client_events
                    .errors()
                    .iter()
                    .any(|(_, kind)| *kind == ErrorKind::RetryExhausted)
            },
            Duration::from_secs(5),
        )
        .await,
        "retry exhaustion never surfaced"
    );
    Ok(())
}

#[tokio::test]
async fn test_rule_removal_drains_and_closes() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client = Context::new(a, TestObserver::default());
    let server_events = TestObserver::default();
    let server = Context::new(b, server_events.clone());

    let (backend, _task) = echo_backend().await?;
    let server_rule = server.add_rule(RuleMode::Server, "gone", backend).await?;
    let rule = client
        .add_rule(RuleMode::Client, "gone", "127.0.0.1:0".parse()?)
        .await?;

    let mut stream = TcpStream::connect(rule.listen().unwrap()).await?;
    let data = payload(1000, 5);
    stream.write_all(&data).await?;
    let mut echo = vec![0u8; 1000];
    timeout(Duration::from_secs(30), stream.read_exact(&mut echo)).await??;
    assert_eq!(echo, data);

    server_rule.remove();

    // the active session drains and closes; the client observes a local
    // tcp close within a bounded linger.
    let size = timeout(Duration::from_secs(15), stream.read(&mut echo)).await??;
    assert_eq!(size, 0);

    // both session tables empty out after the linger.
    assert!(
        wait_until_empty(&server, Duration::from_secs(15)).await,
        "server session lingered forever"
    );
    assert!(
        wait_until_empty(&client, Duration::from_secs(15)).await,
        "client session lingered forever"
    );
    assert!(server_events.closed() >= 1);
    Ok(())
}

async fn wait_until_empty<T: Observer>(context: &Context<T>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(dump) = context.dump().await {
            if dump.sessions.is_empty() {
                return true;
            }
        }

        sleep(Duration::from_millis(100)).await;
    }

    false
}

#[tokio::test]
async fn test_simultaneous_close() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client = Context::new(a, TestObserver::default());
    let server = Context::new(b, TestObserver::default());

    // a backend that writes its own payload and echoes nothing.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let backend = listener.local_addr()?;
    let server_payload = payload(32 * 1024, 21);
    let expected_upload = payload(32 * 1024, 22);
    let received = Arc::new(Mutex::new(Vec::new()));

    let received_ = received.clone();
    let server_payload_ = server_payload.clone();
    let _backend_task = tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = Vec::new();
            let _ = stream.write_all(&server_payload_).await;
            let _ = stream.read_to_end(&mut buf).await;
            *received_.lock() = buf;
        }
    });

    let _server_rule = server.add_rule(RuleMode::Server, "both", backend).await?;
    let rule = client
        .add_rule(RuleMode::Client, "both", "127.0.0.1:0".parse()?)
        .await?;

    let mut stream = TcpStream::connect(rule.listen().unwrap()).await?;
    stream.write_all(&expected_upload).await?;

    // read the peer's full payload first so nothing is in flight, then
    // close; the backend closes when it sees our eof.
    let mut download = vec![0u8; server_payload.len()];
    timeout(Duration::from_secs(30), stream.read_exact(&mut download)).await??;
    assert_eq!(download, server_payload);
    drop(stream);

    assert!(
        wait_until_empty(&client, Duration::from_secs(20)).await,
        "client sessions did not close"
    );
    assert!(
        wait_until_empty(&server, Duration::from_secs(20)).await,
        "server sessions did not close"
    );
    assert!(
        wait_until(
            || received.lock().as_slice() == expected_upload.as_slice(),
            Duration::from_secs(5),
        )
        .await,
        "upload did not fully reach the backend"
    );
    Ok(())
}

#[tokio::test]
async fn test_add_rule_validation() -> Result<()> {
    let (a, _b) = socket_pair().await?;
    let events = TestObserver::default();
    let context = Context::new(a, events.clone());

    let backend: SocketAddr = "127.0.0.1:9".parse()?;
    let _rule = context.add_rule(RuleMode::Server, "dup", backend).await?;

    // duplicate (mode, service) is rejected.
    assert!(context.add_rule(RuleMode::Server, "dup", backend).await.is_err());

    // the same service under the opposite mode is a different rule.
    assert!(
        context
            .add_rule(RuleMode::Client, "dup", "127.0.0.1:0".parse()?)
            .await
            .is_ok()
    );

    // service names are bounded.
    assert!(context.add_rule(RuleMode::Server, "", backend).await.is_err());
    let long = "x".repeat(256);
    assert!(context.add_rule(RuleMode::Server, &long, backend).await.is_err());

    // a taken port fails the client bind.
    let taken = TcpListener::bind("127.0.0.1:0").await?;
    assert!(
        context
            .add_rule(RuleMode::Client, "bound", taken.local_addr()?)
            .await
            .is_err()
    );

    assert_eq!(events.errors().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_option_validation() -> Result<()> {
    let (a, _b) = socket_pair().await?;
    let context = Context::new(a, TestObserver::default());

    assert!(context.set_option(ContextOption::UdpTimeout, 10).is_ok());
    assert!(context.set_option(ContextOption::UdpTimeout, 9).is_err());
    assert!(context.set_option(ContextOption::UdpTimeout, 30_001).is_err());
    assert!(context.set_option(ContextOption::UdpRetries, 21).is_err());
    assert!(context.set_option(ContextOption::SlideWindow, 64).is_ok());
    assert!(context.set_option(ContextOption::SessionTimeout, 9).is_err());
    assert!(context.set_option(ContextOption::DebugBandwidth, 0).is_ok());
    Ok(())
}

fn encode(kind: PacketType, session: u16, peer_session: u16, sequence: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    Packet {
        kind,
        session,
        peer_session,
        sequence,
        payload,
    }
    .encode(&mut buf)
    .unwrap();
    buf.to_vec()
}

async fn recv_packet(socket: &UdpSocket) -> Result<(PacketType, u16, u16, u32, Vec<u8>)> {
    let mut buf = vec![0u8; 2048];
    let size = timeout(Duration::from_secs(5), socket.recv(&mut buf)).await??;
    let packet = Packet::decode(&buf[..size]).map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok((
        packet.kind,
        packet.session,
        packet.peer_session,
        packet.sequence,
        packet.payload.to_vec(),
    ))
}

#[tokio::test]
async fn test_duplicate_connect_and_data_are_idempotent() -> Result<()> {
    let (raw, b) = socket_pair().await?;
    let server = Context::new(b, TestObserver::default());

    // a backend that counts connections and keeps what it reads.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let backend = listener.local_addr()?;
    let accepts = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(Mutex::new(Vec::new()));

    let accepts_ = accepts.clone();
    let sink_ = sink.clone();
    let _backend_task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            accepts_.fetch_add(1, Ordering::SeqCst);
            let sink = sink_.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(size) => sink.lock().extend_from_slice(&buf[..size]),
                    }
                }
            });
        }
    });

    let _rule = server.add_rule(RuleMode::Server, "sink", backend).await?;

    // a connect and its retransmit: exactly one session, one backend
    // connection, and both get acknowledged with the same session id.
    raw.send(&encode(PacketType::Connect, 9, 0, 0, b"sink")).await?;
    let (kind, session, peer_session, _, _) = recv_packet(&raw).await?;
    assert_eq!(kind, PacketType::ConnectAck);
    assert_eq!(peer_session, 9);

    raw.send(&encode(PacketType::Connect, 9, 0, 0, b"sink")).await?;
    let (kind, dup_session, peer_session, _, _) = recv_packet(&raw).await?;
    assert_eq!(kind, PacketType::ConnectAck);
    assert_eq!(dup_session, session);
    assert_eq!(peer_session, 9);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    // a data segment and its duplicate: delivered once, acked both times.
    raw.send(&encode(PacketType::Data, 9, session, 1, b"hello")).await?;
    let (kind, _, _, sequence, _) = recv_packet(&raw).await?;
    assert_eq!(kind, PacketType::Ack);
    assert_eq!(sequence, 1);

    raw.send(&encode(PacketType::Data, 9, session, 1, b"hello")).await?;
    let (kind, _, _, sequence, _) = recv_packet(&raw).await?;
    assert_eq!(kind, PacketType::Ack);
    assert_eq!(sequence, 1);

    assert!(
        wait_until(
            || sink.lock().as_slice() == b"hello".as_slice(),
            Duration::from_secs(5),
        )
        .await,
        "payload never reached the backend"
    );
    assert_eq!(sink.lock().len(), 5);
    Ok(())
}

#[tokio::test]
async fn test_removed_rule_refuses_new_data() -> Result<()> {
    let (raw, b) = socket_pair().await?;
    let server = Context::new(b, TestObserver::default());

    // a backend that accepts and discards everything.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let backend = listener.local_addr()?;
    let _backend_task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    let rule = server.add_rule(RuleMode::Server, "refuse", backend).await?;

    raw.send(&encode(PacketType::Connect, 5, 0, 0, b"refuse")).await?;
    let (kind, session, _, _, _) = recv_packet(&raw).await?;
    assert_eq!(kind, PacketType::ConnectAck);

    raw.send(&encode(PacketType::Data, 5, session, 1, b"ok")).await?;
    let (kind, _, _, sequence, _) = recv_packet(&raw).await?;
    assert_eq!(kind, PacketType::Ack);
    assert_eq!(sequence, 1);

    rule.remove();
    sleep(Duration::from_millis(200)).await;

    // fresh data after the removal must not be admitted or acknowledged,
    // only answered with a close.
    raw.send(&encode(PacketType::Data, 5, session, 2, b"no")).await?;

    let mut saw_close = false;
    let mut buf = vec![0u8; 2048];
    let deadline = Instant::now() + Duration::from_millis(1500);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let Ok(result) = timeout(remaining, raw.recv(&mut buf)).await else {
            break;
        };

        let size = result?;
        if let Ok(packet) = Packet::decode(&buf[..size]) {
            assert_ne!(
                packet.kind,
                PacketType::Ack,
                "data was acknowledged after rule removal"
            );
            if packet.kind == PacketType::Close {
                saw_close = true;
            }
        }
    }

    assert!(saw_close, "no close after rule removal");
    Ok(())
}

#[tokio::test]
async fn test_stateless_reset_and_unknown_datagrams() -> Result<()> {
    let (raw, b) = socket_pair().await?;
    let events = TestObserver::default();
    let _server = Context::new(b, events.clone());

    // data for a session the peer never heard of draws a close.
    raw.send(&encode(PacketType::Data, 77, 123, 1, b"stale")).await?;
    let (kind, _, peer_session, _, _) = recv_packet(&raw).await?;
    assert_eq!(kind, PacketType::Close);
    assert_eq!(peer_session, 77);

    // garbage that fails the magic check lands in the unknown hook.
    raw.send(b"\x00\x01not a tunnel packet").await?;
    assert!(
        wait_until(|| events.unknown() == 1, Duration::from_secs(5)).await,
        "unknown packet hook never fired"
    );
    Ok(())
}

#[tokio::test]
async fn test_idle_session_expires() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client = Context::new(a, TestObserver::default());
    let server = Context::new(b, TestObserver::default());
    server.set_option(ContextOption::SessionTimeout, 10)?;

    let (backend, _task) = echo_backend().await?;
    let _server_rule = server.add_rule(RuleMode::Server, "idle", backend).await?;
    let rule = client
        .add_rule(RuleMode::Client, "idle", "127.0.0.1:0".parse()?)
        .await?;

    let mut stream = TcpStream::connect(rule.listen().unwrap()).await?;
    stream.write_all(b"ping").await?;
    let mut echo = [0u8; 4];
    timeout(Duration::from_secs(30), stream.read_exact(&mut echo)).await??;

    // the client half goes away without a word; the server session must
    // idle out on its own.
    client.shutdown();
    drop(stream);

    assert!(
        wait_until_empty(&server, Duration::from_secs(25)).await,
        "idle session never expired"
    );
    Ok(())
}

#[tokio::test]
async fn test_dump_reports_tables() -> Result<()> {
    let (a, b) = socket_pair().await?;
    let client = Context::new(a, TestObserver::default());
    let server = Context::new(b, TestObserver::default());

    let (backend, _task) = echo_backend().await?;
    let _server_rule = server.add_rule(RuleMode::Server, "dump", backend).await?;
    let rule = client
        .add_rule(RuleMode::Client, "dump", "127.0.0.1:0".parse()?)
        .await?;

    let mut stream = TcpStream::connect(rule.listen().unwrap()).await?;
    stream.write_all(b"dump me").await?;
    let mut echo = [0u8; 7];
    timeout(Duration::from_secs(30), stream.read_exact(&mut echo)).await??;

    let dump = client.dump().await.expect("context gone");
    assert_eq!(dump.rules.len(), 1);
    assert_eq!(dump.rules[0].service, "dump");
    assert_eq!(dump.sessions.len(), 1);
    assert_eq!(dump.sessions[0].state, "established");
    assert!(dump.peer.is_some());

    let dump = server.dump().await.expect("context gone");
    assert_eq!(dump.sessions.len(), 1);
    assert_eq!(dump.sessions[0].service, "dump");
    Ok(())
}
