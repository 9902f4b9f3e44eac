//! Host/Client Relay Integration Tests
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test relay -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test relay -- --nocapture
//! ```

use relaycomm::prelude::*;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

const LOCALHOST: u32 = 0x7f00_0001;
const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("relaycomm={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

fn host_config() -> ServerConfig {
    // Port 0 binds an ephemeral port.
    ServerConfig::new(LOCALHOST, 0)
}

fn spawn_host() -> (ServerHandle, JoinHandle<Result<(), Error>>, u16) {
    let mut server = Server::host(host_config()).expect("Failed to start host");
    let port = server.local_addr().expect("Host has no local address").port();
    let handle = server.handle();
    let worker = thread::spawn(move || {
        let result = server.run_with_sink(&mut |_: &Message| {});
        server.disconnect();
        result
    });
    (handle, worker, port)
}

fn connect_peer(port: u16) -> TcpStream {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("Failed to connect peer");
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    stream
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Reads until `needle` shows up or the wait expires; returns everything read.
fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let deadline = Instant::now() + WAIT;
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&received).contains(needle) && Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => panic!("Read failed: {err}"),
        }
    }
    String::from_utf8(received).unwrap()
}

/// Asserts that nothing arrives on `stream` within its read timeout.
fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    match stream.read(&mut buf) {
        Ok(0) => panic!("Connection closed unexpectedly"),
        Ok(n) => panic!(
            "Unexpected data: {:?}",
            String::from_utf8_lossy(&buf[..n])
        ),
        Err(err) => assert!(
            matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            "Unexpected error: {err}"
        ),
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Host Tests
// ============================================================================

#[test]
fn host_relays_to_everyone_but_the_sender() {
    init_tracing();
    let (handle, worker, port) = spawn_host();

    let mut a = connect_peer(port);
    let mut b = connect_peer(port);
    let mut c = connect_peer(port);
    wait_for("three connections", || handle.connection_count().unwrap() == 3);

    a.write_all(b"hello").unwrap();

    let at_b = read_until(&mut b, "hello");
    let at_c = read_until(&mut c, "hello");
    println!("B received {at_b:?}, C received {at_c:?}");
    assert!(at_b.starts_with("user_"), "Missing sender tag: {at_b:?}");
    assert!(at_b.ends_with(": hello"), "Unexpected payload: {at_b:?}");
    assert_eq!(at_b, at_c, "B and C must see the same sender");
    assert_silent(&mut a);

    handle.shutdown();
    worker.join().unwrap().unwrap();
}

#[test]
fn host_retires_disconnected_peers() {
    init_tracing();
    let (handle, worker, port) = spawn_host();

    let a = connect_peer(port);
    let mut b = connect_peer(port);
    wait_for("two connections", || handle.connection_count().unwrap() == 2);

    drop(a);
    wait_for("one connection", || handle.connection_count().unwrap() == 1);

    let sent = handle.broadcast(Message::new("host", "still here")).unwrap();
    assert_eq!(sent, 1);
    assert_eq!(read_until(&mut b, "still here"), "host: still here");

    handle.shutdown();
    worker.join().unwrap().unwrap();
}

#[test]
fn broadcast_reaches_each_other_live_connection_once() {
    init_tracing();
    let mut server = Server::host(host_config()).unwrap();
    let port = server.local_addr().unwrap().port();

    let mut peers: Vec<TcpStream> = (0..3).map(|_| connect_peer(port)).collect();
    wait_for("three accepted connections", || {
        server.accept_all().unwrap();
        server.connection_count() == 3
    });

    let ids = server.connection_ids();
    assert_eq!(ids.len(), 3);
    let sent = server
        .broadcast(&Message::new("host", "x"), Some(ids[0]))
        .unwrap();
    assert_eq!(sent, 2);

    // The excluded id is one of the three peers; exactly the other two see
    // the payload, once each.
    let mut silent = 0;
    for peer in &mut peers {
        let mut buf = [0u8; 64];
        match peer.read(&mut buf) {
            Ok(n) => assert_eq!(&buf[..n], b"host: x"),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                silent += 1
            }
            Err(err) => panic!("Read failed: {err}"),
        }
    }
    assert_eq!(silent, 1);
    for peer in &mut peers {
        assert_silent(peer);
    }

    server.disconnect();
}

#[test]
fn event_loop_marks_eof_dead_and_reaps_once() {
    init_tracing();
    let mut server = Server::host(host_config()).unwrap();
    let port = server.local_addr().unwrap().port();
    let mut relayed = Vec::new();

    let a = connect_peer(port);
    let mut b = connect_peer(port);
    wait_for("two connections", || {
        server
            .run_once(&mut |m: &Message| relayed.push(m.clone()), Some(Duration::from_millis(20)))
            .unwrap();
        server.connection_count() == 2
    });

    drop(a);
    b.write_all(b"after").unwrap();
    wait_for("the closed peer to be retired", || {
        server
            .run_once(&mut |m: &Message| relayed.push(m.clone()), Some(Duration::from_millis(20)))
            .unwrap();
        server.connection_count() == 1 && !relayed.is_empty()
    });

    // The next iteration's reap has closed the dead connection, so nothing is
    // left pending.
    server
        .run_once(&mut |_: &Message| {}, Some(Duration::from_millis(20)))
        .unwrap();
    assert_eq!(server.reap(), 0);
    assert_eq!(server.reap(), 0);
    assert_eq!(server.connection_count(), 1);

    assert_eq!(relayed.len(), 1);
    assert!(relayed[0].sender().starts_with("user_"));
    assert_eq!(relayed[0].contents(), b"after");

    server.disconnect();
}

#[test]
fn bind_conflict_is_reported() {
    init_tracing();
    let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = Server::host(ServerConfig::new(LOCALHOST, port)).unwrap_err();
    assert!(
        matches!(err, Error::Bind { port: p, .. } if p == port),
        "Unexpected error: {err:?}"
    );
}

#[test]
fn disconnect_closes_listener_and_is_idempotent() {
    init_tracing();
    let mut server = Server::host(host_config()).unwrap();
    let port = server.local_addr().unwrap().port();

    server.disconnect();
    server.disconnect();

    assert!(server.should_shutdown());
    assert!(server.local_addr().is_none());
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err());
}

// ============================================================================
// Client Tests
// ============================================================================

#[test]
fn client_sends_through_handle() {
    init_tracing();
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = Server::client(ServerConfig::new(LOCALHOST, port)).unwrap();
    assert_eq!(client.mode(), Mode::Client);
    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

    let handle = client.handle();
    let worker = thread::spawn(move || client.run_with_sink(&mut |_: &Message| {}));

    assert_eq!(handle.send("ping").unwrap(), 4);
    assert_eq!(read_until(&mut peer, "ping"), "ping");

    handle.shutdown();
    worker.join().unwrap().unwrap();
    assert!(matches!(handle.send("late"), Err(Error::Shutdown)));
}

#[test]
fn client_stops_when_host_closes() {
    init_tracing();
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = Server::client(ServerConfig::new(LOCALHOST, port)).unwrap();
    let (mut peer, _) = listener.accept().unwrap();
    peer.write_all(b"bye").unwrap();
    drop(peer);
    drop(listener);

    let mut received = Vec::new();
    let result = client.run_with_sink(&mut |m: &Message| received.extend_from_slice(m.contents()));

    assert!(
        matches!(result, Err(Error::PeerClosed { .. })),
        "Unexpected result: {result:?}"
    );
    assert!(client.should_shutdown());
    assert_eq!(received, b"bye");
}

#[test]
fn client_connect_to_closed_port_fails() {
    init_tracing();
    let port = free_port();
    let mut config = ServerConfig::new(LOCALHOST, port);
    config.connect_timeout_ms = 500;

    let started = Instant::now();
    let err = Server::client(config).unwrap_err();
    assert!(
        matches!(err, Error::Connect { .. }),
        "Unexpected error: {err:?}"
    );
    assert!(started.elapsed() < Duration::from_millis(500) + Duration::from_secs(2));
}

#[test]
fn client_connect_to_unreachable_address_is_bounded() {
    init_tracing();
    // TEST-NET-1 is never routed; depending on the environment the connect
    // either times out or fails immediately.
    let mut config = ServerConfig::new(u32::from(Ipv4Addr::new(192, 0, 2, 1)), 9);
    config.connect_timeout_ms = 300;

    let started = Instant::now();
    let err = Server::client(config).unwrap_err();
    let elapsed = started.elapsed();
    println!("Connect failed after {elapsed:?}: {err}");

    assert!(
        matches!(err, Error::Connect { .. }),
        "Unexpected error: {err:?}"
    );
    assert!(elapsed < Duration::from_millis(300) + Duration::from_secs(2));
}

// ============================================================================
// Mode Tests
// ============================================================================

#[test]
fn operations_are_checked_against_mode() {
    init_tracing();
    let mut host = Server::connect(Mode::Host, host_config()).unwrap();
    assert_eq!(host.mode(), Mode::Host);
    assert!(matches!(
        host.send(b"x"),
        Err(Error::ModeMismatch { mode: Mode::Host, .. })
    ));

    let port = host.local_addr().unwrap().port();
    let mut client = Server::connect(Mode::Client, ServerConfig::new(LOCALHOST, port)).unwrap();
    assert!(matches!(
        client.broadcast(&Message::new("me", "x"), None),
        Err(Error::ModeMismatch { mode: Mode::Client, .. })
    ));
    assert!(matches!(
        client.accept_all(),
        Err(Error::ModeMismatch { .. })
    ));
    assert_eq!(client.reap(), 0);
    assert_eq!(client.connection_count(), 1);

    client.disconnect();
    host.disconnect();
}
