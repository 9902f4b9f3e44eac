//! Socket setup for both ends of the relay.
//!
//! [`setup_host`] produces the non-blocking listening socket a host polls for
//! new peers. [`setup_client`] produces the single outbound [`Connection`] a
//! client talks through, using a two-phase non-blocking connect so an
//! unreachable host can never stall the process beyond the configured
//! timeout.

mod connection;
mod registry;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub(crate) use connection::ReadOutcome;
pub use registry::ConnectionRegistry;

use crate::config::ServerConfig;
use crate::error::{ConnectError, Error};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Backlog passed to `listen()` for the host socket.
pub const LISTEN_BACKLOG: i32 = 32;

/// First identifier handed out to connections. Lower values are reserved for
/// the listener and the waker tokens.
pub const CONNECTION_ID_RANGE_START: ConnectionId = 1000;

// The client's only connection always uses the first connection id.
const CLIENT_CONNECTION_ID: ConnectionId = CONNECTION_ID_RANGE_START;

const CONNECT_TOKEN: Token = Token(0);

// ============================================================================
// Host Setup
// ============================================================================

/// Creates the host's listening socket.
///
/// The socket reuses its address, is non-blocking and is bound to the
/// wildcard address on `config.port` (the configured address is ignored). A
/// port of 0 binds an ephemeral port.
///
/// On failure the partially set up socket is closed before the error is
/// returned.
#[instrument(skip(config), fields(port = config.port))]
pub fn setup_host(config: &ServerConfig) -> Result<TcpListener, Error> {
    let addr = SocketAddr::V4(config.listen_addr());

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::SocketCreate)?;
    socket
        .set_reuse_address(true)
        .map_err(Error::SocketCreate)?;
    socket.set_nonblocking(true).map_err(Error::SocketCreate)?;
    socket.bind(&addr.into()).map_err(|source| Error::Bind {
        port: config.port,
        source,
    })?;
    socket.listen(LISTEN_BACKLOG).map_err(Error::Listen)?;

    let listener = TcpListener::from_std(socket.into());
    match listener.local_addr() {
        Ok(local_addr) => info!(%local_addr, "Listening for connections"),
        Err(err) => warn!(?err, "Listening, but failed to get local address"),
    }
    Ok(listener)
}

// ============================================================================
// Client Setup
// ============================================================================

/// Connects to the host at `config.address:config.port`.
///
/// The connect is issued on a non-blocking socket. An "in progress" result is
/// expected; completion is confirmed by waiting for the socket to become
/// writable within `config.connect_timeout_ms` and then checking its pending
/// error. Any failure, including the timeout, is reported as
/// [`Error::Connect`] and the socket is closed.
#[instrument(skip(config), fields(addr = %config.socket_addr()))]
pub fn setup_client(config: &ServerConfig) -> Result<Connection, Error> {
    let addr = config.socket_addr();
    let timeout = Duration::from_millis(config.connect_timeout_ms);

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::SocketCreate)?;
    socket.set_nonblocking(true).map_err(Error::SocketCreate)?;

    match socket.connect(&SocketAddr::V4(addr).into()) {
        Ok(()) => debug!("Connected immediately"),
        Err(err) if is_in_progress(&err) => debug!("Connection in progress"),
        Err(err) => {
            return Err(Error::Connect {
                addr,
                kind: ConnectError::Refused(err),
            })
        }
    }

    let stream = TcpStream::from_std(socket.into());
    let local_addr = stream.local_addr().map_err(Error::SocketCreate)?;
    let mut connection = Connection::new(
        CLIENT_CONNECTION_ID,
        stream,
        local_addr,
        SocketAddr::V4(addr),
        ConnectionState::Connecting,
    );

    wait_until_connected(connection.stream_mut(), addr, timeout)?;
    connection
        .stream_mut()
        .set_nodelay(true)
        .map_err(Error::SocketCreate)?;
    connection.set_state(ConnectionState::Established);

    info!(
        local_addr = %connection.local_addr(),
        peer_addr = %connection.peer_addr(),
        "Connection established"
    );
    Ok(connection)
}

// Waits for the in-flight connect on `stream` to complete.
fn wait_until_connected(
    stream: &mut TcpStream,
    addr: SocketAddrV4,
    timeout: Duration,
) -> Result<(), Error> {
    let fail = |kind| Error::Connect { addr, kind };

    let mut poll = Poll::new().map_err(|err| fail(ConnectError::Poll(err)))?;
    poll.registry()
        .register(stream, CONNECT_TOKEN, Interest::WRITABLE)
        .map_err(|err| fail(ConnectError::Poll(err)))?;

    let mut events = Events::with_capacity(4);
    let deadline = Instant::now() + timeout;

    let result = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Timed out connecting");
            break Err(ConnectError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        match poll.poll(&mut events, Some(remaining)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break Err(ConnectError::Poll(err)),
        }
        if events.is_empty() {
            continue;
        }

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => break Err(ConnectError::Pending(err)),
        }

        // Writable without a pending error can still be spurious; only a
        // known peer address means the handshake finished.
        match stream.peer_addr() {
            Ok(_) => break Ok(()),
            Err(err) if err.kind() == ErrorKind::NotConnected => continue,
            Err(err) => break Err(ConnectError::Pending(err)),
        }
    };

    if let Err(err) = poll.registry().deregister(stream) {
        warn!(?err, "Failed to deregister connecting socket");
    }
    result.map_err(fail)
}

#[cfg(unix)]
fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn is_in_progress(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}
