use crate::error::Error;

use mio::net::TcpStream;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, error, instrument, trace, warn};

/// Identifies a connection within a [`Server`](crate::Server). Also used as
/// the connection's poll token.
pub type ConnectionId = usize;

/// Lifecycle of a connection.
///
/// `Connecting` only applies to a client's outbound connection while the
/// connect is in flight; accepted connections start as `Established`. Only
/// the reaper moves a connection to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Dead,
    Closed,
}

// Internal data type for Connection::drain
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// The read would block; the connection stays open.
    Open(Vec<u8>),
    /// The peer closed its side.
    Closed(Vec<u8>),
    /// Reading failed for a reason other than "would block".
    Failed(Vec<u8>, io::Error),
}

impl ReadOutcome {
    pub(crate) fn into_data(self) -> Vec<u8> {
        match self {
            ReadOutcome::Open(data) | ReadOutcome::Closed(data) | ReadOutcome::Failed(data, _) => {
                data
            }
        }
    }
}

/// A single non-blocking TCP socket and its identity.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    state: ConnectionState,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        state: ConnectionState,
    ) -> Self {
        Self {
            id,
            stream,
            state,
            local_addr,
            peer_addr,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        trace!(id = self.id, from = ?self.state, to = ?state, "Connection state change");
        self.state = state;
    }

    /// Reads everything currently available, `chunk` bytes at a time.
    #[instrument(skip(self), fields(id = self.id))]
    pub(crate) fn drain(&mut self, chunk: usize) -> ReadOutcome {
        let local_addr = &self.local_addr;
        let peer_addr = &self.peer_addr;
        let mut recv_buf = Vec::<u8>::new();
        let mut recv_pos: usize = 0;

        let outcome = loop {
            recv_buf.resize(recv_pos + chunk, 0);

            match self.stream.read(&mut recv_buf[recv_pos..]) {
                Ok(0) => {
                    debug!(%local_addr, %peer_addr, "Connection closed by peer");
                    break None;
                }
                Ok(sz) => {
                    trace!(len = sz, %local_addr, %peer_addr, "Read data from socket");
                    recv_pos += sz;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Some(Ok(())),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if err.kind() == ErrorKind::ConnectionReset {
                        warn!(%local_addr, %peer_addr, "Connection reset");
                    } else {
                        error!(%local_addr, %peer_addr, ?err, "Error reading from socket");
                    }
                    break Some(Err(err));
                }
            }
        };

        recv_buf.truncate(recv_pos);
        if !recv_buf.is_empty() {
            debug!(len = recv_buf.len(), %local_addr, %peer_addr, "Received data");
        }

        match outcome {
            Some(Ok(())) => ReadOutcome::Open(recv_buf),
            Some(Err(err)) => ReadOutcome::Failed(recv_buf, err),
            None => ReadOutcome::Closed(recv_buf),
        }
    }

    /// Writes all of `buf` without blocking.
    ///
    /// If the socket's send buffer fills up first, the bytes already written
    /// stay written and [`Error::PartialWrite`] is returned.
    #[instrument(skip(self, buf), fields(id = self.id, len = buf.len()))]
    pub(crate) fn write_payload(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let mut send_pos = 0;

        while send_pos < buf.len() {
            match self.stream.write(&buf[send_pos..]) {
                Ok(0) => break,
                Ok(sz) => {
                    send_pos += sz;
                    trace!(len = sz, remaining = buf.len() - send_pos, "Wrote to socket");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(Error::Write { id: self.id, source }),
            }
        }

        if send_pos < buf.len() {
            return Err(Error::PartialWrite {
                id: self.id,
                written: send_pos,
                len: buf.len(),
            });
        }
        Ok(send_pos)
    }

    pub(crate) fn shutdown(&self, how: Shutdown) {
        if let Err(err) = self.stream.shutdown(how) {
            // Already disconnected peers report NotConnected here.
            if err.kind() != ErrorKind::NotConnected {
                warn!(id = self.id, ?how, ?err, "Error shutting down connection");
            }
        }
    }
}
