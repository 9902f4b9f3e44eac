//! Host side of the relay: accepting peers, draining their sockets, relaying
//! payloads to everyone else, and retiring peers that went away.

use super::{LISTENER_ID, WAKE_ID};
use crate::config::ServerConfig;
use crate::error::Error;
use crate::message::{Message, Sink};
use crate::transport::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionState, ReadOutcome,
    CONNECTION_ID_RANGE_START,
};

use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Registry, Token};
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug)]
pub(super) struct Host {
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    registry: ConnectionRegistry,
    next_id: ConnectionId,
}

impl Host {
    pub(super) fn new(
        mut listener: TcpListener,
        registry: &Registry,
        token: Token,
    ) -> Result<Self, Error> {
        registry
            .register(&mut listener, token, Interest::READABLE)
            .map_err(Error::Poll)?;
        let local_addr = listener.local_addr().ok();

        Ok(Self {
            listener: Some(listener),
            local_addr,
            registry: ConnectionRegistry::new(),
            next_id: CONNECTION_ID_RANGE_START,
        })
    }

    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and(self.local_addr)
    }

    pub(super) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

// ============================================================================
// Event Dispatch
// ============================================================================

impl Host {
    pub(super) fn handle_events(
        &mut self,
        events: &Events,
        registry: &Registry,
        config: &ServerConfig,
        sink: &mut impl Sink,
    ) -> Result<(), Error> {
        for event in events.iter() {
            let Token(id) = event.token();

            match id {
                WAKE_ID => {}
                LISTENER_ID => {
                    if !event.is_readable() {
                        error!(?event, "Unexpected readiness on listener");
                        return Err(Error::UnexpectedReadiness {
                            token: id,
                            detail: format!("{event:?}"),
                        });
                    }
                    self.accept_all(registry, config)?;
                }
                id => self.handle_connection_event(id, event, config, sink),
            }
        }
        Ok(())
    }

    fn handle_connection_event(
        &mut self,
        id: ConnectionId,
        event: &Event,
        config: &ServerConfig,
        sink: &mut impl Sink,
    ) {
        if !self.registry.is_live(id) {
            trace!(id, "Ignoring event for retired connection");
            return;
        }

        // Errors and hang-ups normally arrive together with readability and
        // are surfaced by the read itself.
        if !event.is_readable() {
            warn!(id, ?event, "Unexpected readiness on connection");
            self.retire(id);
            return;
        }

        if let Some(message) = self.read_connection(id, config) {
            info!(
                id,
                sender = message.sender(),
                len = message.contents().len(),
                "Relaying message"
            );
            sink.deliver(&message);
            self.broadcast(&message, Some(id));
        }
    }
}

// ============================================================================
// Connection I/O
// ============================================================================

impl Host {
    /// Accepts until the listener would block.
    #[instrument(skip(self, registry, config))]
    pub(super) fn accept_all(
        &mut self,
        registry: &Registry,
        config: &ServerConfig,
    ) -> Result<usize, Error> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(0);
        };

        // Collect first, register afterwards, so the listener borrow ends
        // before the registry is touched.
        let mut new_streams = Vec::new();
        loop {
            match listener.accept() {
                Ok(accepted) => new_streams.push(accepted),
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Error accepting connection");
                        return Err(Error::Accept(err));
                    }
                },
            }
        }

        let mut accepted = 0;
        for (mut stream, peer_addr) in new_streams {
            let id = self.next_id;

            if let Err(err) = stream.set_nodelay(true) {
                warn!(id, %peer_addr, ?err, "Failed to set TCP_NODELAY");
            }
            let local_addr = match stream.local_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!(id, %peer_addr, ?err, "Dropping connection without local address");
                    continue;
                }
            };
            if let Err(err) = registry.register(&mut stream, Token(id), Interest::READABLE) {
                warn!(id, %peer_addr, ?err, "Dropping connection that could not be registered");
                continue;
            }

            info!(id, %local_addr, %peer_addr, "Registering new connection");
            let connection = Connection::new(
                id,
                stream,
                local_addr,
                peer_addr,
                ConnectionState::Established,
            );
            self.registry.insert(id, connection);
            self.advance_connection_id();
            accepted += 1;
        }

        if self.registry.len() > config.max_connections {
            warn!(
                live = self.registry.len(),
                max_connections = config.max_connections,
                "More connections than configured maximum"
            );
        }

        Ok(accepted)
    }

    // Drains a readable connection. Returns its payload, if any, as a message
    // from that connection. Marks the connection dead on EOF or error.
    #[instrument(skip(self, config))]
    fn read_connection(&mut self, id: ConnectionId, config: &ServerConfig) -> Option<Message> {
        let conn = self.registry.get_mut(id)?;
        let outcome = conn.drain(config.max_read_size);

        match &outcome {
            ReadOutcome::Open(_) => {}
            ReadOutcome::Closed(_) => {
                info!(id, peer_addr = %conn.peer_addr(), "Peer closed connection");
                self.retire(id);
            }
            ReadOutcome::Failed(_, err) => {
                warn!(id, peer_addr = %conn.peer_addr(), ?err, "Read failed");
                self.retire(id);
            }
        }

        let data = outcome.into_data();
        if data.is_empty() {
            None
        } else {
            Some(Message::from_connection(id, data))
        }
    }

    /// Writes `message` to each live connection other than `exclude`.
    #[instrument(skip(self, message))]
    pub(super) fn broadcast(&mut self, message: &Message, exclude: Option<ConnectionId>) -> usize {
        let wire = message.to_wire();
        let targets = self.registry.live_ids_except(exclude);
        let mut sent = 0;

        for &id in &targets {
            let Some(conn) = self.registry.get_mut(id) else {
                continue;
            };
            match conn.write_payload(&wire) {
                Ok(_) => sent += 1,
                Err(err) => warn!(id, %err, "Failed to relay message"),
            }
        }

        debug!(sent, targets = targets.len(), len = wire.len(), "Broadcast message");
        sent
    }

    /// Closes every connection marked dead since the last reap.
    pub(super) fn reap(&mut self, registry: &Registry) -> usize {
        let reaped = self.registry.reap();
        if reaped.is_empty() {
            return 0;
        }

        debug!(count = reaped.len(), "Closing dead connections");
        let count = reaped.len();
        for (id, mut conn) in reaped {
            if let Err(err) = registry.deregister(conn.stream_mut()) {
                warn!(id, ?err, "Failed to deregister connection");
            }
            conn.set_state(ConnectionState::Closed);
            info!(id, peer_addr = %conn.peer_addr(), "Closed connection");
        }
        count
    }

    /// Closes every connection and the listener.
    pub(super) fn close_all(&mut self, registry: &Registry) {
        for (id, mut conn) in self.registry.drain() {
            conn.shutdown(Shutdown::Both);
            if let Err(err) = registry.deregister(conn.stream_mut()) {
                warn!(id, ?err, "Failed to deregister connection");
            }
            conn.set_state(ConnectionState::Closed);
            info!(id, peer_addr = %conn.peer_addr(), "Closed connection");
        }

        if let Some(mut listener) = self.listener.take() {
            if let Err(err) = registry.deregister(&mut listener) {
                warn!(?err, "Failed to deregister listener");
            }
            info!(local_addr = ?self.local_addr, "Closed listener");
        }
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl Host {
    fn retire(&mut self, id: ConnectionId) {
        if self.registry.mark_dead(id) {
            if let Some(conn) = self.registry.get_mut(id) {
                conn.set_state(ConnectionState::Dead);
            }
        }
    }

    // Ids only come back around after wrapping, and never while still
    // tracked.
    fn advance_connection_id(&mut self) {
        loop {
            self.next_id = self
                .next_id
                .checked_add(1)
                .unwrap_or(CONNECTION_ID_RANGE_START);
            if !self.registry.contains(self.next_id) {
                break;
            }
        }
    }
}
