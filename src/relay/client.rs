use super::WAKE_ID;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::message::{Message, Sink};
use crate::transport::{Connection, ConnectionId, ConnectionState, ReadOutcome};

use mio::{Events, Interest, Registry, Token};
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, info, warn};

// Client side of the relay: one connection to the host.
#[derive(Debug)]
pub(super) struct Client {
    connection: Option<Connection>,
}

impl Client {
    pub(super) fn new(mut connection: Connection, registry: &Registry) -> Result<Self, Error> {
        let token = Token(connection.id());
        registry
            .register(connection.stream_mut(), token, Interest::READABLE)
            .map_err(Error::Poll)?;
        Ok(Self {
            connection: Some(connection),
        })
    }

    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(Connection::local_addr)
    }

    pub(super) fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(Connection::id)
    }

    pub(super) fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.state() == ConnectionState::Established)
    }

    pub(super) fn send(&mut self, data: &[u8]) -> Result<usize, Error> {
        let conn = self.connection.as_mut().ok_or(Error::Shutdown)?;
        let written = conn.write_payload(data)?;
        debug!(len = written, "Sent data");
        Ok(written)
    }

    pub(super) fn handle_events(
        &mut self,
        events: &Events,
        config: &ServerConfig,
        sink: &mut impl Sink,
    ) -> Result<(), Error> {
        for event in events.iter() {
            let Token(id) = event.token();
            if id == WAKE_ID {
                continue;
            }

            let Some(conn) = self.connection.as_mut().filter(|conn| conn.id() == id) else {
                warn!(id, "Event for unknown connection");
                continue;
            };

            // Hang-ups and errors are reported by the read below, so every
            // event on the connection is handled as readable.
            let outcome = conn.drain(config.max_read_size);
            let sender = conn.peer_addr().to_string();

            match outcome {
                ReadOutcome::Open(data) => deliver(sink, sender, data),
                ReadOutcome::Closed(data) => {
                    deliver(sink, sender, data);
                    info!(id, "Peer closed connection");
                    conn.set_state(ConnectionState::Dead);
                    return Err(Error::PeerClosed { id });
                }
                ReadOutcome::Failed(data, source) => {
                    deliver(sink, sender, data);
                    warn!(id, ?source, "Read failed");
                    conn.set_state(ConnectionState::Dead);
                    return Err(Error::Read { id, source });
                }
            }
        }
        Ok(())
    }

    pub(super) fn close(&mut self, registry: &Registry) {
        if let Some(mut conn) = self.connection.take() {
            conn.shutdown(Shutdown::Both);
            if let Err(err) = registry.deregister(conn.stream_mut()) {
                warn!(id = conn.id(), ?err, "Failed to deregister connection");
            }
            conn.set_state(ConnectionState::Closed);
            info!(id = conn.id(), peer_addr = %conn.peer_addr(), "Closed connection");
        }
    }
}

fn deliver(sink: &mut impl Sink, sender: String, data: Vec<u8>) {
    if !data.is_empty() {
        sink.deliver(&Message::new(sender, data));
    }
}
