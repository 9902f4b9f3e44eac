//! RelayComm - A small TCP broadcast relay
//!
//! A [`Server`] runs either as a **host**, accepting many TCP peers and
//! rebroadcasting each peer's bytes to every other connected peer, or as a
//! **client**, holding a single connection to a host. Both sides are driven
//! by a single-threaded `mio` event loop; other threads interact with it
//! through a [`ServerHandle`].
//!
//! Payloads are forwarded as raw byte chunks. There is no framing: whatever a
//! single drain of a socket yields is relayed as one message, tagged with the
//! sender's identity (`user_<id>`).

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod message;
pub(crate) mod relay;

/// Socket setup and connection bookkeeping.
pub mod transport;

// These are the intended public API
pub use crate::config::{
    ServerConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_READ_SIZE,
    DEFAULT_POLL_CAPACITY, DEFAULT_PORT,
};
pub use error::{ConnectError, Error};
pub use message::{sender_name, DisplaySink, Message, Sink};
pub use relay::{Mode, Server, ServerHandle};
pub use transport::{ConnectionId, ConnectionState};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::error::{ConnectError, Error};
    pub use crate::message::{Message, Sink};
    pub use crate::relay::{Mode, Server, ServerHandle};
    pub use crate::transport::ConnectionId;
}
