use thiserror::Error;

/// The error type for relaycomm operations.
///
/// Setup errors ([`Error::SocketCreate`], [`Error::Bind`], [`Error::Listen`],
/// [`Error::Connect`]) abort startup. [`Error::Poll`],
/// [`Error::UnexpectedReadiness`] and [`Error::Accept`] are fatal to a running
/// event loop. Read and write failures on a single peer are handled inside the
/// loop and only retire that peer; they surface as errors only in client mode,
/// where the single connection is the whole session.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Setup Errors
    // ============================================================================
    /// The stream socket could not be created or configured.
    #[error("Failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    /// Binding the listening socket failed.
    #[error("Failed to bind to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Switching the bound socket into listening mode failed.
    #[error("Failed to listen: {0}")]
    Listen(#[source] std::io::Error),

    /// The outbound connection could not be established.
    #[error("Failed to connect to {addr}: {kind}")]
    Connect {
        addr: std::net::SocketAddrV4,
        kind: ConnectError,
    },

    // ============================================================================
    // Steady-State Errors
    // ============================================================================
    /// Accepting an incoming connection failed for a reason other than
    /// "would block".
    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// Reading from a connection failed.
    #[error("Failed to read from connection {id}: {source}")]
    Read {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    /// Writing to a connection failed.
    #[error("Failed to write to connection {id}: {source}")]
    Write {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    /// Only part of a payload could be written before the socket would block.
    #[error("Partial write to connection {id}: {written} of {len} bytes")]
    PartialWrite { id: usize, written: usize, len: usize },

    /// The readiness poll itself failed.
    #[error("Poll error: {0}")]
    Poll(#[source] std::io::Error),

    /// The poll reported a readiness condition the loop cannot handle.
    #[error("Unexpected readiness event on token {token}: {detail}")]
    UnexpectedReadiness { token: usize, detail: String },

    /// The peer closed the connection.
    #[error("Peer closed connection {id}")]
    PeerClosed { id: usize },

    // ============================================================================
    // Usage Errors
    // ============================================================================
    /// The operation is not valid in the server's mode.
    #[error("{operation} is not available in {mode:?} mode")]
    ModeMismatch {
        operation: &'static str,
        mode: crate::Mode,
    },

    /// The server has shut down and no longer processes requests.
    #[error("Server has shut down")]
    Shutdown,

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The configured address is not a valid IPv4 address.
    #[error("Invalid IPv4 address '{0}'")]
    InvalidAddress(String),
}

/// Reasons an outbound connect can fail.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The connect call failed immediately.
    #[error("connect failed: {0}")]
    Refused(#[source] std::io::Error),

    /// The socket reported a pending error once it became writable.
    #[error("pending socket error: {0}")]
    Pending(#[source] std::io::Error),

    /// Waiting for writability failed.
    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),

    /// The socket did not become writable in time.
    #[error("timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
}

impl Error {
    /// Returns `true` for errors that stop a running event loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Poll(_) | Error::UnexpectedReadiness { .. } | Error::Accept(_)
        )
    }
}
