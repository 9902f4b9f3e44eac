//! The relay server and its event loops.
//!
//! A [`Server`] runs in one of two [`Mode`]s fixed at construction. A host
//! accepts any number of peers and rebroadcasts each peer's bytes to every
//! other peer; a client holds one connection to a host. Both are driven by a
//! single-threaded `mio` readiness loop that owns every socket. Other threads
//! talk to the loop through a [`ServerHandle`].

mod client;
mod host;
mod interface;

pub use interface::ServerHandle;

use client::Client;
use host::Host;
use interface::Request;

use crate::config::ServerConfig;
use crate::error::Error;
use crate::message::{DisplaySink, Message, Sink};
use crate::transport::{self, ConnectionId};

use mio::{Events, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Receiver, Sender},
    Arc,
};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

// Internal poll tokens. Connection ids start at
// transport::CONNECTION_ID_RANGE_START, well above these.
const LISTENER_ID: usize = 1;
const WAKE_ID: usize = 2;

/// Which side of the relay a [`Server`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Host,
    Client,
}

// Mode-specific state. Each variant owns its sockets.
#[derive(Debug)]
enum Role {
    Host(Host),
    Client(Client),
}

/// A broadcast relay endpoint.
///
/// Construct with [`Server::host`], [`Server::client`] or
/// [`Server::connect`], then drive it with [`Server::run`] (or step it with
/// [`Server::run_once`]).
///
/// Not thread-safe: the event loop needs `&mut self`. Use [`ServerHandle`]
/// to send, broadcast or shut down from other threads.
///
/// # Example
///
/// ```no_run
/// use relaycomm::{Server, ServerConfig};
/// use std::thread;
///
/// let config = ServerConfig::new(0x7f00_0001, 13371);
/// let mut server = Server::host(config)?;
/// let handle = server.handle();
///
/// let worker = thread::spawn(move || {
///     let result = server.run();
///     server.disconnect();
///     result
/// });
///
/// // ... later
/// handle.shutdown();
/// worker.join().unwrap()?;
/// # Ok::<(), relaycomm::Error>(())
/// ```
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    role: Role,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    sender: Sender<Request>,
    receiver: Receiver<Request>,
    shutdown: Arc<AtomicBool>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Server {
    /// Sets up a server in the given mode.
    pub fn connect(mode: Mode, config: ServerConfig) -> Result<Self, Error> {
        match mode {
            Mode::Host => Self::host(config),
            Mode::Client => Self::client(config),
        }
    }

    /// Starts listening on the wildcard address at `config.port`.
    pub fn host(config: ServerConfig) -> Result<Self, Error> {
        let listener = transport::setup_host(&config)?;
        let poll = Poll::new().map_err(Error::Poll)?;
        let host = Host::new(listener, poll.registry(), Token(LISTENER_ID))?;
        Self::with_role(config, poll, Role::Host(host))
    }

    /// Connects to the host at `config.address:config.port`.
    ///
    /// Fails with [`Error::Connect`] within roughly
    /// `config.connect_timeout_ms` if the host cannot be reached.
    pub fn client(config: ServerConfig) -> Result<Self, Error> {
        let connection = transport::setup_client(&config)?;
        let poll = Poll::new().map_err(Error::Poll)?;
        let client = Client::new(connection, poll.registry())?;
        Self::with_role(config, poll, Role::Client(client))
    }

    fn with_role(config: ServerConfig, poll: Poll, role: Role) -> Result<Self, Error> {
        let waker = Arc::new(Waker::new(poll.registry(), Token(WAKE_ID)).map_err(Error::Poll)?);
        let (sender, receiver) = channel();

        Ok(Self {
            config,
            role,
            poll,
            events: Events::with_capacity(config.poll_capacity),
            waker,
            sender,
            receiver,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Server {
    pub fn mode(&self) -> Mode {
        match self.role {
            Role::Host(_) => Mode::Host,
            Role::Client(_) => Mode::Client,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The listening address (host) or the local end of the connection
    /// (client). `None` after [`Self::disconnect`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Host(host) => host.local_addr(),
            Role::Client(client) => client.local_addr(),
        }
    }

    /// Whether the event loops have been told to stop. Once `true`, stays
    /// `true`.
    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Number of live connections: the accepted peers of a host, or 1 for a
    /// connected client.
    pub fn connection_count(&self) -> usize {
        match &self.role {
            Role::Host(host) => host.registry().len(),
            Role::Client(client) => usize::from(client.is_connected()),
        }
    }

    /// Ids of the live connections, in the order they were accepted.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        match &self.role {
            Role::Host(host) => host.registry().live_ids().to_vec(),
            Role::Client(client) => client.connection_id().into_iter().collect(),
        }
    }

    /// Gets a thread-safe handle for talking to the event loop.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

impl Server {
    /// Writes `message` to every live connection except `exclude`. Host mode
    /// only.
    ///
    /// Connections already marked dead are skipped even if they have not been
    /// reaped yet. A partial or failed write is logged and does not retire
    /// the connection. Returns the number of connections the whole message
    /// was written to.
    pub fn broadcast(
        &mut self,
        message: &Message,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, Error> {
        match &mut self.role {
            Role::Host(host) => Ok(host.broadcast(message, exclude)),
            Role::Client(_) => Err(self.mode_mismatch("broadcast")),
        }
    }

    /// Writes raw bytes to the host. Client mode only.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, Error> {
        match &mut self.role {
            Role::Client(client) => client.send(data),
            Role::Host(_) => Err(self.mode_mismatch("send")),
        }
    }

    /// Accepts every pending connection. Host mode only.
    ///
    /// Returns the number of connections accepted.
    pub fn accept_all(&mut self) -> Result<usize, Error> {
        match &mut self.role {
            Role::Host(host) => {
                let result = host.accept_all(self.poll.registry(), &self.config);
                if let Err(err) = &result {
                    error!(%err, "Accept failed, shutting down");
                    self.shutdown.store(true, Ordering::SeqCst);
                }
                result
            }
            Role::Client(_) => Err(self.mode_mismatch("accept_all")),
        }
    }

    /// Closes every connection marked dead since the last call. Returns how
    /// many were closed; a client never has any.
    pub fn reap(&mut self) -> usize {
        match &mut self.role {
            Role::Host(host) => host.reap(self.poll.registry()),
            Role::Client(_) => 0,
        }
    }

    /// Closes every socket and stops the event loop.
    ///
    /// Safe to call more than once. Requests still queued by handles are
    /// answered with [`Error::Shutdown`].
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) {
        self.set_shutdown();
        match &mut self.role {
            Role::Host(host) => host.close_all(self.poll.registry()),
            Role::Client(client) => client.close(self.poll.registry()),
        }
        self.reject_pending_requests();
    }

    fn mode_mismatch(&self, operation: &'static str) -> Error {
        Error::ModeMismatch {
            operation,
            mode: self.mode(),
        }
    }

    fn set_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(mode = ?self.mode(), "Shutting down");
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl Server {
    /// Runs the event loop until shutdown, printing received data to stdout.
    pub fn run(&mut self) -> Result<(), Error> {
        self.run_with_sink(&mut DisplaySink)
    }

    /// Runs the event loop until shutdown, delivering received data to
    /// `sink`.
    ///
    /// A host returns `Ok(())` once shut down through a handle or
    /// [`Self::disconnect`], and an error if polling or accepting fails. A
    /// client also stops with [`Error::PeerClosed`] or [`Error::Read`] when
    /// its connection ends. Either way the shutdown flag is set on return.
    pub fn run_with_sink(&mut self, sink: &mut impl Sink) -> Result<(), Error> {
        info!(mode = ?self.mode(), "Event loop started");
        let mut result = Ok(());
        while !self.should_shutdown() {
            if let Err(err) = self.run_once(sink, None) {
                result = Err(err);
                break;
            }
        }
        self.set_shutdown();
        self.reject_pending_requests();
        info!(mode = ?self.mode(), "Event loop stopped");
        result
    }

    /// Runs a single iteration of the event loop.
    ///
    /// Reaps dead connections, answers queued handle requests, then waits up
    /// to `timeout` (forever if `None`) for readiness and handles every ready
    /// socket. Errors that end the loop also set the shutdown flag.
    pub fn run_once(
        &mut self,
        sink: &mut impl Sink,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.reap();
        self.process_requests();
        if self.should_shutdown() {
            return Ok(());
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(err) => {
                error!(?err, "Poll failed");
                self.set_shutdown();
                return Err(Error::Poll(err));
            }
        }

        let result = match &mut self.role {
            Role::Host(host) => {
                host.handle_events(&self.events, self.poll.registry(), &self.config, sink)
            }
            Role::Client(client) => client.handle_events(&self.events, &self.config, sink),
        };
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(%err, "Fatal event loop error");
            } else {
                debug!(%err, "Event loop stopped by connection error");
            }
            self.set_shutdown();
        }
        result
    }

    fn process_requests(&mut self) {
        let requests: Vec<Request> = self.receiver.try_iter().collect();

        for request in requests {
            match request {
                Request::Send { data, response } => {
                    let result = self.send(&data);
                    let _ = response.send(result);
                }
                Request::Broadcast { message, response } => {
                    let result = self.broadcast(&message, None);
                    let _ = response.send(result);
                }
                Request::ConnectionCount { response } => {
                    let result = match self.mode() {
                        Mode::Host => Ok(self.connection_count()),
                        Mode::Client => Err(self.mode_mismatch("connection_count")),
                    };
                    let _ = response.send(result);
                }
            }
        }
    }

    fn reject_pending_requests(&mut self) {
        for request in self.receiver.try_iter() {
            request.reject();
        }
    }
}
