use crate::message::Message;
use crate::Error;
use mio::Waker;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Sender},
    Arc,
};
use tracing::{debug, warn};

// Internal request type for cross-thread communication
#[derive(Debug)]
pub(crate) enum Request {
    Send {
        data: Vec<u8>,
        response: Sender<Result<usize, Error>>,
    },
    Broadcast {
        message: Message,
        response: Sender<Result<usize, Error>>,
    },
    ConnectionCount {
        response: Sender<Result<usize, Error>>,
    },
}

impl Request {
    // Answers a request the event loop will never get to.
    pub(crate) fn reject(self) {
        let response = match self {
            Request::Send { response, .. }
            | Request::Broadcast { response, .. }
            | Request::ConnectionCount { response } => response,
        };
        let _ = response.send(Err(Error::Shutdown));
    }
}

/// Thread-safe handle to a running [`Server`](super::Server).
///
/// Obtain one with [`Server::handle()`](super::Server::handle) before moving
/// the server onto its event loop thread. Handles are cheap to clone.
///
/// Requests are queued for the event loop, which is woken to process them;
/// methods that return a value block until it has done so. Once the server
/// has shut down every request fails with [`Error::Shutdown`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub(crate) sender: Sender<Request>,
    pub(crate) waker: Arc<Waker>,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Sends raw bytes to the host. Client mode only.
    ///
    /// Returns the number of bytes written.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<usize, Error> {
        let data = data.into();
        self.request(|response| Request::Send { data, response })
    }

    /// Sends `message` to every live connection. Host mode only.
    ///
    /// Returns the number of connections the whole message was written to.
    pub fn broadcast(&self, message: Message) -> Result<usize, Error> {
        self.request(|response| Request::Broadcast { message, response })
    }

    /// Number of live connections. Host mode only.
    pub fn connection_count(&self) -> Result<usize, Error> {
        self.request(|response| Request::ConnectionCount { response })
    }

    /// Asks the event loop to stop.
    ///
    /// The flag is never cleared again. The loop notices it on its next
    /// iteration; this call does not wait for that.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("Shutdown requested");
        }
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake event loop");
        }
    }

    /// Whether the server has been asked to stop or has stopped on its own.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn request<F>(&self, build: F) -> Result<usize, Error>
    where
        F: FnOnce(Sender<Result<usize, Error>>) -> Request,
    {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }

        let (tx, rx) = channel();
        self.sender
            .send(build(tx))
            .map_err(|_| Error::Shutdown)?;
        self.waker.wake().map_err(Error::Poll)?;
        rx.recv().map_err(|_| Error::Shutdown)?
    }
}
