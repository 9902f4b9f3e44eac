//! Payloads moving through the relay and the sink they are delivered to.

use std::fmt;
use std::io::Write;

// ============================================================================
// Message
// ============================================================================

/// An opaque byte payload tagged with the name of its sender.
///
/// The relay does not interpret `contents`. When a message is written to a
/// peer it is rendered as `"<sender>: <contents>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: String,
    contents: Vec<u8>,
}

impl Message {
    pub fn new(sender: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            sender: sender.into(),
            contents: contents.into(),
        }
    }

    /// Creates a message attributed to an accepted connection.
    pub fn from_connection(id: usize, contents: Vec<u8>) -> Self {
        Self::new(sender_name(id), contents)
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Renders the bytes written to each receiving peer.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.sender.len() + 2 + self.contents.len());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(&self.contents);
        buf
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sender, String::from_utf8_lossy(&self.contents))
    }
}

/// The name a relayed payload is tagged with when no richer identity is
/// known for its connection.
pub fn sender_name(id: usize) -> String {
    format!("user_{id}")
}

// ============================================================================
// Sink
// ============================================================================

/// Receives every payload the event loop takes in.
///
/// In host mode this is each relayed [`Message`], tagged with its origin
/// connection. In client mode the sender is the host and the contents are
/// exactly the bytes read from the socket.
pub trait Sink {
    fn deliver(&mut self, message: &Message);
}

impl<F> Sink for F
where
    F: FnMut(&Message),
{
    fn deliver(&mut self, message: &Message) {
        self(message)
    }
}

/// Writes received contents to stdout, one chunk per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisplaySink;

impl Sink for DisplaySink {
    fn deliver(&mut self, message: &Message) {
        let mut stdout = std::io::stdout().lock();
        // Display is best effort; a closed stdout must not stop the relay.
        let _ = stdout.write_all(message.contents());
        let _ = stdout.write_all(b"\n");
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_prefixes_sender() {
        let message = Message::from_connection(1003, b"hello".to_vec());
        assert_eq!(message.sender(), "user_1003");
        assert_eq!(message.to_wire(), b"user_1003: hello");
        assert_eq!(message.to_string(), "user_1003: hello");
    }

    #[test]
    fn closures_are_sinks() {
        let mut seen = Vec::new();
        {
            let mut sink = |message: &Message| seen.push(message.contents().to_vec());
            sink.deliver(&Message::new("host", "abc"));
        }
        assert_eq!(seen, vec![b"abc".to_vec()]);
    }
}
