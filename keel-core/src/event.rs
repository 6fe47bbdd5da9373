//! Core events delivered to connection handlers.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// Raw connection event.
///
/// Protocol layers translate these into their own event types and forward
/// both to the handler they wrap.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// Raised once per loop iteration on every live connection
    Poll,
    /// New inbound connection (TCP) or first datagram from a peer (UDP)
    Accept(SocketAddr),
    /// Outbound connect finished
    Connect(Result<(), &'a io::Error>),
    /// Bytes appended to the receive buffer
    Recv(usize),
    /// Bytes drained from the send buffer
    Send(usize),
    /// Connection is being destroyed; delivered exactly once
    Close,
    /// The armed deadline passed; the timer is disarmed before delivery
    Timer(Instant),
    /// Payload posted through a `Broadcaster`
    Broadcast(&'a [u8]),
}

impl Event<'_> {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Event::Poll => "POLL",
            Event::Accept(_) => "ACCEPT",
            Event::Connect(_) => "CONNECT",
            Event::Recv(_) => "RECV",
            Event::Send(_) => "SEND",
            Event::Close => "CLOSE",
            Event::Timer(_) => "TIMER",
            Event::Broadcast(_) => "BROADCAST",
        }
    }
}

/// I/O completion queued by an interface callback, dispatched after the
/// interface poll returns.
#[derive(Debug)]
pub(crate) enum IoEvent {
    Accept(SocketAddr),
    Connect(Option<io::Error>),
    Recv(usize),
    Send(usize),
}

impl IoEvent {
    pub fn with_event<R>(&self, f: impl FnOnce(&Event<'_>) -> R) -> R {
        match self {
            IoEvent::Accept(addr) => f(&Event::Accept(*addr)),
            IoEvent::Connect(None) => f(&Event::Connect(Ok(()))),
            IoEvent::Connect(Some(err)) => f(&Event::Connect(Err(err))),
            IoEvent::Recv(n) => f(&Event::Recv(*n)),
            IoEvent::Send(n) => f(&Event::Send(*n)),
        }
    }
}
