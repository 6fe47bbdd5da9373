//! Manager and connection configuration options

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::flags::ConnFlags;
use crate::tls::TlsParams;

/// Default DNS server used when a lookup does not name one.
pub const DEFAULT_NAMESERVER: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53));

/// Largest message accepted by [`Broadcaster::send`](crate::broadcast::Broadcaster::send).
pub const DEFAULT_MAX_BROADCAST_SIZE: usize = 8192;

/// Manager-wide configuration.
///
/// # Examples
///
/// ```
/// use keel_core::options::ManagerOptions;
///
/// let opts = ManagerOptions::default()
///     .with_recv_limit(64 * 1024)
///     .with_nameserver("1.1.1.1:53".parse().unwrap());
/// assert_eq!(opts.recv_limit, Some(64 * 1024));
/// ```
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// DNS server for host name lookups
    ///
    /// - Default: 8.8.8.8:53
    pub nameserver: SocketAddr,

    /// Per-connection receive buffer limit
    ///
    /// When a receive buffer holds this many bytes the interface stops reading
    /// from that socket until a handler consumes data.
    /// - `None`: unlimited (default)
    pub recv_limit: Option<usize>,

    /// Initial capacity of receive/send buffers
    ///
    /// - Default: 0 (allocate on first use)
    pub initial_buffer_size: usize,

    /// Largest broadcast payload
    ///
    /// - Default: 8192 bytes
    pub max_broadcast_size: usize,

    /// Readiness events fetched per interface poll
    ///
    /// - Default: 1024
    pub max_poll_events: usize,

    /// Time source for timers
    ///
    /// - Default: [`SystemClock`]
    pub clock: Arc<dyn Clock>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            nameserver: DEFAULT_NAMESERVER,
            recv_limit: None,
            initial_buffer_size: 0,
            max_broadcast_size: DEFAULT_MAX_BROADCAST_SIZE,
            max_poll_events: 1024,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ManagerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_nameserver(mut self, addr: SocketAddr) -> Self {
        self.nameserver = addr;
        self
    }

    #[must_use]
    pub fn with_recv_limit(mut self, limit: usize) -> Self {
        self.recv_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_initial_buffer_size(mut self, size: usize) -> Self {
        self.initial_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_max_broadcast_size(mut self, size: usize) -> Self {
        self.max_broadcast_size = size;
        self
    }

    #[must_use]
    pub fn with_max_poll_events(mut self, events: usize) -> Self {
        self.max_poll_events = events.max(1);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Per-connection options for bind and connect.
#[derive(Debug, Clone, Default)]
pub struct ConnOpts {
    /// Index into the manager's interface registry (0 = main interface)
    pub iface: usize,

    /// Initial flags; only the `USER_*` bits and `ENABLE_BROADCAST` are honored
    pub flags: ConnFlags,

    /// Wrap the connection in TLS using the manager's TLS backend
    pub tls: Option<TlsParams>,
}

impl ConnOpts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_iface(mut self, iface: usize) -> Self {
        self.iface = iface;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ConnFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, params: TlsParams) -> Self {
        self.tls = Some(params);
        self
    }

    pub(crate) fn initial_flags(&self) -> ConnFlags {
        self.flags & (ConnFlags::USER_MASK | ConnFlags::ENABLE_BROADCAST)
    }
}
