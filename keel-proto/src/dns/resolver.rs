//! Asynchronous stub resolver.
//!
//! Each lookup is a UDP connection to the nameserver driven by a
//! [`ResolverLayer`]. The query goes out as soon as the connection exists
//! and a timer is armed for the per-attempt timeout. On `TIMER` the query is
//! resent until `max_retries` resends have been made, then the lookup fails
//! with [`ResolveError::ExceededRetryCount`]. The first response carrying the
//! query's transaction id completes the lookup; responses with another id are
//! ignored. If the connection goes away before that, the callback sees
//! [`ResolveError::Timeout`].
//!
//! The callback runs exactly once per lookup.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use keel_core::conn::{Conn, ConnId};
use keel_core::endpoint::Endpoint;
use keel_core::error::{KeelError, Result};
use keel_core::event::Event;
use keel_core::handler::EventHandler;
use keel_core::manager::{Manager, NameResolver};
use keel_core::options::ConnOpts;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::codec::{DnsMessage, RecordType};
use super::hosts::resolve_from_hosts_file;

/// Why a lookup produced no message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// A valid response arrived without answers
    #[error("No answers in DNS response")]
    NoAnswers,

    /// Every attempt timed out
    #[error("DNS query exceeded retry count")]
    ExceededRetryCount,

    /// The lookup connection closed before an answer arrived
    #[error("DNS query timed out")]
    Timeout,
}

/// Lookup configuration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use keel_proto::dns::ResolveOpts;
///
/// let opts = ResolveOpts::default()
///     .with_max_retries(3)
///     .with_timeout(Duration::from_secs(2))
///     .with_accept_literal(true);
/// assert_eq!(opts.max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct ResolveOpts {
    /// Server to query
    ///
    /// - `None`: the manager's configured nameserver (default)
    pub nameserver: Option<SocketAddr>,

    /// Resends after the first attempt times out
    ///
    /// - Default: 2
    pub max_retries: u32,

    /// Per-attempt timeout
    ///
    /// - Default: 5s
    pub timeout: Duration,

    /// Answer literal IP addresses immediately, without I/O
    ///
    /// - Default: false
    pub accept_literal: bool,

    /// Never touch the network: literals succeed, names fail with `NoAnswers`
    ///
    /// - Default: false
    pub only_literal: bool,

    /// Hosts file consulted before the network
    ///
    /// - Default: none
    pub hosts_file: Option<PathBuf>,
}

impl Default for ResolveOpts {
    fn default() -> Self {
        Self {
            nameserver: None,
            max_retries: 2,
            timeout: Duration::from_secs(5),
            accept_literal: false,
            only_literal: false,
            hosts_file: None,
        }
    }
}

impl ResolveOpts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_nameserver(mut self, addr: SocketAddr) -> Self {
        self.nameserver = Some(addr);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_accept_literal(mut self, accept: bool) -> Self {
        self.accept_literal = accept;
        self
    }

    #[must_use]
    pub fn with_only_literal(mut self, only: bool) -> Self {
        self.only_literal = only;
        self
    }

    #[must_use]
    pub fn with_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_file = Some(path.into());
        self
    }
}

/// Completion callback for [`resolve_async`].
pub type ResolveCallback = Box<dyn FnOnce(&mut Manager, std::result::Result<DnsMessage, ResolveError>)>;

/// Look `name` up and call `cb` with the outcome.
///
/// Returns the lookup connection, or `None` if the lookup completed inside
/// this call (literal address, hosts file, `only_literal`).
pub fn resolve_async<F>(
    mgr: &mut Manager,
    name: &str,
    qtype: RecordType,
    opts: &ResolveOpts,
    cb: F,
) -> Result<Option<ConnId>>
where
    F: FnOnce(&mut Manager, std::result::Result<DnsMessage, ResolveError>) + 'static,
{
    if let Ok(ip) = name.parse::<IpAddr>() {
        if opts.accept_literal || opts.only_literal {
            trace!(%ip, "literal address, no lookup");
            cb(mgr, Ok(DnsMessage::synthesize(name, ip)));
            return Ok(None);
        }
    }
    if opts.only_literal {
        cb(mgr, Err(ResolveError::NoAnswers));
        return Ok(None);
    }
    if let Some(path) = &opts.hosts_file {
        match resolve_from_hosts_file(path, name, qtype) {
            Ok(Some(ip)) => {
                debug!(name, %ip, "resolved from hosts file");
                cb(mgr, Ok(DnsMessage::synthesize(name, ip)));
                return Ok(None);
            }
            Ok(None) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "hosts file unreadable"),
        }
    }

    let id = rand::random::<u16>();
    let query = DnsMessage::query(id, name, qtype)
        .encode()
        .map_err(|e| KeelError::resolve(format!("{name}: {e}")))?;
    let nameserver = opts.nameserver.unwrap_or(mgr.options().nameserver);

    let layer = ResolverLayer {
        id,
        query: Bytes::from(query),
        attempt: 0,
        max_retries: opts.max_retries,
        timeout: opts.timeout,
        cb: Some(Box::new(cb)),
    };
    let conn = mgr.connect_opt(&Endpoint::udp(nameserver), layer, ConnOpts::default())?;
    // the query itself goes out on CONNECT
    if let Some(mut c) = mgr.conn(conn) {
        c.set_timer(Some(c.now() + opts.timeout));
    }
    debug!(%conn, name, ?qtype, txid = id, %nameserver, "dns query");
    Ok(Some(conn))
}

/// Protocol layer driving one lookup.
pub struct ResolverLayer {
    id: u16,
    query: Bytes,
    attempt: u32,
    max_retries: u32,
    timeout: Duration,
    cb: Option<ResolveCallback>,
}

impl ResolverLayer {
    fn finish(&mut self, conn: &mut Conn<'_>, result: std::result::Result<DnsMessage, ResolveError>) {
        let Some(cb) = self.cb.take() else {
            return;
        };
        conn.set_timer(None);
        conn.close();
        cb(conn.manager(), result);
    }

    fn on_response(&mut self, conn: &mut Conn<'_>) {
        let data = conn.recv_buf_mut().take(usize::MAX);
        match DnsMessage::parse(&data) {
            Ok(msg) if msg.id == self.id && msg.is_response() => {
                if msg.answers.is_empty() {
                    debug!(conn = %conn.id(), rcode = msg.rcode(), "dns response without answers");
                    self.finish(conn, Err(ResolveError::NoAnswers));
                } else {
                    self.finish(conn, Ok(msg));
                }
            }
            Ok(msg) => trace!(conn = %conn.id(), txid = msg.id, expected = self.id, "ignoring unrelated dns message"),
            Err(e) => warn!(conn = %conn.id(), error = %e, "malformed dns response ignored"),
        }
    }
}

impl EventHandler for ResolverLayer {
    fn handle(&mut self, conn: &mut Conn<'_>, event: &Event<'_>) {
        match event {
            Event::Connect(Ok(())) => {
                conn.send(&self.query);
            }
            Event::Recv(_) => self.on_response(conn),
            Event::Timer(_) if self.cb.is_some() => {
                if self.attempt < self.max_retries {
                    self.attempt += 1;
                    debug!(conn = %conn.id(), attempt = self.attempt, "dns retry");
                    // a query still queued goes out as is; a second copy would share its datagram
                    if conn.send_buf().is_empty() {
                        conn.send(&self.query);
                    }
                    conn.set_timer(Some(conn.now() + self.timeout));
                } else {
                    self.finish(conn, Err(ResolveError::ExceededRetryCount));
                }
            }
            Event::Close => {
                if let Some(cb) = self.cb.take() {
                    cb(conn.manager(), Err(ResolveError::Timeout));
                }
            }
            _ => {}
        }
    }
}

/// [`NameResolver`] that resolves host names over DNS, so plain
/// [`Manager::connect`] accepts `tcp://host:port`.
#[derive(Debug, Clone, Default)]
pub struct DnsResolver {
    opts: ResolveOpts,
}

impl DnsResolver {
    #[must_use]
    pub fn new(opts: ResolveOpts) -> Self {
        Self { opts }
    }

    /// Install a resolver with `opts` on `mgr`.
    pub fn install(mgr: &mut Manager, opts: ResolveOpts) {
        mgr.set_name_resolver(Self::new(opts));
    }
}

impl NameResolver for DnsResolver {
    fn resolve(&mut self, mgr: &mut Manager, conn: ConnId, host: &str, port: u16) {
        let opts = self.opts.clone().with_accept_literal(true);
        let started = resolve_async(mgr, host, RecordType::A, &opts, move |mgr, result| {
            match result.map(|msg| msg.first_addr()) {
                Ok(Some(ip)) => {
                    if let Err(e) = mgr.resolved(conn, SocketAddr::new(ip, port)) {
                        trace!(%conn, error = %e, "resolved connection is gone");
                    }
                }
                Ok(None) => mgr.resolve_failed(
                    conn,
                    io::Error::new(io::ErrorKind::NotFound, ResolveError::NoAnswers),
                ),
                Err(e) => mgr.resolve_failed(conn, io::Error::new(io::ErrorKind::NotFound, e)),
            }
        });
        if let Err(e) = started {
            mgr.resolve_failed(conn, io::Error::new(io::ErrorKind::InvalidInput, e.to_string()));
        }
    }
}

/// Connect to `addr`, resolving its host name first if needed.
///
/// The returned connection starts in `Resolving` for names and raises
/// CONNECT (with an error if the lookup failed) like any other connection.
pub fn connect_host(
    mgr: &mut Manager,
    addr: &str,
    handler: impl EventHandler,
    opts: &ResolveOpts,
) -> Result<ConnId> {
    let endpoint = Endpoint::parse(addr)?;
    let Some(host) = endpoint.host_name() else {
        return mgr.connect_opt(&endpoint, handler, ConnOpts::default());
    };
    let host = host.to_string();
    let id = mgr.connect_pending(endpoint.transport, handler, ConnOpts::default())?;
    DnsResolver::new(opts.clone()).resolve(mgr, id, &host, endpoint.port);
    Ok(id)
}
