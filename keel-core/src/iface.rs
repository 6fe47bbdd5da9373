//! Pluggable transport interfaces.
//!
//! An [`Interface`] owns the real sockets (or a vendor stack, or an in-memory
//! fabric) for the connections attached to it. The manager calls into it and
//! it reports completions back through an [`IoCtx`] that only exists for the
//! duration of [`Interface::poll`].
//!
//! ## Contract
//!
//! - Interface methods never report completions synchronously. A method such
//!   as `connect_tcp` has no `IoCtx`, so the result of the connect can only be
//!   delivered from a later `poll`.
//! - Every `IoCtx` callback takes `&mut self`, so at most one callback is in
//!   flight into the core at a time.
//! - Callbacks only update buffers and queue events. Handlers run after
//!   `poll` returns, which keeps interface state and handler code apart.
//!
//! Connections created by the interface itself during `poll` (accepted
//! streams, UDP peers) are already known to it, so `create_conn`/`add_conn`
//! are not called for them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::buffer::Mbuf;
use crate::conn::{ConnId, ConnTable, Connection};
use crate::event::IoEvent;
use crate::flags::ConnFlags;
use crate::tls::{TlsBackend, TlsState, TlsStatus};

/// Bytes handed to the core by a receive callback.
///
/// `Owned` transfers the allocation to the core. `Borrowed` is copied; the
/// interface keeps the storage and may reclaim it after [`Interface::recved`].
#[derive(Debug)]
pub enum RecvBuf<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl RecvBuf<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            RecvBuf::Owned(v) => v,
            RecvBuf::Borrowed(s) => s,
        }
    }
}

/// Wakes an interface blocked in `poll` from another thread.
pub trait Wake: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

/// Transport backend.
pub trait Interface {
    fn name(&self) -> &str;

    /// Called once when the manager takes ownership.
    fn init(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called once when the manager shuts down, after every connection is gone.
    fn free(&mut self) {}

    /// Allocate per-connection state before any socket exists.
    fn create_conn(&mut self, _conn: ConnId) -> io::Result<()> {
        Ok(())
    }

    /// Release everything held for `conn`, including its socket.
    fn destroy_conn(&mut self, conn: ConnId);

    /// `conn` was linked into the manager.
    fn add_conn(&mut self, _conn: ConnId) {}

    /// `conn` is about to be unlinked from the manager.
    fn remove_conn(&mut self, _conn: ConnId) {}

    /// Start listening; returns the bound local address.
    fn listen_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<SocketAddr>;

    fn listen_udp(
        &mut self,
        conn: ConnId,
        addr: SocketAddr,
        flags: ConnFlags,
    ) -> io::Result<SocketAddr>;

    /// Begin a non-blocking connect. Completion is reported with
    /// [`IoCtx::connect_cb`] from a later `poll`.
    fn connect_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<()>;

    /// Create a UDP socket aimed at `addr`. UDP has no handshake; the manager
    /// raises CONNECT itself.
    fn connect_udp(&mut self, conn: ConnId, addr: SocketAddr, flags: ConnFlags)
        -> io::Result<()>;

    /// Queue stream data. The default appends to the connection's send buffer,
    /// which `poll` drains through [`IoCtx::send_data`].
    fn tcp_send(&mut self, _conn: ConnId, data: &[u8], outbox: &mut Mbuf) -> usize {
        outbox.append(data)
    }

    /// Queue a datagram. The whole send buffer goes out as one datagram.
    fn udp_send(&mut self, _conn: ConnId, data: &[u8], outbox: &mut Mbuf) -> usize {
        outbox.append(data)
    }

    /// The core consumed `len` bytes from the last receive callback for `conn`.
    fn recved(&mut self, _conn: ConnId, _len: usize) {}

    /// Adopt an already-connected socket.
    fn sock_set(&mut self, _conn: ConnId, _sock: std::net::TcpStream) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface cannot adopt sockets",
        ))
    }

    /// Local (`remote == false`) or peer address of `conn`.
    fn get_conn_addr(&self, conn: ConnId, remote: bool) -> Option<SocketAddr>;

    /// Wait up to `timeout` for I/O and report completions through `ctx`.
    fn poll(&mut self, timeout: Duration, ctx: &mut IoCtx<'_>) -> io::Result<()>;

    /// Handle used by broadcasters to interrupt a blocking `poll`.
    fn waker(&self) -> Option<Arc<dyn Wake>> {
        None
    }
}

/// Callback surface handed to [`Interface::poll`].
pub struct IoCtx<'a> {
    conns: &'a mut ConnTable,
    iface: usize,
    now: Instant,
    acks: &'a mut Vec<(ConnId, usize)>,
    tls: Option<&'a mut (dyn TlsBackend + 'static)>,
    queued: usize,
}

impl<'a> IoCtx<'a> {
    pub(crate) fn new(
        conns: &'a mut ConnTable,
        iface: usize,
        now: Instant,
        acks: &'a mut Vec<(ConnId, usize)>,
        tls: Option<&'a mut (dyn TlsBackend + 'static)>,
    ) -> Self {
        Self {
            conns,
            iface,
            now,
            acks,
            tls,
            queued: 0,
        }
    }

    /// Time of the current loop iteration.
    #[must_use]
    pub const fn now(&self) -> Instant {
        self.now
    }

    /// Events queued through this context so far.
    #[must_use]
    pub const fn queued(&self) -> usize {
        self.queued
    }

    #[must_use]
    pub fn is_live(&self, id: ConnId) -> bool {
        self.conns.get(id).is_some_and(|c| !c.closed)
    }

    /// Outbound connect finished.
    pub fn connect_cb(&mut self, id: ConnId, result: io::Result<()>) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.flags.remove(ConnFlags::CONNECTING);
        conn.last_io = self.now;
        match result {
            Ok(()) if conn.tls.is_some() => {
                debug!(conn = %id, "connected, starting TLS handshake");
                advance_tls(conn, &mut self.queued);
            }
            Ok(()) => {
                debug!(conn = %id, "connected");
                push(conn, IoEvent::Connect(None), &mut self.queued);
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "connect failed");
                conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
                push(conn, IoEvent::Connect(Some(e)), &mut self.queued);
            }
        }
    }

    /// First half of accepting: allocate a connection for a new peer of `listener`.
    ///
    /// Returns `None` if the listener is gone or closing, or the TLS session
    /// could not be created; the interface should then drop the socket.
    pub fn accept_new_conn(&mut self, listener: ConnId) -> Option<ConnId> {
        let lc = self.conns.get_mut(listener)?;
        if lc.closed || lc.flags.contains(ConnFlags::CLOSE_IMMEDIATELY) {
            return None;
        }
        let handler = lc.spawn.as_mut().map(|spawn| spawn());
        let flags = lc.flags & (ConnFlags::UDP | ConnFlags::USER_MASK);
        let tls_params = lc.tls_listen.clone();
        let limits = lc.limits;

        let tls = match (tls_params, self.tls.as_deref_mut()) {
            (Some(params), Some(backend)) => match backend.conn_accept(&params) {
                Ok(session) => Some(TlsState::new(session)),
                Err(e) => {
                    warn!(listener = %listener, error = %e, "TLS accept failed");
                    return None;
                }
            },
            (Some(_), None) => {
                warn!(listener = %listener, "TLS listener without a TLS backend");
                return None;
            }
            (None, _) => None,
        };

        let iface = self.iface;
        let now = self.now;
        let id = self.conns.insert(|id| {
            let mut conn = Connection::new(id, iface, flags, limits, now);
            conn.listener = Some(listener);
            conn.handler = handler;
            if let Some(tls) = tls {
                conn.flags.insert(ConnFlags::SSL);
                conn.tls = Some(tls);
            }
            conn
        });
        trace!(listener = %listener, conn = %id, "accepted new connection");
        Some(id)
    }

    /// Second half of accepting: the socket for `id` is registered.
    pub fn accept_cb(&mut self, id: ConnId, peer: SocketAddr) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.peer = Some(peer);
        conn.last_io = self.now;
        debug!(conn = %id, %peer, "accepted");
        if conn.tls.is_some() {
            advance_tls(conn, &mut self.queued);
        } else {
            push(conn, IoEvent::Accept(peer), &mut self.queued);
        }
    }

    /// Stream bytes arrived. Returns how many the core kept.
    pub fn recv_tcp_cb(&mut self, id: ConnId, buf: RecvBuf<'_>) -> usize {
        let len = buf.len();
        let n = match self.conns.get_mut(id) {
            Some(conn) => deliver(conn, buf, self.now, &mut self.queued),
            None => 0,
        };
        self.acks.push((id, len));
        n
    }

    /// A datagram arrived on `id` from `from`.
    ///
    /// On a listening socket the datagram goes to the child connection for
    /// `from`, created on first contact. Returns the child if it was just
    /// created so the interface can route replies for it.
    pub fn recv_udp_cb(
        &mut self,
        id: ConnId,
        buf: RecvBuf<'_>,
        from: SocketAddr,
    ) -> Option<ConnId> {
        self.acks.push((id, buf.len()));
        let conn = self.conns.get(id)?;
        if !conn.flags.contains(ConnFlags::LISTENING) {
            let conn = self.conns.get_mut(id)?;
            conn.peer.get_or_insert(from);
            deliver(conn, buf, self.now, &mut self.queued);
            return None;
        }

        let existing = conn
            .udp_children
            .get(&from)
            .copied()
            .filter(|child| self.conns.get(*child).is_some());
        if let Some(child) = existing {
            if let Some(conn) = self.conns.get_mut(child) {
                deliver(conn, buf, self.now, &mut self.queued);
            }
            return None;
        }

        let child = self.accept_new_conn(id)?;
        if let Some(lc) = self.conns.get_mut(id) {
            lc.udp_children.insert(from, child);
        }
        let conn = self.conns.get_mut(child)?;
        conn.peer = Some(from);
        push(conn, IoEvent::Accept(from), &mut self.queued);
        deliver(conn, buf, self.now, &mut self.queued);
        Some(child)
    }

    /// `n` bytes from [`send_data`](Self::send_data) reached the wire.
    pub fn sent_cb(&mut self, id: ConnId, n: usize) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.last_io = self.now;
        if let Some(tls) = conn.tls.as_mut() {
            tls.wire_out.remove(n);
            if tls.wire_out.is_empty() {
                conn.flags.remove(ConnFlags::WANT_WRITE);
            }
            if !conn.flags.contains(ConnFlags::SSL_HANDSHAKE_DONE) {
                advance_tls(conn, &mut self.queued);
            }
            return;
        }
        conn.send.remove(n);
        trace!(conn = %id, bytes = n, "sent");
        push(conn, IoEvent::Send(n), &mut self.queued);
    }

    /// The peer finished sending. Queued output still goes out before the
    /// connection closes.
    pub fn eof_cb(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        debug!(conn = %id, unsent = conn.unsent(), "peer finished sending");
        conn.flags.insert(ConnFlags::SEND_AND_CLOSE);
    }

    /// The socket failed or the peer closed it.
    pub fn close_cb(&mut self, id: ConnId, err: Option<io::Error>) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        debug!(conn = %id, error = ?err, "closed by interface");
        if conn.err.is_none() {
            conn.err = err;
        }
        conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
    }

    /// How many bytes the interface may read for `id` before the receive
    /// buffer limit is hit. `0` means stop reading.
    #[must_use]
    pub fn recv_room(&self, id: ConnId) -> usize {
        self.conns.get(id).map_or(0, |c| c.recv.room())
    }

    /// True if `id` has bytes waiting for the wire.
    #[must_use]
    pub fn has_output(&self, id: ConnId) -> bool {
        self.conns.get(id).is_some_and(|c| {
            let plain_ready = !c.send.is_empty()
                && (c.tls.is_none() || c.flags.contains(ConnFlags::SSL_HANDSHAKE_DONE));
            plain_ready || c.tls.as_ref().is_some_and(|t| !t.wire_out.is_empty())
        })
    }

    /// Bytes to write for `id`. Acknowledge with [`sent_cb`](Self::sent_cb).
    pub fn send_data(&mut self, id: ConnId) -> &[u8] {
        let Some(conn) = self.conns.get_mut(id) else {
            return &[];
        };
        let Some(tls) = conn.tls.as_mut() else {
            return conn.send.as_slice();
        };
        if conn.flags.contains(ConnFlags::SSL_HANDSHAKE_DONE) && !conn.send.is_empty() {
            match tls.write(&conn.send) {
                Ok(n) => {
                    conn.send.remove(n);
                    if n > 0 {
                        conn.pending.push(IoEvent::Send(n));
                        self.queued += 1;
                    }
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "TLS write failed");
                    conn.err = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
                    conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
                }
            }
        }
        if !tls.wire_out.is_empty() {
            conn.flags.insert(ConnFlags::WANT_WRITE);
        }
        tls.wire_out.as_slice()
    }
}

fn push(conn: &mut Connection, ev: IoEvent, queued: &mut usize) {
    conn.pending.push(ev);
    *queued += 1;
}

fn deliver(conn: &mut Connection, buf: RecvBuf<'_>, now: Instant, queued: &mut usize) -> usize {
    conn.last_io = now;
    let len = buf.len();
    if conn.tls.is_some() {
        return deliver_tls(conn, buf.as_slice(), queued);
    }
    let n = match buf {
        RecvBuf::Owned(v) => conn.recv.append_owned(v),
        RecvBuf::Borrowed(s) => conn.recv.append(s),
    };
    if n == 0 && len > 0 {
        warn!(conn = %conn.id, bytes = len, "receive buffer full, dropping input");
        return 0;
    }
    trace!(conn = %conn.id, bytes = n, "received");
    if n > 0 {
        push(conn, IoEvent::Recv(n), queued);
    }
    n
}

fn deliver_tls(conn: &mut Connection, wire: &[u8], queued: &mut usize) -> usize {
    let kept = match conn.tls.as_mut() {
        Some(tls) => tls.wire_in.append(wire),
        None => return 0,
    };
    if !conn.flags.contains(ConnFlags::SSL_HANDSHAKE_DONE) {
        advance_tls(conn, queued);
    }
    if !conn.flags.contains(ConnFlags::SSL_HANDSHAKE_DONE) {
        return kept;
    }
    let Some(tls) = conn.tls.as_mut() else {
        return kept;
    };
    match tls.read(&mut conn.recv) {
        Ok(0) => {}
        Ok(n) => push(conn, IoEvent::Recv(n), queued),
        Err(e) => {
            warn!(conn = %conn.id, error = %e, "TLS read failed");
            conn.err = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
            conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
        }
    }
    kept
}

/// Run one handshake step and raise the deferred ACCEPT/CONNECT once done.
fn advance_tls(conn: &mut Connection, queued: &mut usize) {
    let Some(tls) = conn.tls.as_mut() else {
        return;
    };
    let status = tls.handshake();
    let mut events: SmallVec<[IoEvent; 2]> = SmallVec::new();
    match status {
        Ok(TlsStatus::Done) => {
            debug!(conn = %conn.id, "TLS handshake done");
            conn.flags.insert(ConnFlags::SSL_HANDSHAKE_DONE);
            conn.flags.remove(ConnFlags::WANT_READ | ConnFlags::WANT_WRITE);
            match (conn.listener, conn.peer) {
                (Some(_), Some(peer)) => events.push(IoEvent::Accept(peer)),
                (Some(_), None) => {}
                (None, _) => events.push(IoEvent::Connect(None)),
            }
            // application data may already be buffered behind the handshake
            if !tls.wire_in.is_empty() {
                match tls.read(&mut conn.recv) {
                    Ok(0) => {}
                    Ok(n) => events.push(IoEvent::Recv(n)),
                    Err(e) => {
                        warn!(conn = %conn.id, error = %e, "TLS read failed");
                        conn.err = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
                        conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
                    }
                }
            }
        }
        Ok(TlsStatus::WantRead) => {
            conn.flags.insert(ConnFlags::WANT_READ);
            conn.flags.remove(ConnFlags::WANT_WRITE);
        }
        Ok(TlsStatus::WantWrite) => {
            conn.flags.insert(ConnFlags::WANT_WRITE);
            conn.flags.remove(ConnFlags::WANT_READ);
        }
        Err(e) => {
            warn!(conn = %conn.id, error = %e, "TLS handshake failed");
            let err = io::Error::new(io::ErrorKind::Other, e.to_string());
            if conn.listener.is_none() {
                events.push(IoEvent::Connect(Some(err)));
            } else {
                conn.err = Some(err);
            }
            conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
        }
    }
    for ev in events {
        push(conn, ev, queued);
    }
}
