//! The connection manager and its poll loop.
//!
//! ## Loop iteration
//!
//! 1. Poll every interface. The main interface (index 0) may block for up
//!    to the caller's timeout, clamped to the nearest connection timer;
//!    the others are polled without waiting. Interfaces report completions
//!    through [`IoCtx`], which only queues events.
//! 2. Walk a snapshot of the connections. Each one gets its queued I/O
//!    events in arrival order, then `POLL`, then `TIMER` if its deadline
//!    has passed.
//! 3. Deliver queued broadcasts to every connection.
//! 4. Destroy connections marked close-immediately, or send-and-close with
//!    nothing left to send: raise `CLOSE`, unlink, let the interface drop
//!    the socket, then drop protocol state before the buffers.
//!
//! Handlers only run in steps 2-4, never while an interface is polling.

use std::any::Any;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::broadcast::Broadcaster;
use crate::clock::Clock;
use crate::conn::{BufLimits, Conn, ConnId, ConnState, ConnTable, Connection};
use crate::endpoint::{Endpoint, Transport};
use crate::error::{KeelError, Result};
use crate::event::{Event, IoEvent};
use crate::flags::ConnFlags;
use crate::handler::EventHandler;
use crate::iface::{Interface, IoCtx};
use crate::options::{ConnOpts, ManagerOptions};
use crate::sock::SocketInterface;
use crate::tls::{TlsBackend, TlsState};

/// Starts a name lookup for a connection in the `Resolving` state.
///
/// The implementation finishes the connection later with
/// [`Manager::resolved`] or [`Manager::resolve_failed`].
pub trait NameResolver {
    fn resolve(&mut self, mgr: &mut Manager, conn: ConnId, host: &str, port: u16);
}

/// Owner of every connection and interface.
pub struct Manager {
    pub(crate) conns: ConnTable,
    ifaces: Vec<Box<dyn Interface>>,
    opts: ManagerOptions,
    now: Instant,
    tls: Option<Box<dyn TlsBackend>>,
    resolver: Option<Box<dyn NameResolver>>,
    bcast_tx: flume::Sender<Bytes>,
    bcast_rx: flume::Receiver<Bytes>,
    user_data: Option<Box<dyn Any>>,
    in_poll: bool,
    shutting_down: bool,
    freed: bool,
}

impl Manager {
    /// Create a manager with the platform socket interface as its only interface.
    pub fn new(opts: ManagerOptions) -> Result<Self> {
        let sock = SocketInterface::new(opts.max_poll_events);
        Self::with_interfaces(opts, vec![Box::new(sock)])
    }

    /// Create a manager over an explicit interface registry.
    ///
    /// Index 0 is the main interface: it is the default for bind/connect and
    /// the only one that blocks in `poll`.
    pub fn with_interfaces(opts: ManagerOptions, mut ifaces: Vec<Box<dyn Interface>>) -> Result<Self> {
        if ifaces.is_empty() {
            return Err(KeelError::UnknownInterface(0));
        }
        for iface in &mut ifaces {
            iface.init()?;
            debug!(iface = iface.name(), "interface initialized");
        }
        let (bcast_tx, bcast_rx) = flume::unbounded();
        let now = opts.clock.now();
        Ok(Self {
            conns: ConnTable::default(),
            ifaces,
            opts,
            now,
            tls: None,
            resolver: None,
            bcast_tx,
            bcast_rx,
            user_data: None,
            in_poll: false,
            shutting_down: false,
            freed: false,
        })
    }

    #[must_use]
    pub const fn options(&self) -> &ManagerOptions {
        &self.opts
    }

    /// Time of the current (or last) loop iteration.
    #[must_use]
    pub const fn now(&self) -> Instant {
        self.now
    }

    /// Install the TLS backend used for connections opened with TLS params.
    pub fn set_tls_backend(&mut self, mut backend: Box<dyn TlsBackend>) -> Result<()> {
        backend.init()?;
        debug!(backend = backend.name(), "TLS backend installed");
        self.tls = Some(backend);
        Ok(())
    }

    /// Install the lookup used when `connect` is given a host name.
    pub fn set_name_resolver(&mut self, resolver: impl NameResolver + 'static) {
        self.resolver = Some(Box::new(resolver));
    }

    #[must_use]
    pub fn interface_count(&self) -> usize {
        self.ifaces.len()
    }

    #[must_use]
    pub fn interface_name(&self, iface: usize) -> Option<&str> {
        self.ifaces.get(iface).map(|i| i.name())
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.len() == 0
    }

    #[must_use]
    pub fn contains(&self, id: ConnId) -> bool {
        self.conns.contains(id)
    }

    /// Ids of all live connections, in no particular order.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnId> {
        self.conns.ids()
    }

    /// Handler-style access to a connection from outside the loop.
    pub fn conn(&mut self, id: ConnId) -> Option<Conn<'_>> {
        if self.conns.contains(id) {
            Some(Conn::new(self, id))
        } else {
            None
        }
    }

    #[must_use]
    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        self.conns.get(id).map(Connection::state)
    }

    #[must_use]
    pub fn flags(&self, id: ConnId) -> Option<ConnFlags> {
        self.conns.get(id).map(|c| c.flags)
    }

    #[must_use]
    pub fn local_addr(&self, id: ConnId) -> Option<SocketAddr> {
        let conn = self.conns.get(id)?;
        conn.local
            .or_else(|| self.ifaces.get(conn.iface)?.get_conn_addr(id, false))
    }

    #[must_use]
    pub fn peer_addr(&self, id: ConnId) -> Option<SocketAddr> {
        let conn = self.conns.get(id)?;
        conn.peer
            .or_else(|| self.ifaces.get(conn.iface)?.get_conn_addr(id, true))
    }

    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut()
    }

    /// Listen on `addr` (`"1883"`, `"tcp://0.0.0.0:1883"`, `"udp://:5353"`).
    ///
    /// Each accepted connection gets its own clone of `handler`.
    pub fn bind<H>(&mut self, addr: &str, handler: H) -> Result<ConnId>
    where
        H: EventHandler + Clone,
    {
        self.bind_opt(&Endpoint::parse(addr)?, handler, ConnOpts::default())
    }

    pub fn bind_opt<H>(&mut self, endpoint: &Endpoint, handler: H, opts: ConnOpts) -> Result<ConnId>
    where
        H: EventHandler + Clone,
    {
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| KeelError::resolve(endpoint.to_string()))?;
        if opts.tls.is_some() {
            if endpoint.is_udp() {
                return Err(KeelError::not_supported("TLS over UDP"));
            }
            if self.tls.is_none() {
                return Err(KeelError::tls("no TLS backend installed"));
            }
        }

        let mut flags = opts.initial_flags() | ConnFlags::LISTENING;
        if endpoint.is_udp() {
            flags |= ConnFlags::UDP;
        }
        let id = self.new_conn(opts.iface, flags, Box::new(handler.clone()))?;

        let iface = &mut self.ifaces[opts.iface];
        let bound = if endpoint.is_udp() {
            iface.listen_udp(id, addr, flags)
        } else {
            iface.listen_tcp(id, addr)
        };
        match bound {
            Ok(local) => {
                let conn = &mut self.conns[id];
                conn.local = Some(local);
                conn.tls_listen = opts.tls;
                conn.spawn = Some(Box::new(move || -> Box<dyn EventHandler> {
                    Box::new(handler.clone())
                }));
                debug!(conn = %id, %local, transport = %endpoint.transport, "listening");
                Ok(id)
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "bind failed");
                self.discard(id);
                Err(e.into())
            }
        }
    }

    /// Connect to `addr`. The outcome arrives as a CONNECT event.
    ///
    /// Host names need a [`NameResolver`]; without one they fail with
    /// [`KeelError::Resolve`].
    pub fn connect(&mut self, addr: &str, handler: impl EventHandler) -> Result<ConnId> {
        self.connect_opt(&Endpoint::parse(addr)?, handler, ConnOpts::default())
    }

    pub fn connect_opt(
        &mut self,
        endpoint: &Endpoint,
        handler: impl EventHandler,
        opts: ConnOpts,
    ) -> Result<ConnId> {
        let Some(addr) = endpoint.socket_addr() else {
            return self.connect_name(endpoint, Box::new(handler), opts);
        };
        let id = self.outbound_conn(endpoint.transport, Box::new(handler), opts, ConnFlags::NONE)?;
        self.start_connect(id, addr);
        Ok(id)
    }

    fn connect_name(
        &mut self,
        endpoint: &Endpoint,
        handler: Box<dyn EventHandler>,
        opts: ConnOpts,
    ) -> Result<ConnId> {
        let (Some(host), true) = (endpoint.host_name(), self.resolver.is_some()) else {
            return Err(KeelError::resolve(endpoint.to_string()));
        };
        let host = host.to_string();
        let id = self.outbound_conn(endpoint.transport, handler, opts, ConnFlags::RESOLVING)?;
        if let Some(mut resolver) = self.resolver.take() {
            debug!(conn = %id, %host, "resolving");
            resolver.resolve(self, id, &host, endpoint.port);
            self.resolver.get_or_insert(resolver);
        }
        Ok(id)
    }

    /// Create an outbound connection in the `Resolving` state.
    ///
    /// Finish it with [`resolved`](Self::resolved) or [`resolve_failed`](Self::resolve_failed).
    pub fn connect_pending(
        &mut self,
        transport: Transport,
        handler: impl EventHandler,
        opts: ConnOpts,
    ) -> Result<ConnId> {
        let id = self.outbound_conn(transport, Box::new(handler), opts, ConnFlags::RESOLVING)?;
        trace!(conn = %id, "waiting for name resolution");
        Ok(id)
    }

    /// Name lookup for a `Resolving` connection succeeded; start connecting.
    pub fn resolved(&mut self, id: ConnId, addr: SocketAddr) -> Result<()> {
        let conn = self
            .conns
            .get_mut(id)
            .ok_or(KeelError::UnknownConnection(id))?;
        if !conn.flags.contains(ConnFlags::RESOLVING) {
            return Err(KeelError::not_supported("connection is not resolving"));
        }
        conn.flags.remove(ConnFlags::RESOLVING);
        if !conn.flags.contains(ConnFlags::UDP) {
            conn.flags.insert(ConnFlags::CONNECTING);
        }
        debug!(conn = %id, %addr, "resolved");
        self.start_connect(id, addr);
        Ok(())
    }

    /// Name lookup failed: raise CONNECT with `err` and close.
    pub fn resolve_failed(&mut self, id: ConnId, err: io::Error) {
        if let Some(conn) = self.conns.get_mut(id) {
            debug!(conn = %id, error = %err, "resolve failed");
            conn.flags.remove(ConnFlags::RESOLVING);
            conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
            conn.pending.push(IoEvent::Connect(Some(err)));
        }
    }

    /// Adopt a connected TCP stream on the main interface.
    pub fn add_sock(&mut self, stream: std::net::TcpStream, handler: impl EventHandler) -> Result<ConnId> {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let id = self.new_conn(0, ConnFlags::NONE, Box::new(handler))?;
        if let Err(e) = self.ifaces[0].sock_set(id, stream) {
            self.discard(id);
            return Err(e.into());
        }
        let conn = &mut self.conns[id];
        conn.peer = peer;
        conn.local = local;
        debug!(conn = %id, ?peer, "socket adopted");
        Ok(id)
    }

    /// Queue `data` on `id`. Returns the number of bytes queued (0 if the
    /// buffer could not grow).
    pub fn send(&mut self, id: ConnId, data: &[u8]) -> Result<usize> {
        let conn = self
            .conns
            .get_mut(id)
            .ok_or(KeelError::UnknownConnection(id))?;
        if conn.closed {
            return Ok(0);
        }
        let iface = self
            .ifaces
            .get_mut(conn.iface)
            .ok_or(KeelError::UnknownInterface(conn.iface))?;
        let n = if conn.flags.contains(ConnFlags::UDP) {
            iface.udp_send(id, data, &mut conn.send)
        } else {
            iface.tcp_send(id, data, &mut conn.send)
        };
        if n < data.len() {
            warn!(conn = %id, bytes = data.len(), "send buffer full");
        }
        Ok(n)
    }

    /// Arm (or with `None`, disarm) the timer of `id`. Returns the previous deadline.
    pub fn set_timer(&mut self, id: ConnId, deadline: Option<Instant>) -> Result<Option<Instant>> {
        let conn = self
            .conns
            .get_mut(id)
            .ok_or(KeelError::UnknownConnection(id))?;
        Ok(mem::replace(&mut conn.timer, deadline))
    }

    /// Close `id` at the next loop iteration. Closing twice is a no-op.
    pub fn close(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(id) {
            if !conn.closed && !conn.flags.contains(ConnFlags::CLOSE_IMMEDIATELY) {
                trace!(conn = %id, "close requested");
                conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
            }
        }
    }

    /// Close `id` once its send buffer drains.
    pub fn close_after_send(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if conn.closed || conn.flags.contains(ConnFlags::SEND_AND_CLOSE) {
            return;
        }
        conn.flags.insert(ConnFlags::SEND_AND_CLOSE);
        if conn.flags.contains(ConnFlags::SSL_HANDSHAKE_DONE) {
            if let Some(tls) = conn.tls.as_mut() {
                tls.close_notify();
            }
        }
    }

    /// Thread-safe handle for broadcasting to every connection.
    #[must_use]
    pub fn broadcaster(&self) -> Broadcaster {
        let waker = self.ifaces.first().and_then(|i| i.waker());
        Broadcaster::new(self.bcast_tx.clone(), waker, self.opts.max_broadcast_size)
    }

    /// Run one loop iteration, waiting at most `timeout` for I/O.
    ///
    /// Returns the iteration's timestamp.
    pub fn poll(&mut self, timeout: Duration) -> Result<Instant> {
        if self.freed {
            return Err(KeelError::ShuttingDown);
        }
        if self.in_poll {
            return Err(KeelError::not_supported("poll called from inside a handler"));
        }
        self.in_poll = true;
        let result = self.poll_once(timeout);
        self.in_poll = false;
        result
    }

    /// Close every connection (each gets exactly one CLOSE) and free the interfaces.
    ///
    /// Called from a handler, the connections are closed at the end of the
    /// current iteration and the interfaces are freed when the manager drops.
    pub fn shutdown(&mut self) {
        if self.freed {
            return;
        }
        self.shutting_down = true;
        if self.in_poll {
            for id in self.conns.ids() {
                self.close(id);
            }
            return;
        }
        debug!(conns = self.conns.len(), "shutting down");
        for id in self.conns.ids() {
            self.destroy(id);
        }
        for iface in &mut self.ifaces {
            iface.free();
        }
        self.freed = true;
    }

    fn poll_once(&mut self, timeout: Duration) -> Result<Instant> {
        self.now = self.opts.clock.now();
        let wait = self.next_wait(timeout);

        let mut acks = Vec::new();
        let mut ifaces = mem::take(&mut self.ifaces);
        let mut failed = None;
        for (idx, iface) in ifaces.iter_mut().enumerate() {
            let mut ctx = IoCtx::new(&mut self.conns, idx, self.now, &mut acks, self.tls.as_deref_mut());
            let wait = if idx == 0 { wait } else { Duration::ZERO };
            if let Err(e) = iface.poll(wait, &mut ctx) {
                warn!(iface = iface.name(), error = %e, "interface poll failed");
                failed.get_or_insert(e);
            }
            trace!(iface = iface.name(), queued = ctx.queued(), "interface polled");
        }
        for (id, len) in acks {
            let Some(idx) = self.conns.get(id).map(|c| c.iface) else {
                continue;
            };
            if let Some(iface) = ifaces.get_mut(idx) {
                iface.recved(id, len);
            }
        }
        self.ifaces = ifaces;
        if let Some(e) = failed {
            return Err(e.into());
        }

        self.now = self.opts.clock.now();
        self.dispatch_all();
        self.drain_broadcasts();
        self.close_phase();
        Ok(self.now)
    }

    fn next_wait(&self, timeout: Duration) -> Duration {
        if !self.bcast_rx.is_empty() {
            return Duration::ZERO;
        }
        let mut wait = timeout;
        for conn in self.conns.iter() {
            if !conn.pending.is_empty() || conn.should_destroy() {
                return Duration::ZERO;
            }
            if let Some(deadline) = conn.timer {
                wait = wait.min(deadline.saturating_duration_since(self.now));
            }
        }
        wait
    }

    fn dispatch_all(&mut self) {
        let now = self.now;
        for id in self.conns.ids() {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };
            let events = mem::take(&mut conn.pending);
            for ev in &events {
                ev.with_event(|e| self.dispatch(id, e));
            }

            match self.conns.get(id) {
                Some(conn) if !conn.flags.contains(ConnFlags::CLOSE_IMMEDIATELY) => {}
                _ => continue,
            }
            self.dispatch(id, &Event::Poll);

            let due = self.conns.get_mut(id).and_then(|c| match c.timer {
                Some(deadline) if deadline <= now => c.timer.take(),
                _ => None,
            });
            if let Some(deadline) = due {
                self.dispatch(id, &Event::Timer(deadline));
            }
        }
    }

    fn drain_broadcasts(&mut self) {
        while let Ok(msg) = self.bcast_rx.try_recv() {
            trace!(bytes = msg.len(), "delivering broadcast");
            for id in self.conns.ids() {
                self.dispatch(id, &Event::Broadcast(&msg));
            }
        }
    }

    fn close_phase(&mut self) {
        let doomed: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|c| c.should_destroy())
            .map(|c| c.id)
            .collect();
        for id in doomed {
            self.destroy(id);
        }
    }

    fn dispatch(&mut self, id: ConnId, event: &Event<'_>) {
        let Some(mut handler) = self.conns.get_mut(id).and_then(|c| c.handler.take()) else {
            return;
        };
        trace!(conn = %id, event = event.name(), "dispatch");
        handler.handle(&mut Conn::new(self, id), event);
        if let Some(conn) = self.conns.get_mut(id) {
            if conn.handler.is_none() {
                conn.handler = Some(handler);
            }
        }
    }

    fn destroy(&mut self, id: ConnId) {
        match self.conns.get_mut(id) {
            Some(conn) if !conn.closed => conn.closed = true,
            _ => return,
        }
        // events queued after this connection's dispatch turn still go out before CLOSE
        let queued = self
            .conns
            .get_mut(id)
            .map(|c| mem::take(&mut c.pending))
            .unwrap_or_default();
        for ev in &queued {
            ev.with_event(|e| self.dispatch(id, e));
        }
        self.dispatch(id, &Event::Close);

        let Some(conn) = self.conns.remove(id) else {
            return;
        };
        debug!(conn = %id, flags = ?conn.flags, error = ?conn.err, "closed");

        if let (Some(listener), Some(peer)) = (conn.listener, conn.peer) {
            if let Some(lc) = self.conns.get_mut(listener) {
                lc.udp_children.remove(&peer);
            }
        }
        for child in conn.udp_children.values() {
            self.close(*child);
        }
        if let Some(iface) = self.ifaces.get_mut(conn.iface) {
            iface.remove_conn(id);
            iface.destroy_conn(id);
        }
        // handler and protocol state drop first, then the buffers
        drop(conn);
    }

    /// Drop a connection that never became visible to handlers.
    fn discard(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.remove(id) {
            if let Some(iface) = self.ifaces.get_mut(conn.iface) {
                iface.remove_conn(id);
                iface.destroy_conn(id);
            }
        }
    }

    fn limits(&self) -> BufLimits {
        BufLimits {
            recv_limit: self.opts.recv_limit,
            initial: self.opts.initial_buffer_size,
        }
    }

    fn new_conn(
        &mut self,
        iface: usize,
        flags: ConnFlags,
        handler: Box<dyn EventHandler>,
    ) -> Result<ConnId> {
        if self.shutting_down {
            return Err(KeelError::ShuttingDown);
        }
        if iface >= self.ifaces.len() {
            return Err(KeelError::UnknownInterface(iface));
        }
        let limits = self.limits();
        let now = self.now;
        let id = self.conns.insert(|id| {
            let mut conn = Connection::new(id, iface, flags, limits, now);
            conn.handler = Some(handler);
            conn
        });
        if let Err(e) = self.ifaces[iface].create_conn(id) {
            self.conns.remove(id);
            return Err(e.into());
        }
        self.ifaces[iface].add_conn(id);
        Ok(id)
    }

    fn outbound_conn(
        &mut self,
        transport: Transport,
        handler: Box<dyn EventHandler>,
        opts: ConnOpts,
        extra: ConnFlags,
    ) -> Result<ConnId> {
        let mut flags = opts.initial_flags() | extra;
        match transport {
            Transport::Udp => flags |= ConnFlags::UDP,
            Transport::Tcp if !extra.contains(ConnFlags::RESOLVING) => flags |= ConnFlags::CONNECTING,
            Transport::Tcp => {}
        }

        let tls = match &opts.tls {
            Some(_) if transport == Transport::Udp => {
                return Err(KeelError::not_supported("TLS over UDP"));
            }
            Some(params) => {
                let backend = self
                    .tls
                    .as_mut()
                    .ok_or_else(|| KeelError::tls("no TLS backend installed"))?;
                Some(TlsState::new(backend.conn_init(params)?))
            }
            None => None,
        };

        let id = self.new_conn(opts.iface, flags, handler)?;
        if let Some(tls) = tls {
            let conn = &mut self.conns[id];
            conn.flags.insert(ConnFlags::SSL);
            conn.tls = Some(tls);
        }
        Ok(id)
    }

    fn start_connect(&mut self, id: ConnId, addr: SocketAddr) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        conn.peer = Some(addr);
        let udp = conn.flags.contains(ConnFlags::UDP);
        let Some(iface) = self.ifaces.get_mut(conn.iface) else {
            return;
        };
        let started = if udp {
            iface.connect_udp(id, addr, conn.flags)
        } else {
            iface.connect_tcp(id, addr)
        };
        match started {
            Ok(()) if udp => {
                conn.local = iface.get_conn_addr(id, false);
                debug!(conn = %id, %addr, "udp socket ready");
                conn.pending.push(IoEvent::Connect(None));
            }
            Ok(()) => debug!(conn = %id, %addr, "connecting"),
            Err(e) => {
                debug!(conn = %id, %addr, error = %e, "connect failed");
                conn.flags.remove(ConnFlags::CONNECTING);
                conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
                conn.pending.push(IoEvent::Connect(Some(e)));
            }
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.in_poll = false;
        self.shutdown();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("connections", &self.conns.len())
            .field("interfaces", &self.ifaces.len())
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}
