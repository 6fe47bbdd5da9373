//! Socket interface on top of mio.
//!
//! Token `0` is the waker; every other token is a slab key plus one. mio
//! reports readiness edges, so each entry remembers whether it is still
//! readable or writable and the interface keeps draining until the socket
//! says `WouldBlock` or the connection's receive buffer is full.
//!
//! UDP listeners get one pseudo-entry per remote peer. Those entries have no
//! socket of their own: replies go out through the listener's socket.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::conn::ConnId;
use crate::flags::ConnFlags;
use crate::iface::{Interface, IoCtx, RecvBuf, Wake};
use crate::sockopt;

const WAKE_TOKEN: Token = Token(0);
const READ_CHUNK: usize = 16 * 1024;
const MAX_DATAGRAM: usize = 64 * 1024;

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp(UdpSocket),
    UdpPeer { listener: ConnId, peer: SocketAddr },
}

struct Entry {
    conn: ConnId,
    sock: Socket,
    readable: bool,
    writable: bool,
    connecting: bool,
    /// Peer sent FIN. Output may still be draining.
    read_done: bool,
    closed: bool,
}

enum Flush {
    Idle,
    Blocked,
    Failed(io::Error),
}

struct MioWaker(Waker);

impl Wake for MioWaker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// Interface backed by the operating system's sockets.
pub struct SocketInterface {
    poll: Option<Poll>,
    events: Events,
    waker: Option<Arc<MioWaker>>,
    entries: Slab<Entry>,
    by_conn: HashMap<ConnId, usize>,
    scratch: Vec<u8>,
}

impl SocketInterface {
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            poll: None,
            events: Events::with_capacity(max_events.max(1)),
            waker: None,
            entries: Slab::new(),
            by_conn: HashMap::new(),
            scratch: vec![0; MAX_DATAGRAM],
        }
    }

    fn register(&mut self, conn: ConnId, mut sock: Socket, connecting: bool) -> io::Result<()> {
        let poll = self
            .poll
            .as_ref()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "socket interface not initialized"))?;
        let entry = self.entries.vacant_entry();
        let token = Token(entry.key() + 1);
        let registry = poll.registry();
        match &mut sock {
            Socket::Listener(l) => registry.register(l, token, Interest::READABLE)?,
            Socket::Stream(s) => {
                registry.register(s, token, Interest::READABLE | Interest::WRITABLE)?;
            }
            Socket::Udp(u) => registry.register(u, token, Interest::READABLE)?,
            Socket::UdpPeer { .. } => {}
        }
        let writable = !connecting && !matches!(sock, Socket::Listener(_));
        let key = entry.key();
        entry.insert(Entry {
            conn,
            sock,
            readable: false,
            writable,
            connecting,
            read_done: false,
            closed: false,
        });
        self.by_conn.insert(conn, key);
        trace!(%conn, token = key + 1, "socket registered");
        Ok(())
    }

    fn entry(&self, conn: ConnId) -> Option<&Entry> {
        self.entries.get(*self.by_conn.get(&conn)?)
    }

    fn finish_connect(&mut self, key: usize, ctx: &mut IoCtx<'_>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let Socket::Stream(stream) = &entry.sock else {
            return;
        };
        let result = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(()),
                // not finished yet, wait for the next edge
                Err(e) if e.kind() == ErrorKind::NotConnected => return,
                Err(e) => Err(e),
            },
        };
        entry.connecting = false;
        if result.is_err() {
            entry.closed = true;
        } else if let Err(e) = sockopt::configure_stream(stream) {
            trace!(conn = %entry.conn, error = %e, "stream tuning failed");
        }
        ctx.connect_cb(entry.conn, result);
    }

    fn read_ready(&mut self, ctx: &mut IoCtx<'_>) {
        let keys: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, e)| e.readable && !e.read_done && !e.closed && !e.connecting)
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            self.read_entry(key, ctx);
        }
    }

    fn read_entry(&mut self, key: usize, ctx: &mut IoCtx<'_>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let id = entry.conn;
        let mut accepted = Vec::new();
        let mut peers = Vec::new();

        match &mut entry.sock {
            Socket::Listener(listener) => loop {
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        entry.readable = false;
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(listener = %id, error = %e, "accept failed");
                        entry.readable = false;
                        break;
                    }
                }
            },
            Socket::Stream(stream) => loop {
                let room = ctx.recv_room(id);
                if room == 0 {
                    // stay readable; resume once a handler drains the buffer
                    break;
                }
                let mut buf = vec![0u8; room.min(READ_CHUNK)];
                match stream.read(&mut buf) {
                    Ok(0) => {
                        entry.read_done = true;
                        entry.readable = false;
                        ctx.eof_cb(id);
                        break;
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        ctx.recv_tcp_cb(id, RecvBuf::Owned(buf));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        entry.readable = false;
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        entry.closed = true;
                        ctx.close_cb(id, Some(e));
                        break;
                    }
                }
            },
            Socket::Udp(socket) => loop {
                match socket.recv_from(&mut self.scratch) {
                    Ok((n, from)) => {
                        if let Some(child) = ctx.recv_udp_cb(id, RecvBuf::Borrowed(&self.scratch[..n]), from) {
                            peers.push((child, from));
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        entry.readable = false;
                        break;
                    }
                    // ICMP errors surface here; the datagram is simply lost
                    Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                        trace!(conn = %id, "udp peer unreachable");
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(conn = %id, error = %e, "udp receive failed");
                        entry.readable = false;
                        break;
                    }
                }
            },
            Socket::UdpPeer { .. } => entry.readable = false,
        }

        for (stream, peer) in accepted {
            let Some(child) = ctx.accept_new_conn(id) else {
                debug!(listener = %id, %peer, "dropping unaccepted connection");
                continue;
            };
            if let Err(e) = sockopt::configure_stream(&stream) {
                trace!(conn = %child, error = %e, "stream tuning failed");
            }
            match self.register(child, Socket::Stream(stream), false) {
                Ok(()) => ctx.accept_cb(child, peer),
                Err(e) => ctx.close_cb(child, Some(e)),
            }
        }
        for (child, peer) in peers {
            if let Err(e) = self.register(child, Socket::UdpPeer { listener: id, peer }, false) {
                ctx.close_cb(child, Some(e));
            }
        }
    }

    fn flush_ready(&mut self, ctx: &mut IoCtx<'_>) {
        let keys: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, e)| e.writable && !e.closed && !e.connecting && ctx.has_output(e.conn))
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            let outcome = self.flush_entry(key, ctx);
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            match outcome {
                Flush::Idle => {}
                Flush::Blocked => entry.writable = false,
                Flush::Failed(e) => {
                    entry.closed = true;
                    ctx.close_cb(entry.conn, Some(e));
                }
            }
        }
    }

    fn flush_entry(&self, key: usize, ctx: &mut IoCtx<'_>) -> Flush {
        let Some(entry) = self.entries.get(key) else {
            return Flush::Idle;
        };
        let id = entry.conn;
        match &entry.sock {
            Socket::Stream(stream) => loop {
                let written = {
                    let data = ctx.send_data(id);
                    if data.is_empty() {
                        return Flush::Idle;
                    }
                    let mut writer: &TcpStream = stream;
                    writer.write(data)
                };
                match written {
                    Ok(0) => return Flush::Failed(ErrorKind::WriteZero.into()),
                    Ok(n) => ctx.sent_cb(id, n),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Flush::Blocked,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Flush::Failed(e),
                }
            },
            Socket::Udp(socket) => {
                let (len, sent) = {
                    let data = ctx.send_data(id);
                    (data.len(), socket.send(data))
                };
                self.datagram_sent(id, len, sent, ctx)
            }
            Socket::UdpPeer { listener, peer } => {
                let socket = match self.entry(*listener).map(|e| &e.sock) {
                    Some(Socket::Udp(socket)) => socket,
                    _ => return Flush::Failed(ErrorKind::NotConnected.into()),
                };
                let (len, sent) = {
                    let data = ctx.send_data(id);
                    (data.len(), socket.send_to(data, *peer))
                };
                self.datagram_sent(id, len, sent, ctx)
            }
            Socket::Listener(_) => Flush::Idle,
        }
    }

    fn datagram_sent(&self, id: ConnId, len: usize, sent: io::Result<usize>, ctx: &mut IoCtx<'_>) -> Flush {
        match sent {
            Ok(_) => {
                ctx.sent_cb(id, len);
                Flush::Idle
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Flush::Blocked,
            Err(e) => {
                // datagrams are unreliable; drop it and keep the socket
                warn!(conn = %id, error = %e, bytes = len, "datagram dropped");
                ctx.sent_cb(id, len);
                Flush::Idle
            }
        }
    }

    fn has_ready_work(&self, ctx: &IoCtx<'_>) -> bool {
        self.entries.iter().any(|(_, e)| {
            !e.closed
                && !e.connecting
                && ((e.readable && !e.read_done && ctx.recv_room(e.conn) > 0)
                    || (e.writable && ctx.has_output(e.conn)))
        })
    }
}

impl Interface for SocketInterface {
    fn name(&self) -> &str {
        "socket"
    }

    fn init(&mut self) -> io::Result<()> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        self.waker = Some(Arc::new(MioWaker(waker)));
        self.poll = Some(poll);
        Ok(())
    }

    fn free(&mut self) {
        self.entries.clear();
        self.by_conn.clear();
        self.waker = None;
        self.poll = None;
    }

    fn destroy_conn(&mut self, conn: ConnId) {
        let Some(key) = self.by_conn.remove(&conn) else {
            return;
        };
        let mut entry = self.entries.remove(key);
        if let Some(poll) = &self.poll {
            let registry = poll.registry();
            let res = match &mut entry.sock {
                Socket::Listener(l) => registry.deregister(l),
                Socket::Stream(s) => registry.deregister(s),
                Socket::Udp(u) => registry.deregister(u),
                Socket::UdpPeer { .. } => Ok(()),
            };
            if let Err(e) = res {
                trace!(%conn, error = %e, "deregister failed");
            }
        }
        trace!(%conn, "socket released");
    }

    fn listen_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = sockopt::tcp_listener(addr)?;
        let local = listener.local_addr()?;
        self.register(conn, Socket::Listener(listener), false)?;
        Ok(local)
    }

    fn listen_udp(&mut self, conn: ConnId, addr: SocketAddr, flags: ConnFlags) -> io::Result<SocketAddr> {
        let socket = sockopt::udp_socket(addr, flags.contains(ConnFlags::ENABLE_BROADCAST))?;
        let local = socket.local_addr()?;
        self.register(conn, Socket::Udp(socket), false)?;
        Ok(local)
    }

    fn connect_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<()> {
        let stream = TcpStream::connect(addr)?;
        self.register(conn, Socket::Stream(stream), true)
    }

    fn connect_udp(&mut self, conn: ConnId, addr: SocketAddr, flags: ConnFlags) -> io::Result<()> {
        let any = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = sockopt::udp_socket(
            SocketAddr::new(any, 0),
            flags.contains(ConnFlags::ENABLE_BROADCAST),
        )?;
        socket.connect(addr)?;
        self.register(conn, Socket::Udp(socket), false)
    }

    fn sock_set(&mut self, conn: ConnId, sock: std::net::TcpStream) -> io::Result<()> {
        sock.set_nonblocking(true)?;
        let stream = TcpStream::from_std(sock);
        sockopt::configure_stream(&stream)?;
        self.register(conn, Socket::Stream(stream), false)
    }

    fn get_conn_addr(&self, conn: ConnId, remote: bool) -> Option<SocketAddr> {
        match &self.entry(conn)?.sock {
            Socket::Listener(l) if !remote => l.local_addr().ok(),
            Socket::Listener(_) => None,
            Socket::Stream(s) if remote => s.peer_addr().ok(),
            Socket::Stream(s) => s.local_addr().ok(),
            Socket::Udp(u) if remote => u.peer_addr().ok(),
            Socket::Udp(u) => u.local_addr().ok(),
            Socket::UdpPeer { peer, .. } if remote => Some(*peer),
            Socket::UdpPeer { listener, .. } => self.get_conn_addr(*listener, false),
        }
    }

    fn poll(&mut self, timeout: Duration, ctx: &mut IoCtx<'_>) -> io::Result<()> {
        self.flush_ready(ctx);
        let timeout = if self.has_ready_work(ctx) {
            Duration::ZERO
        } else {
            timeout
        };

        let Some(poll) = self.poll.as_mut() else {
            return Err(io::Error::new(ErrorKind::NotConnected, "socket interface not initialized"));
        };
        match poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let ready: Vec<(usize, bool, bool, bool)> = self
            .events
            .iter()
            .filter(|ev| ev.token() != WAKE_TOKEN)
            .map(|ev| {
                (
                    ev.token().0 - 1,
                    ev.is_readable() || ev.is_read_closed(),
                    ev.is_writable() || ev.is_write_closed(),
                    ev.is_error(),
                )
            })
            .collect();

        for (key, readable, writable, error) in ready {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            entry.readable |= readable || error;
            entry.writable |= writable;
            if entry.connecting && (writable || error) {
                self.finish_connect(key, ctx);
            }
        }

        self.read_ready(ctx);
        self.flush_ready(ctx);
        Ok(())
    }

    fn waker(&self) -> Option<Arc<dyn Wake>> {
        self.waker.clone().map(|w| w as Arc<dyn Wake>)
    }
}
