//! Connections and the arena that owns them.
//!
//! Connections live in a slab owned by the manager and are addressed by
//! [`ConnId`], a slot index plus a generation. A handle to a destroyed
//! connection never aliases a newer connection that reuses the slot.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};
use std::time::Instant;

use hashbrown::HashMap;
use slab::Slab;
use smallvec::SmallVec;

use crate::buffer::Mbuf;
use crate::event::IoEvent;
use crate::flags::ConnFlags;
use crate::handler::EventHandler;
use crate::manager::Manager;
use crate::tls::{TlsParams, TlsState};

/// Stable handle to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    idx: usize,
    gen: u32,
}

impl ConnId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.idx
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.gen
    }

    #[cfg(test)]
    pub(crate) const fn new(idx: usize, gen: u32) -> Self {
        Self { idx, gen }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.idx, self.gen)
    }
}

/// Lifecycle state of a connection.
///
/// `Resolving -> Connecting -> Established -> Closing -> Closed`. Listeners
/// and accepted connections start in `Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Resolving,
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Buffer sizing copied from the manager options into each connection.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BufLimits {
    pub recv_limit: Option<usize>,
    pub initial: usize,
}

/// Builds a handler for each connection accepted on a listener.
pub(crate) type Spawn = Box<dyn FnMut() -> Box<dyn EventHandler>>;

pub(crate) struct Connection {
    pub id: ConnId,
    pub iface: usize,
    pub flags: ConnFlags,
    pub closed: bool,
    pub recv: Mbuf,
    pub send: Mbuf,
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub listener: Option<ConnId>,
    pub timer: Option<Instant>,
    pub last_io: Instant,
    pub err: Option<io::Error>,
    pub limits: BufLimits,
    pub handler: Option<Box<dyn EventHandler>>,
    pub spawn: Option<Spawn>,
    pub proto_data: Option<Box<dyn Any>>,
    pub user_data: Option<Box<dyn Any>>,
    pub tls: Option<TlsState>,
    pub tls_listen: Option<TlsParams>,
    pub udp_children: HashMap<SocketAddr, ConnId>,
    pub pending: SmallVec<[IoEvent; 4]>,
}

impl Connection {
    pub fn new(id: ConnId, iface: usize, flags: ConnFlags, limits: BufLimits, now: Instant) -> Self {
        let mut recv = Mbuf::with_capacity(limits.initial);
        recv.set_limit(limits.recv_limit);
        Self {
            id,
            iface,
            flags,
            closed: false,
            recv,
            send: Mbuf::with_capacity(limits.initial),
            peer: None,
            local: None,
            listener: None,
            timer: None,
            last_io: now,
            err: None,
            limits,
            handler: None,
            spawn: None,
            proto_data: None,
            user_data: None,
            tls: None,
            tls_listen: None,
            udp_children: HashMap::new(),
            pending: SmallVec::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        if self.closed {
            ConnState::Closed
        } else if self
            .flags
            .intersects(ConnFlags::CLOSE_IMMEDIATELY | ConnFlags::SEND_AND_CLOSE)
        {
            ConnState::Closing
        } else if self.flags.contains(ConnFlags::RESOLVING) {
            ConnState::Resolving
        } else if self.flags.contains(ConnFlags::CONNECTING)
            || (self.flags.contains(ConnFlags::SSL)
                && !self.flags.contains(ConnFlags::SSL_HANDSHAKE_DONE))
        {
            ConnState::Connecting
        } else {
            ConnState::Established
        }
    }

    /// Bytes not yet handed to the wire, plaintext and ciphertext.
    pub fn unsent(&self) -> usize {
        self.send.len() + self.tls.as_ref().map_or(0, |t| t.wire_out.len())
    }

    pub fn should_destroy(&self) -> bool {
        self.flags.contains(ConnFlags::CLOSE_IMMEDIATELY)
            || (self.flags.contains(ConnFlags::SEND_AND_CLOSE) && self.unsent() == 0)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // protocol and user state go before the buffers they may reference
        self.handler.take();
        self.spawn.take();
        self.proto_data.take();
        self.user_data.take();
    }
}

/// Slab of live connections plus the generation counter.
#[derive(Default)]
pub(crate) struct ConnTable {
    slab: Slab<Connection>,
    next_gen: u32,
}

impl ConnTable {
    pub fn insert(&mut self, build: impl FnOnce(ConnId) -> Connection) -> ConnId {
        self.next_gen = self.next_gen.wrapping_add(1);
        let entry = self.slab.vacant_entry();
        let id = ConnId {
            idx: entry.key(),
            gen: self.next_gen,
        };
        entry.insert(build(id));
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slab.get(id.idx).filter(|c| c.id.gen == id.gen)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slab.get_mut(id.idx).filter(|c| c.id.gen == id.gen)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        if self.get(id).is_some() {
            Some(self.slab.remove(id.idx))
        } else {
            None
        }
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Snapshot of live ids, so callers may mutate the table while walking it.
    pub fn ids(&self) -> Vec<ConnId> {
        self.slab.iter().map(|(_, c)| c.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slab.iter().map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }
}

impl Index<ConnId> for ConnTable {
    type Output = Connection;

    fn index(&self, id: ConnId) -> &Connection {
        let conn = &self.slab[id.idx];
        debug_assert_eq!(conn.id.gen, id.gen, "stale connection handle");
        conn
    }
}

impl IndexMut<ConnId> for ConnTable {
    fn index_mut(&mut self, id: ConnId) -> &mut Connection {
        let conn = &mut self.slab[id.idx];
        debug_assert_eq!(conn.id.gen, id.gen, "stale connection handle");
        conn
    }
}

/// A connection as seen from inside a handler.
///
/// Borrows the whole manager, so a handler can reach other connections and
/// create new ones. The connection itself stays alive for as long as this
/// value exists: only the manager's close phase destroys connections.
pub struct Conn<'a> {
    mgr: &'a mut Manager,
    id: ConnId,
}

impl<'a> Conn<'a> {
    pub(crate) fn new(mgr: &'a mut Manager, id: ConnId) -> Self {
        Self { mgr, id }
    }

    fn inner(&self) -> &Connection {
        &self.mgr.conns[self.id]
    }

    fn inner_mut(&mut self) -> &mut Connection {
        &mut self.mgr.conns[self.id]
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.id
    }

    /// The owning manager.
    pub fn manager(&mut self) -> &mut Manager {
        &mut *self.mgr
    }

    /// Time of the current loop iteration.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.mgr.now()
    }

    #[must_use]
    pub fn flags(&self) -> ConnFlags {
        self.inner().flags
    }

    /// Set application flags. Only `USER_*` and `IS_WEBSOCKET` bits are honored.
    pub fn set_flags(&mut self, flags: ConnFlags) {
        self.inner_mut()
            .flags
            .insert(flags & (ConnFlags::USER_MASK | ConnFlags::IS_WEBSOCKET));
    }

    pub fn clear_flags(&mut self, flags: ConnFlags) {
        self.inner_mut()
            .flags
            .remove(flags & (ConnFlags::USER_MASK | ConnFlags::IS_WEBSOCKET));
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        self.inner().state()
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.flags().contains(ConnFlags::LISTENING)
    }

    #[must_use]
    pub fn is_udp(&self) -> bool {
        self.flags().contains(ConnFlags::UDP)
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.mgr.peer_addr(self.id)
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mgr.local_addr(self.id)
    }

    /// Listener that accepted this connection.
    #[must_use]
    pub fn listener(&self) -> Option<ConnId> {
        self.inner().listener
    }

    #[must_use]
    pub fn recv_buf(&self) -> &Mbuf {
        &self.inner().recv
    }

    pub fn recv_buf_mut(&mut self) -> &mut Mbuf {
        &mut self.inner_mut().recv
    }

    #[must_use]
    pub fn send_buf(&self) -> &Mbuf {
        &self.inner().send
    }

    /// Queue bytes for sending. Returns the number of bytes queued.
    pub fn send(&mut self, data: &[u8]) -> usize {
        self.mgr.send(self.id, data).unwrap_or(0)
    }

    /// Arm the timer at `deadline` (or disarm with `None`). Returns the previous deadline.
    pub fn set_timer(&mut self, deadline: Option<Instant>) -> Option<Instant> {
        std::mem::replace(&mut self.inner_mut().timer, deadline)
    }

    #[must_use]
    pub fn timer(&self) -> Option<Instant> {
        self.inner().timer
    }

    /// Time of the last successful receive or send.
    #[must_use]
    pub fn last_io_time(&self) -> Instant {
        self.inner().last_io
    }

    /// Error that caused the connection to close, if any.
    #[must_use]
    pub fn error(&self) -> Option<&io::Error> {
        self.inner().err.as_ref()
    }

    /// Close at the next loop iteration, discarding unsent data.
    pub fn close(&mut self) {
        self.mgr.close(self.id);
    }

    /// Close once everything queued so far has been sent.
    pub fn close_after_send(&mut self) {
        self.mgr.close_after_send(self.id);
    }

    /// Protocol layer state, if it is a `T`.
    pub fn proto_data<T: Any>(&mut self) -> Option<&mut T> {
        self.inner_mut().proto_data.as_mut()?.downcast_mut()
    }

    /// Attach protocol layer state. It is dropped when the connection is destroyed,
    /// before the buffers are released.
    pub fn set_proto_data<T: Any>(&mut self, data: T) {
        self.inner_mut().proto_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&mut self) -> Option<&mut T> {
        self.inner_mut().user_data.as_mut()?.downcast_mut()
    }

    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.inner_mut().user_data = Some(Box::new(data));
    }

    /// Replace this connection's handler. Takes effect from the next event.
    pub fn set_handler(&mut self, handler: impl EventHandler) {
        self.inner_mut().handler = Some(Box::new(handler));
    }
}
