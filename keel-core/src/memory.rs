//! In-process interface.
//!
//! Streams and datagrams move between connections of the same
//! [`MemoryInterface`] without touching the operating system, which makes it
//! the interface of choice for deterministic tests (pair it with a
//! [`ManualClock`](crate::clock::ManualClock)). Every address lives on
//! `127.0.0.1`; port `0` picks an ephemeral port.
//!
//! The interface never blocks: `poll` moves whatever is ready and returns.
//! Every datagram it carries, routable or not, is recorded in a [`Journal`].

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::conn::ConnId;
use crate::flags::ConnFlags;
use crate::iface::{Interface, IoCtx, RecvBuf};

const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// A datagram seen by the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Bytes,
    /// False if nothing was bound at `to`.
    pub delivered: bool,
}

/// Shared record of datagram traffic.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    inner: Arc<Mutex<Vec<Datagram>>>,
}

impl Journal {
    #[must_use]
    pub fn datagrams(&self) -> Vec<Datagram> {
        self.inner.lock().clone()
    }

    /// Datagrams sent to `to`.
    #[must_use]
    pub fn sent_to(&self, to: SocketAddr) -> Vec<Datagram> {
        self.inner.lock().iter().filter(|d| d.to == to).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    fn record(&self, datagram: Datagram) {
        self.inner.lock().push(datagram);
    }
}

#[derive(Debug)]
enum Kind {
    Listener,
    Stream { peer: Option<ConnId>, remote: SocketAddr },
    Udp { remote: Option<SocketAddr> },
    UdpPeer { listener: ConnId, remote: SocketAddr },
}

#[derive(Debug)]
struct Slot {
    kind: Kind,
    local: SocketAddr,
    peer_closed: bool,
    closed: bool,
}

/// Interface connecting its own connections to each other in memory.
#[derive(Debug)]
pub struct MemoryInterface {
    name: String,
    slots: HashMap<ConnId, Slot>,
    tcp_bound: HashMap<SocketAddr, ConnId>,
    udp_bound: HashMap<SocketAddr, ConnId>,
    connects: Vec<(ConnId, SocketAddr)>,
    next_port: u16,
    journal: Journal,
}

impl Default for MemoryInterface {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryInterface {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: HashMap::new(),
            tcp_bound: HashMap::new(),
            udp_bound: HashMap::new(),
            connects: Vec::new(),
            next_port: FIRST_EPHEMERAL_PORT,
            journal: Journal::default(),
        }
    }

    /// Handle on the datagram record; stays valid after the interface moves
    /// into a manager.
    #[must_use]
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn ephemeral(&mut self) -> io::Result<SocketAddr> {
        for _ in 0..u16::MAX {
            let port = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            if !self.tcp_bound.contains_key(&addr) && !self.udp_bound.contains_key(&addr) {
                return Ok(addr);
            }
        }
        Err(ErrorKind::AddrNotAvailable.into())
    }

    fn local_for(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        if addr.port() == 0 {
            let port = self.ephemeral()?.port();
            Ok(SocketAddr::new(addr.ip(), port))
        } else {
            Ok(addr)
        }
    }

    fn finish_connects(&mut self, ctx: &mut IoCtx<'_>) {
        for (client, addr) in std::mem::take(&mut self.connects) {
            if !ctx.is_live(client) {
                continue;
            }
            let Some(local) = self.slots.get(&client).map(|s| s.local) else {
                continue;
            };
            let Some(listener) = self.lookup_listener(addr) else {
                self.mark_closed(client);
                ctx.connect_cb(client, Err(ErrorKind::ConnectionRefused.into()));
                continue;
            };
            let Some(server) = ctx.accept_new_conn(listener) else {
                self.mark_closed(client);
                ctx.connect_cb(client, Err(ErrorKind::ConnectionRefused.into()));
                continue;
            };
            self.slots.insert(
                server,
                Slot {
                    kind: Kind::Stream {
                        peer: Some(client),
                        remote: local,
                    },
                    local: addr,
                    peer_closed: false,
                    closed: false,
                },
            );
            if let Some(slot) = self.slots.get_mut(&client) {
                slot.kind = Kind::Stream {
                    peer: Some(server),
                    remote: addr,
                };
            }
            trace!(%client, %server, %addr, "memory stream linked");
            ctx.accept_cb(server, local);
            ctx.connect_cb(client, Ok(()));
        }
    }

    fn lookup_listener(&self, addr: SocketAddr) -> Option<ConnId> {
        self.tcp_bound.get(&addr).copied().or_else(|| {
            // a listener on the unspecified address accepts any local destination
            let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
            self.tcp_bound.get(&any).copied()
        })
    }

    fn lookup_udp(&self, addr: SocketAddr) -> Option<ConnId> {
        self.udp_bound.get(&addr).copied().or_else(|| {
            let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
            self.udp_bound.get(&any).copied()
        })
    }

    fn mark_closed(&mut self, id: ConnId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.closed = true;
        }
    }

    fn pump_streams(&mut self, ctx: &mut IoCtx<'_>) {
        let pairs: Vec<(ConnId, ConnId)> = self
            .slots
            .iter()
            .filter(|(_, s)| !s.closed)
            .filter_map(|(id, s)| match s.kind {
                Kind::Stream { peer: Some(peer), .. } => Some((*id, peer)),
                _ => None,
            })
            .collect();
        loop {
            let mut progressed = false;
            for &(id, peer) in &pairs {
                if ctx.is_live(id) && ctx.is_live(peer) && ctx.has_output(id) {
                    progressed |= Self::pump(id, peer, ctx);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn pump(id: ConnId, peer: ConnId, ctx: &mut IoCtx<'_>) -> bool {
        let room = ctx.recv_room(peer);
        if room == 0 {
            return false;
        }
        let chunk = {
            let data = ctx.send_data(id);
            if data.is_empty() {
                return false;
            }
            data[..data.len().min(room)].to_vec()
        };
        ctx.sent_cb(id, chunk.len());
        ctx.recv_tcp_cb(peer, RecvBuf::Owned(chunk));
        true
    }

    fn pump_datagrams(&mut self, ctx: &mut IoCtx<'_>) {
        let senders: Vec<(ConnId, SocketAddr, SocketAddr)> = self
            .slots
            .iter()
            .filter(|(id, s)| !s.closed && ctx.has_output(**id))
            .filter_map(|(id, s)| match s.kind {
                Kind::Udp { remote: Some(remote) } => Some((*id, s.local, remote)),
                Kind::UdpPeer { remote, .. } => Some((*id, s.local, remote)),
                _ => None,
            })
            .collect();

        for (id, from, to) in senders {
            let payload = Bytes::copy_from_slice(ctx.send_data(id));
            ctx.sent_cb(id, payload.len());

            let target = self.lookup_udp(to).filter(|t| ctx.is_live(*t));
            self.journal.record(Datagram {
                from,
                to,
                payload: payload.clone(),
                delivered: target.is_some(),
            });
            let Some(target) = target else {
                trace!(conn = %id, %to, "datagram unroutable");
                continue;
            };
            if let Some(child) = ctx.recv_udp_cb(target, RecvBuf::Borrowed(&payload), from) {
                let local = self.slots.get(&target).map_or(to, |s| s.local);
                self.slots.insert(
                    child,
                    Slot {
                        kind: Kind::UdpPeer {
                            listener: target,
                            remote: from,
                        },
                        local,
                        peer_closed: false,
                        closed: false,
                    },
                );
            }
        }
    }

    fn propagate_closes(&mut self, ctx: &mut IoCtx<'_>) {
        for (id, slot) in &mut self.slots {
            if slot.peer_closed && !slot.closed {
                slot.closed = true;
                debug!(conn = %id, "memory peer closed");
                ctx.close_cb(*id, None);
            }
        }
    }
}

impl Interface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn free(&mut self) {
        self.slots.clear();
        self.tcp_bound.clear();
        self.udp_bound.clear();
        self.connects.clear();
    }

    fn destroy_conn(&mut self, conn: ConnId) {
        self.connects.retain(|(id, _)| *id != conn);
        let Some(slot) = self.slots.remove(&conn) else {
            return;
        };
        match slot.kind {
            Kind::Listener => {
                self.tcp_bound.remove(&slot.local);
            }
            Kind::Udp { .. } => {
                self.udp_bound.remove(&slot.local);
            }
            Kind::Stream { peer: Some(peer), .. } => {
                if let Some(other) = self.slots.get_mut(&peer) {
                    other.peer_closed = true;
                }
            }
            Kind::Stream { peer: None, .. } | Kind::UdpPeer { .. } => {}
        }
    }

    fn listen_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<SocketAddr> {
        let local = self.local_for(addr)?;
        if self.tcp_bound.contains_key(&local) {
            return Err(ErrorKind::AddrInUse.into());
        }
        self.tcp_bound.insert(local, conn);
        self.slots.insert(
            conn,
            Slot {
                kind: Kind::Listener,
                local,
                peer_closed: false,
                closed: false,
            },
        );
        Ok(local)
    }

    fn listen_udp(&mut self, conn: ConnId, addr: SocketAddr, _flags: ConnFlags) -> io::Result<SocketAddr> {
        let local = self.local_for(addr)?;
        if self.udp_bound.contains_key(&local) {
            return Err(ErrorKind::AddrInUse.into());
        }
        self.udp_bound.insert(local, conn);
        self.slots.insert(
            conn,
            Slot {
                kind: Kind::Udp { remote: None },
                local,
                peer_closed: false,
                closed: false,
            },
        );
        Ok(local)
    }

    fn connect_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<()> {
        let local = self.ephemeral()?;
        self.slots.insert(
            conn,
            Slot {
                kind: Kind::Stream {
                    peer: None,
                    remote: addr,
                },
                local,
                peer_closed: false,
                closed: false,
            },
        );
        self.connects.push((conn, addr));
        Ok(())
    }

    fn connect_udp(&mut self, conn: ConnId, addr: SocketAddr, _flags: ConnFlags) -> io::Result<()> {
        let local = self.ephemeral()?;
        self.udp_bound.insert(local, conn);
        self.slots.insert(
            conn,
            Slot {
                kind: Kind::Udp { remote: Some(addr) },
                local,
                peer_closed: false,
                closed: false,
            },
        );
        Ok(())
    }

    fn get_conn_addr(&self, conn: ConnId, remote: bool) -> Option<SocketAddr> {
        let slot = self.slots.get(&conn)?;
        if !remote {
            return Some(slot.local);
        }
        match slot.kind {
            Kind::Listener => None,
            Kind::Stream { remote, .. } | Kind::UdpPeer { remote, .. } => Some(remote),
            Kind::Udp { remote } => remote,
        }
    }

    fn poll(&mut self, _timeout: Duration, ctx: &mut IoCtx<'_>) -> io::Result<()> {
        self.finish_connects(ctx);
        self.pump_streams(ctx);
        self.pump_datagrams(ctx);
        self.propagate_closes(ctx);
        Ok(())
    }
}
