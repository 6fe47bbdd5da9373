//! Shared helpers for the protocol integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use keel_core::buffer::Mbuf;
use keel_core::clock::ManualClock;
use keel_core::conn::ConnId;
use keel_core::flags::ConnFlags;
use keel_core::iface::{Interface, IoCtx};
use keel_core::manager::Manager;
use keel_core::memory::{Journal, MemoryInterface};
use keel_core::options::ManagerOptions;

pub fn memory_manager(opts: ManagerOptions) -> (Manager, ManualClock, Journal) {
    init_tracing();
    let clock = ManualClock::new();
    let iface = MemoryInterface::default();
    let journal = iface.journal();
    let opts = opts.with_clock(Arc::new(clock.clone()));
    let mgr = Manager::with_interfaces(opts, vec![Box::new(iface)]).expect("memory manager");
    (mgr, clock, journal)
}

/// Log to stderr when `RUST_LOG` is set. Safe to call from every test.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

pub fn poll_n(mgr: &mut Manager, n: usize) {
    for _ in 0..n {
        mgr.poll(Duration::ZERO).expect("poll");
    }
}

/// In-memory interface whose I/O can be frozen, leaving output queued.
pub struct Stalled {
    inner: MemoryInterface,
    frozen: Rc<Cell<bool>>,
}

impl Interface for Stalled {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn destroy_conn(&mut self, conn: ConnId) {
        self.inner.destroy_conn(conn);
    }

    fn listen_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<SocketAddr> {
        self.inner.listen_tcp(conn, addr)
    }

    fn listen_udp(&mut self, conn: ConnId, addr: SocketAddr, flags: ConnFlags) -> io::Result<SocketAddr> {
        self.inner.listen_udp(conn, addr, flags)
    }

    fn connect_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<()> {
        self.inner.connect_tcp(conn, addr)
    }

    fn connect_udp(&mut self, conn: ConnId, addr: SocketAddr, flags: ConnFlags) -> io::Result<()> {
        self.inner.connect_udp(conn, addr, flags)
    }

    fn tcp_send(&mut self, conn: ConnId, data: &[u8], outbox: &mut Mbuf) -> usize {
        self.inner.tcp_send(conn, data, outbox)
    }

    fn udp_send(&mut self, conn: ConnId, data: &[u8], outbox: &mut Mbuf) -> usize {
        self.inner.udp_send(conn, data, outbox)
    }

    fn get_conn_addr(&self, conn: ConnId, remote: bool) -> Option<SocketAddr> {
        self.inner.get_conn_addr(conn, remote)
    }

    fn poll(&mut self, timeout: Duration, ctx: &mut IoCtx<'_>) -> io::Result<()> {
        if self.frozen.get() {
            return Ok(());
        }
        self.inner.poll(timeout, ctx)
    }
}

/// Like [`memory_manager`], plus a switch that freezes the interface.
pub fn stalled_manager(opts: ManagerOptions) -> (Manager, ManualClock, Journal, Rc<Cell<bool>>) {
    init_tracing();
    let clock = ManualClock::new();
    let inner = MemoryInterface::default();
    let journal = inner.journal();
    let frozen = Rc::new(Cell::new(false));
    let iface = Stalled {
        inner,
        frozen: frozen.clone(),
    };
    let opts = opts.with_clock(Arc::new(clock.clone()));
    let mgr = Manager::with_interfaces(opts, vec![Box::new(iface)]).expect("stalled manager");
    (mgr, clock, journal, frozen)
}
