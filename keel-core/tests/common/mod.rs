//! Shared helpers for the manager integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use keel_core::buffer::Mbuf;
use keel_core::clock::ManualClock;
use keel_core::conn::{Conn, ConnId};
use keel_core::event::Event;
use keel_core::flags::ConnFlags;
use keel_core::handler::EventHandler;
use keel_core::iface::{Interface, IoCtx, Wake};
use keel_core::manager::Manager;
use keel_core::memory::{Journal, MemoryInterface};
use keel_core::options::ManagerOptions;

/// Wraps an interface and panics if any of its methods is entered while its
/// own `poll` is running.
pub struct GuardedInterface<I> {
    inner: I,
    busy: Rc<Cell<bool>>,
}

impl<I: Interface> GuardedInterface<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            busy: Rc::new(Cell::new(false)),
        }
    }

    fn check(&self, what: &str) {
        assert!(!self.busy.get(), "{what} called while the interface was polling");
    }
}

impl<I: Interface> Interface for GuardedInterface<I> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init(&mut self) -> io::Result<()> {
        self.check("init");
        self.inner.init()
    }

    fn free(&mut self) {
        self.check("free");
        self.inner.free();
    }

    fn create_conn(&mut self, conn: ConnId) -> io::Result<()> {
        self.check("create_conn");
        self.inner.create_conn(conn)
    }

    fn destroy_conn(&mut self, conn: ConnId) {
        self.check("destroy_conn");
        self.inner.destroy_conn(conn);
    }

    fn add_conn(&mut self, conn: ConnId) {
        self.check("add_conn");
        self.inner.add_conn(conn);
    }

    fn remove_conn(&mut self, conn: ConnId) {
        self.check("remove_conn");
        self.inner.remove_conn(conn);
    }

    fn listen_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<SocketAddr> {
        self.check("listen_tcp");
        self.inner.listen_tcp(conn, addr)
    }

    fn listen_udp(&mut self, conn: ConnId, addr: SocketAddr, flags: ConnFlags) -> io::Result<SocketAddr> {
        self.check("listen_udp");
        self.inner.listen_udp(conn, addr, flags)
    }

    fn connect_tcp(&mut self, conn: ConnId, addr: SocketAddr) -> io::Result<()> {
        self.check("connect_tcp");
        self.inner.connect_tcp(conn, addr)
    }

    fn connect_udp(&mut self, conn: ConnId, addr: SocketAddr, flags: ConnFlags) -> io::Result<()> {
        self.check("connect_udp");
        self.inner.connect_udp(conn, addr, flags)
    }

    fn tcp_send(&mut self, conn: ConnId, data: &[u8], outbox: &mut Mbuf) -> usize {
        self.check("tcp_send");
        self.inner.tcp_send(conn, data, outbox)
    }

    fn udp_send(&mut self, conn: ConnId, data: &[u8], outbox: &mut Mbuf) -> usize {
        self.check("udp_send");
        self.inner.udp_send(conn, data, outbox)
    }

    fn recved(&mut self, conn: ConnId, len: usize) {
        self.check("recved");
        self.inner.recved(conn, len);
    }

    fn get_conn_addr(&self, conn: ConnId, remote: bool) -> Option<SocketAddr> {
        self.inner.get_conn_addr(conn, remote)
    }

    fn poll(&mut self, timeout: Duration, ctx: &mut IoCtx<'_>) -> io::Result<()> {
        self.check("poll");
        self.busy.set(true);
        let res = self.inner.poll(timeout, ctx);
        self.busy.set(false);
        res
    }

    fn waker(&self) -> Option<Arc<dyn Wake>> {
        self.inner.waker()
    }
}

/// Manager over a guarded in-memory interface driven by a manual clock.
pub fn memory_manager(opts: ManagerOptions) -> (Manager, ManualClock, Journal) {
    init_tracing();
    let clock = ManualClock::new();
    let iface = MemoryInterface::default();
    let journal = iface.journal();
    let opts = opts.with_clock(Arc::new(clock.clone()));
    let mgr = Manager::with_interfaces(opts, vec![Box::new(GuardedInterface::new(iface))])
        .expect("memory manager");
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

/// Shared event log: `(connection, event label)`.
pub type Log = Rc<RefCell<Vec<(ConnId, String)>>>;

pub fn label(event: &Event<'_>) -> String {
    match event {
        Event::Connect(Err(_)) => "CONNECT_ERR".to_string(),
        Event::Recv(n) => format!("RECV {n}"),
        Event::Broadcast(msg) => format!("BROADCAST {}", String::from_utf8_lossy(msg)),
        other => other.name().to_string(),
    }
}

/// Records every event except POLL.
#[derive(Clone, Default)]
pub struct Recorder {
    pub log: Log,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.borrow().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn events_for(&self, id: ConnId) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter(|(c, _)| *c == id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn count(&self, what: &str) -> usize {
        self.log.borrow().iter().filter(|(_, e)| e == what).count()
    }
}

impl EventHandler for Recorder {
    fn handle(&mut self, conn: &mut Conn<'_>, event: &Event<'_>) {
        if matches!(event, Event::Poll) {
            return;
        }
        self.log.borrow_mut().push((conn.id(), label(event)));
    }
}

/// Echoes every received byte back to the sender.
#[derive(Clone, Default)]
pub struct Echo;

impl EventHandler for Echo {
    fn handle(&mut self, conn: &mut Conn<'_>, event: &Event<'_>) {
        if let Event::Recv(_) = event {
            let data = conn.recv_buf_mut().take(usize::MAX);
            conn.send(&data);
        }
    }
}
