//! Resolve host names through the event loop, then connect by name.
//!
//! ```text
//! cargo run --example resolve --features dns -- example.com 1.1.1.1:53
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use keel::dns::{resolve_async, DnsResolver, RecordType, ResolveOpts};
use keel::prelude::*;
use tracing::{info, warn};

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| "example.com".to_string());
    let nameserver = match args.next() {
        Some(ns) => ns.parse()?,
        None => ManagerOptions::default().nameserver,
    };

    let mut mgr = Manager::new(ManagerOptions::default().with_nameserver(nameserver))?;
    let opts = ResolveOpts::default()
        .with_timeout(Duration::from_secs(2))
        .with_accept_literal(true);

    let pending = Rc::new(Cell::new(2u32));
    for qtype in [RecordType::A, RecordType::AAAA] {
        let left = pending.clone();
        let host = name.clone();
        resolve_async(&mut mgr, &name, qtype, &opts, move |_, result| {
            match result {
                Ok(msg) => {
                    for rr in msg.answers_of(qtype) {
                        info!(name = %host, ?qtype, ttl = rr.ttl, addr = ?rr.ip(), "answer");
                    }
                }
                Err(e) => warn!(name = %host, ?qtype, error = %e, "lookup failed"),
            }
            left.set(left.get() - 1);
        })?;
    }

    // name-based connect goes through the same resolver
    DnsResolver::install(&mut mgr, opts);
    let connected = Rc::new(Cell::new(false));
    let done = connected.clone();
    mgr.connect(
        &format!("tcp://{name}:80"),
        handler_fn(move |conn, ev| {
            if let Event::Connect(result) = ev {
                match result {
                    Ok(()) => info!(peer = ?conn.peer_addr(), "connected by name"),
                    Err(e) => warn!(error = %e, "connect by name failed"),
                }
                done.set(true);
                conn.close();
            }
        }),
    )?;

    while pending.get() > 0 || !connected.get() {
        mgr.poll(Duration::from_millis(100))?;
    }
    Ok(())
}
