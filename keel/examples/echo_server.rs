//! TCP echo server.
//!
//! ```text
//! cargo run --example echo_server -- 127.0.0.1:7000
//! nc 127.0.0.1 7000
//! ```

use std::time::Duration;

use keel::prelude::*;
use tracing::info;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7000".to_string());
    let mut mgr = Manager::new(ManagerOptions::default())?;

    let listener = mgr.bind(
        &format!("tcp://{addr}"),
        handler_fn(|conn, ev| match ev {
            Event::Accept(peer) => info!(conn = %conn.id(), %peer, "client connected"),
            Event::Recv(_) => {
                let data = conn.recv_buf_mut().take(usize::MAX);
                conn.send(&data);
            }
            Event::Close if !conn.is_listening() => info!(conn = %conn.id(), "client gone"),
            _ => {}
        }),
    )?;
    info!(local = ?mgr.local_addr(listener), "echo server listening");

    loop {
        mgr.poll(Duration::from_secs(1))?;
    }
}
