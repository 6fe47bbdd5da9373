//! # Keel
//!
//! An embeddable, single-threaded network core: one [`Manager`] owns every
//! connection, a poll loop drives socket I/O through pluggable interfaces,
//! and protocols are layered handlers on top of raw connection events.
//!
//! ## Architecture
//!
//! - **`keel-core`**: buffers, interfaces, connections and the poll loop
//! - **`keel-proto`**: protocol layers (DNS resolver, MQTT broker)
//! - **`keel`**: public API surface (this crate)
//!
//! ## Protocols (opt-in via features)
//!
//! - **`dns`** - asynchronous stub resolver, name-based connects
//! - **`mqtt`** - MQTT 3.1.1 codec, protocol layer and embedded broker
//!
//! ```toml
//! [dependencies]
//! keel = { version = "0.1", features = ["mqtt", "dns"] }
//! ```
//!
//! ## Quick Start
//!
//! ### Echo server
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use keel::prelude::*;
//!
//! # fn main() -> keel::Result<()> {
//! let mut mgr = Manager::new(ManagerOptions::default())?;
//! mgr.bind("tcp://127.0.0.1:7000", handler_fn(|conn, ev| {
//!     if let Event::Recv(_) = ev {
//!         let data = conn.recv_buf_mut().take(usize::MAX);
//!         conn.send(&data);
//!     }
//! }))?;
//! loop {
//!     mgr.poll(Duration::from_millis(500))?;
//! }
//! # }
//! ```
//!
//! ## Threading
//!
//! A manager and its connections live on one thread. The only way in from
//! other threads is a [`Broadcaster`](broadcast::Broadcaster), which queues
//! messages for delivery to every connection on the next poll.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;

pub use bytes::Bytes;

pub use keel_core::broadcast;
pub use keel_core::buffer;
pub use keel_core::clock;
pub use keel_core::conn;
pub use keel_core::endpoint;
pub use keel_core::error;
pub use keel_core::event;
pub use keel_core::flags;
pub use keel_core::handler;
pub use keel_core::iface;
pub use keel_core::manager;
pub use keel_core::memory;
pub use keel_core::options;
pub use keel_core::sock;
pub use keel_core::tls;

pub use keel_core::error::{KeelError, Result};
pub use keel_core::manager::Manager;

/// Commonly used types.
pub mod prelude {
    pub use keel_core::prelude::*;
}

/// Asynchronous DNS resolution.
#[cfg(feature = "dns")]
pub mod dns {
    pub use keel_proto::dns::*;
}

/// MQTT codec, protocol layer and broker.
#[cfg(feature = "mqtt")]
pub mod mqtt {
    pub use keel_proto::mqtt::*;
}
