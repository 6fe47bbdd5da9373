//! Keel Core
//!
//! The single-threaded event-loop kernel:
//! - Growable byte buffer with headroom and limits (`buffer`)
//! - Pluggable transport interfaces (`iface`), with an OS socket backend
//!   (`sock`) and an in-process one for tests (`memory`)
//! - Connections, flags and handler-facing access (`conn`, `flags`)
//! - The manager and its poll loop (`manager`)
//! - Cross-thread broadcast (`broadcast`)
//! - TLS backend seam (`tls`)
//! - Error types (`error`)

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod broadcast;
pub mod buffer;
pub mod clock;
pub mod conn;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod flags;
pub mod handler;
pub mod iface;
pub mod manager;
pub mod memory;
pub mod options;
pub mod sock;
mod sockopt;
pub mod tls;

pub mod prelude {
    pub use crate::broadcast::Broadcaster;
    pub use crate::buffer::Mbuf;
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::conn::{Conn, ConnId, ConnState};
    pub use crate::endpoint::{Endpoint, Host, Transport};
    pub use crate::error::{KeelError, Result};
    pub use crate::event::Event;
    pub use crate::flags::ConnFlags;
    pub use crate::handler::{handler_fn, EventHandler, NoopHandler};
    pub use crate::iface::Interface;
    pub use crate::manager::{Manager, NameResolver};
    pub use crate::memory::MemoryInterface;
    pub use crate::options::{ConnOpts, ManagerOptions};
    pub use crate::tls::{TlsBackend, TlsParams};
}
