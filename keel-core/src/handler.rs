//! Event handlers and protocol layering.
//!
//! A connection has one handler slot. Protocol layers are handlers that own
//! the handler above them: the layer sees every raw [`Event`] first, keeps
//! its private state in the connection's protocol slot, and calls into the
//! wrapped handler with both the raw event and whatever higher-level events
//! it decoded. Each protocol defines its own handler trait for that (for
//! example one method for raw events and one for decoded packets), so the
//! composition is checked at compile time instead of chained through
//! function pointers.
//!
//! Handlers are never re-entered: the manager takes a handler out of its
//! slot while it runs.

use crate::conn::Conn;
use crate::event::Event;

/// Receives raw connection events.
pub trait EventHandler: 'static {
    fn handle(&mut self, conn: &mut Conn<'_>, event: &Event<'_>);
}

/// Handler that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn handle(&mut self, _conn: &mut Conn<'_>, _event: &Event<'_>) {}
}

/// Adapter turning a closure into an [`EventHandler`].
#[derive(Clone)]
pub struct FnHandler<F>(F);

/// Wrap a closure as a handler.
///
/// ```
/// use keel_core::event::Event;
/// use keel_core::handler::handler_fn;
///
/// let echo = handler_fn(|conn, ev| {
///     if let Event::Recv(_) = ev {
///         let data = conn.recv_buf_mut().take(usize::MAX);
///         conn.send(&data);
///     }
/// });
/// # let _ = echo;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&mut Conn<'_>, &Event<'_>) + 'static,
{
    FnHandler(f)
}

impl<F> EventHandler for FnHandler<F>
where
    F: FnMut(&mut Conn<'_>, &Event<'_>) + 'static,
{
    fn handle(&mut self, conn: &mut Conn<'_>, event: &Event<'_>) {
        (self.0)(conn, event);
    }
}
