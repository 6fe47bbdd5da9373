//! Cross-thread broadcast into the event loop.
//!
//! [`Broadcaster`] is the one manager handle that may be used from other
//! threads. Messages go through a flume channel; the sender then wakes the
//! main interface so a blocked poll returns. The loop drains the channel
//! once per iteration and delivers each message to every connection as
//! [`Event::Broadcast`](crate::event::Event::Broadcast).

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::error::{KeelError, Result};
use crate::iface::Wake;

/// Cloneable, `Send` handle for posting broadcasts.
#[derive(Clone)]
pub struct Broadcaster {
    tx: flume::Sender<Bytes>,
    waker: Option<Arc<dyn Wake>>,
    max_size: usize,
}

impl Broadcaster {
    pub(crate) fn new(tx: flume::Sender<Bytes>, waker: Option<Arc<dyn Wake>>, max_size: usize) -> Self {
        Self { tx, waker, max_size }
    }

    /// Queue `msg` for delivery to every connection.
    pub fn send(&self, msg: &[u8]) -> Result<()> {
        if msg.len() > self.max_size {
            return Err(KeelError::MessageTooLarge {
                size: msg.len(),
                max: self.max_size,
            });
        }
        self.tx
            .send(Bytes::copy_from_slice(msg))
            .map_err(|_| KeelError::ChannelClosed)?;
        trace!(bytes = msg.len(), "broadcast queued");
        if let Some(waker) = &self.waker {
            waker.wake()?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("max_size", &self.max_size)
            .field("has_waker", &self.waker.is_some())
            .finish()
    }
}
