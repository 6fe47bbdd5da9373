//! MQTT protocol layer.
//!
//! [`MqttLayer`] wraps an [`MqttHandler`]. Every raw event reaches the
//! handler's `on_event` first; on `RECV` the layer then decodes as many
//! whole packets as are buffered and hands each to `on_mqtt`. Partial
//! packets stay in the receive buffer for the next read.
//!
//! A frame whose length is known but whose body does not decode is skipped
//! and reported as [`MqttEvent::Malformed`]. A broken length prefix, or a
//! CONNECT that does not decode, leaves nothing to resynchronise on: the
//! buffer is dropped and the connection closed.
//!
//! Keep-alive: the layer records the keep-alive interval of the CONNECT it
//! sees (received or sent through [`super::client`]) and the time of the last
//! control packet. On `POLL`, a connection silent for more than 1.5 times the
//! interval is closed.

use std::time::{Duration, Instant};

use keel_core::conn::Conn;
use keel_core::event::Event;
use keel_core::flags::ConnFlags;
use keel_core::handler::EventHandler;
use tracing::{debug, trace, warn};

use super::codec::{self, MqttError, Packet};

/// Decoded events delivered to [`MqttHandler::on_mqtt`].
#[derive(Debug, Clone, Copy)]
pub enum MqttEvent<'a> {
    Packet(&'a Packet),
    Malformed(&'a MqttError),
}

/// Handler above an [`MqttLayer`].
pub trait MqttHandler: 'static {
    /// Raw connection events, before the layer decodes anything.
    fn on_event(&mut self, _conn: &mut Conn<'_>, _event: &Event<'_>) {}

    fn on_mqtt(&mut self, conn: &mut Conn<'_>, event: &MqttEvent<'_>);
}

/// Per-connection MQTT state, kept in the connection's protocol slot.
#[derive(Debug, Clone, Copy)]
pub struct MqttProtoData {
    /// Seconds; zero disables the check
    pub keep_alive: u16,
    pub last_control_time: Instant,
}

impl MqttProtoData {
    /// Deadline after which a silent connection is dropped.
    #[must_use]
    pub fn expiry(&self) -> Option<Instant> {
        (self.keep_alive > 0)
            .then(|| self.last_control_time + Duration::from_millis(u64::from(self.keep_alive) * 1500))
    }
}

/// Protocol state of `conn`, if the layer has seen it.
pub fn proto_data(conn: &mut Conn<'_>) -> Option<MqttProtoData> {
    conn.proto_data::<MqttProtoData>().copied()
}

/// Run `f` on the protocol state of `conn`, creating it on first use.
pub(crate) fn with_proto_data<R>(conn: &mut Conn<'_>, f: impl FnOnce(&mut MqttProtoData) -> R) -> R {
    let now = conn.now();
    if let Some(data) = conn.proto_data::<MqttProtoData>() {
        return f(data);
    }
    let mut data = MqttProtoData {
        keep_alive: 0,
        last_control_time: now,
    };
    let out = f(&mut data);
    conn.set_proto_data(data);
    out
}

/// Event handler that speaks MQTT on behalf of `H`.
#[derive(Debug, Clone, Default)]
pub struct MqttLayer<H> {
    inner: H,
}

impl<H: MqttHandler> MqttLayer<H> {
    pub const fn new(inner: H) -> Self {
        Self { inner }
    }

    pub const fn inner(&self) -> &H {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut H {
        &mut self.inner
    }

    fn on_recv(&mut self, conn: &mut Conn<'_>) {
        while !conn.recv_buf().is_empty() && !conn.flags().contains(ConnFlags::CLOSE_IMMEDIATELY) {
            match Packet::decode(conn.recv_buf()) {
                Ok((packet, used)) => {
                    conn.recv_buf_mut().remove(used);
                    let now = conn.now();
                    with_proto_data(conn, |data| {
                        data.last_control_time = now;
                        if let Packet::Connect(connect) = &packet {
                            data.keep_alive = connect.keep_alive;
                        }
                    });
                    trace!(conn = %conn.id(), packet = packet.name(), "mqtt packet");
                    self.inner.on_mqtt(conn, &MqttEvent::Packet(&packet));
                }
                Err(MqttError::Incomplete) => break,
                Err(e) => self.on_malformed(conn, &e),
            }
        }
    }

    fn on_malformed(&mut self, conn: &mut Conn<'_>, err: &MqttError) {
        match codec::frame(conn.recv_buf()) {
            Ok((header, total)) if header >> 4 != codec::CONNECT => {
                debug!(conn = %conn.id(), error = %err, bytes = total, "skipping malformed mqtt packet");
                conn.recv_buf_mut().remove(total);
                self.inner.on_mqtt(conn, &MqttEvent::Malformed(err));
            }
            _ => {
                warn!(conn = %conn.id(), error = %err, "unrecoverable mqtt input, closing");
                conn.recv_buf_mut().clear();
                self.inner.on_mqtt(conn, &MqttEvent::Malformed(err));
                conn.close();
            }
        }
    }

    fn check_keep_alive(conn: &mut Conn<'_>) {
        let now = conn.now();
        let expired = with_proto_data(conn, |data| data.expiry().is_some_and(|deadline| now > deadline));
        if expired {
            debug!(conn = %conn.id(), "mqtt keep-alive expired");
            conn.close();
        }
    }
}

impl<H: MqttHandler> EventHandler for MqttLayer<H> {
    fn handle(&mut self, conn: &mut Conn<'_>, event: &Event<'_>) {
        self.inner.on_event(conn, event);
        match event {
            Event::Recv(_) => self.on_recv(conn),
            Event::Poll if !conn.is_listening() => Self::check_keep_alive(conn),
            _ => {}
        }
    }
}

/// Wrap `handler` in an [`MqttLayer`].
pub const fn mqtt<H: MqttHandler>(handler: H) -> MqttLayer<H> {
    MqttLayer::new(handler)
}
