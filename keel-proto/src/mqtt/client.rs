//! Client-side frame helpers.
//!
//! Each helper encodes one packet into the connection's send buffer and
//! returns the number of bytes queued (0 if the packet could not be encoded
//! or the connection is gone).

use bytes::Bytes;
use keel_core::conn::Conn;
use tracing::warn;

use super::codec::{Connect, Packet, Publish, QoS};
use super::layer::with_proto_data;

/// Queue any packet.
pub fn send_packet(conn: &mut Conn<'_>, packet: &Packet) -> usize {
    match packet.to_vec() {
        Ok(buf) => conn.send(&buf),
        Err(e) => {
            warn!(conn = %conn.id(), packet = packet.name(), error = %e, "cannot encode mqtt packet");
            0
        }
    }
}

/// Queue CONNECT and start keep-alive tracking with its interval.
pub fn connect(conn: &mut Conn<'_>, connect: Connect) -> usize {
    let keep_alive = connect.keep_alive;
    let now = conn.now();
    with_proto_data(conn, |data| {
        data.keep_alive = keep_alive;
        data.last_control_time = now;
    });
    send_packet(conn, &Packet::Connect(connect))
}

pub fn publish(
    conn: &mut Conn<'_>,
    topic: &str,
    packet_id: u16,
    qos: QoS,
    payload: impl Into<Bytes>,
) -> usize {
    let publish = Publish::new(topic, payload).with_qos(qos, packet_id);
    send_packet(conn, &Packet::Publish(publish))
}

pub fn subscribe(conn: &mut Conn<'_>, packet_id: u16, filters: &[(&str, QoS)]) -> usize {
    send_packet(conn, &Packet::subscribe(packet_id, filters))
}

pub fn unsubscribe(conn: &mut Conn<'_>, packet_id: u16, filters: &[&str]) -> usize {
    send_packet(conn, &Packet::unsubscribe(packet_id, filters))
}

pub fn ping(conn: &mut Conn<'_>) -> usize {
    send_packet(conn, &Packet::PingReq)
}

pub fn disconnect(conn: &mut Conn<'_>) -> usize {
    send_packet(conn, &Packet::Disconnect)
}
