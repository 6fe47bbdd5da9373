//! MQTT 3.1.1 control packets.
//!
//! Fixed header: packet type in the high nibble, flags in the low nibble,
//! then the remaining length as a varint of at most four bytes.
//! `decode` reports [`MqttError::Incomplete`] until a whole packet is
//! buffered; every other error means the input is malformed.

use bytes::Bytes;
use thiserror::Error;

/// Largest remaining length a four-byte varint can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL_311: u8 = 4;

/// SUBACK return code for a refused filter.
pub const SUBACK_FAILURE: u8 = 0x80;

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PUBREC: u8 = 5;
pub const PUBREL: u8 = 6;
pub const PUBCOMP: u8 = 7;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const UNSUBSCRIBE: u8 = 10;
pub const UNSUBACK: u8 = 11;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

const CONNECT_CLEAN_SESSION: u8 = 0x02;
const CONNECT_WILL: u8 = 0x04;
const CONNECT_WILL_RETAIN: u8 = 0x20;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_USER_NAME: u8 = 0x80;

/// MQTT codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MqttError {
    /// More bytes are needed
    #[error("Incomplete packet")]
    Incomplete,

    /// Remaining length varint longer than four bytes
    #[error("Malformed remaining length")]
    MalformedLength,

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet type {0}")]
    InvalidPacketType(u8),

    #[error("Invalid flags {flags:#x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("Invalid QoS {0}")]
    InvalidQos(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
}

impl MqttError {
    #[must_use]
    pub const fn is_incomplete(&self) -> bool {
        matches!(self, MqttError::Incomplete)
    }
}

pub type Result<T> = std::result::Result<T, MqttError>;

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub const fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQos(other)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted = 0,
    UnacceptableProtocol = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectCode {
    const fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ConnectCode::Accepted),
            1 => Ok(ConnectCode::UnacceptableProtocol),
            2 => Ok(ConnectCode::IdentifierRejected),
            3 => Ok(ConnectCode::ServerUnavailable),
            4 => Ok(ConnectCode::BadUserNameOrPassword),
            5 => Ok(ConnectCode::NotAuthorized),
            _ => Err(MqttError::Malformed("unknown CONNACK code")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// MQTT 3.1.1 CONNECT with a clean session and no keep-alive.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: PROTOCOL_LEVEL_311,
            clean_session: true,
            keep_alive: 0,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    /// MQTT 3.1.1, or 3.1 under its old protocol name.
    #[must_use]
    pub fn is_supported_protocol(&self) -> bool {
        matches!(
            (self.protocol_name.as_str(), self.protocol_level),
            ("MQTT", PROTOCOL_LEVEL_311) | ("MQIsdp", 3)
        )
    }

    #[must_use]
    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive = secs;
        self
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present for QoS 1 and 2
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// QoS 0 publish.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    /// Set the QoS; `packet_id` is only kept above QoS 0.
    #[must_use]
    pub fn with_qos(mut self, qos: QoS, packet_id: u16) -> Self {
        self.qos = qos;
        self.packet_id = (qos != QoS::AtMostOnce).then_some(packet_id);
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS per filter, or [`SUBACK_FAILURE`]
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// An MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: ConnectCode },
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// SUBSCRIBE for `filters`.
    #[must_use]
    pub fn subscribe(packet_id: u16, filters: &[(&str, QoS)]) -> Self {
        Packet::Subscribe(Subscribe {
            packet_id,
            filters: filters.iter().map(|(f, q)| ((*f).to_string(), *q)).collect(),
        })
    }

    /// UNSUBSCRIBE for `filters`.
    #[must_use]
    pub fn unsubscribe(packet_id: u16, filters: &[&str]) -> Self {
        Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: filters.iter().map(|f| (*f).to_string()).collect(),
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => CONNECT,
            Packet::ConnAck { .. } => CONNACK,
            Packet::Publish(_) => PUBLISH,
            Packet::PubAck(_) => PUBACK,
            Packet::PubRec(_) => PUBREC,
            Packet::PubRel(_) => PUBREL,
            Packet::PubComp(_) => PUBCOMP,
            Packet::Subscribe(_) => SUBSCRIBE,
            Packet::SubAck(_) => SUBACK,
            Packet::Unsubscribe(_) => UNSUBSCRIBE,
            Packet::UnsubAck(_) => UNSUBACK,
            Packet::PingReq => PINGREQ,
            Packet::PingResp => PINGRESP,
            Packet::Disconnect => DISCONNECT,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Packet, usize)> {
        let (header, total) = frame(buf)?;
        let packet_type = header >> 4;
        let flags = header & 0x0f;
        let body = &buf[total - body_len(buf)?..total];
        let packet = decode_body(packet_type, flags, body)?;
        Ok((packet, total))
    }

    /// Append the encoded packet to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut body = Vec::new();
        let flags = match self {
            Packet::Connect(c) => {
                encode_connect(c, &mut body)?;
                0
            }
            Packet::ConnAck {
                session_present,
                code,
            } => {
                body.push(u8::from(*session_present));
                body.push(*code as u8);
                0
            }
            Packet::Publish(p) => {
                put_str(&mut body, &p.topic)?;
                match (p.qos, p.packet_id) {
                    (QoS::AtMostOnce, _) => {}
                    (_, Some(id)) => put_u16(&mut body, id),
                    (_, None) => return Err(MqttError::Malformed("PUBLISH above QoS 0 needs a packet id")),
                }
                body.extend_from_slice(&p.payload);
                (u8::from(p.dup) << 3) | ((p.qos as u8) << 1) | u8::from(p.retain)
            }
            Packet::PubAck(id) | Packet::PubRec(id) | Packet::PubComp(id) | Packet::UnsubAck(id) => {
                put_u16(&mut body, *id);
                0
            }
            Packet::PubRel(id) => {
                put_u16(&mut body, *id);
                0x02
            }
            Packet::Subscribe(s) => {
                put_u16(&mut body, s.packet_id);
                for (filter, qos) in &s.filters {
                    put_str(&mut body, filter)?;
                    body.push(*qos as u8);
                }
                0x02
            }
            Packet::SubAck(s) => {
                put_u16(&mut body, s.packet_id);
                body.extend_from_slice(&s.return_codes);
                0
            }
            Packet::Unsubscribe(u) => {
                put_u16(&mut body, u.packet_id);
                for filter in &u.filters {
                    put_str(&mut body, filter)?;
                }
                0x02
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };
        out.push((self.packet_type() << 4) | flags);
        encode_varint(body.len(), out)?;
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }
}

/// Decode the remaining-length varint at the start of `buf`.
///
/// Returns the value and the number of bytes it used.
pub fn decode_varint(buf: &[u8]) -> Result<(usize, usize)> {
    let mut value = 0usize;
    for (i, b) in buf.iter().enumerate() {
        if i == 4 {
            return Err(MqttError::MalformedLength);
        }
        value |= usize::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= 4 {
        Err(MqttError::MalformedLength)
    } else {
        Err(MqttError::Incomplete)
    }
}

pub fn encode_varint(mut value: usize, out: &mut Vec<u8>) -> Result<()> {
    if value > MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge(value));
    }
    loop {
        let mut b = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            b |= 0x80;
        }
        out.push(b);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Header byte and total frame length of the packet at the front of `buf`,
/// without decoding its body.
pub fn frame(buf: &[u8]) -> Result<(u8, usize)> {
    let header = *buf.first().ok_or(MqttError::Incomplete)?;
    let (len, used) = decode_varint(&buf[1..])?;
    let total = 1 + used + len;
    if buf.len() < total {
        return Err(MqttError::Incomplete);
    }
    Ok((header, total))
}

fn body_len(buf: &[u8]) -> Result<usize> {
    decode_varint(&buf[1..]).map(|(len, _)| len)
}

fn check_flags(packet_type: u8, flags: u8) -> Result<()> {
    let expected = match packet_type {
        PUBLISH => return Ok(()),
        PUBREL | SUBSCRIBE | UNSUBSCRIBE => 0x02,
        _ => 0,
    };
    if flags == expected {
        Ok(())
    } else {
        Err(MqttError::InvalidFlags { packet_type, flags })
    }
}

fn decode_body(packet_type: u8, flags: u8, body: &[u8]) -> Result<Packet> {
    if !(CONNECT..=DISCONNECT).contains(&packet_type) {
        return Err(MqttError::InvalidPacketType(packet_type));
    }
    check_flags(packet_type, flags)?;
    let mut r = Reader::new(body);
    let packet = match packet_type {
        CONNECT => Packet::Connect(decode_connect(&mut r)?),
        CONNACK => {
            let ack = r.u8()?;
            let code = ConnectCode::from_u8(r.u8()?)?;
            Packet::ConnAck {
                session_present: ack & 0x01 != 0,
                code,
            }
        }
        PUBLISH => {
            let qos = QoS::from_u8((flags >> 1) & 0x03)?;
            let topic = r.str()?;
            let packet_id = if qos == QoS::AtMostOnce { None } else { Some(r.u16()?) };
            Packet::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                packet_id,
                payload: Bytes::copy_from_slice(r.rest()),
            })
        }
        PUBACK => Packet::PubAck(r.u16()?),
        PUBREC => Packet::PubRec(r.u16()?),
        PUBREL => Packet::PubRel(r.u16()?),
        PUBCOMP => Packet::PubComp(r.u16()?),
        SUBSCRIBE => {
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while !r.is_empty() {
                let filter = r.str()?;
                let qos = QoS::from_u8(r.u8()?)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(MqttError::Malformed("SUBSCRIBE without filters"));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        SUBACK => Packet::SubAck(SubAck {
            packet_id: r.u16()?,
            return_codes: r.rest().to_vec(),
        }),
        UNSUBSCRIBE => {
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while !r.is_empty() {
                filters.push(r.str()?);
            }
            if filters.is_empty() {
                return Err(MqttError::Malformed("UNSUBSCRIBE without filters"));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        UNSUBACK => Packet::UnsubAck(r.u16()?),
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        _ => Packet::Disconnect,
    };
    Ok(packet)
}

fn decode_connect(r: &mut Reader<'_>) -> Result<Connect> {
    let protocol_name = r.str()?;
    let protocol_level = r.u8()?;
    let flags = r.u8()?;
    if flags & 0x01 != 0 {
        return Err(MqttError::Malformed("reserved CONNECT flag set"));
    }
    let keep_alive = r.u16()?;
    let client_id = r.str()?;
    let will = if flags & CONNECT_WILL != 0 {
        Some(LastWill {
            topic: r.str()?,
            message: Bytes::copy_from_slice(r.binary()?),
            qos: QoS::from_u8((flags >> 3) & 0x03)?,
            retain: flags & CONNECT_WILL_RETAIN != 0,
        })
    } else {
        None
    };
    let username = if flags & CONNECT_USER_NAME != 0 {
        Some(r.str()?)
    } else {
        None
    };
    let password = if flags & CONNECT_PASSWORD != 0 {
        Some(Bytes::copy_from_slice(r.binary()?))
    } else {
        None
    };
    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & CONNECT_CLEAN_SESSION != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn encode_connect(c: &Connect, body: &mut Vec<u8>) -> Result<()> {
    put_str(body, &c.protocol_name)?;
    body.push(c.protocol_level);
    let mut flags = 0u8;
    if c.clean_session {
        flags |= CONNECT_CLEAN_SESSION;
    }
    if let Some(will) = &c.will {
        flags |= CONNECT_WILL | ((will.qos as u8) << 3);
        if will.retain {
            flags |= CONNECT_WILL_RETAIN;
        }
    }
    if c.username.is_some() {
        flags |= CONNECT_USER_NAME;
    }
    if c.password.is_some() {
        flags |= CONNECT_PASSWORD;
    }
    body.push(flags);
    put_u16(body, c.keep_alive);
    put_str(body, &c.client_id)?;
    if let Some(will) = &c.will {
        put_str(body, &will.topic)?;
        put_binary(body, &will.message)?;
    }
    if let Some(user) = &c.username {
        put_str(body, user)?;
    }
    if let Some(password) = &c.password {
        put_binary(body, password)?;
    }
    Ok(())
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_binary(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| MqttError::Malformed("field longer than 65535 bytes"))?;
    put_u16(out, len);
    out.extend_from_slice(data);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    put_binary(out, s.as_bytes())
}

/// Cursor over a packet body. Running out of bytes inside a complete frame
/// is malformed input, not an incomplete read.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let out = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(MqttError::Malformed("field runs past end of packet"))?;
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn binary(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn str(&mut self) -> Result<String> {
        let raw = self.binary()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| MqttError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: &Packet) -> Packet {
        let buf = packet.to_vec().unwrap();
        let (decoded, used) = Packet::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        decoded
    }

    #[test]
    fn test_varint_boundaries() {
        for (value, len) in [(0, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (2_097_152, 4)] {
            let mut out = Vec::new();
            encode_varint(value, &mut out).unwrap();
            assert_eq!(out.len(), len, "value {value}");
            assert_eq!(decode_varint(&out).unwrap(), (value, len));
        }
        let mut out = Vec::new();
        encode_varint(MAX_REMAINING_LENGTH, &mut out).unwrap();
        assert_eq!(out, [0xff, 0xff, 0xff, 0x7f]);
        assert_eq!(
            encode_varint(MAX_REMAINING_LENGTH + 1, &mut Vec::new()),
            Err(MqttError::PacketTooLarge(MAX_REMAINING_LENGTH + 1))
        );
    }

    #[test]
    fn test_varint_malformed_and_incomplete() {
        assert_eq!(decode_varint(&[0xff, 0xff, 0xff, 0xff, 0x01]), Err(MqttError::MalformedLength));
        assert_eq!(decode_varint(&[0xff, 0xff, 0xff, 0xff]), Err(MqttError::MalformedLength));
        assert_eq!(decode_varint(&[0x80, 0x80]), Err(MqttError::Incomplete));
        assert_eq!(decode_varint(&[]), Err(MqttError::Incomplete));
    }

    #[test]
    fn test_connect_wire_format() {
        let connect = Packet::Connect(Connect::new("c1").with_keep_alive(60));
        let buf = connect.to_vec().unwrap();
        assert_eq!(
            buf,
            [
                0x10, 14, 0, 4, b'M', b'Q', b'T', b'T', 4, 0x02, 0, 60, 0, 2, b'c', b'1'
            ]
        );
        assert_eq!(roundtrip(&connect), connect);
    }

    #[test]
    fn test_connect_with_will_and_credentials() {
        let connect = Packet::Connect(
            Connect::new("dev-7")
                .with_clean_session(false)
                .with_credentials("user", &b"secret"[..])
                .with_will(LastWill {
                    topic: "status/dev-7".into(),
                    message: Bytes::from_static(b"offline"),
                    qos: QoS::AtLeastOnce,
                    retain: true,
                }),
        );
        let buf = connect.to_vec().unwrap();
        // user name, password, will retain, will qos 1, will
        assert_eq!(buf[9], 0x80 | 0x40 | 0x20 | 0x08 | 0x04);
        assert_eq!(roundtrip(&connect), connect);
    }

    #[test]
    fn test_unknown_protocol_still_decodes() {
        let mut connect = Connect::new("x");
        connect.protocol_level = 9;
        let buf = Packet::Connect(connect.clone()).to_vec().unwrap();
        let (decoded, _) = Packet::decode(&buf).unwrap();
        assert_eq!(decoded, Packet::Connect(connect.clone()));
        assert!(!connect.is_supported_protocol());
        assert!(Connect::new("x").is_supported_protocol());
    }

    #[test]
    fn test_publish_flags() {
        let publish = Packet::Publish(
            Publish::new("a/b", &b"hi"[..])
                .with_qos(QoS::ExactlyOnce, 7)
                .with_retain(true),
        );
        let buf = publish.to_vec().unwrap();
        assert_eq!(buf[0], 0x30 | 0x04 | 0x01);
        assert_eq!(roundtrip(&publish), publish);

        let qos0 = Publish::new("t", Bytes::new()).with_qos(QoS::AtMostOnce, 9);
        assert_eq!(qos0.packet_id, None);
    }

    #[test]
    fn test_acks_and_control() {
        for packet in [
            Packet::ConnAck {
                session_present: true,
                code: ConnectCode::NotAuthorized,
            },
            Packet::PubAck(1),
            Packet::PubRec(2),
            Packet::PubRel(3),
            Packet::PubComp(4),
            Packet::SubAck(SubAck {
                packet_id: 5,
                return_codes: vec![0, 1, SUBACK_FAILURE],
            }),
            Packet::unsubscribe(6, &["a/#", "b"]),
            Packet::UnsubAck(6),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ] {
            assert_eq!(roundtrip(&packet), packet, "{}", packet.name());
        }
        assert_eq!(Packet::PingReq.to_vec().unwrap(), [0xc0, 0x00]);
        assert_eq!(Packet::PubRel(3).to_vec().unwrap()[0], 0x62);
    }

    #[test]
    fn test_subscribe_requires_flags_and_filters() {
        let sub = Packet::subscribe(10, &[("a/+", QoS::AtLeastOnce), ("#", QoS::AtMostOnce)]);
        assert_eq!(roundtrip(&sub), sub);

        let mut buf = sub.to_vec().unwrap();
        buf[0] = 0x80;
        assert_eq!(
            Packet::decode(&buf),
            Err(MqttError::InvalidFlags {
                packet_type: SUBSCRIBE,
                flags: 0
            })
        );

        assert_eq!(
            Packet::decode(&[0x82, 0x02, 0x00, 0x01]),
            Err(MqttError::Malformed("SUBSCRIBE without filters"))
        );
    }

    #[test]
    fn test_incomplete_until_whole_frame() {
        let buf = Packet::Publish(Publish::new("topic", &b"payload"[..])).to_vec().unwrap();
        for cut in 0..buf.len() {
            assert_eq!(Packet::decode(&buf[..cut]), Err(MqttError::Incomplete), "cut {cut}");
        }
        let mut two = buf.clone();
        two.extend_from_slice(&Packet::PingReq.to_vec().unwrap());
        let (first, used) = Packet::decode(&two).unwrap();
        assert_eq!(first.name(), "PUBLISH");
        assert_eq!(Packet::decode(&two[used..]).unwrap().0, Packet::PingReq);
    }

    #[test]
    fn test_invalid_type_and_truncated_body() {
        assert_eq!(Packet::decode(&[0x00, 0x00]), Err(MqttError::InvalidPacketType(0)));
        assert_eq!(Packet::decode(&[0xf0, 0x00]), Err(MqttError::InvalidPacketType(15)));
        // PUBACK with a one-byte body
        assert!(matches!(Packet::decode(&[0x40, 0x01, 0x00]), Err(MqttError::Malformed(_))));
        // PUBLISH QoS 3
        assert_eq!(Packet::decode(&[0x36, 0x00]), Err(MqttError::InvalidQos(3)));
    }
}
