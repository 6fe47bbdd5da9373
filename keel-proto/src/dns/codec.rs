//! DNS wire format.
//!
//! Enough of RFC 1035 for a stub resolver: queries out, responses in, with
//! name compression on the way in. Authority and additional sections are
//! skipped. At most [`MAX_RECORDS`] questions and answers are kept per
//! message; the rest are ignored.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use smallvec::SmallVec;
use thiserror::Error;

/// Questions or answers kept per message.
pub const MAX_RECORDS: usize = 32;

/// Longest presentation-form name accepted.
pub const MAX_NAME_LEN: usize = 255;

const MAX_LABEL_LEN: usize = 63;
const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 16;

/// Class IN.
pub const CLASS_IN: u16 = 1;

/// Header flag: this message is a response.
pub const FLAG_RESPONSE: u16 = 0x8000;
/// Header flag: recursion desired.
pub const FLAG_RECURSION_DESIRED: u16 = 0x0100;
/// Header flag: recursion available.
pub const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;

/// Errors decoding or encoding DNS messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS message truncated")]
    Truncated,

    #[error("Invalid DNS name: {0}")]
    BadName(String),

    #[error("DNS compression pointer loop")]
    PointerLoop,

    #[error("Invalid {rtype:?} record data")]
    BadRecordData { rtype: RecordType },
}

/// Record type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const SRV: Self = Self(33);
    pub const ANY: Self = Self(255);

    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("A"),
            2 => Some("NS"),
            5 => Some("CNAME"),
            12 => Some("PTR"),
            15 => Some("MX"),
            16 => Some("TXT"),
            28 => Some("AAAA"),
            33 => Some("SRV"),
            255 => Some("ANY"),
            _ => None,
        }
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "TYPE{}", self.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

/// Decoded record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// CNAME, PTR and NS targets
    Name(String),
    Mx { preference: u16, exchange: String },
    Txt(Vec<Bytes>),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// Any type this codec does not interpret
    Raw(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl ResourceRecord {
    /// Address carried by an A or AAAA record.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self.data {
            RecordData::A(ip) => Some(IpAddr::V4(ip)),
            RecordData::Aaaa(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        }
    }
}

/// A DNS message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: SmallVec<[Question; 1]>,
    pub answers: Vec<ResourceRecord>,
}

impl DnsMessage {
    /// Recursive query for `name`.
    #[must_use]
    pub fn query(id: u16, name: &str, qtype: RecordType) -> Self {
        let mut questions = SmallVec::new();
        questions.push(Question {
            name: name.trim_end_matches('.').to_string(),
            qtype,
            qclass: CLASS_IN,
        });
        Self {
            id,
            flags: FLAG_RECURSION_DESIRED,
            questions,
            answers: Vec::new(),
        }
    }

    /// Response to `self` carrying `answers`.
    #[must_use]
    pub fn reply(&self, answers: Vec<ResourceRecord>) -> Self {
        Self {
            id: self.id,
            flags: self.flags | FLAG_RESPONSE | FLAG_RECURSION_AVAILABLE,
            questions: self.questions.clone(),
            answers,
        }
    }

    /// Response answering `name` with a single address, without any I/O.
    #[must_use]
    pub fn synthesize(name: &str, ip: IpAddr) -> Self {
        let (qtype, data) = match ip {
            IpAddr::V4(v4) => (RecordType::A, RecordData::A(v4)),
            IpAddr::V6(v6) => (RecordType::AAAA, RecordData::Aaaa(v6)),
        };
        let query = Self::query(0, name, qtype);
        let answer = ResourceRecord {
            name: query.questions[0].name.clone(),
            rtype: qtype,
            class: CLASS_IN,
            ttl: 0,
            data,
        };
        query.reply(vec![answer])
    }

    #[must_use]
    pub const fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// Response code (0 = no error, 3 = name error).
    #[must_use]
    pub const fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }

    /// First A or AAAA answer.
    #[must_use]
    pub fn first_addr(&self) -> Option<IpAddr> {
        self.answers.iter().find_map(ResourceRecord::ip)
    }

    /// Answers of one type.
    pub fn answers_of(&self, rtype: RecordType) -> impl Iterator<Item = &ResourceRecord> {
        self.answers.iter().filter(move |rr| rr.rtype == rtype)
    }

    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        let mut out = Vec::with_capacity(HEADER_LEN + 32);
        put_u16(&mut out, self.id);
        put_u16(&mut out, self.flags);
        put_u16(&mut out, self.questions.len().min(MAX_RECORDS) as u16);
        put_u16(&mut out, self.answers.len().min(MAX_RECORDS) as u16);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);

        for q in self.questions.iter().take(MAX_RECORDS) {
            write_name(&mut out, &q.name)?;
            put_u16(&mut out, q.qtype.0);
            put_u16(&mut out, q.qclass);
        }
        for rr in self.answers.iter().take(MAX_RECORDS) {
            write_name(&mut out, &rr.name)?;
            put_u16(&mut out, rr.rtype.0);
            put_u16(&mut out, rr.class);
            out.extend_from_slice(&rr.ttl.to_be_bytes());
            let mut rdata = Vec::new();
            write_rdata(&mut rdata, &rr.data)?;
            put_u16(&mut out, rdata.len() as u16);
            out.extend_from_slice(&rdata);
        }
        Ok(out)
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DnsError> {
        if buf.len() < HEADER_LEN {
            return Err(DnsError::Truncated);
        }
        let id = read_u16(buf, 0)?;
        let flags = read_u16(buf, 2)?;
        let qdcount = read_u16(buf, 4)? as usize;
        let ancount = read_u16(buf, 6)? as usize;

        let mut pos = HEADER_LEN;
        let mut questions = SmallVec::new();
        for _ in 0..qdcount {
            let (name, next) = read_name(buf, pos)?;
            let qtype = RecordType(read_u16(buf, next)?);
            let qclass = read_u16(buf, next + 2)?;
            pos = next + 4;
            if questions.len() < MAX_RECORDS {
                questions.push(Question { name, qtype, qclass });
            }
        }

        let mut answers = Vec::new();
        for _ in 0..ancount.min(MAX_RECORDS) {
            let (name, next) = read_name(buf, pos)?;
            let rtype = RecordType(read_u16(buf, next)?);
            let class = read_u16(buf, next + 2)?;
            let ttl = read_u32(buf, next + 4)?;
            let rdlen = read_u16(buf, next + 8)? as usize;
            let start = next + 10;
            if buf.len() < start + rdlen {
                return Err(DnsError::Truncated);
            }
            let data = read_rdata(buf, start, rdlen, rtype)?;
            answers.push(ResourceRecord {
                name,
                rtype,
                class,
                ttl,
                data,
            });
            pos = start + rdlen;
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers,
        })
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, DnsError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Truncated)
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, DnsError> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DnsError::Truncated)
}

/// Read a possibly compressed name at `pos`. Returns the name and the offset
/// just past it in the original stream.
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut resume = None;
    let mut jumps = 0;
    loop {
        let len = *buf.get(pos).ok_or(DnsError::Truncated)? as usize;
        if len == 0 {
            return Ok((name, resume.unwrap_or(pos + 1)));
        }
        match len & 0xc0 {
            0xc0 => {
                let low = *buf.get(pos + 1).ok_or(DnsError::Truncated)? as usize;
                resume.get_or_insert(pos + 2);
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(DnsError::PointerLoop);
                }
                pos = ((len & 0x3f) << 8) | low;
            }
            0x00 => {
                let label = buf.get(pos + 1..pos + 1 + len).ok_or(DnsError::Truncated)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
                if name.len() > MAX_NAME_LEN {
                    return Err(DnsError::BadName(name));
                }
                pos += 1 + len;
            }
            _ => return Err(DnsError::BadName(name)),
        }
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    let name = name.trim_end_matches('.');
    if name.len() > MAX_NAME_LEN {
        return Err(DnsError::BadName(name.to_string()));
    }
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DnsError::BadName(name.to_string()));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(())
}

fn read_rdata(buf: &[u8], start: usize, len: usize, rtype: RecordType) -> Result<RecordData, DnsError> {
    let rdata = &buf[start..start + len];
    let bad = || DnsError::BadRecordData { rtype };
    let data = match rtype {
        RecordType::A => {
            let octets: [u8; 4] = rdata.try_into().map_err(|_| bad())?;
            RecordData::A(Ipv4Addr::from(octets))
        }
        RecordType::AAAA => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| bad())?;
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::CNAME | RecordType::PTR | RecordType::NS => RecordData::Name(read_name(buf, start)?.0),
        RecordType::MX => RecordData::Mx {
            preference: read_u16(rdata, 0).map_err(|_| bad())?,
            exchange: read_name(buf, start + 2)?.0,
        },
        RecordType::TXT => {
            let mut strings = Vec::new();
            let mut pos = 0;
            while pos < rdata.len() {
                let n = rdata[pos] as usize;
                let s = rdata.get(pos + 1..pos + 1 + n).ok_or_else(bad)?;
                strings.push(Bytes::copy_from_slice(s));
                pos += 1 + n;
            }
            RecordData::Txt(strings)
        }
        RecordType::SRV => RecordData::Srv {
            priority: read_u16(rdata, 0).map_err(|_| bad())?,
            weight: read_u16(rdata, 2).map_err(|_| bad())?,
            port: read_u16(rdata, 4).map_err(|_| bad())?,
            target: read_name(buf, start + 6)?.0,
        },
        _ => RecordData::Raw(Bytes::copy_from_slice(rdata)),
    };
    Ok(data)
}

fn write_rdata(out: &mut Vec<u8>, data: &RecordData) -> Result<(), DnsError> {
    match data {
        RecordData::A(ip) => out.extend_from_slice(&ip.octets()),
        RecordData::Aaaa(ip) => out.extend_from_slice(&ip.octets()),
        RecordData::Name(name) => write_name(out, name)?,
        RecordData::Mx {
            preference,
            exchange,
        } => {
            put_u16(out, *preference);
            write_name(out, exchange)?;
        }
        RecordData::Txt(strings) => {
            for s in strings {
                let s = &s[..s.len().min(255)];
                out.push(s.len() as u8);
                out.extend_from_slice(s);
            }
        }
        RecordData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            put_u16(out, *priority);
            put_u16(out, *weight);
            put_u16(out, *port);
            write_name(out, target)?;
        }
        RecordData::Raw(raw) => out.extend_from_slice(raw),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // example.com A 93.184.216.34, answer name compressed to the question
    const EXAMPLE_RESPONSE: &str = "123481800001000100000000076578616d706c6503636f6d0000010001\
                                    c00c0001000100000e1000045db8d822";

    #[test]
    fn test_parse_compressed_response() {
        let buf = hex::decode(EXAMPLE_RESPONSE).unwrap();
        let msg = DnsMessage::parse(&buf).unwrap();
        assert_eq!(msg.id, 0x1234);
        assert!(msg.is_response());
        assert_eq!(msg.rcode(), 0);
        assert_eq!(msg.questions[0].name, "example.com");
        assert_eq!(msg.questions[0].qtype, RecordType::A);
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.answers[0].name, "example.com");
        assert_eq!(msg.answers[0].ttl, 3600);
        assert_eq!(msg.first_addr(), Some("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_query_encoding() {
        let buf = DnsMessage::query(0x1234, "example.com.", RecordType::A)
            .encode()
            .unwrap();
        assert_eq!(
            hex::encode(buf),
            "123401000001000000000000076578616d706c6503636f6d0000010001"
        );
    }

    #[test]
    fn test_truncated_and_loops() {
        let buf = hex::decode(EXAMPLE_RESPONSE).unwrap();
        assert_eq!(DnsMessage::parse(&buf[..buf.len() - 2]), Err(DnsError::Truncated));
        assert_eq!(DnsMessage::parse(&buf[..5]), Err(DnsError::Truncated));

        // question name pointing at itself
        let mut looped = buf[..12].to_vec();
        looped.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
        assert_eq!(DnsMessage::parse(&looped), Err(DnsError::PointerLoop));
    }

    #[test]
    fn test_bad_names_rejected() {
        let long_label = "a".repeat(64);
        assert!(DnsMessage::query(1, &long_label, RecordType::A).encode().is_err());
        assert!(DnsMessage::query(1, "a..b", RecordType::A).encode().is_err());
    }

    #[test]
    fn test_answer_record_types() {
        let query = DnsMessage::query(7, "svc.example", RecordType::ANY);
        let answers = vec![
            ResourceRecord {
                name: "svc.example".into(),
                rtype: RecordType::AAAA,
                class: CLASS_IN,
                ttl: 60,
                data: RecordData::Aaaa("2001:db8::1".parse().unwrap()),
            },
            ResourceRecord {
                name: "svc.example".into(),
                rtype: RecordType::MX,
                class: CLASS_IN,
                ttl: 60,
                data: RecordData::Mx {
                    preference: 10,
                    exchange: "mail.example".into(),
                },
            },
            ResourceRecord {
                name: "svc.example".into(),
                rtype: RecordType::TXT,
                class: CLASS_IN,
                ttl: 60,
                data: RecordData::Txt(vec![Bytes::from_static(b"v=1"), Bytes::from_static(b"x")]),
            },
            ResourceRecord {
                name: "_mqtt._tcp.svc.example".into(),
                rtype: RecordType::SRV,
                class: CLASS_IN,
                ttl: 60,
                data: RecordData::Srv {
                    priority: 1,
                    weight: 5,
                    port: 1883,
                    target: "broker.example".into(),
                },
            },
        ];
        let reply = query.reply(answers.clone());
        let parsed = DnsMessage::parse(&reply.encode().unwrap()).unwrap();
        assert_eq!(parsed.answers, answers);
        assert_eq!(parsed.answers_of(RecordType::SRV).count(), 1);
    }

    #[test]
    fn test_answers_capped() {
        let query = DnsMessage::query(9, "many.example", RecordType::A);
        let answers: Vec<ResourceRecord> = (0..40u8)
            .map(|i| ResourceRecord {
                name: "many.example".into(),
                rtype: RecordType::A,
                class: CLASS_IN,
                ttl: 1,
                data: RecordData::A(Ipv4Addr::new(10, 0, 0, i)),
            })
            .collect();
        let mut buf = query.reply(answers).encode().unwrap();
        // claim all 40 on the wire even though encode caps at 32
        buf[6..8].copy_from_slice(&40u16.to_be_bytes());
        let parsed = DnsMessage::parse(&buf).unwrap();
        assert_eq!(parsed.answers.len(), MAX_RECORDS);
    }

    #[test]
    fn test_record_type_debug() {
        assert_eq!(format!("{:?}", RecordType::AAAA), "AAAA");
        assert_eq!(format!("{:?}", RecordType(99)), "TYPE99");
    }
}
