//! Hosts file lookup.

use std::io;
use std::net::IpAddr;
use std::path::Path;

use super::codec::RecordType;

/// Find `name` in hosts-file `content`.
///
/// Names compare case-insensitively. An `A` query only matches IPv4 lines,
/// `AAAA` only IPv6; anything else takes the first match.
#[must_use]
pub fn lookup_hosts(content: &str, name: &str, qtype: RecordType) -> Option<IpAddr> {
    let name = name.trim_end_matches('.');
    content.lines().find_map(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let ip: IpAddr = fields.next()?.parse().ok()?;
        let family_ok = match qtype {
            RecordType::A => ip.is_ipv4(),
            RecordType::AAAA => ip.is_ipv6(),
            _ => true,
        };
        (family_ok && fields.any(|alias| alias.eq_ignore_ascii_case(name))).then_some(ip)
    })
}

/// Read `path` and look `name` up in it.
pub fn resolve_from_hosts_file(path: &Path, name: &str, qtype: RecordType) -> io::Result<Option<IpAddr>> {
    let content = std::fs::read_to_string(path)?;
    Ok(lookup_hosts(&content, name, qtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTS: &str = "\
# static table
127.0.0.1   localhost
::1         localhost ip6-localhost
10.0.0.7    Broker.LAN broker   # mqtt
bogus       ignored.example
";

    #[test]
    fn test_lookup_by_family() {
        assert_eq!(
            lookup_hosts(HOSTS, "localhost", RecordType::A),
            Some("127.0.0.1".parse().unwrap())
        );
        assert_eq!(
            lookup_hosts(HOSTS, "localhost", RecordType::AAAA),
            Some("::1".parse().unwrap())
        );
        assert_eq!(lookup_hosts(HOSTS, "ip6-localhost", RecordType::A), None);
    }

    #[test]
    fn test_case_insensitive_and_comments() {
        let ip = Some("10.0.0.7".parse().unwrap());
        assert_eq!(lookup_hosts(HOSTS, "broker.lan", RecordType::A), ip);
        assert_eq!(lookup_hosts(HOSTS, "BROKER.", RecordType::ANY), ip);
        assert_eq!(lookup_hosts(HOSTS, "mqtt", RecordType::A), None);
        assert_eq!(lookup_hosts(HOSTS, "ignored.example", RecordType::A), None);
    }

    #[test]
    fn test_missing_file() {
        let err = resolve_from_hosts_file(Path::new("/nonexistent/keel/hosts"), "x", RecordType::A)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
