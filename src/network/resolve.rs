//! Device hostname resolution and local address discovery
//!
//! Resolution order:
//! 1. IPv4 literal
//! 2. System resolver, then the same name as an FQDN with a trailing dot
//! 3. Direct A-record queries to the configured DNS server, then to common
//!    router addresses
//!
//! The direct queries cover hosts whose system resolver does not forward
//! single-label names (such as the device's default `c64u`) to the router.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::NetworkError;

/// Routers tried after the configured DNS server
pub const FALLBACK_DNS_SERVERS: [Ipv4Addr; 3] = [
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(172, 16, 0, 1),
];

const DNS_PORT: u16 = 53;
const DNS_TIMEOUT: Duration = Duration::from_millis(500);
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Resolve a device host to an IPv4 address
pub fn resolve_host(host: &str, dns_server: Option<&str>) -> Result<Ipv4Addr, NetworkError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(NetworkError::Resolve(host.to_string()));
    }

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    if let Some(ip) = system_resolve(host) {
        tracing::info!("Resolved {} -> {} (system)", host, ip);
        return Ok(ip);
    }

    let fqdn = format!("{}.", host.trim_end_matches('.'));
    if let Some(ip) = system_resolve(&fqdn) {
        tracing::info!("Resolved {} -> {} (system, FQDN)", fqdn, ip);
        return Ok(ip);
    }

    tracing::debug!("System resolution of {} failed, querying DNS servers directly", host);
    for server in dns_servers(dns_server) {
        for name in [host, fqdn.as_str()] {
            if let Some(ip) = query_a_record(server, name, DNS_TIMEOUT) {
                tracing::info!("Resolved {} -> {} (via {})", name, ip, server);
                return Ok(ip);
            }
        }
    }

    Err(NetworkError::Resolve(host.to_string()))
}

/// Configured server first, then the fallbacks
fn dns_servers(configured: Option<&str>) -> Vec<Ipv4Addr> {
    let mut servers = Vec::with_capacity(FALLBACK_DNS_SERVERS.len() + 1);
    if let Some(s) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        match s.parse::<Ipv4Addr>() {
            Ok(ip) => servers.push(ip),
            Err(_) => tracing::warn!("Ignoring invalid DNS server {:?}", s),
        }
    }
    for ip in FALLBACK_DNS_SERVERS {
        if !servers.contains(&ip) {
            servers.push(ip);
        }
    }
    servers
}

fn system_resolve(name: &str) -> Option<Ipv4Addr> {
    (name, 0u16)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
}

/// Send one A query to `server` and wait for the matching answer
pub fn query_a_record(server: Ipv4Addr, name: &str, timeout: Duration) -> Option<Ipv4Addr> {
    let id = query_id();
    let query = build_query(id, name)?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.send_to(&query, (server, DNS_PORT)).ok()?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 512];
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        socket.set_read_timeout(Some(remaining)).ok()?;
        let (len, from) = socket.recv_from(&mut buf).ok()?;
        if from.ip() != IpAddr::V4(server) {
            continue;
        }
        if let Some(answer) = parse_response(id, &buf[..len]) {
            return answer;
        }
    }
}

fn query_id() -> u16 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u16 ^ (d.as_secs() as u16))
        .unwrap_or(0x4C36)
}

/// Encode a recursive A/IN query
///
/// Returns `None` for names that cannot be encoded.
pub fn build_query(id: u16, name: &str) -> Option<Vec<u8>> {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return None;
    }

    let mut out = Vec::with_capacity(18 + name.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&TYPE_A.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    Some(out)
}

/// Parse a response to query `id`
///
/// `None` means the datagram is not a response to this query;
/// `Some(None)` means it is, but carries no A record.
pub fn parse_response(id: u16, buf: &[u8]) -> Option<Option<Ipv4Addr>> {
    let be16 = |at: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
    };

    if buf.len() < 12 || be16(0)? != id {
        return None;
    }
    let flags = be16(2)?;
    if flags & 0x8000 == 0 {
        return None;
    }
    if flags & 0x000F != 0 {
        return Some(None);
    }

    let questions = be16(4)?;
    let answers = be16(6)?;
    let mut pos = 12;

    for _ in 0..questions {
        pos = skip_name(buf, pos)? + 4;
    }

    for _ in 0..answers {
        pos = skip_name(buf, pos)?;
        let rtype = be16(pos)?;
        let class = be16(pos + 2)?;
        let rdlen = be16(pos + 8)? as usize;
        let rdata = pos + 10;
        if rtype == TYPE_A && class == CLASS_IN && rdlen == 4 {
            let ip = buf.get(rdata..rdata + 4)?;
            return Some(Some(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])));
        }
        pos = rdata + rdlen;
    }

    Some(None)
}

fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
}

/// Discover the local address the device should stream to
///
/// Connects an unbound UDP socket towards `target` (no packets are sent)
/// and reads back the address the OS routed it through.
pub fn detect_local_ip(target: Option<Ipv4Addr>) -> Ipv4Addr {
    let target = target
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(Ipv4Addr::new(8, 8, 8, 8));

    let detected = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((target, 80))?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        });

    match detected {
        Some(ip) => {
            tracing::debug!("Detected local IP {} (route to {})", ip, target);
            ip
        }
        None => {
            tracing::warn!("Local IP detection failed, falling back to 127.0.0.1");
            Ipv4Addr::LOCALHOST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_localhost() {
        assert_eq!(
            resolve_host("192.168.1.64", None).unwrap(),
            Ipv4Addr::new(192, 168, 1, 64)
        );
        assert_eq!(resolve_host(" 10.0.0.2 ", None).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(resolve_host("localhost", None).unwrap(), Ipv4Addr::LOCALHOST);
        assert!(resolve_host("", None).is_err());
    }

    #[test]
    fn test_dns_server_order() {
        let servers = dns_servers(Some("10.0.0.1"));
        assert_eq!(servers[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(servers.len(), 3);

        let servers = dns_servers(Some("not-an-ip"));
        assert_eq!(servers, FALLBACK_DNS_SERVERS.to_vec());
        assert_eq!(dns_servers(None), FALLBACK_DNS_SERVERS.to_vec());
    }

    #[test]
    fn test_build_query_layout() {
        let query = build_query(0xABCD, "c64u.").unwrap();
        assert_eq!(
            query,
            vec![
                0xAB, 0xCD, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, // header
                4, b'c', b'6', b'4', b'u', 0, // qname
                0, 1, 0, 1, // A, IN
            ]
        );
        assert!(build_query(1, "").is_none());
        assert!(build_query(1, "a..b").is_none());
    }

    fn response(id: u16, rcode: u8, answer: Option<[u8; 4]>) -> Vec<u8> {
        let mut buf = build_query(id, "c64u").unwrap();
        buf[2] = 0x81;
        buf[3] = 0x80 | rcode;
        if let Some(ip) = answer {
            buf[7] = 1;
            // Compressed pointer to the question name
            buf.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
            buf.extend_from_slice(&ip);
        }
        buf
    }

    #[test]
    fn test_parse_a_answer() {
        let buf = response(7, 0, Some([192, 168, 1, 64]));
        assert_eq!(
            parse_response(7, &buf),
            Some(Some(Ipv4Addr::new(192, 168, 1, 64)))
        );
    }

    #[test]
    fn test_parse_rejects_other_ids_and_errors() {
        let buf = response(7, 0, Some([1, 2, 3, 4]));
        assert_eq!(parse_response(8, &buf), None);

        let nxdomain = response(7, 3, None);
        assert_eq!(parse_response(7, &nxdomain), Some(None));

        let empty = response(7, 0, None);
        assert_eq!(parse_response(7, &empty), Some(None));

        assert_eq!(parse_response(7, &buf[..20]), None);
    }

    #[test]
    fn test_query_without_answer_gives_up() {
        let started = Instant::now();
        assert_eq!(
            query_a_record(Ipv4Addr::new(127, 0, 0, 1), "c64u", Duration::from_millis(50)),
            None
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_detect_local_ip_loopback_target() {
        assert_eq!(detect_local_ip(Some(Ipv4Addr::LOCALHOST)), Ipv4Addr::LOCALHOST);
    }
}
