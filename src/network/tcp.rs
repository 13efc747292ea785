//! Two-phase TCP reachability probe
//!
//! A short deadline keeps LAN checks snappy; a timeout on the first
//! attempt falls back to a longer deadline for routed peers.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;

use crate::constants::{PROBE_TIMEOUT_LONG_MS, PROBE_TIMEOUT_SHORT_MS};
use crate::error::ProbeError;

/// Probe with the standard 100 ms / 1500 ms deadlines
pub fn probe_tcp(addr: SocketAddrV4) -> Result<TcpStream, ProbeError> {
    probe_tcp_with(
        addr,
        Duration::from_millis(PROBE_TIMEOUT_SHORT_MS),
        Duration::from_millis(PROBE_TIMEOUT_LONG_MS),
    )
}

/// Connect to `addr`, retrying once with `long` if `short` times out
///
/// The returned stream is in blocking mode.
pub fn probe_tcp_with(
    addr: SocketAddrV4,
    short: Duration,
    long: Duration,
) -> Result<TcpStream, ProbeError> {
    if addr.ip().is_unspecified() || addr.ip().is_broadcast() || addr.port() == 0 {
        return Err(ProbeError::InvalidAddress);
    }

    match connect_once(addr, short) {
        Err(ProbeError::Timeout) => {
            tracing::debug!(
                "Fast connect to {} timed out after {:?}, retrying with {:?}",
                addr,
                short,
                long
            );
            connect_once(addr, long)
        }
        other => other,
    }
}

fn connect_once(addr: SocketAddrV4, timeout: Duration) -> Result<TcpStream, ProbeError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|_| ProbeError::Unreachable)?;

    socket
        .connect_timeout(&SocketAddr::V4(addr).into(), timeout)
        .map_err(|e| classify(&e))?;
    socket.set_nonblocking(false).map_err(|e| classify(&e))?;

    Ok(socket.into())
}

fn classify(e: &io::Error) -> ProbeError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProbeError::Refused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout,
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
            ProbeError::InvalidAddress
        }
        _ => ProbeError::Unreachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    fn local(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn test_probe_listening_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = probe_tcp(local(port)).unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[test]
    fn test_probe_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert_eq!(probe_tcp(local(port)).unwrap_err(), ProbeError::Refused);
    }

    #[test]
    fn test_probe_invalid_address() {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 64);
        assert_eq!(probe_tcp(addr).unwrap_err(), ProbeError::InvalidAddress);
        assert_eq!(probe_tcp(local(0)).unwrap_err(), ProbeError::InvalidAddress);
    }

    #[test]
    fn test_classify() {
        let e = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify(&e), ProbeError::Timeout);
        let e = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify(&e), ProbeError::Unreachable);
    }
}
