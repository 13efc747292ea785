//! UDP socket creation for the receive path

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use crate::constants::UDP_RECV_BUFFER_BYTES;
use crate::error::NetworkError;

/// Open a non-blocking UDP socket bound to `0.0.0.0:port`
///
/// Requests a large kernel receive buffer so bursts at ~3400 packets/s
/// survive scheduling hiccups. Port 0 binds an ephemeral port.
pub fn open_udp(port: u16) -> Result<UdpSocket, NetworkError> {
    let bind_err = |source: std::io::Error| NetworkError::BindFailed { port, source };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;

    if let Err(e) = socket.set_recv_buffer_size(UDP_RECV_BUFFER_BYTES) {
        tracing::warn!("Failed to set SO_RCVBUF on port {}: {}", port, e);
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let socket: UdpSocket = socket.into();
    if let Ok(size) = recv_buffer_size(&socket) {
        tracing::debug!("UDP socket on port {} bound, SO_RCVBUF = {} bytes", port, size);
    }
    Ok(socket)
}

/// Effective kernel receive buffer size
pub fn recv_buffer_size(socket: &UdpSocket) -> std::io::Result<usize> {
    SockRef::from(socket).recv_buffer_size()
}
