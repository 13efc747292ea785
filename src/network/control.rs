//! Control channel client
//!
//! Every command is sent on its own short-lived TCP connection; the device
//! sends no reply. A device address of `0.0.0.0` puts the client in
//! offline mode where nothing is transmitted.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use super::tcp::{probe_tcp, probe_tcp_with};
use crate::constants::CONTROL_PORT;
use crate::error::{NetworkError, ProbeError, Result};
use crate::protocol::{ControlCommand, StreamId};

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Sends start/stop commands to the device
#[derive(Debug, Clone)]
pub struct ControlClient {
    device: Option<SocketAddrV4>,
    probe_timeouts: Option<(Duration, Duration)>,
}

impl ControlClient {
    /// Client for the device's standard control port
    pub fn new(device_ip: Ipv4Addr) -> Self {
        Self::with_port(device_ip, CONTROL_PORT)
    }

    /// Client for a non-standard control port
    pub fn with_port(device_ip: Ipv4Addr, port: u16) -> Self {
        let device = if device_ip.is_unspecified() {
            None
        } else {
            Some(SocketAddrV4::new(device_ip, port))
        };
        Self {
            device,
            probe_timeouts: None,
        }
    }

    /// Client that never transmits
    pub fn offline() -> Self {
        Self {
            device: None,
            probe_timeouts: None,
        }
    }

    /// Override the two probe deadlines
    pub fn with_probe_timeouts(mut self, short: Duration, long: Duration) -> Self {
        self.probe_timeouts = Some((short, long));
        self
    }

    pub fn is_offline(&self) -> bool {
        self.device.is_none()
    }

    pub fn device(&self) -> Option<SocketAddrV4> {
        self.device
    }

    fn connect(&self, addr: SocketAddrV4) -> std::result::Result<std::net::TcpStream, ProbeError> {
        match self.probe_timeouts {
            Some((short, long)) => probe_tcp_with(addr, short, long),
            None => probe_tcp(addr),
        }
    }

    /// Check that the device accepts TCP connections
    pub fn probe(&self) -> std::result::Result<(), ProbeError> {
        match self.device {
            Some(addr) => self.connect(addr).map(drop),
            None => Err(ProbeError::InvalidAddress),
        }
    }

    /// Send a single command
    pub fn send(&self, command: &ControlCommand) -> Result<()> {
        let Some(addr) = self.device else {
            tracing::debug!("Offline mode, not sending {:?}", command);
            return Ok(());
        };

        let mut stream = self.connect(addr)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream
            .write_all(&command.encode())
            .and_then(|_| stream.flush())
            .map_err(|e| NetworkError::SendFailed(format!("{} to {}: {}", command_name(command), addr, e)))?;

        tracing::debug!("Sent {} to {}", command_name(command), addr);
        Ok(())
    }

    /// Ask the device to stream video and audio to `host_ip`
    pub fn start_streams(&self, host_ip: Ipv4Addr, video_port: u16, audio_port: u16) -> Result<()> {
        self.send(&ControlCommand::start(
            StreamId::Video,
            SocketAddrV4::new(host_ip, video_port),
        ))?;
        self.send(&ControlCommand::start(
            StreamId::Audio,
            SocketAddrV4::new(host_ip, audio_port),
        ))
    }

    /// Ask the device to stop both streams
    ///
    /// Both stops are attempted; the first error is returned.
    pub fn stop_streams(&self) -> Result<()> {
        let video = self.send(&ControlCommand::stop(StreamId::Video));
        let audio = self.send(&ControlCommand::stop(StreamId::Audio));
        video.and(audio)
    }
}

fn command_name(command: &ControlCommand) -> String {
    match command {
        ControlCommand::StartStream { stream, target, .. } => format!("start {} -> {}", stream, target),
        ControlCommand::StopStream { stream } => format!("stop {}", stream),
    }
}
