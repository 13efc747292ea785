//! Control commands sent to the device on TCP port 64
//!
//! ```text
//! Start: [0x20|sid, 0xFF, 2+len, 0x00, dur_lo, dur_hi, "ip:port"...]
//! Stop:  [0x30|sid, 0xFF, 0x00, 0x00]
//! ```

use std::fmt;
use std::net::SocketAddrV4;

use crate::error::ProtocolError;

const START_OPCODE: u8 = 0x20;
const STOP_OPCODE: u8 = 0x30;
const COMMAND_MARKER: u8 = 0xFF;

/// Stream selector carried in the low bits of the opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamId {
    Video = 0,
    Audio = 1,
}

impl StreamId {
    pub const ALL: [StreamId; 2] = [StreamId::Video, StreamId::Audio];

    fn from_opcode(opcode: u8) -> Result<Self, ProtocolError> {
        match opcode & 0x0F {
            0 => Ok(StreamId::Video),
            1 => Ok(StreamId::Audio),
            other => Err(ProtocolError::MalformedCommand(format!(
                "unknown stream id {}",
                other
            ))),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Video => write!(f, "video"),
            StreamId::Audio => write!(f, "audio"),
        }
    }
}

/// A single control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Ask the device to stream to `target`; a duration of 0 means forever
    StartStream {
        stream: StreamId,
        target: SocketAddrV4,
        duration: u16,
    },
    StopStream {
        stream: StreamId,
    },
}

impl ControlCommand {
    /// Start streaming forever
    pub fn start(stream: StreamId, target: SocketAddrV4) -> Self {
        ControlCommand::StartStream {
            stream,
            target,
            duration: 0,
        }
    }

    pub fn stop(stream: StreamId) -> Self {
        ControlCommand::StopStream { stream }
    }

    pub fn stream(&self) -> StreamId {
        match self {
            ControlCommand::StartStream { stream, .. } | ControlCommand::StopStream { stream } => {
                *stream
            }
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlCommand::StartStream {
                stream,
                target,
                duration,
            } => {
                let ascii = target.to_string();
                let mut out = Vec::with_capacity(6 + ascii.len());
                out.push(START_OPCODE | *stream as u8);
                out.push(COMMAND_MARKER);
                // "ip:port" is at most 21 bytes, so the length fits a u8
                out.push((2 + ascii.len()) as u8);
                out.push(0x00);
                out.extend_from_slice(&duration.to_le_bytes());
                out.extend_from_slice(ascii.as_bytes());
                out
            }
            ControlCommand::StopStream { stream } => {
                vec![STOP_OPCODE | *stream as u8, COMMAND_MARKER, 0x00, 0x00]
            }
        }
    }

    /// Parse one command from the front of `buf`
    ///
    /// Returns the command and the number of bytes consumed, or `Ok(None)`
    /// when more bytes are needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        if buf[1] != COMMAND_MARKER {
            return Err(ProtocolError::MalformedCommand(format!(
                "bad marker 0x{:02X}",
                buf[1]
            )));
        }

        let stream = StreamId::from_opcode(buf[0])?;
        let param_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;

        match buf[0] & 0xF0 {
            START_OPCODE => {
                if param_len < 2 {
                    return Err(ProtocolError::MalformedCommand(
                        "start without duration".into(),
                    ));
                }
                let total = 4 + param_len;
                if buf.len() < total {
                    return Ok(None);
                }
                let duration = u16::from_le_bytes([buf[4], buf[5]]);
                let ascii = std::str::from_utf8(&buf[6..total])
                    .map_err(|_| ProtocolError::MalformedCommand("target is not ASCII".into()))?;
                let target = ascii.parse::<SocketAddrV4>().map_err(|_| {
                    ProtocolError::MalformedCommand(format!("bad target {:?}", ascii))
                })?;
                Ok(Some((
                    ControlCommand::StartStream {
                        stream,
                        target,
                        duration,
                    },
                    total,
                )))
            }
            STOP_OPCODE => Ok(Some((ControlCommand::StopStream { stream }, 4 + param_len))),
            other => Err(ProtocolError::MalformedCommand(format!(
                "unknown opcode 0x{:02X}",
                other
            ))),
        }
    }
}
