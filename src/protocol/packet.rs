//! Video and audio datagram layouts
//!
//! ```text
//! Video (780 bytes)
//! ┌──────┬───────┬──────┬────────┬─────┬─────┬──────────┬─────────────────┐
//! │ seq  │ frame │ line │ pixels │ lpp │ bpp │ encoding │ 4 x 192 B lines │
//! │ u16  │ u16   │ u16  │ u16    │ u8  │ u8  │ u16      │ 2 pixels / byte │
//! └──────┴───────┴──────┴────────┴─────┴─────┴──────────┴─────────────────┘
//!   line bit 15 marks the last packet of a frame
//!
//! Audio (770 bytes)
//! ┌──────┬──────────────────────────────────────┐
//! │ seq  │ 192 x (L: i16le, R: i16le)           │
//! └──────┴──────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::read_u16_le;
use crate::error::ProtocolError;

pub const VIDEO_PACKET_SIZE: usize = 780;
pub const VIDEO_HEADER_SIZE: usize = 12;
pub const VIDEO_PAYLOAD_SIZE: usize = VIDEO_PACKET_SIZE - VIDEO_HEADER_SIZE;

pub const AUDIO_PACKET_SIZE: usize = 770;
pub const AUDIO_HEADER_SIZE: usize = 2;
pub const AUDIO_PAYLOAD_SIZE: usize = AUDIO_PACKET_SIZE - AUDIO_HEADER_SIZE;

/// Visible pixels per scanline
pub const PIXELS_PER_LINE: u16 = 384;

/// Scanlines carried by each video packet
pub const LINES_PER_PACKET: u8 = 4;

/// Bits per indexed pixel
pub const BITS_PER_PIXEL: u8 = 4;

/// Packed bytes per scanline (two pixels per byte)
pub const BYTES_PER_LINE: usize = PIXELS_PER_LINE as usize / 2;

/// Bit 15 of the line field
pub const LAST_PACKET_FLAG: u16 = 0x8000;

/// Stereo frames per audio packet
pub const AUDIO_FRAMES_PER_PACKET: usize = 192;

/// Bytes per stereo S16LE frame
pub const AUDIO_BYTES_PER_FRAME: usize = 4;

/// Video packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub seq: u16,
    pub frame: u16,
    /// Raw line field, including the last-packet flag
    pub line: u16,
    pub pixels_per_line: u16,
    pub lines_per_packet: u8,
    pub bits_per_pixel: u8,
    pub encoding: u16,
}

impl VideoHeader {
    /// Create a header with the standard format constants
    pub fn new(seq: u16, frame: u16, line_start: u16, last: bool) -> Self {
        let mut line = line_start & !LAST_PACKET_FLAG;
        if last {
            line |= LAST_PACKET_FLAG;
        }
        Self {
            seq,
            frame,
            line,
            pixels_per_line: PIXELS_PER_LINE,
            lines_per_packet: LINES_PER_PACKET,
            bits_per_pixel: BITS_PER_PIXEL,
            encoding: 0,
        }
    }

    /// Parse the 12-byte header at the start of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < VIDEO_HEADER_SIZE {
            return Err(ProtocolError::WrongLength {
                expected: VIDEO_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        Ok(Self {
            seq: read_u16_le(buf, 0),
            frame: read_u16_le(buf, 2),
            line: read_u16_le(buf, 4),
            pixels_per_line: read_u16_le(buf, 6),
            lines_per_packet: buf[8],
            bits_per_pixel: buf[9],
            encoding: read_u16_le(buf, 10),
        })
    }

    /// Check the format constants
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.pixels_per_line != PIXELS_PER_LINE {
            return Err(ProtocolError::UnexpectedField {
                field: "pixels_per_line",
                value: self.pixels_per_line as u32,
            });
        }
        if self.lines_per_packet != LINES_PER_PACKET {
            return Err(ProtocolError::UnexpectedField {
                field: "lines_per_packet",
                value: self.lines_per_packet as u32,
            });
        }
        if self.bits_per_pixel != BITS_PER_PIXEL {
            return Err(ProtocolError::UnexpectedField {
                field: "bits_per_pixel",
                value: self.bits_per_pixel as u32,
            });
        }
        Ok(())
    }

    /// Serialize to wire layout
    pub fn to_bytes(&self) -> [u8; VIDEO_HEADER_SIZE] {
        let mut out = [0u8; VIDEO_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.seq.to_le_bytes());
        out[2..4].copy_from_slice(&self.frame.to_le_bytes());
        out[4..6].copy_from_slice(&self.line.to_le_bytes());
        out[6..8].copy_from_slice(&self.pixels_per_line.to_le_bytes());
        out[8] = self.lines_per_packet;
        out[9] = self.bits_per_pixel;
        out[10..12].copy_from_slice(&self.encoding.to_le_bytes());
        out
    }

    /// First scanline carried by the packet
    pub fn line_start(&self) -> u16 {
        self.line & !LAST_PACKET_FLAG
    }

    /// Whether this is the final packet of its frame
    pub fn is_last(&self) -> bool {
        self.line & LAST_PACKET_FLAG != 0
    }

    /// Slot index within the frame
    pub fn packet_index(&self) -> usize {
        (self.line_start() / self.lines_per_packet.max(1) as u16) as usize
    }
}

/// A validated video datagram
///
/// The payload is a zero-copy slice of the received datagram.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    pub header: VideoHeader,
    pub payload: Bytes,
}

impl VideoPacket {
    /// Parse and validate a full datagram
    pub fn parse(datagram: Bytes) -> Result<Self, ProtocolError> {
        if datagram.len() != VIDEO_PACKET_SIZE {
            return Err(ProtocolError::WrongLength {
                expected: VIDEO_PACKET_SIZE,
                actual: datagram.len(),
            });
        }

        let header = VideoHeader::parse(&datagram)?;
        header.validate()?;

        Ok(Self {
            header,
            payload: datagram.slice(VIDEO_HEADER_SIZE..),
        })
    }

    /// Build a datagram from a header and packed pixel payload
    pub fn encode(header: &VideoHeader, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() != VIDEO_PAYLOAD_SIZE {
            return Err(ProtocolError::WrongLength {
                expected: VIDEO_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }

        let mut buf = BytesMut::with_capacity(VIDEO_PACKET_SIZE);
        buf.put_slice(&header.to_bytes());
        buf.put_slice(payload);
        Ok(buf.freeze())
    }
}

/// A validated audio datagram
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub seq: u16,
    /// 192 interleaved S16LE stereo frames
    pub payload: Bytes,
}

impl AudioPacket {
    /// Parse a full datagram
    pub fn parse(datagram: Bytes) -> Result<Self, ProtocolError> {
        if datagram.len() != AUDIO_PACKET_SIZE {
            return Err(ProtocolError::WrongLength {
                expected: AUDIO_PACKET_SIZE,
                actual: datagram.len(),
            });
        }

        Ok(Self {
            seq: read_u16_le(&datagram, 0),
            payload: datagram.slice(AUDIO_HEADER_SIZE..),
        })
    }

    /// Build a datagram from interleaved stereo samples
    pub fn encode(seq: u16, samples: &[i16]) -> Result<Bytes, ProtocolError> {
        let expected = AUDIO_FRAMES_PER_PACKET * 2;
        if samples.len() != expected {
            return Err(ProtocolError::WrongLength {
                expected,
                actual: samples.len(),
            });
        }

        let mut buf = BytesMut::with_capacity(AUDIO_PACKET_SIZE);
        buf.put_u16_le(seq);
        for &s in samples {
            buf.put_i16_le(s);
        }
        Ok(buf.freeze())
    }

    /// Number of stereo frames carried
    pub fn frame_count(&self) -> usize {
        self.payload.len() / AUDIO_BYTES_PER_FRAME
    }

    /// Iterate over (left, right) sample pairs
    pub fn frames(&self) -> impl Iterator<Item = (i16, i16)> + '_ {
        self.payload.chunks_exact(AUDIO_BYTES_PER_FRAME).map(|f| {
            (
                i16::from_le_bytes([f[0], f[1]]),
                i16::from_le_bytes([f[2], f[3]]),
            )
        })
    }
}
