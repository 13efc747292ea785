//! Video format descriptors and PAL/NTSC detection

use serde::Serialize;
use std::fmt;

use crate::protocol::packet::{LINES_PER_PACKET, PIXELS_PER_LINE};

/// Frame height above which a stream is treated as PAL
const NTSC_MAX_HEIGHT: u32 = 250;

/// Video standard emitted by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoStandard {
    Pal,
    Ntsc,
}

impl fmt::Display for VideoStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoStandard::Pal => write!(f, "PAL"),
            VideoStandard::Ntsc => write!(f, "NTSC"),
        }
    }
}

/// Frame geometry and timing
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FormatDescriptor {
    pub standard: VideoStandard,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_interval_ns: u64,
}

impl FormatDescriptor {
    pub const PAL: FormatDescriptor = FormatDescriptor {
        standard: VideoStandard::Pal,
        width: PIXELS_PER_LINE as u32,
        height: 272,
        fps: 50.125,
        frame_interval_ns: 19_950_124,
    };

    pub const NTSC: FormatDescriptor = FormatDescriptor {
        standard: VideoStandard::Ntsc,
        width: PIXELS_PER_LINE as u32,
        height: 240,
        fps: 59.826,
        frame_interval_ns: 16_710_875,
    };

    /// Pick a format from a measured frame height
    pub fn from_height(height: u32) -> Self {
        match height {
            272 => Self::PAL,
            240 => Self::NTSC,
            h if h <= NTSC_MAX_HEIGHT => Self::NTSC,
            _ => Self::PAL,
        }
    }

    /// Detect the format from the starting line of a frame's last packet
    pub fn from_last_line(line_start: u16) -> Self {
        Self::from_height(line_start as u32 + LINES_PER_PACKET as u32)
    }

    /// Packets needed for one full frame
    pub fn packets_per_frame(&self) -> usize {
        (self.height / LINES_PER_PACKET as u32) as usize
    }

    /// Size of one decoded RGBA frame
    pub fn rgba_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} @ {:.3} Hz",
            self.standard, self.width, self.height, self.fps
        )
    }
}
