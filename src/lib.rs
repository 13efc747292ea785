//! # C64U Receiver
//!
//! Real-time ingestion of the video and audio streams emitted by a
//! Commodore 64 Ultimate, with frame assembly, jitter smoothing and
//! drift-free presentation timestamps.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        C64 ULTIMATE          │
//! │  VIC-II 4bpp     SID PCM     │
//! └──────┬───────────────┬───────┘
//!        │ UDP :11000    │ UDP :11001          ▲ TCP :64
//!        │ 780 B/pkt     │ 770 B/pkt           │ start/stop
//!        ▼               ▼                     │ (network::control)
//! ┌──────────────┐ ┌──────────────┐            │
//! │ Video Recv   │ │ Audio Recv   │            │
//! │ Thread       │ │ Thread       │            │
//! │ (stamp only) │ │ (stamp only) │            │
//! └──────┬───────┘ └──────┬───────┘            │
//!        ▼                ▼                    │
//! ┌──────────────┐ ┌──────────────┐    ┌───────┴──────────────┐
//! │ Jitter Buf   │ │ Jitter Buf   │    │ Source Coordinator   │
//! │ arrival+delay│ │ arrival+delay│    │ open / update / close│
//! └──────┬───────┘ └──────┬───────┘    │ tick ─► Supervisor   │
//!        ▼                │            │   └─► retry task     │
//! ┌──────────────────────────────────┐ │       (TaskPool)     │
//! │ Assembler Thread                 │ └──────────────────────┘
//! │  FrameAssembler (reorder, dedup, │
//! │  timeout, PAL/NTSC detection)    │
//! │  TimestampGenerator              │
//! │  SinkAdapter (video + audio)     │
//! └──────────────┬───────────────────┘
//!                ▼
//!        ┌───────────────┐
//!        │ FrameSink     │  host compositor / mixer
//!        └───────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod protocol;
pub mod sink;
pub mod source;
pub mod status;
pub mod supervisor;
pub mod tasks;
pub mod video;

pub use error::{Error, Result};
pub use source::C64Source;

/// Application-wide constants
pub mod constants {
    /// Default device hostname
    pub const DEFAULT_DEVICE_HOST: &str = "c64u";

    /// Device host value that disables all control traffic
    pub const OFFLINE_HOST: &str = "0.0.0.0";

    /// Default UDP port for the video stream
    pub const DEFAULT_VIDEO_PORT: u16 = 11000;

    /// Default UDP port for the audio stream
    pub const DEFAULT_AUDIO_PORT: u16 = 11001;

    /// TCP control port on the device
    pub const CONTROL_PORT: u16 = 64;

    /// Default jitter buffer delay in milliseconds
    pub const DEFAULT_BUFFER_DELAY_MS: u32 = 10;

    /// Maximum jitter buffer delay in milliseconds
    pub const MAX_BUFFER_DELAY_MS: u32 = 500;

    /// Extra jitter buffer headroom beyond the configured delay
    pub const JITTER_SAFETY_MARGIN_MS: u32 = 100;

    /// Nominal video packet rate (68 packets x 50 Hz)
    pub const VIDEO_PACKETS_PER_SEC: u32 = 3400;

    /// Nominal audio packet rate (48000 / 192)
    pub const AUDIO_PACKETS_PER_SEC: u32 = 250;

    /// Sample rate reported to the sink
    pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

    /// Audio channel count (stereo)
    pub const AUDIO_CHANNELS: u16 = 2;

    /// Incomplete frames older than this are dropped
    pub const FRAME_TIMEOUT_MS: u64 = 100;

    /// Stream silence that triggers a retry
    pub const WATCHDOG_TIMEOUT_MS: u64 = 500;

    /// First TCP probe deadline (LAN)
    pub const PROBE_TIMEOUT_SHORT_MS: u64 = 100;

    /// Second TCP probe deadline (WAN)
    pub const PROBE_TIMEOUT_LONG_MS: u64 = 1500;

    /// Receive buffer requested for UDP sockets
    #[cfg(windows)]
    pub const UDP_RECV_BUFFER_BYTES: usize = 2 * 1024 * 1024;

    /// Receive buffer requested for UDP sockets
    #[cfg(not(windows))]
    pub const UDP_RECV_BUFFER_BYTES: usize = 1024 * 1024;

    /// Interval between statistics log lines
    pub const STATS_INTERVAL_SECS: u64 = 5;

    /// Default port for the status API
    pub const DEFAULT_STATUS_PORT: u16 = 8064;
}
