//! Video path: palette decoding, frame assembly, format detection and
//! presentation timestamps

pub mod assembler;
pub mod format;
pub mod palette;
pub mod timestamp;

pub use assembler::{AssemblerStats, CompletedFrame, FrameAssembler, PushOutcome};
pub use format::{FormatDescriptor, VideoStandard};
pub use palette::{decode_pair, VIC_PALETTE};
pub use timestamp::TimestampGenerator;
