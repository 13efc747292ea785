//! Delivery to the host's video/audio consumer
//!
//! The host implements [`FrameSink`]. The [`SinkAdapter`] sits on the
//! assembler thread and turns completed frames and released audio packets
//! into sink calls, stamping audio with its own drift-free clock.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::ms_to_ns;
use crate::config::SourceConfig;
use crate::constants::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::network::buffer::JitterEntry;
use crate::protocol::packet::{AudioPacket, AUDIO_FRAMES_PER_PACKET};
use crate::protocol::seq_diff;
use crate::video::assembler::CompletedFrame;

/// Audio timestamps further than this from release time are re-anchored
const AUDIO_RESYNC_THRESHOLD_NS: u64 = ms_to_ns(100);

/// Duration of one audio packet at the nominal sample rate
pub const AUDIO_BLOCK_NS: u64 =
    AUDIO_FRAMES_PER_PACKET as u64 * 1_000_000_000 / AUDIO_SAMPLE_RATE as u64;

/// PCM sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian, interleaved
    S16Le,
}

/// One block of interleaved PCM
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock<'a> {
    pub pcm: &'a [u8],
    pub frames: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub pts_ns: u64,
}

/// Consumer of decoded frames and audio, provided by the host
///
/// Calls arrive on the assembler thread and must not block for long.
pub trait FrameSink: Send + Sync {
    /// A decoded RGBA frame; `rgba` is only valid for the call
    fn push_video_frame(&self, rgba: &[u8], width: u32, height: u32, pts_ns: u64);

    /// A block of PCM audio
    fn push_audio_block(&self, block: &AudioBlock<'_>);

    /// Video geometry or rate changed; precedes the first frame in the new format
    fn report_format(&self, width: u32, height: u32, fps: f64);

    /// No frame has been delivered for the frame timeout
    fn no_signal(&self) {}

    /// Configuration was applied or updated
    fn apply_settings(&self, _config: &SourceConfig) {}
}

/// Shared handle to a sink
pub type SharedSink = Arc<dyn FrameSink>;

/// Delivery counters
#[derive(Debug, Default)]
pub struct SinkCounters {
    video_frames: AtomicU64,
    audio_blocks: AtomicU64,
    audio_seq_gaps: AtomicU64,
    audio_rejected: AtomicU64,
    /// Monotonic time of the newest video delivery, 0 if none
    last_frame_ns: AtomicU64,
}

impl SinkCounters {
    /// Get a point-in-time copy
    pub fn snapshot(&self) -> SinkStats {
        SinkStats {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_blocks: self.audio_blocks.load(Ordering::Relaxed),
            audio_seq_gaps: self.audio_seq_gaps.load(Ordering::Relaxed),
            audio_rejected: self.audio_rejected.load(Ordering::Relaxed),
        }
    }

    /// Monotonic time of the newest video delivery, 0 if none
    pub fn last_frame_ns(&self) -> u64 {
        self.last_frame_ns.load(Ordering::Acquire)
    }
}

/// Delivery statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub video_frames: u64,
    pub audio_blocks: u64,
    pub audio_seq_gaps: u64,
    pub audio_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
struct AudioAnchor {
    t0_ns: u64,
    blocks: u64,
}

/// Feeds a [`FrameSink`] from the assembler thread
pub struct SinkAdapter {
    sink: SharedSink,
    counters: Arc<SinkCounters>,
    audio_anchor: Option<AudioAnchor>,
    last_audio_seq: Option<u16>,
}

impl SinkAdapter {
    pub fn new(sink: SharedSink, counters: Arc<SinkCounters>) -> Self {
        Self {
            sink,
            counters,
            audio_anchor: None,
            last_audio_seq: None,
        }
    }

    /// Get shared counters
    pub fn counters(&self) -> Arc<SinkCounters> {
        self.counters.clone()
    }

    /// Deliver a completed frame, announcing format changes first
    pub fn deliver_frame(&mut self, frame: &CompletedFrame<'_>, now_ns: u64) {
        let format = frame.format;
        if frame.format_changed {
            self.sink
                .report_format(format.width, format.height, format.fps);
        }
        self.sink
            .push_video_frame(frame.rgba, format.width, format.height, frame.pts_ns);

        self.counters.video_frames.fetch_add(1, Ordering::Relaxed);
        self.counters.last_frame_ns.store(now_ns, Ordering::Release);
    }

    /// Parse and deliver a released audio datagram
    pub fn deliver_audio(&mut self, entry: JitterEntry) {
        let packet = match AudioPacket::parse(entry.payload) {
            Ok(packet) => packet,
            Err(e) => {
                self.counters.audio_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Rejected audio packet: {}", e);
                return;
            }
        };

        self.track_sequence(packet.seq);
        let pts_ns = self.audio_pts(entry.release_ns);

        self.sink.push_audio_block(&AudioBlock {
            pcm: &packet.payload,
            frames: packet.frame_count() as u32,
            channels: AUDIO_CHANNELS,
            format: SampleFormat::S16Le,
            sample_rate: AUDIO_SAMPLE_RATE,
            pts_ns,
        });
        self.counters.audio_blocks.fetch_add(1, Ordering::Relaxed);
    }

    fn track_sequence(&mut self, seq: u16) {
        if let Some(last) = self.last_audio_seq {
            let diff = seq_diff(seq, last.wrapping_add(1));
            if diff > 0 {
                self.counters
                    .audio_seq_gaps
                    .fetch_add(diff as u64, Ordering::Relaxed);
                tracing::debug!("Audio sequence gap: expected {}, got {}", last.wrapping_add(1), seq);
            }
        }
        self.last_audio_seq = Some(seq);
    }

    /// Block-counting timestamps, re-anchored when they drift from release
    fn audio_pts(&mut self, release_ns: u64) -> u64 {
        let anchor = match self.audio_anchor {
            Some(anchor) => {
                let ideal = anchor.t0_ns + anchor.blocks * AUDIO_BLOCK_NS;
                if ideal.abs_diff(release_ns) > AUDIO_RESYNC_THRESHOLD_NS {
                    tracing::debug!(
                        "Audio clock drifted {} ms from release, re-anchoring",
                        ideal.abs_diff(release_ns) / 1_000_000
                    );
                    AudioAnchor {
                        t0_ns: release_ns,
                        blocks: 0,
                    }
                } else {
                    anchor
                }
            }
            None => AudioAnchor {
                t0_ns: release_ns,
                blocks: 0,
            },
        };

        let pts = anchor.t0_ns + anchor.blocks * AUDIO_BLOCK_NS;
        self.audio_anchor = Some(AudioAnchor {
            blocks: anchor.blocks + 1,
            ..anchor
        });
        pts
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// A delivered video frame
    #[derive(Debug, Clone)]
    pub struct RecordedFrame {
        pub rgba: Vec<u8>,
        pub width: u32,
        pub height: u32,
        pub pts_ns: u64,
    }

    /// Sink that keeps everything it receives
    #[derive(Default)]
    pub struct RecordingSink {
        pub frames: Mutex<Vec<RecordedFrame>>,
        pub audio: Mutex<Vec<(Vec<u8>, u64)>>,
        pub formats: Mutex<Vec<(u32, u32, f64)>>,
        pub no_signal: AtomicU64,
        pub settings_applied: AtomicU64,
    }

    impl FrameSink for RecordingSink {
        fn push_video_frame(&self, rgba: &[u8], width: u32, height: u32, pts_ns: u64) {
            self.frames.lock().push(RecordedFrame {
                rgba: rgba.to_vec(),
                width,
                height,
                pts_ns,
            });
        }

        fn push_audio_block(&self, block: &AudioBlock<'_>) {
            assert_eq!(block.frames, 192);
            assert_eq!(block.channels, 2);
            assert_eq!(block.sample_rate, 48_000);
            self.audio.lock().push((block.pcm.to_vec(), block.pts_ns));
        }

        fn report_format(&self, width: u32, height: u32, fps: f64) {
            self.formats.lock().push((width, height, fps));
        }

        fn no_signal(&self) {
            self.no_signal.fetch_add(1, Ordering::SeqCst);
        }

        fn apply_settings(&self, _config: &SourceConfig) {
            self.settings_applied.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use crate::video::assembler::{test_support::frame_datagrams, FrameAssembler, PushOutcome};
    use bytes::Bytes;

    fn audio_entry(seq: u16, release_ns: u64) -> JitterEntry {
        let samples = vec![seq as i16; AUDIO_FRAMES_PER_PACKET * 2];
        JitterEntry {
            arrival_ns: release_ns.saturating_sub(10_000_000),
            release_ns,
            payload: AudioPacket::encode(seq, &samples).unwrap(),
        }
    }

    #[test]
    fn test_block_duration() {
        assert_eq!(AUDIO_BLOCK_NS, 4_000_000);
    }

    #[test]
    fn test_frame_delivery_reports_format_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut adapter = SinkAdapter::new(sink.clone(), Arc::new(SinkCounters::default()));
        let mut asm = FrameAssembler::new();

        for (frame, seq) in [(0u16, 0u16), (1, 68)] {
            for d in frame_datagrams(frame, 68, seq) {
                if let PushOutcome::Frame(f) = asm.push_datagram(d, 10) {
                    adapter.deliver_frame(&f, 10);
                }
            }
        }

        assert_eq!(sink.formats.lock().as_slice(), &[(384, 272, 50.125)]);
        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].height, 272);
        assert_eq!(adapter.counters().snapshot().video_frames, 2);
        assert_eq!(adapter.counters().last_frame_ns(), 10);
    }

    #[test]
    fn test_audio_pts_is_regular() {
        let sink = Arc::new(RecordingSink::default());
        let mut adapter = SinkAdapter::new(sink.clone(), Arc::new(SinkCounters::default()));

        // Jittered releases around a 4 ms cadence
        let releases = [1_000_000u64, 5_900_000, 9_100_000, 13_400_000];
        for (i, t) in releases.iter().enumerate() {
            adapter.deliver_audio(audio_entry(i as u16, *t));
        }

        let audio = sink.audio.lock();
        let pts: Vec<u64> = audio.iter().map(|(_, p)| *p).collect();
        assert_eq!(pts, vec![1_000_000, 5_000_000, 9_000_000, 13_000_000]);
        assert_eq!(audio[0].0.len(), 768);
    }

    #[test]
    fn test_audio_reanchors_after_stall() {
        let sink = Arc::new(RecordingSink::default());
        let mut adapter = SinkAdapter::new(sink.clone(), Arc::new(SinkCounters::default()));

        adapter.deliver_audio(audio_entry(0, 0));
        adapter.deliver_audio(audio_entry(1, 500_000_000));

        let audio = sink.audio.lock();
        assert_eq!(audio[1].1, 500_000_000);
    }

    #[test]
    fn test_audio_pts_follows_release_not_arrival() {
        let sink = Arc::new(RecordingSink::default());
        let mut adapter = SinkAdapter::new(sink.clone(), Arc::new(SinkCounters::default()));

        adapter.deliver_audio(JitterEntry {
            arrival_ns: 1_000_000_000,
            release_ns: 1_200_000_000,
            payload: AudioPacket::encode(0, &[0i16; AUDIO_FRAMES_PER_PACKET * 2]).unwrap(),
        });

        assert_eq!(sink.audio.lock()[0].1, 1_200_000_000);
    }

    #[test]
    fn test_audio_sequence_gaps_and_rejects() {
        let counters = Arc::new(SinkCounters::default());
        let mut adapter = SinkAdapter::new(Arc::new(RecordingSink::default()), counters.clone());

        adapter.deliver_audio(audio_entry(10, 0));
        adapter.deliver_audio(audio_entry(13, 4_000_000));
        adapter.deliver_audio(JitterEntry {
            arrival_ns: 0,
            release_ns: 0,
            payload: Bytes::from_static(&[0u8; 12]),
        });

        let stats = counters.snapshot();
        assert_eq!(stats.audio_blocks, 2);
        assert_eq!(stats.audio_seq_gaps, 2);
        assert_eq!(stats.audio_rejected, 1);
    }
}
