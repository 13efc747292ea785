//! The running half of a source: sockets, receiver threads and the
//! assembler thread
//!
//! A pipeline is started by the retry task and stopped by the coordinator.
//! All of its state (buffers, assembly, timestamp anchors, counters) lives
//! and dies with it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::SharedClock;
use crate::constants::{AUDIO_PACKETS_PER_SEC, VIDEO_PACKETS_PER_SEC};
use crate::error::NetworkError;
use crate::network::{
    open_udp, JitterBuffer, JitterBufferStats, ReceiverCounters, ReceiverStats,
    SharedJitterBuffer, StreamReceiver,
};
use crate::protocol::StreamId;
use crate::sink::{SharedSink, SinkAdapter, SinkCounters, SinkStats};
use crate::supervisor::StreamHealth;
use crate::video::assembler::{AssemblerCounters, FrameAssembler, PushOutcome};
use crate::video::{AssemblerStats, FormatDescriptor};

/// Idle sleep of the assembler thread when nothing is due
const ASSEMBLER_IDLE: Duration = Duration::from_millis(1);

/// Ports and delay a pipeline runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub video_port: u16,
    pub audio_port: u16,
    pub delay_ms: u32,
}

/// Counters of every pipeline stage
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PipelineStats {
    pub video: ReceiverStats,
    pub audio: ReceiverStats,
    pub video_buffer: JitterBufferStats,
    pub audio_buffer: JitterBufferStats,
    pub assembler: AssemblerStats,
    pub sink: SinkStats,
}

/// A started pipeline
pub struct Pipeline {
    settings: PipelineSettings,
    started_ns: u64,
    video_buffer: SharedJitterBuffer,
    audio_buffer: SharedJitterBuffer,
    video_receiver: StreamReceiver,
    audio_receiver: StreamReceiver,
    assembler: AssemblerWorker,
    assembler_counters: Arc<AssemblerCounters>,
    sink_counters: Arc<SinkCounters>,
    format: Arc<Mutex<Option<FormatDescriptor>>>,
}

impl Pipeline {
    /// Bind both ports and spawn the three pipeline threads
    pub fn start(
        settings: PipelineSettings,
        sink: SharedSink,
        clock: SharedClock,
    ) -> Result<Self, NetworkError> {
        // Bind both before spawning anything so a conflict leaves nothing running
        let video_socket = open_udp(settings.video_port)?;
        let audio_socket = open_udp(settings.audio_port)?;

        let video_buffer = Arc::new(JitterBuffer::new(VIDEO_PACKETS_PER_SEC, settings.delay_ms));
        let audio_buffer = Arc::new(JitterBuffer::new(AUDIO_PACKETS_PER_SEC, settings.delay_ms));

        let assembler_counters = Arc::new(AssemblerCounters::default());
        let sink_counters = Arc::new(SinkCounters::default());
        let format = Arc::new(Mutex::new(None));

        let video_receiver = StreamReceiver::spawn(
            StreamId::Video,
            video_socket,
            video_buffer.clone(),
            clock.clone(),
            Arc::new(ReceiverCounters::default()),
        )?;

        let assembler = AssemblerWorker::spawn(AssemblerContext {
            video: video_buffer.clone(),
            audio: audio_buffer.clone(),
            assembler: FrameAssembler::with_counters(assembler_counters.clone()),
            adapter: SinkAdapter::new(sink, sink_counters.clone()),
            format: format.clone(),
            clock: clock.clone(),
        })?;

        let audio_receiver = StreamReceiver::spawn(
            StreamId::Audio,
            audio_socket,
            audio_buffer.clone(),
            clock.clone(),
            Arc::new(ReceiverCounters::default()),
        )?;

        tracing::info!(
            "Pipeline started: video :{}, audio :{}, delay {} ms",
            settings.video_port,
            settings.audio_port,
            settings.delay_ms
        );

        Ok(Self {
            settings,
            started_ns: clock.now_ns(),
            video_buffer,
            audio_buffer,
            video_receiver,
            audio_receiver,
            assembler,
            assembler_counters,
            sink_counters,
            format,
        })
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub fn started_ns(&self) -> u64 {
        self.started_ns
    }

    /// Change the jitter delay of both buffers
    pub fn set_delay(&mut self, delay_ms: u32) {
        self.video_buffer.set_delay(delay_ms);
        self.audio_buffer.set_delay(delay_ms);
        self.settings.delay_ms = delay_ms;
    }

    /// Liveness for the supervisor
    pub fn health(&self) -> StreamHealth {
        StreamHealth {
            streaming: true,
            started_ns: self.started_ns,
            last_video_ns: self.video_receiver.counters().last_packet_ns(),
            last_audio_ns: self.audio_receiver.counters().last_packet_ns(),
        }
    }

    /// Monotonic time of the newest delivered frame, 0 if none
    pub fn last_frame_ns(&self) -> u64 {
        self.sink_counters.last_frame_ns()
    }

    /// Format of the newest delivered frame
    pub fn format(&self) -> Option<FormatDescriptor> {
        *self.format.lock()
    }

    /// Whether all three threads are alive
    pub fn is_running(&self) -> bool {
        self.video_receiver.is_running()
            && self.audio_receiver.is_running()
            && self.assembler.is_running()
    }

    /// Get statistics
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            video: self.video_receiver.counters().snapshot(),
            audio: self.audio_receiver.counters().snapshot(),
            video_buffer: self.video_buffer.stats(),
            audio_buffer: self.audio_buffer.stats(),
            assembler: self.assembler_counters.snapshot(),
            sink: self.sink_counters.snapshot(),
        }
    }

    /// Stop and join video receiver, assembler, audio receiver in that order
    pub fn stop(&mut self) {
        self.video_receiver.stop();
        self.assembler.stop();
        self.audio_receiver.stop();
        self.video_buffer.clear();
        self.audio_buffer.clear();
        tracing::info!("Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.video_receiver.stop();
        self.assembler.stop();
        self.audio_receiver.stop();
    }
}

struct AssemblerContext {
    video: SharedJitterBuffer,
    audio: SharedJitterBuffer,
    assembler: FrameAssembler,
    adapter: SinkAdapter,
    format: Arc<Mutex<Option<FormatDescriptor>>>,
    clock: SharedClock,
}

/// Thread draining both jitter buffers
struct AssemblerWorker {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AssemblerWorker {
    fn spawn(context: AssemblerContext) -> Result<Self, NetworkError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("c64u-assembler".into())
            .spawn(move || {
                assembler_loop(context, &running_for_loop);
                running_for_loop.store(false, Ordering::SeqCst);
            })
            .map_err(|e| NetworkError::Spawn(e.to_string()))?;

        Ok(Self {
            running,
            thread_handle: Some(handle),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Assembler thread panicked");
            }
        }
    }
}

fn assembler_loop(mut ctx: AssemblerContext, running: &AtomicBool) {
    tracing::debug!("Assembler started");

    while running.load(Ordering::Relaxed) {
        let now_ns = ctx.clock.now_ns();
        let mut worked = false;

        // Both streams are stamped at their release time so they share one time base
        while let Some(entry) = ctx.video.pop_ready(now_ns) {
            worked = true;
            if let PushOutcome::Frame(frame) =
                ctx.assembler.push_datagram(entry.payload, entry.release_ns)
            {
                if frame.format_changed {
                    *ctx.format.lock() = Some(frame.format);
                }
                ctx.adapter.deliver_frame(&frame, now_ns);
            }
        }

        while let Some(entry) = ctx.audio.pop_ready(now_ns) {
            worked = true;
            ctx.adapter.deliver_audio(entry);
        }

        ctx.assembler.poll_timeout(now_ns);

        if !worked {
            thread::sleep(ASSEMBLER_IDLE);
        }
    }

    tracing::debug!("Assembler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::protocol::packet::{AudioPacket, AUDIO_FRAMES_PER_PACKET};
    use crate::sink::test_support::RecordingSink;
    use crate::video::assembler::test_support::frame_datagrams;
    use std::net::UdpSocket;
    use std::time::Instant;

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            video_port: free_port(),
            audio_port: free_port(),
            delay_ms: 10,
        }
    }

    #[test]
    fn test_loopback_frame_and_audio() {
        let settings = settings();
        let sink = Arc::new(RecordingSink::default());
        let mut pipeline =
            Pipeline::start(settings, sink.clone(), MonotonicClock::shared()).unwrap();
        assert!(pipeline.is_running());

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for datagram in frame_datagrams(0, 68, 0) {
            sender
                .send_to(&datagram, ("127.0.0.1", settings.video_port))
                .unwrap();
        }
        let samples = vec![100i16; AUDIO_FRAMES_PER_PACKET * 2];
        for seq in 0..3 {
            let packet = AudioPacket::encode(seq, &samples).unwrap();
            sender
                .send_to(&packet, ("127.0.0.1", settings.audio_port))
                .unwrap();
        }

        assert!(wait_for(|| sink.frames.lock().len() == 1 && sink.audio.lock().len() == 3));
        assert_eq!(sink.formats.lock().as_slice(), &[(384, 272, 50.125)]);
        assert_eq!(pipeline.format(), Some(FormatDescriptor::PAL));
        assert!(pipeline.last_frame_ns() > 0);

        let stats = pipeline.stats();
        assert_eq!(stats.video.packets, 68);
        assert_eq!(stats.assembler.frames_completed, 1);
        assert_eq!(stats.sink.audio_blocks, 3);

        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_release_at_delay_on_shared_time_base() {
        let mut settings = settings();
        settings.delay_ms = 200;
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let sink = Arc::new(RecordingSink::default());
        let mut pipeline = Pipeline::start(settings, sink.clone(), clock.clone()).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for datagram in frame_datagrams(0, 68, 0) {
            sender
                .send_to(&datagram, ("127.0.0.1", settings.video_port))
                .unwrap();
        }
        let samples = vec![100i16; AUDIO_FRAMES_PER_PACKET * 2];
        let packet = AudioPacket::encode(0, &samples).unwrap();
        sender
            .send_to(&packet, ("127.0.0.1", settings.audio_port))
            .unwrap();

        assert!(wait_for(|| {
            let stats = pipeline.stats();
            stats.video.packets == 68 && stats.audio.packets == 1
        }));

        // One millisecond short of the delay nothing is released
        clock.advance_ms(199);
        thread::sleep(Duration::from_millis(30));
        assert!(sink.frames.lock().is_empty());
        assert!(sink.audio.lock().is_empty());

        clock.advance_ms(1);
        assert!(wait_for(|| sink.frames.lock().len() == 1 && sink.audio.lock().len() == 1));

        // The clock stands still, so delivery happened exactly at arrival + delay
        assert_eq!(pipeline.last_frame_ns(), 1_200_000_000);

        let video_pts = sink.frames.lock()[0].pts_ns;
        let audio_pts = sink.audio.lock()[0].1;
        assert_eq!(video_pts, 1_200_000_000);
        assert_eq!(audio_pts, video_pts);

        pipeline.stop();
    }

    #[test]
    fn test_port_conflict_fails_cleanly() {
        let held = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let result = Pipeline::start(
            PipelineSettings {
                video_port: port,
                audio_port: free_port(),
                delay_ms: 10,
            },
            Arc::new(RecordingSink::default()),
            MonotonicClock::shared(),
        );
        assert!(matches!(result, Err(NetworkError::BindFailed { .. })));
    }

    #[test]
    fn test_set_delay_and_health() {
        let mut pipeline = Pipeline::start(
            settings(),
            Arc::new(RecordingSink::default()),
            MonotonicClock::shared(),
        )
        .unwrap();

        pipeline.set_delay(100);
        assert_eq!(pipeline.settings().delay_ms, 100);
        assert_eq!(pipeline.stats().video_buffer.delay_ms, 100);

        let health = pipeline.health();
        assert!(health.streaming);
        assert_eq!(health.last_video_ns, 0);
        assert_eq!(health.started_ns, pipeline.started_ns());
    }
}
