//! Frame assembly from video packets
//!
//! Packets are slotted by `line / lines_per_packet`. A frame is complete
//! once the last-packet flag has fixed the expected count and every slot
//! below it is filled. Completed frames are decoded into a reusable RGBA
//! buffer and stamped; incomplete frames are dropped when superseded by a
//! newer frame or when they outlive the frame timeout.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::format::FormatDescriptor;
use super::palette::{lut, RGBA_BYTES_PER_LINE};
use super::timestamp::TimestampGenerator;
use crate::clock::ms_to_ns;
use crate::constants::FRAME_TIMEOUT_MS;
use crate::error::ProtocolError;
use crate::protocol::packet::{VideoPacket, BYTES_PER_LINE, LINES_PER_PACKET};
use crate::protocol::seq_diff;

/// Packet slots per frame (PAL: 272 lines / 4)
pub const MAX_PACKETS_PER_FRAME: usize = 68;

/// A frame this far behind the last delivered one means the device restarted its counter
const FRAME_RESYNC_WINDOW: i16 = 64;

/// A sequence number this far behind means the device restarted its counter
const SEQ_RESYNC_WINDOW: i16 = 1024;

/// Assembler counters, written by the assembler thread only
#[derive(Debug, Default)]
pub struct AssemblerCounters {
    packets: AtomicU64,
    frames_completed: AtomicU64,
    frame_drops: AtomicU64,
    duplicates: AtomicU64,
    late_duplicates: AtomicU64,
    stale_packets: AtomicU64,
    reorders: AtomicU64,
    seq_gaps: AtomicU64,
    rejected: AtomicU64,
    format_changes: AtomicU64,
}

impl AssemblerCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Get a point-in-time copy
    pub fn snapshot(&self) -> AssemblerStats {
        AssemblerStats {
            packets: self.packets.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frame_drops: self.frame_drops.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late_duplicates: self.late_duplicates.load(Ordering::Relaxed),
            stale_packets: self.stale_packets.load(Ordering::Relaxed),
            reorders: self.reorders.load(Ordering::Relaxed),
            seq_gaps: self.seq_gaps.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            format_changes: self.format_changes.load(Ordering::Relaxed),
        }
    }
}

/// Assembler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblerStats {
    pub packets: u64,
    pub frames_completed: u64,
    pub frame_drops: u64,
    /// Extra copies of a packet, including late ones
    pub duplicates: u64,
    /// Copies arriving after their frame was delivered
    pub late_duplicates: u64,
    /// Packets for frames older than the last delivered one
    pub stale_packets: u64,
    pub reorders: u64,
    pub seq_gaps: u64,
    pub rejected: u64,
    pub format_changes: u64,
}

#[derive(Debug)]
struct PacketSlot {
    line_start: u16,
    payload: Bytes,
}

/// In-flight state for one frame
#[derive(Debug)]
pub struct FrameAssembly {
    frame_num: u16,
    /// Zero until the last packet has been seen
    expected_packets: u16,
    received_bitmask: u128,
    received_count: u16,
    slots: Vec<Option<PacketSlot>>,
    start_time_ns: u64,
    format: Option<FormatDescriptor>,
}

impl FrameAssembly {
    fn new(frame_num: u16, start_time_ns: u64) -> Self {
        let mut slots = Vec::with_capacity(MAX_PACKETS_PER_FRAME);
        slots.resize_with(MAX_PACKETS_PER_FRAME, || None);
        Self {
            frame_num,
            expected_packets: 0,
            received_bitmask: 0,
            received_count: 0,
            slots,
            start_time_ns,
            format: None,
        }
    }

    fn mask(expected: u16) -> u128 {
        if expected as usize >= 128 {
            u128::MAX
        } else {
            (1u128 << expected) - 1
        }
    }

    pub fn frame_num(&self) -> u16 {
        self.frame_num
    }

    pub fn expected_packets(&self) -> u16 {
        self.expected_packets
    }

    pub fn received_bitmask(&self) -> u128 {
        self.received_bitmask
    }

    pub fn received_count(&self) -> u16 {
        self.received_count
    }

    pub fn start_time_ns(&self) -> u64 {
        self.start_time_ns
    }

    /// Expected count is known and every slot below it is filled
    pub fn is_complete(&self) -> bool {
        let mask = Self::mask(self.expected_packets);
        self.expected_packets != 0 && self.received_bitmask & mask == mask
    }
}

/// A decoded frame borrowed from the assembler's frame buffer
#[derive(Debug)]
pub struct CompletedFrame<'a> {
    pub frame_num: u16,
    pub rgba: &'a [u8],
    pub format: FormatDescriptor,
    /// First frame, or geometry/timing differs from the previous frame
    pub format_changed: bool,
    pub pts_ns: u64,
}

/// Result of feeding one packet
#[derive(Debug)]
pub enum PushOutcome<'a> {
    /// Stored; frame not complete yet
    Accumulating,
    /// Frame completed and decoded
    Frame(CompletedFrame<'a>),
    /// Slot already filled for the current frame
    Duplicate,
    /// Packet for an already delivered or older frame
    Late,
    /// Packet failed validation
    Rejected(ProtocolError),
}

/// Reassembles video frames from packets
pub struct FrameAssembler {
    current: Option<FrameAssembly>,
    last_seq: Option<u16>,
    last_delivered: Option<u16>,
    format: Option<FormatDescriptor>,
    frame_buffer: Vec<u8>,
    timestamps: TimestampGenerator,
    timeout_ns: u64,
    counters: Arc<AssemblerCounters>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(AssemblerCounters::default()))
    }

    /// Create an assembler reporting into shared counters
    pub fn with_counters(counters: Arc<AssemblerCounters>) -> Self {
        Self {
            current: None,
            last_seq: None,
            last_delivered: None,
            format: None,
            frame_buffer: Vec::new(),
            timestamps: TimestampGenerator::new(FormatDescriptor::PAL.frame_interval_ns),
            timeout_ns: ms_to_ns(FRAME_TIMEOUT_MS),
            counters,
        }
    }

    /// Get shared counters
    pub fn counters(&self) -> Arc<AssemblerCounters> {
        self.counters.clone()
    }

    /// Get statistics
    pub fn stats(&self) -> AssemblerStats {
        self.counters.snapshot()
    }

    /// Format of the last delivered frame
    pub fn format(&self) -> Option<FormatDescriptor> {
        self.format
    }

    /// Frame currently being assembled
    pub fn current(&self) -> Option<&FrameAssembly> {
        self.current.as_ref()
    }

    pub fn last_delivered(&self) -> Option<u16> {
        self.last_delivered
    }

    /// Parse a raw datagram and feed it
    pub fn push_datagram(&mut self, datagram: Bytes, now_ns: u64) -> PushOutcome<'_> {
        match VideoPacket::parse(datagram) {
            Ok(packet) => self.push(packet, now_ns),
            Err(e) => {
                AssemblerCounters::bump(&self.counters.rejected, 1);
                tracing::debug!("Rejected video packet: {}", e);
                PushOutcome::Rejected(e)
            }
        }
    }

    /// Feed one validated packet
    pub fn push(&mut self, packet: VideoPacket, now_ns: u64) -> PushOutcome<'_> {
        let header = packet.header;
        AssemblerCounters::bump(&self.counters.packets, 1);
        self.track_sequence(header.seq);

        let index = header.packet_index();
        if index >= MAX_PACKETS_PER_FRAME {
            AssemblerCounters::bump(&self.counters.rejected, 1);
            return PushOutcome::Rejected(ProtocolError::IndexOutOfRange(index));
        }

        // Packets for frames at or behind the last delivery
        if let Some(last) = self.last_delivered {
            let diff = seq_diff(header.frame, last);
            if diff == 0 {
                AssemblerCounters::bump(&self.counters.duplicates, 1);
                AssemblerCounters::bump(&self.counters.late_duplicates, 1);
                return PushOutcome::Late;
            }
            if diff < 0 {
                if diff >= -FRAME_RESYNC_WINDOW {
                    AssemblerCounters::bump(&self.counters.stale_packets, 1);
                    return PushOutcome::Late;
                }
                tracing::info!(
                    "Frame counter jumped from {} to {}, resynchronizing",
                    last,
                    header.frame
                );
                self.last_delivered = None;
                self.timestamps.reset();
            }
        }

        // A new frame number supersedes the current assembly
        if let Some(current) = &self.current {
            if current.frame_num != header.frame {
                tracing::debug!(
                    "Abandoning frame {} ({}/{} packets) for frame {}",
                    current.frame_num,
                    current.received_count,
                    current.expected_packets,
                    header.frame
                );
                AssemblerCounters::bump(&self.counters.frame_drops, 1);
                self.current = None;
            }
        }

        let assembly = self
            .current
            .get_or_insert_with(|| FrameAssembly::new(header.frame, now_ns));

        let bit = 1u128 << index;
        if assembly.received_bitmask & bit != 0 {
            AssemblerCounters::bump(&self.counters.duplicates, 1);
            return PushOutcome::Duplicate;
        }

        assembly.slots[index] = Some(PacketSlot {
            line_start: header.line_start(),
            payload: packet.payload,
        });
        assembly.received_bitmask |= bit;
        assembly.received_count += 1;

        if header.is_last() && assembly.expected_packets == 0 {
            assembly.expected_packets = index as u16 + 1;
            assembly.format = Some(FormatDescriptor::from_last_line(header.line_start()));
        }

        if !assembly.is_complete() {
            return PushOutcome::Accumulating;
        }

        match self.current.take() {
            Some(assembly) => PushOutcome::Frame(self.deliver(assembly, now_ns)),
            None => PushOutcome::Accumulating,
        }
    }

    /// Drop the current assembly if it has outlived the frame timeout
    ///
    /// Returns true when a frame was dropped.
    pub fn poll_timeout(&mut self, now_ns: u64) -> bool {
        let expired = self
            .current
            .as_ref()
            .map(|a| now_ns.saturating_sub(a.start_time_ns) > self.timeout_ns)
            .unwrap_or(false);

        if expired {
            if let Some(assembly) = self.current.take() {
                tracing::debug!(
                    "Frame {} timed out with {}/{} packets",
                    assembly.frame_num,
                    assembly.received_count,
                    assembly.expected_packets
                );
            }
            AssemblerCounters::bump(&self.counters.frame_drops, 1);
        }
        expired
    }

    fn track_sequence(&mut self, seq: u16) {
        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            return;
        };

        let diff = seq_diff(seq, last.wrapping_add(1));
        if diff > 0 {
            AssemblerCounters::bump(&self.counters.seq_gaps, diff as u64);
            tracing::debug!("Video sequence gap: expected {}, got {}", last.wrapping_add(1), seq);
            self.last_seq = Some(seq);
        } else if diff < -SEQ_RESYNC_WINDOW {
            self.last_seq = Some(seq);
        } else if diff < 0 {
            AssemblerCounters::bump(&self.counters.reorders, 1);
        } else {
            self.last_seq = Some(seq);
        }
    }

    fn deliver(&mut self, assembly: FrameAssembly, now_ns: u64) -> CompletedFrame<'_> {
        let format = assembly.format.unwrap_or_else(|| {
            FormatDescriptor::from_height(
                assembly.expected_packets as u32 * LINES_PER_PACKET as u32,
            )
        });

        let format_changed = self.format != Some(format);
        if format_changed {
            if let Some(previous) = self.format {
                AssemblerCounters::bump(&self.counters.format_changes, 1);
                tracing::info!("Video format changed: {} -> {}", previous, format);
            } else {
                tracing::info!("Video format detected: {}", format);
            }
            self.format = Some(format);
            self.frame_buffer.clear();
            self.frame_buffer.resize(format.rgba_len(), 0);
            self.timestamps.set_interval(format.frame_interval_ns);
            self.timestamps.reset();
        }

        let height = format.height as usize;
        let table = lut();
        let expected = assembly.expected_packets as usize;

        // Slots are visited in ascending line order
        for slot in assembly.slots.iter().take(expected).flatten() {
            for line in 0..LINES_PER_PACKET as usize {
                let row = slot.line_start as usize + line;
                if row >= height {
                    break;
                }
                let src = &slot.payload[line * BYTES_PER_LINE..(line + 1) * BYTES_PER_LINE];
                let dst = &mut self.frame_buffer
                    [row * RGBA_BYTES_PER_LINE..(row + 1) * RGBA_BYTES_PER_LINE];
                table.decode_line(src, dst);
            }
        }

        let pts_ns = self.timestamps.stamp(assembly.frame_num, now_ns);
        self.last_delivered = Some(assembly.frame_num);
        AssemblerCounters::bump(&self.counters.frames_completed, 1);

        CompletedFrame {
            frame_num: assembly.frame_num,
            rgba: &self.frame_buffer,
            format,
            format_changed,
            pts_ns,
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
