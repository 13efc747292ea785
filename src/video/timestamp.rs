//! Drift-free presentation timestamps
//!
//! The first delivered frame anchors `(t0, f0)`. Every later frame is
//! stamped `t0 + (frame - f0) * interval`, where the frame distance is
//! accumulated from signed 16-bit steps so that counter wraparound does
//! not disturb the sequence.

use crate::protocol::seq_diff;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    t0_ns: u64,
    f0: u16,
    last_frame: u16,
    /// Frames elapsed since `f0`, unwrapped
    offset: i64,
}

/// Presentation timestamp generator for one video stream
#[derive(Debug, Clone)]
pub struct TimestampGenerator {
    interval_ns: u64,
    anchor: Option<Anchor>,
}

impl TimestampGenerator {
    pub fn new(interval_ns: u64) -> Self {
        Self {
            interval_ns,
            anchor: None,
        }
    }

    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    /// Change the frame interval; a new interval drops the anchor
    pub fn set_interval(&mut self, interval_ns: u64) {
        if interval_ns != self.interval_ns {
            self.interval_ns = interval_ns;
            self.anchor = None;
        }
    }

    /// Forget the anchor; the next frame re-anchors at its arrival time
    pub fn reset(&mut self) {
        self.anchor = None;
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Anchor frame number, if anchored
    pub fn anchor_frame(&self) -> Option<u16> {
        self.anchor.map(|a| a.f0)
    }

    /// Timestamp for `frame_num`, anchoring at `now_ns` if needed
    pub fn stamp(&mut self, frame_num: u16, now_ns: u64) -> u64 {
        let interval = self.interval_ns;
        match self.anchor.as_mut() {
            None => self.anchor_at(frame_num, now_ns),
            Some(anchor) => {
                anchor.offset += seq_diff(frame_num, anchor.last_frame) as i64;
                anchor.last_frame = frame_num;
                if anchor.offset < 0 {
                    // Frame counter went behind the anchor
                    return self.anchor_at(frame_num, now_ns);
                }
                anchor.t0_ns + anchor.offset as u64 * interval
            }
        }
    }

    fn anchor_at(&mut self, frame_num: u16, now_ns: u64) -> u64 {
        self.anchor = Some(Anchor {
            t0_ns: now_ns,
            f0: frame_num,
            last_frame: frame_num,
            offset: 0,
        });
        now_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAL_NS: u64 = 19_950_124;

    #[test]
    fn test_first_frame_anchors_at_now() {
        let mut ts = TimestampGenerator::new(PAL_NS);
        assert_eq!(ts.stamp(17, 5_000), 5_000);
        assert_eq!(ts.anchor_frame(), Some(17));
    }

    #[test]
    fn test_ignores_arrival_jitter() {
        let mut ts = TimestampGenerator::new(PAL_NS);
        let t0 = ts.stamp(0, 1_000_000);
        assert_eq!(ts.stamp(1, 1_000_000 + 25_000_000), t0 + PAL_NS);
        assert_eq!(ts.stamp(2, 1_000_000 + 31_000_000), t0 + 2 * PAL_NS);
        // Skipped frames advance by the gap
        assert_eq!(ts.stamp(5, 0), t0 + 5 * PAL_NS);
    }

    #[test]
    fn test_wraparound_keeps_counting() {
        let mut ts = TimestampGenerator::new(PAL_NS);
        let t0 = ts.stamp(65534, 10);
        assert_eq!(ts.stamp(65535, 0), t0 + PAL_NS);
        assert_eq!(ts.stamp(0, 0), t0 + 2 * PAL_NS);
        assert_eq!(ts.stamp(1, 0), t0 + 3 * PAL_NS);
    }

    #[test]
    fn test_long_run_past_half_range() {
        let mut ts = TimestampGenerator::new(PAL_NS);
        let t0 = ts.stamp(0, 0);
        let mut frame = 0u16;
        for _ in 0..40_000u32 {
            frame = frame.wrapping_add(1);
            ts.stamp(frame, 0);
        }
        assert_eq!(ts.stamp(frame.wrapping_add(1), 0), t0 + 40_001 * PAL_NS);
    }

    #[test]
    fn test_interval_change_reanchors() {
        let mut ts = TimestampGenerator::new(PAL_NS);
        ts.stamp(0, 100);
        ts.set_interval(16_710_875);
        assert!(!ts.is_anchored());
        assert_eq!(ts.stamp(1, 900), 900);
        assert_eq!(ts.stamp(2, 0), 900 + 16_710_875);
    }
}
