//! Source statistics snapshot and the periodic rate summary

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

use super::pipeline::PipelineStats;
use crate::clock::ms_to_ns;
use crate::constants::STATS_INTERVAL_SECS;
use crate::video::FormatDescriptor;

/// Point-in-time view of a source
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub timestamp: DateTime<Utc>,
    pub streaming: bool,
    pub offline: bool,
    pub device_ip: Option<Ipv4Addr>,
    pub host_ip: Option<Ipv4Addr>,
    pub video_port: u16,
    pub audio_port: u16,
    pub delay_ms: u32,
    pub format: Option<FormatDescriptor>,
    pub retry_attempts: u64,
    pub retry_failures: u32,
    /// Zeroed while the pipeline is down
    pub pipeline: PipelineStats,
}

/// Rates over one reporting interval
#[derive(Debug, Clone, PartialEq)]
pub struct RateSummary {
    pub video_pps: f64,
    pub audio_pps: f64,
    pub mbps: f64,
    /// Sequence gaps over packets plus gaps, in percent
    pub loss_pct: f64,
    pub fps: f64,
    pub frame_drops: u64,
    pub duplicates: u64,
    pub video_fill: f32,
    pub audio_fill: f32,
}

impl fmt::Display for RateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "video {:.0} pkt/s, audio {:.0} pkt/s, {:.2} Mbps, loss {:.2}%, {:.2} fps, \
             drops {}, dups {}, jitter fill {:.0}%/{:.0}%",
            self.video_pps,
            self.audio_pps,
            self.mbps,
            self.loss_pct,
            self.fps,
            self.frame_drops,
            self.duplicates,
            self.video_fill * 100.0,
            self.audio_fill * 100.0
        )
    }
}

/// Produces a [`RateSummary`] once per interval
#[derive(Debug)]
pub struct StatsReporter {
    interval_ns: u64,
    last: Option<(u64, PipelineStats)>,
}

impl StatsReporter {
    pub fn new() -> Self {
        Self::with_interval_ns(ms_to_ns(STATS_INTERVAL_SECS * 1000))
    }

    pub fn with_interval_ns(interval_ns: u64) -> Self {
        Self {
            interval_ns,
            last: None,
        }
    }

    /// Forget the previous sample, e.g. after counters were reset
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Sample `stats`; returns a summary when an interval has elapsed
    pub fn poll(&mut self, now_ns: u64, stats: &PipelineStats) -> Option<RateSummary> {
        let Some((then, previous)) = &self.last else {
            self.last = Some((now_ns, stats.clone()));
            return None;
        };

        let elapsed_ns = now_ns.saturating_sub(*then);
        if elapsed_ns < self.interval_ns {
            return None;
        }

        let summary = summarize(previous, stats, elapsed_ns);
        self.last = Some((now_ns, stats.clone()));
        Some(summary)
    }
}

impl Default for StatsReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(previous: &PipelineStats, current: &PipelineStats, elapsed_ns: u64) -> RateSummary {
    let secs = elapsed_ns as f64 / 1e9;
    let delta = |now: u64, before: u64| now.saturating_sub(before);

    let video_packets = delta(current.video.packets, previous.video.packets);
    let audio_packets = delta(current.audio.packets, previous.audio.packets);
    let bytes = delta(current.video.bytes, previous.video.bytes)
        + delta(current.audio.bytes, previous.audio.bytes);
    let gaps = delta(current.assembler.seq_gaps, previous.assembler.seq_gaps)
        + delta(current.sink.audio_seq_gaps, previous.sink.audio_seq_gaps);
    let frames = delta(current.sink.video_frames, previous.sink.video_frames);

    let expected = video_packets + audio_packets + gaps;
    let loss_pct = if expected == 0 {
        0.0
    } else {
        gaps as f64 * 100.0 / expected as f64
    };

    RateSummary {
        video_pps: video_packets as f64 / secs,
        audio_pps: audio_packets as f64 / secs,
        mbps: bytes as f64 * 8.0 / secs / 1e6,
        loss_pct,
        fps: frames as f64 / secs,
        frame_drops: delta(current.assembler.frame_drops, previous.assembler.frame_drops),
        duplicates: delta(current.assembler.duplicates, previous.assembler.duplicates),
        video_fill: current.video_buffer.fill_level(),
        audio_fill: current.audio_buffer.fill_level(),
    }
}
