//! Per-stream UDP receiver threads
//!
//! Each stream gets a dedicated OS thread that does nothing but receive,
//! stamp, count and enqueue. Decoding happens downstream so the hot loop
//! stays short enough to keep up with the video packet rate.

use bytes::Bytes;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::buffer::SharedJitterBuffer;
use crate::clock::SharedClock;
use crate::error::NetworkError;
use crate::protocol::packet::{AUDIO_PACKET_SIZE, VIDEO_PACKET_SIZE};
use crate::protocol::StreamId;

/// Large enough for any datagram we expect, so oversize ones are detected
const RECV_BUFFER_LEN: usize = 2048;

/// Receiver counters, written by the receiver thread only
#[derive(Debug, Default)]
pub struct ReceiverCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
    invalid: AtomicU64,
    /// Arrival time of the newest packet, 0 if none yet
    last_packet_ns: AtomicU64,
}

impl ReceiverCounters {
    /// Get a point-in-time copy
    pub fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            last_packet_ns: self.last_packet_ns.load(Ordering::Acquire),
        }
    }

    /// Arrival time of the newest packet, 0 if none yet
    pub fn last_packet_ns(&self) -> u64 {
        self.last_packet_ns.load(Ordering::Acquire)
    }

    fn record(&self, len: usize, now_ns: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.last_packet_ns.store(now_ns, Ordering::Release);
    }
}

/// Receiver statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReceiverStats {
    pub packets: u64,
    pub bytes: u64,
    /// Datagrams of the wrong size
    pub invalid: u64,
    pub last_packet_ns: u64,
}

/// Datagram size for a stream
pub fn expected_packet_size(stream: StreamId) -> usize {
    match stream {
        StreamId::Video => VIDEO_PACKET_SIZE,
        StreamId::Audio => AUDIO_PACKET_SIZE,
    }
}

/// A running receiver thread
pub struct StreamReceiver {
    stream: StreamId,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    counters: Arc<ReceiverCounters>,
}

impl StreamReceiver {
    /// Spawn a receiver thread that owns `socket`
    ///
    /// The socket must be non-blocking.
    pub fn spawn(
        stream: StreamId,
        socket: UdpSocket,
        buffer: SharedJitterBuffer,
        clock: SharedClock,
        counters: Arc<ReceiverCounters>,
    ) -> Result<Self, NetworkError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let counters_for_loop = counters.clone();

        let handle = thread::Builder::new()
            .name(format!("c64u-{}-recv", stream))
            .spawn(move || {
                receive_loop(
                    stream,
                    socket,
                    buffer,
                    clock,
                    counters_for_loop,
                    &running_for_loop,
                );
                running_for_loop.store(false, Ordering::SeqCst);
            })
            .map_err(|e| NetworkError::Spawn(e.to_string()))?;

        Ok(Self {
            stream,
            running,
            thread_handle: Some(handle),
            counters,
        })
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Whether the thread is still receiving
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get shared counters
    pub fn counters(&self) -> Arc<ReceiverCounters> {
        self.counters.clone()
    }

    /// Signal the thread and wait for it; the socket is closed on exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("{} receiver thread panicked", self.stream);
            }
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    stream: StreamId,
    socket: UdpSocket,
    buffer: SharedJitterBuffer,
    clock: SharedClock,
    counters: Arc<ReceiverCounters>,
    running: &AtomicBool,
) {
    platform::raise_thread_priority();
    let _timer = platform::TimerResolution::acquire();

    let expected = expected_packet_size(stream);
    let mut buf = [0u8; RECV_BUFFER_LEN];

    tracing::debug!(
        "{} receiver started on {:?}",
        stream,
        socket.local_addr().ok()
    );

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => {
                let now_ns = clock.now_ns();
                if len != expected {
                    counters.invalid.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                counters.record(len, now_ns);
                buffer.push(Bytes::copy_from_slice(&buf[..len]), now_ns);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => platform::idle(),
            // ICMP port-unreachable echoes surface as resets on some platforms
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::ConnectionReset) => {}
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    tracing::error!("{} receiver socket error: {}", stream, e);
                }
                break;
            }
        }
    }

    tracing::debug!("{} receiver stopped", stream);
}

#[cfg(windows)]
mod platform {
    use windows::Win32::Media::{timeBeginPeriod, timeEndPeriod};
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
    };

    /// 1 ms timer resolution for the lifetime of the guard
    pub struct TimerResolution;

    impl TimerResolution {
        pub fn acquire() -> Self {
            unsafe {
                timeBeginPeriod(1);
            }
            Self
        }
    }

    impl Drop for TimerResolution {
        fn drop(&mut self) {
            unsafe {
                timeEndPeriod(1);
            }
        }
    }

    pub fn raise_thread_priority() {
        unsafe {
            let _ = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL);
        }
    }

    pub fn idle() {
        std::thread::yield_now();
    }
}

#[cfg(not(windows))]
mod platform {
    use std::time::Duration;

    pub struct TimerResolution;

    impl TimerResolution {
        pub fn acquire() -> Self {
            Self
        }
    }

    pub fn raise_thread_priority() {}

    pub fn idle() {
        std::thread::sleep(Duration::from_millis(1));
    }
}
