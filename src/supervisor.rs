//! Stream watchdog and retry scheduling
//!
//! The supervisor is polled from the coordinator's `tick`. It decides when
//! a retry should be queued; the retry itself runs on the task pool and
//! reports back through a [`RetryTicket`]. At most one retry is in flight.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::ms_to_ns;
use crate::constants::WATCHDOG_TIMEOUT_MS;

/// Exponential retry backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 100,
            factor: 1.3,
            cap_ms: 3000,
        }
    }
}

impl Backoff {
    /// Delay before the next retry after `failures` consecutive failures
    ///
    /// Each step multiplies and truncates to whole milliseconds.
    pub fn delay_ms(&self, failures: u32) -> u64 {
        let mut delay = self.base_ms;
        for _ in 0..failures {
            if delay >= self.cap_ms {
                break;
            }
            delay = (delay as f64 * self.factor) as u64;
        }
        delay.min(self.cap_ms)
    }

    pub fn delay_ns(&self, failures: u32) -> u64 {
        ms_to_ns(self.delay_ms(failures))
    }
}

/// Stream liveness as seen by the coordinator
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamHealth {
    pub streaming: bool,
    /// When the pipeline came up; stands in for packets not yet seen
    pub started_ns: u64,
    pub last_video_ns: u64,
    pub last_audio_ns: u64,
}

impl StreamHealth {
    /// Longest silence across both streams
    pub fn silence_ns(&self, now_ns: u64) -> u64 {
        let video = now_ns.saturating_sub(self.last_video_ns.max(self.started_ns));
        let audio = now_ns.saturating_sub(self.last_audio_ns.max(self.started_ns));
        video.max(audio)
    }
}

/// Why a retry was queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Pipeline is down; bring it up
    NotStreaming,
    /// Pipeline is up but a stream went silent
    Stalled,
}

/// Retry bookkeeping shared with the retry task
#[derive(Debug, Default)]
pub struct RetryState {
    in_flight: AtomicBool,
    failures: AtomicU32,
    attempts: AtomicU64,
}

impl RetryState {
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Consecutive failed retries
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Retries queued since the last reset
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.attempts.store(0, Ordering::Relaxed);
    }
}

/// Claim on the single in-flight retry; released on drop
#[derive(Debug)]
pub struct RetryTicket {
    state: Arc<RetryState>,
}

impl RetryTicket {
    fn claim(state: &Arc<RetryState>) -> Option<Self> {
        state
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        state.attempts.fetch_add(1, Ordering::Relaxed);
        Some(Self {
            state: state.clone(),
        })
    }

    /// The retry reached the device
    pub fn succeeded(self) {
        self.state.failures.store(0, Ordering::Relaxed);
    }

    /// The retry failed; lengthens the next backoff
    pub fn failed(self) -> u32 {
        self.state.failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Drop for RetryTicket {
    fn drop(&mut self) {
        self.state.in_flight.store(false, Ordering::Release);
    }
}

/// Decides when to queue retries
#[derive(Debug)]
pub struct Supervisor {
    backoff: Backoff,
    watchdog_ns: u64,
    state: Arc<RetryState>,
    last_retry_ns: Option<u64>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_backoff(Backoff::default())
    }

    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            backoff,
            watchdog_ns: ms_to_ns(WATCHDOG_TIMEOUT_MS),
            state: Arc::new(RetryState::default()),
            last_retry_ns: None,
        }
    }

    /// Shared retry bookkeeping
    pub fn state(&self) -> Arc<RetryState> {
        self.state.clone()
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Forget retry timing and failures, e.g. after a restart
    pub fn reset(&mut self) {
        self.last_retry_ns = None;
        self.state.reset();
    }

    /// Check the watchdog; returns a ticket when a retry should be queued
    ///
    /// The caller passes the ticket to the retry task, which reports the
    /// outcome on it. Dropping the ticket ends the in-flight retry.
    pub fn poll(&mut self, now_ns: u64, health: &StreamHealth) -> Option<(RetryReason, RetryTicket)> {
        let reason = if !health.streaming {
            RetryReason::NotStreaming
        } else if health.silence_ns(now_ns) > self.watchdog_ns {
            RetryReason::Stalled
        } else {
            // Packets are flowing
            if self.state.failures() != 0 {
                tracing::debug!("Streams healthy again, clearing retry backoff");
            }
            self.state.failures.store(0, Ordering::Relaxed);
            return None;
        };

        if self.state.in_flight() {
            return None;
        }

        let failures = self.state.failures();
        let delay_ns = self.backoff.delay_ns(failures);
        if let Some(last) = self.last_retry_ns {
            if now_ns.saturating_sub(last) < delay_ns {
                return None;
            }
        }

        let ticket = RetryTicket::claim(&self.state)?;
        let attempt = self.state.attempts();
        self.last_retry_ns = Some(now_ns);

        if attempt == 1 {
            tracing::info!("Queueing retry ({:?})", reason);
        } else {
            tracing::debug!(
                "Queueing retry {} ({:?}, {} consecutive failures, {} ms backoff)",
                attempt,
                reason,
                failures,
                delay_ns / 1_000_000
            );
        }

        Some((reason, ticket))
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn streaming(started_ns: u64, last_ns: u64) -> StreamHealth {
        StreamHealth {
            streaming: true,
            started_ns,
            last_video_ns: last_ns,
            last_audio_ns: last_ns,
        }
    }

    #[test]
    fn test_backoff_law() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..4).map(|k| backoff.delay_ms(k)).collect();
        assert_eq!(delays, vec![100, 130, 169, 219]);
        assert_eq!(backoff.delay_ms(13), 2997);
        assert_eq!(backoff.delay_ms(14), 3000);
        assert_eq!(backoff.delay_ms(u32::MAX), 3000);
    }

    #[test]
    fn test_not_streaming_retries_immediately() {
        let mut supervisor = Supervisor::new();
        let (reason, ticket) = supervisor.poll(0, &StreamHealth::default()).unwrap();
        assert_eq!(reason, RetryReason::NotStreaming);

        // Coalesced while in flight
        assert!(supervisor.poll(10 * MS, &StreamHealth::default()).is_none());
        drop(ticket);
        assert!(!supervisor.state().in_flight());

        // Backoff still applies
        assert!(supervisor.poll(99 * MS, &StreamHealth::default()).is_none());
        assert!(supervisor.poll(100 * MS, &StreamHealth::default()).is_some());
    }

    #[test]
    fn test_watchdog_enqueues_exactly_one_retry() {
        let mut supervisor = Supervisor::new();
        let health = streaming(0, 0);

        let mut queued = Vec::new();
        let mut t = 0;
        while t <= 2000 * MS {
            if let Some(retry) = supervisor.poll(t, &health) {
                queued.push(retry);
            }
            t += MS;
        }

        // Silent past 500 ms; the ticket is never returned so nothing else queues
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, RetryReason::Stalled);
        assert_eq!(supervisor.state().attempts(), 1);
    }

    #[test]
    fn test_healthy_streams_do_not_retry() {
        let mut supervisor = Supervisor::new();
        for step in 0..100u64 {
            let now = step * 10 * MS;
            assert!(supervisor.poll(now, &streaming(0, now)).is_none());
        }
        assert_eq!(supervisor.state().attempts(), 0);
    }

    #[test]
    fn test_probe_failures_back_off() {
        let mut supervisor = Supervisor::new();

        // Initial start succeeds at t = 0
        let (_, ticket) = supervisor.poll(0, &StreamHealth::default()).unwrap();
        ticket.succeeded();

        // Then the device goes quiet and every probe fails
        let health = streaming(0, 0);
        let mut retries = Vec::new();
        let mut t = 0;
        while retries.len() < 4 {
            t += MS;
            if let Some((reason, ticket)) = supervisor.poll(t, &health) {
                assert_eq!(reason, RetryReason::Stalled);
                retries.push(t);
                ticket.failed();
            }
        }

        let gaps: Vec<u64> = retries.windows(2).map(|w| (w[1] - w[0]) / MS).collect();
        assert_eq!(retries[0], 501 * MS);
        assert_eq!(gaps, vec![130, 169, 219]);
        assert_eq!(supervisor.state().failures(), 4);
    }

    #[test]
    fn test_delivery_resets_failures() {
        let mut supervisor = Supervisor::new();
        let (_, ticket) = supervisor.poll(0, &StreamHealth::default()).unwrap();
        ticket.failed();
        let (_, ticket) = supervisor.poll(130 * MS, &StreamHealth::default()).unwrap();
        ticket.failed();
        assert_eq!(supervisor.state().failures(), 2);

        // Packets arrive
        assert!(supervisor.poll(200 * MS, &streaming(150 * MS, 199 * MS)).is_none());
        assert_eq!(supervisor.state().failures(), 0);

        // Next stall uses the base delay again
        let stalled = streaming(150 * MS, 199 * MS);
        assert!(supervisor.poll(700 * MS, &stalled).is_some());
    }

    #[test]
    fn test_silence_uses_quieter_stream() {
        let health = StreamHealth {
            streaming: true,
            started_ns: 100,
            last_video_ns: 900,
            last_audio_ns: 0,
        };
        assert_eq!(health.silence_ns(1000), 900);
    }
}
