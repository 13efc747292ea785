//! Source lifecycle: open, update, tick and close
//!
//! The host drives a [`C64Source`] from its own thread. Nothing on that
//! path touches the network except `close`, which sends the stop commands;
//! resolution, probing and pipeline start-up run as retry tasks on the
//! host's task pool.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::pipeline::{Pipeline, PipelineSettings};
use super::stats::{SourceStats, StatsReporter};
use crate::clock::{ms_to_ns, SharedClock};
use crate::config::SourceConfig;
use crate::constants::{CONTROL_PORT, FRAME_TIMEOUT_MS};
use crate::error::{Error, NetworkError, Result};
use crate::logging;
use crate::network::{detect_local_ip, resolve_host, ControlClient};
use crate::sink::SharedSink;
use crate::supervisor::{Backoff, RetryReason, RetryTicket, Supervisor};
use crate::tasks::SharedTaskPool;
use crate::video::palette;

/// Resolved device and advertised addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    /// `0.0.0.0` in offline mode
    pub device_ip: Ipv4Addr,
    /// Address the device is told to stream to
    pub host_ip: Ipv4Addr,
}

/// Tunables that are not part of the user configuration
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub control_port: u16,
    pub backoff: Backoff,
    /// Override of the two TCP probe deadlines
    pub probe_timeouts: Option<(Duration, Duration)>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            control_port: CONTROL_PORT,
            backoff: Backoff::default(),
            probe_timeouts: None,
        }
    }
}

/// State shared with retry tasks
struct SourceShared {
    config: RwLock<SourceConfig>,
    sink: SharedSink,
    clock: SharedClock,
    tasks: SharedTaskPool,
    options: SourceOptions,
    pipeline: Mutex<Option<Pipeline>>,
    /// Resolution cache, cleared when endpoint settings change
    endpoints: Mutex<Option<Endpoints>>,
    /// Device that must be told to stop before the next start
    pending_stop: Mutex<Option<Ipv4Addr>>,
    /// Held while start or stop commands are on the wire
    control: Mutex<()>,
    /// Bumped whenever ports or endpoints change; stale retries give up
    generation: AtomicU64,
    closed: AtomicBool,
}

impl SourceShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a retry started at `generation` may still command the device
    fn is_current(&self, generation: u64) -> bool {
        !self.is_closed() && self.generation.load(Ordering::SeqCst) == generation
    }

    fn control_client(&self, device_ip: Ipv4Addr) -> ControlClient {
        let client = ControlClient::with_port(device_ip, self.options.control_port);
        match self.options.probe_timeouts {
            Some((short, long)) => client.with_probe_timeouts(short, long),
            None => client,
        }
    }

    /// Cached endpoints, resolving them first if needed
    fn resolve_endpoints(&self, config: &SourceConfig) -> std::result::Result<Endpoints, NetworkError> {
        if let Some(endpoints) = *self.endpoints.lock() {
            return Ok(endpoints);
        }
        let generation = self.generation.load(Ordering::SeqCst);

        let device_ip = if config.is_offline() {
            Ipv4Addr::UNSPECIFIED
        } else {
            resolve_host(config.host(), config.dns_server())?
        };
        let host_ip = match config.manual_host_ip() {
            Some(ip) => ip,
            None => detect_local_ip(Some(device_ip)),
        };
        let endpoints = Endpoints { device_ip, host_ip };

        if self.generation.load(Ordering::SeqCst) == generation {
            *self.endpoints.lock() = Some(endpoints);
        }
        tracing::info!(
            "Device {} at {}, streaming to {}",
            config.host(),
            device_ip,
            host_ip
        );
        Ok(endpoints)
    }
}

/// Ends a no-signal episode when a newer frame arrives
#[derive(Debug)]
struct NoSignalTracker {
    timeout_ns: u64,
    reported_for: Option<u64>,
}

impl NoSignalTracker {
    fn new() -> Self {
        Self {
            timeout_ns: ms_to_ns(FRAME_TIMEOUT_MS),
            reported_for: None,
        }
    }

    /// True once per starvation episode; `reference_ns` is the newest frame or start time
    fn check(&mut self, now_ns: u64, reference_ns: u64) -> bool {
        if now_ns.saturating_sub(reference_ns) <= self.timeout_ns
            || self.reported_for == Some(reference_ns)
        {
            return false;
        }
        self.reported_for = Some(reference_ns);
        true
    }

    fn reset(&mut self) {
        self.reported_for = None;
    }
}

/// State touched only from the host thread
struct HostState {
    supervisor: Supervisor,
    reporter: StatsReporter,
    no_signal: NoSignalTracker,
    /// Open or teardown time; starvation reference while no pipeline runs
    idle_since_ns: u64,
}

impl HostState {
    fn reset(&mut self, now_ns: u64) {
        self.supervisor.reset();
        self.reporter.reset();
        self.no_signal.reset();
        self.idle_since_ns = now_ns;
    }
}

/// A C64 Ultimate video/audio source
pub struct C64Source {
    shared: Arc<SourceShared>,
    host: Mutex<HostState>,
}

impl C64Source {
    /// Create a source and queue its first connection attempt
    ///
    /// Never blocks on the network.
    pub fn open(
        config: SourceConfig,
        sink: SharedSink,
        clock: SharedClock,
        tasks: SharedTaskPool,
    ) -> Result<Self> {
        Self::open_with(config, sink, clock, tasks, SourceOptions::default())
    }

    /// [`open`](Self::open) with non-default tunables
    pub fn open_with(
        config: SourceConfig,
        sink: SharedSink,
        clock: SharedClock,
        tasks: SharedTaskPool,
        options: SourceOptions,
    ) -> Result<Self> {
        config.validate()?;
        palette::lut();
        logging::set_debug(config.debug_logging);
        sink.apply_settings(&config);

        tracing::info!(
            "Opening source for {} (video :{}, audio :{}, delay {} ms){}",
            config.host(),
            config.video_port,
            config.audio_port,
            config.effective_delay_ms(),
            if config.is_offline() { ", offline" } else { "" }
        );

        let host = HostState {
            supervisor: Supervisor::with_backoff(options.backoff),
            reporter: StatsReporter::new(),
            no_signal: NoSignalTracker::new(),
            idle_since_ns: clock.now_ns(),
        };

        let source = Self {
            shared: Arc::new(SourceShared {
                config: RwLock::new(config),
                sink,
                clock,
                tasks,
                options,
                pipeline: Mutex::new(None),
                endpoints: Mutex::new(None),
                pending_stop: Mutex::new(None),
                control: Mutex::new(()),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            host: Mutex::new(host),
        };

        source.tick();
        Ok(source)
    }

    /// Currently applied configuration
    pub fn config(&self) -> SourceConfig {
        self.shared.config.read().clone()
    }

    /// Resolved endpoints, once a retry has resolved them
    pub fn endpoints(&self) -> Option<Endpoints> {
        *self.shared.endpoints.lock()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.pipeline.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Apply a new configuration
    ///
    /// Port or endpoint changes restart a running pipeline; the delay, log
    /// level and sink settings are always re-applied.
    pub fn update(&self, config: SourceConfig) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        config.validate()?;

        let diff = {
            let mut current = self.shared.config.write();
            let diff = config.diff(&current);
            *current = config.clone();
            diff
        };

        if diff.ports || diff.endpoints {
            let known = if diff.endpoints {
                self.shared.endpoints.lock().take()
            } else {
                *self.shared.endpoints.lock()
            };
            self.shared.generation.fetch_add(1, Ordering::SeqCst);

            let stopped = self.shared.pipeline.lock().take();
            if let Some(mut pipeline) = stopped {
                tracing::info!("Ports or device changed, restarting pipeline");
                pipeline.stop();
                if let Some(endpoints) = known.filter(|e| !e.device_ip.is_unspecified()) {
                    *self.shared.pending_stop.lock() = Some(endpoints.device_ip);
                }
                self.host.lock().reset(self.shared.clock.now_ns());
            }
        }

        if let Some(pipeline) = self.shared.pipeline.lock().as_mut() {
            pipeline.set_delay(config.effective_delay_ms());
        }
        logging::set_debug(config.debug_logging);
        self.shared.sink.apply_settings(&config);

        if !diff.is_empty() {
            tracing::info!("Configuration updated: {:?}", diff);
        }
        Ok(())
    }

    /// Periodic housekeeping from the host thread
    ///
    /// Queues retries, reports no-signal and logs statistics.
    pub fn tick(&self) {
        if self.is_closed() {
            return;
        }
        let now_ns = self.shared.clock.now_ns();
        let mut host = self.host.lock();

        let snapshot = {
            let mut pipeline = self.shared.pipeline.lock();
            if pipeline.as_ref().is_some_and(|p| !p.is_running()) {
                tracing::warn!("Pipeline thread exited, tearing down for restart");
                pipeline.take();
                host.reset(now_ns);
            }
            pipeline
                .as_ref()
                .map(|p| (p.health(), p.last_frame_ns(), p.stats()))
        };

        let health = snapshot.as_ref().map(|s| s.0).unwrap_or_default();
        if let Some((reason, ticket)) = host.supervisor.poll(now_ns, &health) {
            let shared = self.shared.clone();
            self.shared
                .tasks
                .spawn(Box::new(move || run_retry(shared, reason, ticket)));
        }

        let reference_ns = match &snapshot {
            Some((health, last_frame_ns, _)) => (*last_frame_ns).max(health.started_ns),
            None => host.idle_since_ns,
        };
        if host.no_signal.check(now_ns, reference_ns) {
            tracing::info!("No video signal");
            self.shared.sink.no_signal();
        }

        if let Some((_, _, stats)) = &snapshot {
            if let Some(summary) = host.reporter.poll(now_ns, stats) {
                tracing::info!("{}", summary);
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> SourceStats {
        let retry = self.host.lock().supervisor.state();
        let config = self.config();
        let endpoints = self.endpoints();
        let pipeline = self.shared.pipeline.lock();

        SourceStats {
            timestamp: chrono::Utc::now(),
            streaming: pipeline.is_some(),
            offline: config.is_offline(),
            device_ip: endpoints.map(|e| e.device_ip),
            host_ip: endpoints.map(|e| e.host_ip),
            video_port: config.video_port,
            audio_port: config.audio_port,
            delay_ms: config.effective_delay_ms(),
            format: pipeline.as_ref().and_then(|p| p.format()),
            retry_attempts: retry.attempts(),
            retry_failures: retry.failures(),
            pipeline: pipeline.as_ref().map(|p| p.stats()).unwrap_or_default(),
        }
    }

    /// Stop streaming and release everything; safe to call repeatedly
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let stopped = self.shared.pipeline.lock().take();
        if let Some(mut pipeline) = stopped {
            pipeline.stop();
            let _control = self.shared.control.lock();
            if let Some(endpoints) = *self.shared.endpoints.lock() {
                let control = self.shared.control_client(endpoints.device_ip);
                if let Err(e) = control.stop_streams() {
                    tracing::warn!("Failed to send stop commands: {}", e);
                }
            }
        }
        self.shared.endpoints.lock().take();
        tracing::info!("Source closed");
    }
}

impl Drop for C64Source {
    fn drop(&mut self) {
        self.close();
    }
}

/// Body of a retry task
fn run_retry(shared: Arc<SourceShared>, reason: RetryReason, ticket: RetryTicket) {
    if shared.is_closed() {
        return;
    }
    tracing::debug!("Retry running ({:?})", reason);

    let generation = shared.generation.load(Ordering::SeqCst);
    let config = shared.config.read().clone();

    let endpoints = match shared.resolve_endpoints(&config) {
        Ok(endpoints) => endpoints,
        Err(e) => {
            let failures = ticket.failed();
            tracing::warn!("{} ({} consecutive failures)", e, failures);
            return;
        }
    };
    let control = shared.control_client(endpoints.device_ip);

    let mut pipeline = shared.pipeline.lock();
    if shared.is_closed() || shared.generation.load(Ordering::SeqCst) != generation {
        tracing::debug!("Retry superseded by a configuration change");
        return;
    }

    if pipeline.is_none() {
        let settings = PipelineSettings {
            video_port: config.video_port,
            audio_port: config.audio_port,
            delay_ms: config.effective_delay_ms(),
        };
        match Pipeline::start(settings, shared.sink.clone(), shared.clock.clone()) {
            Ok(started) => *pipeline = Some(started),
            Err(e) => {
                tracing::error!("Failed to start pipeline: {}", e);
                ticket.failed();
                return;
            }
        }
        drop(pipeline);

        let _control = shared.control.lock();
        if !shared.is_current(generation) {
            tracing::debug!("Retry superseded before start commands");
            return;
        }
        if let Some(previous) = shared.pending_stop.lock().take() {
            if let Err(e) = shared.control_client(previous).stop_streams() {
                tracing::warn!("Failed to stop streams on {}: {}", previous, e);
            }
        }
        if let Err(e) = control.start_streams(endpoints.host_ip, config.video_port, config.audio_port) {
            tracing::warn!("Failed to send start commands: {}", e);
        }
        // Sockets are up; a silent device is the watchdog's business
        ticket.succeeded();
        return;
    }
    drop(pipeline);

    if control.is_offline() {
        ticket.failed();
        return;
    }

    match control.probe() {
        Ok(()) => {
            let _control = shared.control.lock();
            if !shared.is_current(generation) {
                return;
            }
            match control.start_streams(endpoints.host_ip, config.video_port, config.audio_port) {
                Ok(()) => ticket.succeeded(),
                Err(e) => {
                    let failures = ticket.failed();
                    tracing::warn!(
                        "Failed to send start commands: {} ({} consecutive failures)",
                        e,
                        failures
                    );
                }
            }
        }
        Err(e) => {
            let failures = ticket.failed();
            tracing::debug!(
                "Device {} not reachable: {} ({} consecutive failures)",
                endpoints.device_ip,
                e,
                failures
            );
        }
    }
}
