//! C64 Ultimate Receiver Application
//!
//! Connects to a C64 Ultimate, receives its video and audio streams and
//! reports what arrives. Serves the status API while running.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use c64u_receiver::{
    clock::MonotonicClock,
    config::{AppConfig, SourceConfig},
    logging,
    sink::{AudioBlock, FrameSink},
    status::StatusServer,
    tasks::TokioTaskPool,
    C64Source,
};

const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Sink that counts deliveries and logs notable events
#[derive(Default)]
struct LoggingSink {
    frames: AtomicU64,
    audio_blocks: AtomicU64,
}

impl FrameSink for LoggingSink {
    fn push_video_frame(&self, _rgba: &[u8], _width: u32, _height: u32, _pts_ns: u64) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    fn push_audio_block(&self, _block: &AudioBlock<'_>) {
        self.audio_blocks.fetch_add(1, Ordering::Relaxed);
    }

    fn report_format(&self, width: u32, height: u32, fps: f64) {
        tracing::info!("Sink format: {}x{} @ {:.3} Hz", width, height, fps);
    }

    fn no_signal(&self) {
        tracing::warn!(
            "No signal ({} frames, {} audio blocks so far)",
            self.frames.load(Ordering::Relaxed),
            self.audio_blocks.load(Ordering::Relaxed)
        );
    }

    fn apply_settings(&self, config: &SourceConfig) {
        tracing::debug!("Sink settings: {:?}", config);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    tracing::info!("Starting C64 Ultimate Receiver");

    let path = AppConfig::path();
    let mut config = AppConfig::load_from(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.source.apply_env();

    println!("\n=== C64 Ultimate Receiver ===");
    println!("  Device: {}", config.source.device_host);
    println!("  Video port: {}", config.source.video_port);
    println!("  Audio port: {}", config.source.audio_port);
    println!("  Buffer delay: {} ms", config.source.effective_delay_ms());
    println!("  Config file: {}", path.display());
    println!();

    let sink = Arc::new(LoggingSink::default());
    let source = Arc::new(
        C64Source::open(
            config.source.clone(),
            sink,
            MonotonicClock::shared(),
            Arc::new(TokioTaskPool::current()),
        )
        .context("failed to open source")?,
    );

    let _status_handle = if config.status.enabled {
        let server = StatusServer::new(config.status.clone(), source.clone());
        tracing::info!(
            "Status API at http://{}:{}/api/status",
            config.status.bind_address,
            config.status.port
        );
        Some(server.start_background())
    } else {
        None
    };

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => source.tick(),
            _ = &mut shutdown => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    let closing = source.clone();
    tokio::task::spawn_blocking(move || closing.close())
        .await
        .context("close task failed")?;

    Ok(())
}
