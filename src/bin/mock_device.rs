//! C64 Ultimate Simulator
//!
//! Accepts start/stop commands on the control port and streams colour-bar
//! video and a 440 Hz tone to the advertised address, with optional packet
//! loss, duplication and reordering.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use c64u_receiver::{
    constants::CONTROL_PORT,
    logging,
    protocol::packet::{
        VideoHeader, AUDIO_FRAMES_PER_PACKET, BYTES_PER_LINE, LINES_PER_PACKET,
        VIDEO_PAYLOAD_SIZE,
    },
    protocol::{AudioPacket, ControlCommand, StreamId, VideoPacket},
    video::FormatDescriptor,
};

const AUDIO_PACKET_INTERVAL: Duration = Duration::from_millis(4);
const TONE_HZ: f64 = 440.0;
const TONE_AMPLITUDE: f64 = 8000.0;
const SAMPLE_RATE: f64 = 48_000.0;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Standard {
    Pal,
    Ntsc,
}

#[derive(Parser, Debug)]
#[clap(about = "C64 Ultimate stream simulator", version)]
struct Args {
    #[clap(long, default_value = "0.0.0.0", help = "Address to accept control connections on")]
    bind: String,

    #[clap(long, default_value_t = CONTROL_PORT, help = "Control port")]
    control_port: u16,

    #[clap(long, value_enum, default_value_t = Standard::Pal, help = "Video standard")]
    standard: Standard,

    #[clap(long, default_value_t = 0.0, help = "Packet drop probability 0.0-1.0")]
    drop_rate: f64,

    #[clap(long, default_value_t = 0.0, help = "Packet duplication probability 0.0-1.0")]
    duplicate_rate: f64,

    #[clap(long, default_value_t = 0.0, help = "Packet reorder probability 0.0-1.0")]
    reorder_rate: f64,
}

/// Network impairments applied to outgoing datagrams
#[derive(Debug, Clone, Copy)]
struct Impairment {
    drop_rate: f64,
    duplicate_rate: f64,
    reorder_rate: f64,
}

impl Impairment {
    /// Send `datagrams`, dropping, duplicating and swapping neighbours at random
    async fn send_all(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        datagrams: Vec<Bytes>,
        rng: &mut StdRng,
    ) -> std::io::Result<()> {
        let mut held: Option<Bytes> = None;

        for datagram in datagrams {
            if rng.gen::<f64>() < self.drop_rate {
                continue;
            }
            if held.is_none() && rng.gen::<f64>() < self.reorder_rate {
                held = Some(datagram);
                continue;
            }

            socket.send_to(&datagram, target).await?;
            if rng.gen::<f64>() < self.duplicate_rate {
                socket.send_to(&datagram, target).await?;
            }
            if let Some(late) = held.take() {
                socket.send_to(&late, target).await?;
            }
        }

        if let Some(late) = held {
            socket.send_to(&late, target).await?;
        }
        Ok(())
    }
}

/// One line of 16 vertical colour bars, 24 pixels each
fn colour_bar_line() -> [u8; BYTES_PER_LINE] {
    let mut line = [0u8; BYTES_PER_LINE];
    for (k, byte) in line.iter_mut().enumerate() {
        let left = (2 * k / 24) as u8;
        let right = ((2 * k + 1) / 24) as u8;
        *byte = (right << 4) | left;
    }
    line
}

async fn stream_video(
    target: SocketAddr,
    format: FormatDescriptor,
    impairment: Impairment,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut rng = StdRng::from_entropy();

    let payload: Vec<u8> = colour_bar_line()
        .iter()
        .copied()
        .cycle()
        .take(VIDEO_PAYLOAD_SIZE)
        .collect();
    let packets = format.packets_per_frame();

    let mut ticker = tokio::time::interval(Duration::from_nanos(format.frame_interval_ns));
    let mut seq: u16 = 0;
    let mut frame: u16 = 0;

    tracing::info!("Streaming {} video to {}", format, target);
    loop {
        ticker.tick().await;

        let datagrams = (0..packets)
            .map(|i| {
                let header = VideoHeader::new(
                    seq.wrapping_add(i as u16),
                    frame,
                    (i * LINES_PER_PACKET as usize) as u16,
                    i == packets - 1,
                );
                VideoPacket::encode(&header, &payload)
            })
            .collect::<Result<Vec<_>, _>>()?;

        seq = seq.wrapping_add(packets as u16);
        frame = frame.wrapping_add(1);
        impairment.send_all(&socket, target, datagrams, &mut rng).await?;
    }
}

async fn stream_audio(target: SocketAddr, impairment: Impairment) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut rng = StdRng::from_entropy();

    let step = 2.0 * std::f64::consts::PI * TONE_HZ / SAMPLE_RATE;
    let mut phase = 0.0f64;
    let mut seq: u16 = 0;
    let mut samples = vec![0i16; AUDIO_FRAMES_PER_PACKET * 2];

    let mut ticker = tokio::time::interval(AUDIO_PACKET_INTERVAL);

    tracing::info!("Streaming {} Hz tone to {}", TONE_HZ, target);
    loop {
        ticker.tick().await;

        for frame in samples.chunks_exact_mut(2) {
            let value = (phase.sin() * TONE_AMPLITUDE) as i16;
            frame[0] = value;
            frame[1] = value;
            phase = (phase + step) % (2.0 * std::f64::consts::PI);
        }

        let packet = AudioPacket::encode(seq, &samples)?;
        seq = seq.wrapping_add(1);
        impairment
            .send_all(&socket, target, vec![packet], &mut rng)
            .await?;
    }
}

/// Running stream tasks, indexed by stream id
struct Streams {
    tasks: Mutex<[Option<JoinHandle<()>>; 2]>,
    format: FormatDescriptor,
    impairment: Impairment,
}

impl Streams {
    fn apply(&self, command: ControlCommand) {
        let stream = command.stream();
        let slot = stream as usize;
        let mut tasks = self.tasks.lock();

        if let Some(running) = tasks[slot].take() {
            running.abort();
        }

        match command {
            ControlCommand::StartStream {
                target, duration, ..
            } => {
                let target = SocketAddr::V4(target);
                let format = self.format;
                let impairment = self.impairment;
                tracing::info!("Start {} -> {} (duration {})", stream, target, duration);

                tasks[slot] = Some(tokio::spawn(async move {
                    let result = match stream {
                        StreamId::Video => stream_video(target, format, impairment).await,
                        StreamId::Audio => stream_audio(target, impairment).await,
                    };
                    if let Err(e) = result {
                        tracing::error!("{} stream ended: {}", stream, e);
                    }
                }));
            }
            ControlCommand::StopStream { .. } => {
                tracing::info!("Stop {}", stream);
            }
        }
    }
}

async fn handle_connection(mut conn: TcpStream, streams: Arc<Streams>) -> Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        while let Some((command, used)) = ControlCommand::decode(&buf)? {
            buf.drain(..used);
            streams.apply(command);
        }
    }

    if !buf.is_empty() {
        tracing::warn!("Connection closed with {} unparsed bytes", buf.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let format = match args.standard {
        Standard::Pal => FormatDescriptor::PAL,
        Standard::Ntsc => FormatDescriptor::NTSC,
    };
    let streams = Arc::new(Streams {
        tasks: Mutex::new([None, None]),
        format,
        impairment: Impairment {
            drop_rate: args.drop_rate.clamp(0.0, 1.0),
            duplicate_rate: args.duplicate_rate.clamp(0.0, 1.0),
            reorder_rate: args.reorder_rate.clamp(0.0, 1.0),
        },
    });

    let addr = format!("{}:{}", args.bind, args.control_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind control port {}", addr))?;

    tracing::info!("C64 Ultimate simulator ({}) listening on {}", format, addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, peer) = accepted?;
                let streams = streams.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, streams).await {
                        tracing::warn!("Control connection from {}: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    for task in streams.tasks.lock().iter_mut().filter_map(Option::take) {
        task.abort();
    }
    Ok(())
}
