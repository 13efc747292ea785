use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use c64u_receiver::protocol::packet::{VideoHeader, BYTES_PER_LINE, VIDEO_PAYLOAD_SIZE};
use c64u_receiver::protocol::VideoPacket;
use c64u_receiver::video::assembler::{FrameAssembler, PushOutcome};
use c64u_receiver::video::palette::{lut, RGBA_BYTES_PER_LINE};

fn payload() -> Vec<u8> {
    (0..VIDEO_PAYLOAD_SIZE).map(|i| (i * 37) as u8).collect()
}

fn frame(frame: u16, packets: usize) -> Vec<Bytes> {
    let payload = payload();
    (0..packets)
        .map(|i| {
            let header = VideoHeader::new(
                (frame as usize * packets + i) as u16,
                frame,
                (i * 4) as u16,
                i == packets - 1,
            );
            VideoPacket::encode(&header, &payload).unwrap()
        })
        .collect()
}

fn bench_decode_line(c: &mut Criterion) {
    let table = lut();
    let src = payload();
    let mut dst = vec![0u8; RGBA_BYTES_PER_LINE];

    let mut group = c.benchmark_group("palette");
    group.throughput(Throughput::Bytes(BYTES_PER_LINE as u64));
    group.bench_function("decode_line", |b| {
        b.iter(|| table.decode_line(black_box(&src[..BYTES_PER_LINE]), &mut dst))
    });
    group.finish();
}

fn bench_assemble_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("assembler");
    group.throughput(Throughput::Elements(68));

    group.bench_function("pal_frame_in_order", |b| {
        let mut assembler = FrameAssembler::new();
        let mut n: u16 = 0;
        b.iter_batched(
            || {
                n = n.wrapping_add(1);
                frame(n, 68)
            },
            |datagrams| {
                let mut delivered = 0;
                for d in datagrams {
                    if let PushOutcome::Frame(f) = assembler.push_datagram(d, 0) {
                        delivered += f.rgba.len();
                    }
                }
                black_box(delivered)
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.bench_function("pal_frame_reversed", |b| {
        let mut assembler = FrameAssembler::new();
        let mut n: u16 = 0;
        b.iter_batched(
            || {
                n = n.wrapping_add(1);
                let mut datagrams = frame(n, 68);
                datagrams.reverse();
                datagrams
            },
            |datagrams| {
                for d in datagrams {
                    black_box(matches!(assembler.push_datagram(d, 0), PushOutcome::Frame(_)));
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_decode_line, bench_assemble_frame);
criterion_main!(benches);
