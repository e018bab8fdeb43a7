//! # Codec Benchmark
//!
//! Encode/decode cost of a server tick as the merged command list grows.

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lockstep_core::{Command, EntityId, OpaqueParser, OpaquePayload, Packet, ServerTick};

fn tick_with(commands: usize) -> Packet {
    let mut tick = ServerTick::new(1_000, 100_000_000, 123_456_789);
    for i in 0..commands {
        tick.commands.push(Command::new(
            (i % 8) as u16,
            Some(EntityId(i as u32)),
            OpaquePayload(vec![0xAB; 16]),
        ));
    }
    Packet::Tick(tick)
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_encode");

    for count in [0usize, 16, 256, 2048] {
        let packet = tick_with(count);
        let mut buf = vec![0u8; packet.encoded_len()];
        group.throughput(Throughput::Bytes(buf.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &count, |b, _| {
            b.iter(|| packet.encode(black_box(&mut buf)).unwrap());
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_decode");

    for count in [0usize, 16, 256, 2048] {
        let bytes = tick_with(count).encode_to_vec(usize::MAX).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("decode", count), &count, |b, _| {
            b.iter(|| Packet::decode(black_box(&bytes), &OpaqueParser).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
