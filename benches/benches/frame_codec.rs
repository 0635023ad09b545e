//! Benchmarks for gRPC length-prefixed framing in server/src/codec/frame.rs
//!
//! Performance-critical paths:
//! - `encode_frame`: prefixing every outbound message
//! - `FrameDecoder`: reassembling frames from arbitrary body chunks

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use vine_server::codec::frame::{FrameDecoder, encode_frame};

const MAX: usize = 32 * 1024 * 1024;

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/encode");

    for size in [64usize, 4 * 1024, 256 * 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| encode_frame(black_box(payload)));
        });
    }

    group.finish();
}

fn bench_decode_chunked(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/decode_chunked");

    let frames: Vec<u8> = (0..64)
        .flat_map(|i| encode_frame(&vec![i as u8; 1024]).map(|b| b.to_vec()).unwrap_or_default())
        .collect();
    group.throughput(Throughput::Bytes(frames.len() as u64));

    // Transport chunk sizes seen from HTTP/2 DATA frames
    for chunk in [512usize, 16 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &frames, |b, frames| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new(MAX);
                let mut count = 0;
                for piece in frames.chunks(chunk) {
                    decoder.push(piece);
                    while let Ok(Some(frame)) = decoder.next_frame() {
                        count += frame.payload.len();
                    }
                }
                black_box(count)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_chunked);
criterion_main!(benches);
