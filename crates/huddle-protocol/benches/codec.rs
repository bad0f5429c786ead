//! Codec benchmarks for huddle-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, ChatMessage, Event};

fn chat_event(size: usize) -> Event {
    Event::receive_message(ChatMessage::new("Alice", "x".repeat(size), "3:04:05 PM"))
}

fn bench_encode(c: &mut Criterion) {
    let event = chat_event(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&event))));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_json(black_box(&event)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let event = chat_event(64);
    let binary = codec::encode(&event).unwrap();
    let text = codec::encode_json(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(binary.len() as u64));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode(black_box(&binary)))
    });
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode_json(black_box(&text)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let event = chat_event(256);

    c.bench_function("roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip);
criterion_main!(benches);
