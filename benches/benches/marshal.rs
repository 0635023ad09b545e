//! Benchmarks for the marshalers in server/src/codec
//!
//! Performance-critical paths:
//! - `ProtoMarshaler`: default `application/grpc` body encoding
//! - `JsonMarshaler`: `application/grpc+json` and subscriber bodies

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use vine_server::codec::Marshaler;
use vine_server::codec::json::JsonMarshaler;
use vine_server::codec::proto::ProtoMarshaler;

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, repeated, tag = "2")]
    pub items: Vec<String>,
    #[prost(uint64, tag = "3")]
    pub total_cents: u64,
}

fn order(items: usize) -> Order {
    Order {
        id: "order-42".to_string(),
        items: (0..items).map(|i| format!("sku-{i:05}")).collect(),
        total_cents: 12_999,
    }
}

fn bench_marshal(c: &mut Criterion) {
    let mut group = c.benchmark_group("marshal/encode");
    let marshalers: [(&str, &dyn Marshaler); 2] =
        [("proto", &ProtoMarshaler), ("json", &JsonMarshaler)];

    for (name, marshaler) in marshalers {
        let value = order(100);
        group.bench_with_input(BenchmarkId::from_parameter(name), &value, |b, value| {
            b.iter(|| marshaler.marshal(black_box(value)));
        });
    }

    group.finish();
}

fn bench_unmarshal(c: &mut Criterion) {
    let mut group = c.benchmark_group("marshal/decode");
    let marshalers: [(&str, &dyn Marshaler); 2] =
        [("proto", &ProtoMarshaler), ("json", &JsonMarshaler)];

    for (name, marshaler) in marshalers {
        let Ok(bytes) = marshaler.marshal(&order(100)) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| {
                let mut out = Order::default();
                let _ = marshaler.unmarshal(black_box(bytes), &mut out);
                out
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_marshal, bench_unmarshal);
criterion_main!(benches);
