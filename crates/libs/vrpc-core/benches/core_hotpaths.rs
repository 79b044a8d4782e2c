use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use vrpc_core::topic::{discovery_filter, matches_filter};
use vrpc_core::wire::{pack_positional, positional_args, RpcMessage};

fn bench_filter_match(c: &mut Criterion) {
    let filter = discovery_filter("*", "*");
    let topic = "public.vrpc/agent-1/Counter/__static__/__info__";
    c.bench_function("vrpc_core/matches_filter", |b| {
        b.iter(|| black_box(matches_filter(black_box(&filter), black_box(topic))));
    });
}

fn bench_positional_pack(c: &mut Criterion) {
    let args = vec![json!(42), json!("payload"), json!({ "nested": [1, 2, 3] })];
    c.bench_function("vrpc_core/pack_positional", |b| {
        b.iter(|| black_box(pack_positional(black_box(&args))));
    });
}

fn bench_positional_decode(c: &mut Criterion) {
    let data = pack_positional(&(1..=8).map(|n| json!(n)).collect::<Vec<_>>());
    c.bench_function("vrpc_core/positional_args", |b| {
        b.iter(|| black_box(positional_args(black_box(&data))));
    });
}

fn bench_message_roundtrip(c: &mut Criterion) {
    let msg = RpcMessage::request(
        "Counter",
        "increment",
        "ab12-7",
        "public.vrpc/host/ab12",
        pack_positional(&[json!(1)]),
    );
    let encoded = msg.encode().expect("encode should succeed");
    c.bench_function("vrpc_core/message_roundtrip", |b| {
        b.iter(|| {
            let bytes = msg.encode().expect("encode should succeed");
            let decoded = RpcMessage::decode(black_box(&bytes)).expect("decode should succeed");
            black_box(decoded);
        });
    });
    black_box(encoded);
}

criterion_group!(
    benches,
    bench_filter_match,
    bench_positional_pack,
    bench_positional_decode,
    bench_message_roundtrip
);
criterion_main!(benches);
