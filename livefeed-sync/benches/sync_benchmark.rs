use criterion::{criterion_group, criterion_main, Criterion};
use livefeed_sync::chunk::{ChunkAssembler, Fragment};
use livefeed_sync::delta::Delta;
use livefeed_sync::envelope::{encode_envelope, open_envelope};
use livefeed_sync::listener::ListenerRegistry;
use livefeed_sync::merge::apply_delta;
use livefeed_sync::pipeline::Pipeline;
use livefeed_sync::replica::Replica;
use livefeed_sync::sse::SseDecoder;
use livefeed_sync::AssemblyPolicy;
use serde_json::{json, Value};
use std::hint::black_box;

/// A collection of `n` entities with a handful of fields each.
fn collection_delta(n: usize, round: u64) -> Value {
    let entities: serde_json::Map<String, Value> = (0..n)
        .map(|i| {
            (
                i.to_string(),
                json!({
                    "Name": format!("Athlete {i}"),
                    "Rank": i as u64 + round,
                    "Splits": [31.2, 30.9, round],
                    "Status": {"Code": "OK", "Round": round},
                }),
            )
        })
        .collect();
    json!({ "Athletes": entities })
}

fn bench_delta_parse(c: &mut Criterion) {
    let text = collection_delta(1000, 1).to_string();

    c.bench_function("delta_parse_1000_entities", |b| {
        b.iter(|| black_box(Delta::parse(black_box(&text)).unwrap()))
    });
}

fn bench_merge_update(c: &mut Criterion) {
    let replica = Replica::new();
    apply_delta(&replica, &Delta::from_json(collection_delta(1000, 0)).unwrap());
    let update = Delta::from_json(collection_delta(1000, 1)).unwrap();

    c.bench_function("merge_update_1000_entities", |b| {
        b.iter(|| black_box(apply_delta(&replica, black_box(&update))))
    });
}

fn bench_merge_small_into_large(c: &mut Criterion) {
    let replica = Replica::new();
    apply_delta(&replica, &Delta::from_json(collection_delta(10_000, 0)).unwrap());
    let update = Delta::from_json(json!({
        "Athletes": {"42": {"Rank": 1}, "deleted": ["9999"], "invalidated": []}
    }))
    .unwrap();

    c.bench_function("merge_1_entity_into_10000", |b| {
        b.iter(|| black_box(apply_delta(&replica, black_box(&update))))
    });
}

fn bench_envelope_open(c: &mut Criterion) {
    let wrapped = encode_envelope(&collection_delta(1000, 1).to_string()).unwrap();

    c.bench_function("envelope_open_1000_entities", |b| {
        b.iter(|| black_box(open_envelope(black_box(wrapped.clone())).unwrap()))
    });
}

fn bench_reassembly(c: &mut Criterion) {
    let text = collection_delta(1000, 1).to_string();
    let mut fragments = Fragment::split("bench", &text, 4096);
    fragments.reverse();

    c.bench_function("reassemble_reverse_order", |b| {
        b.iter(|| {
            let mut assembler = ChunkAssembler::default();
            let mut complete = None;
            for fragment in fragments.iter().cloned() {
                complete = assembler.push(fragment).unwrap();
            }
            black_box(complete.unwrap())
        })
    });
}

fn bench_sse_decode(c: &mut Criterion) {
    let line = format!("data: {}\n\n", collection_delta(10, 1));
    let body = line.repeat(100);

    c.bench_function("sse_decode_100_events", |b| {
        b.iter(|| {
            let mut decoder = SseDecoder::new();
            let mut events = 0;
            for slice in body.as_bytes().chunks(1460) {
                events += decoder.feed(slice).len();
            }
            black_box(events)
        })
    });
}

fn bench_pipeline_message(c: &mut Criterion) {
    let listeners = ListenerRegistry::new();
    listeners.register("noop", |_: &Delta, _: &Replica| Ok(()));
    let mut pipeline = Pipeline::new(Replica::new(), listeners, AssemblyPolicy::default());
    let text = collection_delta(100, 1).to_string();

    c.bench_function("pipeline_message_100_entities", |b| {
        b.iter(|| black_box(pipeline.handle_text(text.clone()).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_delta_parse,
    bench_merge_update,
    bench_merge_small_into_large,
    bench_envelope_open,
    bench_reassembly,
    bench_sse_decode,
    bench_pipeline_message,
);
criterion_main!(benches);
