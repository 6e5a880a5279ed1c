//! Benchmarks for stream session emission
//!
//! This benchmark measures:
//! - Sequenced event emission into an in-memory sink
//! - Buffered emission with periodic flushes
//! - Event JSON encoding

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use nl2sql_runtime::streaming::{BufferedSink, MemorySink, StreamSession};
use serde_json::json;

const EVENTS_PER_SESSION: u64 = 64;

async fn emit_session(session: &StreamSession) {
    session.start(None).await.unwrap();
    for i in 0..EVENTS_PER_SESSION as usize {
        session.chunk(i, "SELECT id FROM t").await.unwrap();
    }
    session.complete(json!({ "ok": true }), None).await.unwrap();
}

fn bench_emission(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("stream_session");
    group.throughput(Throughput::Elements(EVENTS_PER_SESSION + 2));

    group.bench_function("memory_sink", |b| {
        b.to_async(&rt).iter(|| async {
            let session = StreamSession::new(Box::new(MemorySink::new()));
            emit_session(&session).await;
            black_box(session.emitted())
        })
    });

    group.bench_function("buffered_sink", |b| {
        b.to_async(&rt).iter(|| async {
            let sink = BufferedSink::new(MemorySink::new(), 16);
            let session = StreamSession::new(Box::new(sink));
            emit_session(&session).await;
            black_box(session.emitted())
        })
    });

    group.finish();
}

fn bench_encoding(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sink = MemorySink::new();
    rt.block_on(async {
        let session = StreamSession::new(Box::new(sink.clone()));
        session.start(Some(json!({ "requestId": "bench" }))).await.unwrap();
        session.chunk(0, "SELECT name FROM customers").await.unwrap();
    });
    let events = sink.events();

    c.bench_function("event_to_json", |b| {
        b.iter(|| {
            for event in &events {
                black_box(event.to_json().unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_emission, bench_encoding);
criterion_main!(benches);
